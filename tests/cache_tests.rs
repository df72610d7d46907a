/// Disk cache behaviour under concurrency: many readers, racing writers, and
/// sweep passes against the same directory.
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use uproxy::cache::DiskCache;

async fn write_entry(cache: &DiskCache, uri: &str, body: &[u8]) {
    let mut writer = cache.open_for_write(uri).await;
    writer.append(body).await;
    writer.commit().await;
}

async fn read_entry(cache: &DiskCache, uri: &str) -> Option<Vec<u8>> {
    let mut hit = cache.lookup(uri).await?;
    let mut out = Vec::new();
    hit.copy_to(&mut out).await.ok()?;
    Some(out)
}

fn visible_entries(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            !e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with('.')
        })
        .count()
}

#[tokio::test]
async fn test_sweeper_exits_when_caching_disabled() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("999"), b"http://leftover/\nstale bytes").unwrap();

    let cache = DiskCache::open(dir.path(), 0).unwrap();
    // Give the leftover file a measurable age before the pass
    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), cache.clone().run_sweeper())
        .await
        .expect("sweeper must exit with ttl 0");

    assert_eq!(visible_entries(&dir), 0);
}

#[tokio::test]
async fn test_rewrite_supersedes_previous_entry() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path(), 60).unwrap();
    let uri = "http://example.test/page";

    write_entry(&cache, uri, b"first response").await;
    write_entry(&cache, uri, b"second response").await;

    assert_eq!(
        read_entry(&cache, uri).await.as_deref(),
        Some(b"second response".as_ref())
    );
    assert_eq!(visible_entries(&dir), 1);
}

#[tokio::test]
async fn test_concurrent_readers_share_one_entry() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path(), 60).unwrap();
    let uri = "http://example.test/hot";
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    write_entry(&cache, uri, &body).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let out = read_entry(&cache, uri).await.expect("entry is fresh");
                assert_eq!(out, body);
            }
        }));
    }

    let all = async {
        for handle in handles {
            handle.await.unwrap();
        }
    };
    timeout(Duration::from_secs(30), all)
        .await
        .expect("readers must not deadlock");
}

#[tokio::test]
async fn test_readers_and_sweeps_interleave_without_deadlock() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path(), 60).unwrap();
    let uri = "http://example.test/contended";
    write_entry(&cache, uri, b"payload").await;

    let reader_cache = cache.clone();
    let readers = tokio::spawn(async move {
        for _ in 0..50 {
            let out = read_entry(&reader_cache, uri).await.expect("fresh entry");
            assert_eq!(out, b"payload");
        }
    });

    let sweeps = async {
        // Nothing is stale at ttl 60; the point is gate contention
        for _ in 0..10 {
            cache.sweep_once().await;
            tokio::task::yield_now().await;
        }
    };

    timeout(Duration::from_secs(30), async {
        sweeps.await;
        readers.await.unwrap();
    })
    .await
    .expect("readers and sweeper must not deadlock");

    assert_eq!(read_entry(&cache, uri).await.as_deref(), Some(b"payload".as_ref()));
}

#[tokio::test]
async fn test_parallel_writers_on_distinct_uris() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path(), 60).unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let uri = format!("http://example.test/item/{i}");
            let body = format!("response body {i}");
            write_entry(&cache, &uri, body.as_bytes()).await;
            (uri, body)
        }));
    }

    for handle in handles {
        let (uri, body) = handle.await.unwrap();
        assert_eq!(read_entry(&cache, &uri).await, Some(body.into_bytes()));
    }
    assert_eq!(visible_entries(&dir), 16);
}

#[tokio::test]
async fn test_sweep_only_removes_expired_entries() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(dir.path(), 2).unwrap();

    write_entry(&cache, "http://example.test/old", b"old").await;
    tokio::time::sleep(Duration::from_millis(2200)).await;
    write_entry(&cache, "http://example.test/new", b"new").await;

    cache.sweep_once().await;

    assert!(read_entry(&cache, "http://example.test/old").await.is_none());
    assert_eq!(
        read_entry(&cache, "http://example.test/new").await.as_deref(),
        Some(b"new".as_ref())
    );
    assert_eq!(visible_entries(&dir), 1);
}
