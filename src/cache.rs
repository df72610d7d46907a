use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, warn};

use crate::{cache_key, is_cacheable};

#[derive(Default)]
struct Counters {
    readers: usize,
    writers: usize,
}

/// Reader/writer coordination for the cache directory.
///
/// Fetch writers only count themselves, relying on hash-keyed file isolation
/// between concurrent writes. The sweeper additionally takes the single `wrt`
/// permit, excluding every reader while it unlinks entries. The first reader
/// in holds `wrt` on behalf of all piggy-backing readers; a queued sweep
/// forces newly arriving readers through the permit queue behind it.
struct Gate {
    counters: Mutex<Counters>,
    wrt: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            wrt: Semaphore::new(1),
        }
    }

    async fn begin_read(self: &Arc<Self>) -> ReadSlot {
        {
            let mut counters = self.counters.lock();
            if counters.writers == 0 && counters.readers > 0 {
                // Piggy-back on the permit the first reader already holds
                counters.readers += 1;
                return ReadSlot {
                    gate: Arc::clone(self),
                };
            }
        }
        if let Ok(permit) = self.wrt.acquire().await {
            permit.forget();
        }
        self.counters.lock().readers += 1;
        ReadSlot {
            gate: Arc::clone(self),
        }
    }

    fn begin_write(self: &Arc<Self>) -> WriteSlot {
        self.counters.lock().writers += 1;
        WriteSlot {
            gate: Arc::clone(self),
            exclusive: false,
        }
    }

    async fn begin_sweep(self: &Arc<Self>) -> WriteSlot {
        self.counters.lock().writers += 1;
        if let Ok(permit) = self.wrt.acquire().await {
            permit.forget();
        }
        WriteSlot {
            gate: Arc::clone(self),
            exclusive: true,
        }
    }
}

struct ReadSlot {
    gate: Arc<Gate>,
}

impl Drop for ReadSlot {
    fn drop(&mut self) {
        let mut counters = self.gate.counters.lock();
        counters.readers -= 1;
        if counters.readers == 0 {
            self.gate.wrt.add_permits(1);
        }
    }
}

struct WriteSlot {
    gate: Arc<Gate>,
    exclusive: bool,
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        if self.exclusive {
            self.gate.wrt.add_permits(1);
        }
        self.gate.counters.lock().writers -= 1;
    }
}

/// Shared handle to the on-disk response cache.
///
/// Entries live under one directory, named by the decimal djb2 hash of their
/// URI. The first line of an entry is the URI itself (the collision tag), the
/// rest is the upstream response verbatim. The file mtime is the TTL clock.
#[derive(Clone)]
pub struct DiskCache {
    dir: PathBuf,
    ttl: u64,
    gate: Arc<Gate>,
    search: Arc<AsyncMutex<()>>,
    tmp_seq: Arc<AtomicU64>,
}

impl DiskCache {
    /// Opens the cache, creating the directory if needed. A ttl of zero
    /// disables caching: lookups always miss and writers stay dry.
    pub fn open(dir: impl Into<PathBuf>, ttl: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl,
            gate: Arc::new(Gate::new()),
            search: Arc::new(AsyncMutex::new(())),
            tmp_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    fn entry_path(&self, uri: &str) -> PathBuf {
        self.dir.join(cache_key(uri).to_string())
    }

    /// Serialises the lookup-or-fetch decision across workers. Held from the
    /// start of a lookup until the caller has committed to serving from the
    /// cache or opened its cache writer, never across the streaming itself.
    pub async fn search_guard(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.search).lock_owned().await
    }

    /// Looks up `uri`, returning an open entry positioned past the tag line.
    /// A mismatched tag (hash collision), an expired mtime, or any read
    /// problem is a miss.
    pub async fn lookup(&self, uri: &str) -> Option<CacheHit> {
        if self.ttl == 0 {
            return None;
        }
        let slot = self.gate.begin_read().await;
        let path = self.entry_path(uri);

        let meta = fs::metadata(&path).await.ok()?;
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age > Duration::from_secs(self.ttl) {
            return None;
        }

        let file = File::open(&path).await.ok()?;
        let mut reader = BufReader::new(file);
        let mut tag = Vec::new();
        reader.read_until(b'\n', &mut tag).await.ok()?;
        if tag.pop() != Some(b'\n') {
            return None;
        }
        if tag != uri.as_bytes() {
            debug!("cache tag mismatch for {uri}, treating as miss");
            return None;
        }
        Some(CacheHit {
            reader,
            _slot: slot,
        })
    }

    /// Opens a writer for the response to `uri`. Non-cacheable URIs and a
    /// zero ttl get a dry writer that discards every append. The entry is
    /// built in a uniquely named temporary sibling so concurrent fetches for
    /// the same URI never interleave, and readers only ever see whole files.
    pub async fn open_for_write(&self, uri: &str) -> CacheWriter {
        let slot = self.gate.begin_write();
        if self.ttl == 0 || !is_cacheable(uri) {
            return CacheWriter {
                inner: None,
                _slot: slot,
            };
        }

        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!("{}.{seq}.tmp", cache_key(uri)));

        let mut file = match File::create(&tmp_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("cache write unavailable for {uri}: {e}");
                return CacheWriter {
                    inner: None,
                    _slot: slot,
                };
            }
        };
        let mut tag = Vec::with_capacity(uri.len() + 1);
        tag.extend_from_slice(uri.as_bytes());
        tag.push(b'\n');
        if let Err(e) = file.write_all(&tag).await {
            warn!("cache write unavailable for {uri}: {e}");
            let _ = std::fs::remove_file(&tmp_path);
            return CacheWriter {
                inner: None,
                _slot: slot,
            };
        }

        CacheWriter {
            inner: Some(WriterInner {
                file,
                tmp_path,
                final_path: self.entry_path(uri),
                uri: uri.to_string(),
            }),
            _slot: slot,
        }
    }

    /// One expiration pass over the cache directory. Runs with the gate held
    /// exclusively so no reader observes an entry mid-unlink. Temporaries
    /// abandoned by a crashed writer age out here too.
    pub async fn sweep_once(&self) {
        let _slot = self.gate.begin_sweep().await;

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot scan cache directory: {e}");
                return;
            }
        };
        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > Duration::from_secs(self.ttl) {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => debug!("swept expired entry {}", name.to_string_lossy()),
                    Err(e) => debug!("could not sweep {}: {e}", name.to_string_lossy()),
                }
            }
        }
    }

    /// Background expiration loop: sweep, then sleep one ttl. With caching
    /// disabled it makes a single pass to clear leftovers from an earlier
    /// run, then exits.
    pub async fn run_sweeper(self) {
        loop {
            self.sweep_once().await;
            if self.ttl == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_secs(self.ttl)).await;
        }
    }
}

/// An open cache entry positioned just past the tag line. Holds its reader
/// slot until dropped.
pub struct CacheHit {
    reader: BufReader<File>,
    _slot: ReadSlot,
}

impl CacheHit {
    /// Streams the cached response to `dst`.
    pub async fn copy_to<W>(&mut self, dst: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        tokio::io::copy(&mut self.reader, dst).await
    }
}

struct WriterInner {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    uri: String,
}

/// Teed cache output for one fetch. Committing publishes the entry under its
/// hash filename with an atomic rename; dropping without committing removes
/// the temporary instead.
pub struct CacheWriter {
    inner: Option<WriterInner>,
    _slot: WriteSlot,
}

impl CacheWriter {
    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }

    /// Appends one response chunk. Failures demote the writer to dry; the
    /// fetch itself keeps streaming.
    pub async fn append(&mut self, chunk: &[u8]) {
        if let Some(inner) = &mut self.inner {
            if let Err(e) = inner.file.write_all(chunk).await {
                debug!("dropping cache entry for {}: {e}", inner.uri);
                self.discard();
            }
        }
    }

    /// Publishes the finished entry.
    pub async fn commit(mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let WriterInner {
            mut file,
            tmp_path,
            final_path,
            uri,
        } = inner;
        if let Err(e) = file.flush().await {
            debug!("dropping cache entry for {uri}: {e}");
            let _ = std::fs::remove_file(&tmp_path);
            return;
        }
        drop(file);
        match fs::rename(&tmp_path, &final_path).await {
            Ok(()) => debug!("cached {uri}"),
            Err(e) => {
                debug!("failed to publish cache entry for {uri}: {e}");
                let _ = std::fs::remove_file(&tmp_path);
            }
        }
    }

    fn discard(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = std::fs::remove_file(&inner.tmp_path);
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        self.discard();
    }
}
