use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::cache::{CacheWriter, DiskCache};
use crate::upstream::Connector;
use crate::{build_upstream_request, parse_request, parse_uri, HttpError, HttpVersion, BUFSIZE};

/// The proxy engine: a shared cache plus an upstream connector. Clones are
/// cheap handles to the same state.
#[derive(Clone)]
pub struct Proxy {
    cache: DiskCache,
    connector: Connector,
}

impl Proxy {
    pub fn new(cache: DiskCache, connector: Connector) -> Self {
        Self { cache, connector }
    }

    /// Accept loop. Each connection gets its own task; worker failures never
    /// reach back here.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((client, addr)) => {
                    debug!("accepted connection from {addr}");
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        proxy.handle_client(client).await;
                    });
                }
                Err(e) => error!("failed to accept connection: {e}"),
            }
        }
    }

    /// Per-connection pipeline: read one request, serve from cache or fetch
    /// upstream, close. Sockets and cache slots release on every path by
    /// going out of scope.
    pub async fn handle_client(&self, mut client: TcpStream) {
        let mut buffer = BytesMut::with_capacity(BUFSIZE);
        let n = match client.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        // A completely full buffer means the request may have been truncated
        if n >= BUFSIZE {
            send_error(&mut client, HttpError::BadRequest, None).await;
            return;
        }

        let req = match parse_request(&buffer) {
            Ok(req) => req,
            Err(err) => {
                send_error(&mut client, err, None).await;
                return;
            }
        };

        // The search guard pins the lookup-or-fetch decision; it is released
        // as soon as that decision is committed, never held while streaming.
        let search = self.cache.search_guard().await;
        if let Some(mut hit) = self.cache.lookup(&req.uri).await {
            drop(search);
            info!("cache hit: {}", req.uri);
            if let Err(e) = hit.copy_to(&mut client).await {
                debug!("client write failed mid cache read: {e}");
            }
            return;
        }
        debug!("cache miss: {}", req.uri);

        let target = match parse_uri(&req.uri) {
            Ok(target) => target,
            Err(err) => {
                send_error(&mut client, err, Some(req.version)).await;
                return;
            }
        };
        let upstream = match self.connector.connect(&target).await {
            Ok(upstream) => upstream,
            Err(err) => {
                send_error(&mut client, err, Some(req.version)).await;
                return;
            }
        };
        let writer = self.cache.open_for_write(&req.uri).await;
        drop(search);

        let request = build_upstream_request(&req, &target);
        forward(client, upstream, &request, writer).await;
        info!("fetched upstream: {}", req.uri);
    }
}

/// Streams the upstream response to the client, teeing each chunk into the
/// cache writer. Upstream EOF commits the entry (a read error counts as
/// EOF); a client write failure aborts the fetch and discards it.
async fn forward(
    mut client: TcpStream,
    mut upstream: TcpStream,
    request: &str,
    mut writer: CacheWriter,
) {
    if let Err(e) = upstream.write_all(request.as_bytes()).await {
        debug!("failed to send request upstream: {e}");
        return;
    }

    let mut chunk = BytesMut::with_capacity(BUFSIZE);
    loop {
        chunk.clear();
        match upstream.read_buf(&mut chunk).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("upstream read error, ending stream: {e}");
                break;
            }
        }
        if let Err(e) = client.write_all(&chunk).await {
            debug!("client write failed, aborting fetch: {e}");
            return;
        }
        writer.append(&chunk).await;
    }
    writer.commit().await;
}

async fn send_error(client: &mut TcpStream, err: HttpError, version: Option<HttpVersion>) {
    let response = err.to_response(version);
    if let Err(e) = client.write_all(response.as_bytes()).await {
        debug!("failed to send {} response: {e}", err.code());
    }
}
