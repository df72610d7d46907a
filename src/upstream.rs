use std::path::PathBuf;

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::blocklist::Blocklist;
use crate::{HttpError, UpstreamTarget};

/// Opens connections to origin servers, applying the host blocklist first.
#[derive(Clone, Debug)]
pub struct Connector {
    blocklist_path: PathBuf,
}

impl Connector {
    pub fn new(blocklist_path: impl Into<PathBuf>) -> Self {
        Self {
            blocklist_path: blocklist_path.into(),
        }
    }

    /// Resolves the target and returns the first address that accepts a
    /// connection. Blocked hosts map to 403; resolution failures and
    /// unreachable hosts map to 404.
    pub async fn connect(&self, target: &UpstreamTarget) -> Result<TcpStream, HttpError> {
        let blocklist = Blocklist::load(&self.blocklist_path).await;
        if blocklist.contains(&target.host) {
            debug!("refusing blocklisted host {}", target.host);
            return Err(HttpError::Forbidden);
        }

        let addrs = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|_| HttpError::NotFound)?;

        for addr in addrs.filter(|addr| addr.is_ipv4()) {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("connect to {addr} failed: {e}"),
            }
        }
        Err(HttpError::NotFound)
    }
}
