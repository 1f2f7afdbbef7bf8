//! The HTTPS-style distributor: a local hashring fed by the resource
//! stream, mapping each requester to one resource.

use ferry_core::{hashkey, Hashkey, Hashring, Resource, ResourceDiff};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HTTPS_DIST_NAME: &str = "https";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpsError {
    #[error("no resources available")]
    NoResources,
}

/// Maps a requester's address to a hash key by taking the /16 prefix string
/// (the first two dotted octets, dots included) and hashing it.  Everyone in
/// the same /16 gets the same resource, which limits enumeration.
pub fn hashkey_from_addr(remote_addr: &str) -> Hashkey {
    let mut dots = 0;
    let mut end = remote_addr.len();
    for (i, c) in remote_addr.char_indices() {
        if c == '.' {
            dots += 1;
            if dots == 2 {
                end = i + 1;
                break;
            }
        }
    }
    let prefix = &remote_addr[..end];
    tracing::debug!(%prefix, "using address prefix as hash key");
    hashkey(prefix.as_bytes())
}

/// The HTTPS distributor's state.
#[derive(Default)]
pub struct HttpsDistributor {
    ring: Arc<RwLock<Hashring>>,
}

impl HttpsDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the housekeeping task that applies incoming diffs to the local
    /// hashring.
    pub fn spawn(
        &self,
        mut diffs: UnboundedReceiver<ResourceDiff>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let ring = self.ring.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("shutting down housekeeping");
                        return;
                    }
                    received = diffs.recv() => {
                        let Some(diff) = received else { return };
                        tracing::info!(%diff, "applying update");
                        let mut ring = ring.write().await;
                        ring.apply_diff(diff);
                        tracing::info!(len = ring.len(), "done applying update");
                    }
                }
            }
        })
    }

    /// Returns a resource for the given hash key.  It is the frontend's
    /// responsibility to derive the key from the requester.
    pub async fn request_bridges(
        &self,
        key: Hashkey,
    ) -> Result<Vec<Box<dyn Resource>>, HttpsError> {
        let ring = self.ring.read().await;
        if ring.is_empty() {
            return Err(HttpsError::NoResources);
        }
        let r = ring.get(key).map_err(|_| HttpsError::NoResources)?;
        Ok(vec![r])
    }
}
