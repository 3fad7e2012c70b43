//! The node pool: cached SSH connections keyed by node reference id.
//!
//! `get` returns the cached client when it is still healthy, otherwise
//! opens a fresh connection, ensures the minion is installed, and caches
//! it. A mutex guards the map; a second per-node mutex serializes the
//! ensure-minion step so concurrent first contacts don't race uploads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::{NodeClient, NodeTarget};
use crate::minion::{ensure_minion, MinionBinary, ENSURE_TIMEOUT};
use crate::{NodeError, NodeResult};

/// Shared pool of node connections.
pub struct NodePool {
    clients: Mutex<HashMap<String, Arc<NodeClient>>>,
    ensure_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    minion_binary: Option<MinionBinary>,
    exec_timeout: Duration,
}

impl NodePool {
    /// Build a pool. The minion binary path is optional: without it,
    /// nodes must already have a working minion installed.
    pub fn new(minion_binary_path: Option<PathBuf>, exec_timeout: Duration) -> NodeResult<Self> {
        let minion_binary = match minion_binary_path {
            Some(path) => Some(MinionBinary::load(&path)?),
            None => None,
        };
        Ok(Self {
            clients: Mutex::new(HashMap::new()),
            ensure_locks: Mutex::new(HashMap::new()),
            minion_binary,
            exec_timeout,
        })
    }

    /// Content hash of the configured minion binary, if any.
    pub fn minion_hash(&self) -> Option<&str> {
        self.minion_binary.as_ref().map(|b| b.hash.as_str())
    }

    /// Return a cached healthy client or open (and cache) a new one.
    pub async fn get(&self, target: &NodeTarget) -> NodeResult<Arc<NodeClient>> {
        {
            let mut clients = self.clients.lock().await;
            match clients.get(&target.reference_id) {
                Some(client) if client.is_healthy() => return Ok(client.clone()),
                Some(_) => {
                    debug!(node = %target.reference_id, "evicting dead connection");
                    clients.remove(&target.reference_id);
                }
                None => {}
            }
        }

        let client = Arc::new(self.open(target).await?);
        self.clients
            .lock()
            .await
            .insert(target.reference_id.clone(), client.clone());
        Ok(client)
    }

    /// Open a fresh connection outside the cache. The health checker
    /// uses this so a cached-but-stale connection can't mask a live
    /// host, and vice versa.
    pub async fn connect_fresh(&self, target: &NodeTarget) -> NodeResult<NodeClient> {
        self.open(target).await
    }

    async fn open(&self, target: &NodeTarget) -> NodeResult<NodeClient> {
        let client = NodeClient::connect(target, self.exec_timeout).await?;
        self.auto_ensure_minion(target, &client).await?;
        Ok(client)
    }

    /// Idempotently install/refresh the minion, serialized per node.
    pub async fn auto_ensure_minion(
        &self,
        target: &NodeTarget,
        client: &NodeClient,
    ) -> NodeResult<()> {
        let Some(binary) = &self.minion_binary else {
            // Trust whatever is installed; the first RPC will surface a
            // missing minion as an exec failure.
            return Ok(());
        };

        let lock = {
            let mut locks = self.ensure_locks.lock().await;
            locks
                .entry(target.reference_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let uploaded = tokio::time::timeout(ENSURE_TIMEOUT, ensure_minion(client, binary))
            .await
            .map_err(|_| NodeError::Timeout(ENSURE_TIMEOUT.as_secs()))??;
        if uploaded {
            info!(node = %target.reference_id, "minion deployed");
        }
        Ok(())
    }

    /// Drop and close one cached connection.
    pub async fn close(&self, node_ref: &str) {
        let removed = self.clients.lock().await.remove(node_ref);
        if let Some(client) = removed {
            client.disconnect().await;
            debug!(node = node_ref, "connection closed");
        }
    }

    /// Close every cached connection; per-entry errors are ignored.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<NodeClient>)> =
            self.clients.lock().await.drain().collect();
        for (node_ref, client) in drained {
            client.disconnect().await;
            debug!(node = %node_ref, "connection closed");
        }
        self.ensure_locks.lock().await.clear();
    }

    /// Number of cached connections (for health/introspection).
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_pool_bookkeeping() {
        let pool = NodePool::new(None, Duration::from_secs(5)).unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(pool.len().await, 0);
        assert!(pool.minion_hash().is_none());

        // Closing unknown nodes and closing an empty pool are no-ops.
        pool.close("node_missing").await;
        pool.close_all().await;
    }

    #[tokio::test]
    async fn get_against_dead_endpoint_fails_without_caching() {
        let pool = NodePool::new(None, Duration::from_secs(1)).unwrap();
        let target = NodeTarget {
            reference_id: "node_dead".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "root".to_string(),
            private_key: String::new(),
        };

        assert!(pool.get(&target).await.is_err());
        assert!(pool.is_empty().await);
    }

    #[test]
    fn missing_minion_binary_path_is_an_error() {
        let err = NodePool::new(
            Some(PathBuf::from("/nonexistent/minion")),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::Sftp(_)));
    }
}
