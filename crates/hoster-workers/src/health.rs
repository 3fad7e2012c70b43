//! Node health checker.
//!
//! Every tick: list checkable nodes, fan out to a bounded pool, and
//! probe each node over a fresh SSH connection. A fresh connection is
//! deliberate: a cached-but-dead connection must not hide a live host,
//! nor the reverse. The minion ensure step gets its own generous budget
//! even when the per-node check timeout is shorter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use hoster_core::SecretCipher;
use hoster_nodes::minion::ENSURE_TIMEOUT;
use hoster_nodes::protocol::command;
use hoster_nodes::{NodePool, NodeTarget};
use hoster_store::{Node, NodeStatus, Store};

use crate::WorkerHandle;

/// Extended budget for a node's first-ever check, covering the minion
/// upload.
const FIRST_CHECK_TIMEOUT: Duration = Duration::from_secs(180);

/// Periodic health checker for remote nodes.
pub struct HealthChecker {
    store: Store,
    pool: Arc<NodePool>,
    cipher: SecretCipher,
    interval: Duration,
    max_concurrent: usize,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Store,
        pool: Arc<NodePool>,
        cipher: SecretCipher,
        interval: Duration,
        max_concurrent: usize,
        check_timeout: Duration,
    ) -> Self {
        Self { store, pool, cipher, interval, max_concurrent, check_timeout }
    }

    /// Spawn the run loop.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => self.tick().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        WorkerHandle::new("health-checker", shutdown_tx, handle)
    }

    /// One cycle: check every node, bounded by the semaphore, and wait
    /// for all checks before returning.
    pub async fn tick(&self) {
        let nodes = match self.store.list_checkable_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "listing nodes failed");
                return;
            }
        };
        if nodes.is_empty() {
            return;
        }
        debug!(count = nodes.len(), "health cycle starting");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for node in nodes {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let pool = self.pool.clone();
            let cipher = self.cipher.clone();
            let check_timeout = self.check_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                check_node(&store, &pool, &cipher, node, check_timeout).await;
            });
        }
        // In-progress checks finish before the next cycle starts.
        while tasks.join_next().await.is_some() {}
    }
}

/// Probe one node and write the outcome in a single row update.
async fn check_node(
    store: &Store,
    pool: &NodePool,
    cipher: &SecretCipher,
    node: Node,
    check_timeout: Duration,
) {
    let first_check = node.last_health_check.is_none();
    let budget = if first_check {
        FIRST_CHECK_TIMEOUT
    } else {
        check_timeout + ENSURE_TIMEOUT
    };

    let outcome = tokio::time::timeout(budget, probe(pool, cipher, store, &node, check_timeout))
        .await
        .unwrap_or_else(|_| Err(format!("health check timed out after {}s", budget.as_secs())));

    let (status, message) = match outcome {
        Ok(()) => (NodeStatus::Online, String::new()),
        Err(message) => (NodeStatus::Offline, message),
    };

    if status == NodeStatus::Offline {
        warn!(node = %node.reference_id, error = %message, "node offline");
    } else {
        debug!(node = %node.reference_id, "node online");
    }
    if let Err(e) = store
        .update_node_health(&node.reference_id, status, &message, Utc::now())
        .await
    {
        warn!(node = %node.reference_id, error = %e, "health update failed");
    }
}

async fn probe(
    pool: &NodePool,
    cipher: &SecretCipher,
    store: &Store,
    node: &Node,
    check_timeout: Duration,
) -> Result<(), String> {
    let target = resolve_target(store, cipher, node).await?;

    // Fresh connection: bypasses the long-lived pool on purpose. The
    // open includes the minion ensure step with its own 2-minute budget.
    let client = pool
        .connect_fresh(&target)
        .await
        .map_err(|e| e.to_string())?;

    let result = client
        .minion_call(command::PING, &serde_json::json!({}), Some(check_timeout))
        .await
        .map(|_| ())
        .map_err(|e| e.to_string());
    client.disconnect().await;
    result
}

/// Build the SSH target for a node, decrypting its key.
pub(crate) async fn resolve_target(
    store: &Store,
    cipher: &SecretCipher,
    node: &Node,
) -> Result<NodeTarget, String> {
    let key_ref = node
        .ssh_key_id
        .as_ref()
        .ok_or_else(|| "node has no ssh key".to_string())?;
    let key = store
        .get_ssh_key(key_ref)
        .await
        .map_err(|e| format!("ssh key: {e}"))?;
    let private_key = cipher
        .decrypt_string(&key.encrypted_key)
        .map_err(|e| format!("key decrypt: {e}"))?;

    Ok(NodeTarget {
        reference_id: node.reference_id.clone(),
        host: node.ssh_host.clone(),
        port: node.ssh_port,
        user: node.ssh_user.clone(),
        private_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoster_store::store::{NewNode, NewSshKey};
    use hoster_store::ResourceLimits;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn seeded() -> (Store, SecretCipher, Node) {
        let store = Store::open_in_memory().await.unwrap();
        let cipher = SecretCipher::new(KEY).unwrap();
        let key = store
            .create_ssh_key(NewSshKey {
                creator_id: "creator-1".to_string(),
                name: "default".to_string(),
                encrypted_key: cipher.encrypt(b"not-a-real-key").unwrap(),
                public_key: "ssh-ed25519 AAAA".to_string(),
                fingerprint: "SHA256:x".to_string(),
            })
            .await
            .unwrap();
        let node = store
            .create_node(NewNode {
                name: "worker-1".to_string(),
                creator_id: "creator-1".to_string(),
                ssh_host: "127.0.0.1".to_string(),
                ssh_port: 1,
                ssh_user: "root".to_string(),
                ssh_key_id: Some(key.reference_id),
                capabilities: vec!["standard".to_string()],
                capacity: ResourceLimits::default(),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, cipher, node)
    }

    #[tokio::test]
    async fn unreachable_node_is_marked_offline() {
        let (store, cipher, node) = seeded().await;
        let pool = Arc::new(NodePool::new(None, Duration::from_secs(1)).unwrap());

        let checker = HealthChecker::new(
            store.clone(),
            pool,
            cipher,
            Duration::from_secs(60),
            5,
            Duration::from_secs(1),
        );
        checker.tick().await;

        let node = store.get_node(&node.reference_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.last_health_check.is_some());
        assert!(!node.error_message.is_empty());
    }

    #[tokio::test]
    async fn node_without_key_is_marked_offline_with_reason() {
        let (store, cipher, _) = seeded().await;
        let node = store
            .create_node(NewNode {
                name: "keyless".to_string(),
                creator_id: "creator-1".to_string(),
                ssh_host: "127.0.0.1".to_string(),
                ssh_port: 1,
                ssh_user: "root".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let pool = Arc::new(NodePool::new(None, Duration::from_secs(1)).unwrap());

        check_node(&store, &pool, &cipher, node.clone(), Duration::from_secs(1)).await;
        let node = store.get_node(&node.reference_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.error_message.contains("no ssh key"));
    }

    #[tokio::test]
    async fn maintenance_nodes_are_skipped() {
        let (store, cipher, node) = seeded().await;
        let mut n = store.get_node(&node.reference_id).await.unwrap();
        n.status = NodeStatus::Maintenance;
        store.update_node(&n).await.unwrap();

        let pool = Arc::new(NodePool::new(None, Duration::from_secs(1)).unwrap());
        let checker = HealthChecker::new(
            store.clone(),
            pool,
            cipher,
            Duration::from_secs(60),
            5,
            Duration::from_secs(1),
        );
        checker.tick().await;

        // Untouched: still maintenance, never checked.
        let node = store.get_node(&node.reference_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Maintenance);
        assert!(node.last_health_check.is_none());
    }
}
