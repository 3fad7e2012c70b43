//! hoster-nodes — remote node access for the control plane.
//!
//! A pool of authenticated SSH connections, one per node, tunneling a
//! JSON request/response protocol to the minion helper binary installed
//! on each node. The pool auto-deploys the minion when it is missing or
//! stale, guarded by a per-node mutex.

pub mod client;
pub mod keys;
pub mod minion;
pub mod pool;
pub mod protocol;
pub mod remote;

pub use client::{ExecOutput, NodeClient, NodeTarget};
pub use pool::NodePool;
pub use remote::RemoteRuntime;

use thiserror::Error;

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors talking to a remote node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("ssh connection failed: {0}")]
    Connect(String),

    #[error("ssh authentication failed: {0}")]
    Auth(String),

    #[error("ssh key decode failed: {0}")]
    KeyDecode(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("exec timed out after {0}s")]
    Timeout(u64),

    #[error("sftp transfer failed: {0}")]
    Sftp(String),

    #[error("minion protocol error: {0}")]
    Protocol(String),

    #[error("minion not installed and no binary configured")]
    MinionUnavailable,
}

impl NodeError {
    /// Whether this failure means the node itself is unreachable (vs. a
    /// command-level failure). The health checker marks nodes offline on
    /// these.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, NodeError::Connect(_) | NodeError::Auth(_) | NodeError::Timeout(_))
    }
}
