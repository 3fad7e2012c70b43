//! hoster-deployer — turns deployment records into running containers.
//!
//! The deployer owns the start/stop/delete/restart flows: state-machine
//! planned transitions, compose planning, proxy-port allocation, and
//! execution against the local daemon or a pooled remote node.

pub mod convert;
pub mod executor;

pub use executor::Deployer;

use thiserror::Error;

/// Result type alias for deployer operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors from deployment execution.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Store(#[from] hoster_store::StoreError),

    #[error("invalid template: {0}")]
    Plan(#[from] hoster_planner::PlanError),

    #[error("{0}")]
    Rejected(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] hoster_docker::RuntimeError),

    #[error("no free proxy port in {0}-{1}")]
    PortsExhausted(u16, u16),
}
