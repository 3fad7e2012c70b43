//! hoster-planner — pure planning logic for deployments.
//!
//! Transforms a compose-style template plus a variable binding into an
//! ordered sequence of container plans with stable resource names. No
//! I/O: the deployer executes plans against a container runtime.

pub mod compose;
pub mod order;
pub mod plan;
pub mod substitute;

pub use compose::{ComposeSpec, Service};
pub use order::order_services;
pub use plan::{plan_deployment, plan_service, ContainerPlan, PlanContext};
pub use substitute::substitute_variables;

use thiserror::Error;

/// Result type alias for planner operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors produced while parsing or planning a template.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid compose spec: {0}")]
    Parse(String),

    #[error("compose spec declares no services")]
    NoServices,

    #[error("service {service:?} has no image")]
    MissingImage { service: String },

    #[error("service {service:?} depends on unknown service {dependency:?}")]
    UnknownDependency { service: String, dependency: String },

    #[error("invalid port specification {0:?}")]
    InvalidPort(String),

    #[error("invalid volume specification {0:?}")]
    InvalidVolume(String),
}
