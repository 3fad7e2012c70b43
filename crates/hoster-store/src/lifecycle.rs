//! Lifecycle state machines for deployments and cloud provisions.
//!
//! Pure transition tables. Status fields are never mutated directly;
//! handlers and workers go through `Deployment::transition` /
//! `CloudProvision::transition`, which consult these tables, or plan
//! multi-step paths with `determine_start_path` / `determine_stop_path`.

use crate::types::DeploymentStatus as D;
use crate::types::ProvisionStatus as P;
use crate::types::{DeploymentStatus, ProvisionStatus};

/// Whether a deployment may move from `from` to `to`.
pub fn deployment_transition_allowed(from: D, to: D) -> bool {
    matches!(
        (from, to),
        (D::Pending, D::Scheduled)
            | (D::Scheduled, D::Starting)
            | (D::Starting, D::Running)
            | (D::Running, D::Stopping)
            | (D::Stopping, D::Stopped)
            | (D::Stopped, D::Starting)
            | (D::Failed, D::Starting)
            | (D::Starting, D::Failed)
            | (D::Running, D::Failed)
            | (D::Deleting, D::Deleted)
    ) || (to == D::Deleting && !from.is_terminal() && from != D::Deleting)
}

/// Whether a provision may move from `from` to `to`.
pub fn provision_transition_allowed(from: P, to: P) -> bool {
    matches!(
        (from, to),
        (P::Pending, P::Creating)
            | (P::Creating, P::Configuring)
            | (P::Configuring, P::Ready)
            | (P::Pending, P::Destroying)
            | (P::Creating, P::Destroying)
            | (P::Configuring, P::Destroying)
            | (P::Ready, P::Destroying)
            | (P::Failed, P::Destroying)
            | (P::Destroying, P::Destroyed)
    ) || (to == P::Failed && !from.is_terminal())
}

/// Outcome of planning a start or stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPlan {
    /// Ordered transitions to apply, first to last.
    Valid(Vec<DeploymentStatus>),
    /// The request is rejected with a user-facing reason.
    Rejected(&'static str),
}

impl PathPlan {
    pub fn is_valid(&self) -> bool {
        matches!(self, PathPlan::Valid(_))
    }
}

/// Plan the transition sequence for a start request from the current
/// status. Each source state yields either an exact ordered path or an
/// exact rejection reason.
pub fn determine_start_path(current: D) -> PathPlan {
    match current {
        D::Pending => PathPlan::Valid(vec![D::Scheduled, D::Starting]),
        D::Stopped | D::Failed => PathPlan::Valid(vec![D::Starting]),
        D::Running => PathPlan::Rejected("deployment is already running"),
        D::Starting => PathPlan::Rejected("deployment is already starting"),
        D::Stopping => PathPlan::Rejected("deployment is currently stopping"),
        D::Scheduled => PathPlan::Rejected("deployment is already scheduled"),
        D::Deleting => PathPlan::Rejected("deployment is being deleted"),
        D::Deleted => PathPlan::Rejected("cannot start deleted deployment"),
    }
}

/// Plan the transition sequence for a stop request. Stopping is only
/// allowed from `running`.
pub fn determine_stop_path(current: D) -> PathPlan {
    match current {
        D::Running => PathPlan::Valid(vec![D::Stopping, D::Stopped]),
        _ => PathPlan::Rejected("deployment is not running"),
    }
}
