//! Domain types for the Hoster store.
//!
//! These types mirror the relational schema. Nested collections
//! (variables, domains, container records, tags) live in JSON TEXT
//! columns and are serialized with serde_json.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Statuses ──────────────────────────────────────────────────────

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleting,
    Deleted,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "scheduled" => Self::Scheduled,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "failed" => Self::Failed,
            "deleting" => Self::Deleting,
            "deleted" => Self::Deleted,
            _ => return None,
        })
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud provision lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Pending,
    Creating,
    Configuring,
    Ready,
    Destroying,
    Destroyed,
    Failed,
}

impl ProvisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "creating" => Self::Creating,
            "configuring" => Self::Configuring,
            "ready" => Self::Ready,
            "destroying" => Self::Destroying,
            "destroyed" => Self::Destroyed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

impl std::fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "maintenance" => Self::Maintenance,
            _ => return None,
        })
    }
}

/// Where a node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Manual,
    Aws,
    Digitalocean,
    Hetzner,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Aws => "aws",
            Self::Digitalocean => "digitalocean",
            Self::Hetzner => "hetzner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "manual" => Self::Manual,
            "aws" => Self::Aws,
            "digitalocean" => Self::Digitalocean,
            "hetzner" => Self::Hetzner,
            _ => return None,
        })
    }
}

// ── Templates ─────────────────────────────────────────────────────

/// A declared template variable with an optional default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
    /// Free-form type hint ("string", "number", "password", ...).
    #[serde(default)]
    pub var_type: String,
}

/// CPU/memory/disk bounds. Zero means unlimited/unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

/// A recipe deployments instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub reference_id: String,
    pub slug: String,
    pub version: i64,
    /// Compose-style specification (YAML text).
    pub compose_spec: String,
    pub variables: Vec<TemplateVariable>,
    pub resources: ResourceLimits,
    pub price_cents: i64,
    pub category: String,
    pub tags: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub published: bool,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Deployments ───────────────────────────────────────────────────

/// Hostname kind attached to a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Auto,
    Custom,
}

/// DNS verification state for a custom domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

/// A hostname routing to a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDomain {
    pub hostname: String,
    pub kind: DomainKind,
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_check_error: Option<String>,
}

impl DeploymentDomain {
    /// The system-assigned hostname for a deployment name.
    pub fn auto(name: &str, base_domain: &str) -> Self {
        Self {
            hostname: format!("{name}.{base_domain}"),
            kind: DomainKind::Auto,
            verification_status: VerificationStatus::Verified,
            verified_at: None,
            last_check_error: None,
        }
    }

    pub fn custom(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_ascii_lowercase(),
            kind: DomainKind::Custom,
            verification_status: VerificationStatus::Pending,
            verified_at: None,
            last_check_error: None,
        }
    }
}

/// A container port exposed by a running deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Snapshot of a container belonging to a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub id: String,
    pub image: String,
    pub status: String,
    #[serde(default)]
    pub ports: Vec<PortRecord>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// A running instance of a template for a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub reference_id: String,
    /// Customer-chosen lowercase slug; becomes the auto-domain label.
    pub name: String,
    pub template_id: i64,
    pub template_version: i64,
    pub customer_id: String,
    /// Assigned node reference id; empty string means the local daemon.
    pub node_id: String,
    pub status: DeploymentStatus,
    pub variables: HashMap<String, String>,
    pub domains: Vec<DeploymentDomain>,
    pub containers: Vec<ContainerRecord>,
    pub resources: ResourceLimits,
    /// Port on the target node the entry container is exposed on.
    /// Nonzero whenever status is starting or running.
    pub proxy_port: u16,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Whether the hostname router may forward traffic here.
    pub fn is_routable(&self) -> bool {
        self.status == DeploymentStatus::Running && self.proxy_port > 0
    }

    /// The deployment's auto-assigned domain, if present.
    pub fn auto_domain(&self) -> Option<&DeploymentDomain> {
        self.domains.iter().find(|d| d.kind == DomainKind::Auto)
    }

    /// Apply a status transition after consulting the state machine.
    pub fn transition(&mut self, to: DeploymentStatus) -> crate::StoreResult<()> {
        if !crate::lifecycle::deployment_transition_allowed(self.status, to) {
            return Err(crate::StoreError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// A worker host executing containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub reference_id: String,
    pub name: String,
    pub creator_id: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Reference id of the SSH key; null after key deletion.
    pub ssh_key_id: Option<String>,
    pub docker_socket: String,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub capacity: ResourceLimits,
    pub usage: ResourceLimits,
    pub location: String,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: String,
    pub provider: ProviderKind,
    pub provision_id: Option<String>,
    pub base_domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── SSH keys & credentials ────────────────────────────────────────

/// An encrypted SSH private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: String,
    pub name: String,
    /// AES-256-GCM ciphertext of the OpenSSH-encoded private key.
    #[serde(skip_serializing)]
    pub encrypted_key: Vec<u8>,
    pub public_key: String,
    /// SHA256 fingerprint of the public key.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// An encrypted cloud provider API secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCredential {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: String,
    pub name: String,
    pub provider: ProviderKind,
    #[serde(skip_serializing)]
    pub encrypted_credential: Vec<u8>,
    pub default_region: String,
    pub created_at: DateTime<Utc>,
}

// ── Cloud provisions ──────────────────────────────────────────────

/// An in-progress or completed cloud-instance creation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudProvision {
    pub id: i64,
    pub reference_id: String,
    pub creator_id: String,
    pub credential_id: String,
    pub provider: ProviderKind,
    pub status: ProvisionStatus,
    pub instance_name: String,
    pub region: String,
    pub size: String,
    pub provider_instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub node_id: Option<String>,
    pub ssh_key_id: Option<String>,
    /// Free text for progress display.
    pub current_step: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CloudProvision {
    /// Apply a status transition after consulting the state machine.
    pub fn transition(&mut self, to: ProvisionStatus) -> crate::StoreResult<()> {
        if !crate::lifecycle::provision_transition_allowed(self.status, to) {
            return Err(crate::StoreError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

// ── Usage events ──────────────────────────────────────────────────

/// Billable action kinds.
pub mod event_kind {
    pub const DEPLOYMENT_CREATED: &str = "deployment.created";
    pub const DEPLOYMENT_STARTED: &str = "deployment.started";
    pub const DEPLOYMENT_STOPPED: &str = "deployment.stopped";
    pub const DEPLOYMENT_DELETED: &str = "deployment.deleted";
    pub const PROVISION_CREATED: &str = "provision.created";
    pub const PROVISION_DESTROYED: &str = "provision.destroyed";
}

/// A billable action record. Rows with `reported_at IS NULL` form the
/// outbox queue consumed by the billing reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: i64,
    pub reference_id: String,
    pub user_id: String,
    pub event_type: String,
    pub resource_id: String,
    pub resource_type: String,
    pub quantity: i64,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

// ── Container events ──────────────────────────────────────────────

/// A log-line-grade operational event for the monitoring UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub id: i64,
    pub reference_id: String,
    pub deployment_id: i64,
    pub kind: String,
    pub container_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            DeploymentStatus::Pending,
            DeploymentStatus::Scheduled,
            DeploymentStatus::Starting,
            DeploymentStatus::Running,
            DeploymentStatus::Stopping,
            DeploymentStatus::Stopped,
            DeploymentStatus::Failed,
            DeploymentStatus::Deleting,
            DeploymentStatus::Deleted,
        ] {
            assert_eq!(DeploymentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DeploymentStatus::parse("bogus"), None);
    }

    #[test]
    fn auto_domain_hostname_shape() {
        let d = DeploymentDomain::auto("blog", "apps.localhost");
        assert_eq!(d.hostname, "blog.apps.localhost");
        assert_eq!(d.kind, DomainKind::Auto);
        assert_eq!(d.verification_status, VerificationStatus::Verified);
    }

    #[test]
    fn custom_domains_are_lowercased_and_pending() {
        let d = DeploymentDomain::custom("Shop.Example.COM");
        assert_eq!(d.hostname, "shop.example.com");
        assert_eq!(d.verification_status, VerificationStatus::Pending);
    }

    #[test]
    fn routable_requires_running_and_port() {
        let mut dep = test_deployment();
        dep.status = DeploymentStatus::Running;
        dep.proxy_port = 20001;
        assert!(dep.is_routable());

        dep.proxy_port = 0;
        assert!(!dep.is_routable());

        dep.proxy_port = 20001;
        dep.status = DeploymentStatus::Stopped;
        assert!(!dep.is_routable());
    }

    fn test_deployment() -> Deployment {
        Deployment {
            id: 1,
            reference_id: "dep_test".into(),
            name: "blog".into(),
            template_id: 1,
            template_version: 1,
            customer_id: "user-1".into(),
            node_id: String::new(),
            status: DeploymentStatus::Pending,
            variables: HashMap::new(),
            domains: vec![DeploymentDomain::auto("blog", "apps.localhost")],
            containers: vec![],
            resources: ResourceLimits::default(),
            proxy_port: 0,
            error_message: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }
}
