//! Wire types shared by the local client and the minion protocol.
//!
//! Everything here serializes to JSON: the remote runtime ships these
//! types verbatim over the minion protocol, so field names are part of
//! the node RPC contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Stable error codes shared across the daemon surface and the minion
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    NotRunning,
    AlreadyRunning,
    InUse,
    PortConflict,
    ConnectionFailed,
    Timeout,
    PullFailed,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::NotRunning => "not_running",
            Self::AlreadyRunning => "already_running",
            Self::InUse => "in_use",
            Self::PortConflict => "port_conflict",
            Self::ConnectionFailed => "connection_failed",
            Self::Timeout => "timeout",
            Self::PullFailed => "pull_failed",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "not_found" => Self::NotFound,
            "already_exists" => Self::AlreadyExists,
            "not_running" => Self::NotRunning,
            "already_running" => Self::AlreadyRunning,
            "in_use" => Self::InUse,
            "port_conflict" => Self::PortConflict,
            "connection_failed" => Self::ConnectionFailed,
            "timeout" => Self::Timeout,
            "pull_failed" => Self::PullFailed,
            "invalid_input" => Self::InvalidInput,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

/// A runtime failure with a stable code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {message}", code.as_str())]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

/// A container port binding. `host_port` zero means auto-assign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub protocol: String,
}

/// A volume or bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Health check in daemon units (nanoseconds, as the Docker API takes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub test: Vec<String>,
    #[serde(default)]
    pub interval_ns: i64,
    #[serde(default)]
    pub timeout_ns: i64,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub start_period_ns: i64,
}

/// The create-container request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default)]
    pub network: Option<String>,
    /// `no`, `always`, `on-failure`, `unless-stopped`.
    #[serde(default)]
    pub restart_policy: String,
    /// Zero means unlimited.
    #[serde(default)]
    pub cpu_cores: f64,
    /// Zero means unlimited.
    #[serde(default)]
    pub memory_bytes: i64,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Filters for container listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilters {
    /// Include stopped containers.
    #[serde(default)]
    pub all: bool,
    /// `key=value` label filter.
    #[serde(default)]
    pub label: Option<String>,
    /// Name substring filter.
    #[serde(default)]
    pub name: Option<String>,
}

impl ListFilters {
    /// All containers (running or not) managed for one deployment.
    pub fn deployment(deployment_ref: &str) -> Self {
        Self {
            all: true,
            label: Some(format!("com.hoster.deployment={deployment_ref}")),
            name: None,
        }
    }
}

/// A container as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Daemon state string: `running`, `exited`, ...
    pub state: String,
    /// Human status line: `Up 2 minutes`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
}

/// Options for a one-shot log fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Number of trailing lines; absent means everything.
    #[serde(default)]
    pub tail: Option<u32>,
    #[serde(default)]
    pub timestamps: bool,
}

/// A point-in-time resource usage snapshot for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Host-level capacity as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemInfo {
    pub containers: i64,
    pub containers_running: i64,
    pub images: i64,
    pub cpu_cores: i64,
    pub memory_bytes: i64,
    pub docker_version: String,
    pub os: String,
    pub architecture: String,
}
