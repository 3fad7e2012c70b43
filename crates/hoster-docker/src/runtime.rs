//! The abstract container-daemon interface.

use async_trait::async_trait;

use crate::types::*;

/// Everything the control plane asks of a container daemon, local or
/// remote. All calls respect task cancellation at their await points.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness probe against the daemon.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Host-level capacity.
    async fn system_info(&self) -> RuntimeResult<SystemInfo>;

    async fn create_network(&self, name: &str) -> RuntimeResult<()>;
    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    async fn create_volume(&self, name: &str) -> RuntimeResult<()>;
    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;

    /// Create a container; returns the daemon-assigned id.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;
    /// Stop with an optional grace period in seconds.
    async fn stop_container(&self, id: &str, timeout_secs: Option<u32>) -> RuntimeResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn list_containers(&self, filters: &ListFilters) -> RuntimeResult<Vec<ContainerInfo>>;
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo>;
    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<String>;
    async fn container_stats(&self, id: &str) -> RuntimeResult<StatsSnapshot>;

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;
}
