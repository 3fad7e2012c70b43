//! Remote container runtime over the minion protocol.
//!
//! Implements `ContainerRuntime` by serializing each request as JSON
//! over an SSH exec of the node's minion binary. Connection-level
//! failures classify as `connection_failed`; envelope errors propagate
//! their carried code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use hoster_docker::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ErrorCode, ListFilters, LogOptions,
    RuntimeError, RuntimeResult, StatsSnapshot, SystemInfo,
};

use crate::client::NodeTarget;
use crate::pool::NodePool;
use crate::protocol::command;
use crate::NodeError;

/// Map a node-level failure onto the shared runtime error codes.
pub fn classify(e: NodeError) -> RuntimeError {
    match &e {
        NodeError::Connect(_) | NodeError::Auth(_) | NodeError::KeyDecode(_) => {
            RuntimeError::connection_failed(e.to_string())
        }
        NodeError::Timeout(_) => RuntimeError::new(ErrorCode::Timeout, e.to_string()),
        _ => RuntimeError::internal(e.to_string()),
    }
}

/// A `ContainerRuntime` bound to one node, borrowing connections from
/// the shared pool.
pub struct RemoteRuntime {
    pool: Arc<NodePool>,
    target: NodeTarget,
    /// Per-RPC budget; pulls get a larger one.
    call_timeout: Duration,
}

impl RemoteRuntime {
    pub fn new(pool: Arc<NodePool>, target: NodeTarget) -> Self {
        Self {
            pool,
            target,
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn call(
        &self,
        command: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> RuntimeResult<serde_json::Value> {
        let client = self.pool.get(&self.target).await.map_err(classify)?;
        client.minion_call(command, &args, Some(timeout)).await
    }

    async fn call_default(&self, command: &str, args: serde_json::Value) -> RuntimeResult<serde_json::Value> {
        self.call(command, args, self.call_timeout).await
    }

    fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> RuntimeResult<T> {
        serde_json::from_value(value)
            .map_err(|e| RuntimeError::internal(format!("minion payload: {e}")))
    }
}

#[async_trait]
impl ContainerRuntime for RemoteRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.call_default(command::PING, json!({})).await?;
        Ok(())
    }

    async fn system_info(&self) -> RuntimeResult<SystemInfo> {
        let data = self.call_default(command::SYSTEM_INFO, json!({})).await?;
        Self::decode(data)
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        self.call_default(command::CREATE_NETWORK, json!({ "name": name })).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.call_default(command::REMOVE_NETWORK, json!({ "name": name })).await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> RuntimeResult<()> {
        self.call_default(command::CREATE_VOLUME, json!({ "name": name })).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.call_default(command::REMOVE_VOLUME, json!({ "name": name })).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let args = serde_json::to_value(spec)
            .map_err(|e| RuntimeError::internal(e.to_string()))?;
        let data = self.call_default(command::CREATE_CONTAINER, args).await?;
        let id = data
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuntimeError::internal("create-container response missing id"))?;
        Ok(id.to_string())
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.call_default(command::START_CONTAINER, json!({ "id": id })).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: Option<u32>) -> RuntimeResult<()> {
        self.call_default(
            command::STOP_CONTAINER,
            json!({ "id": id, "timeout_secs": timeout_secs }),
        )
        .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.call_default(command::REMOVE_CONTAINER, json!({ "id": id, "force": force }))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, filters: &ListFilters) -> RuntimeResult<Vec<ContainerInfo>> {
        let args = serde_json::to_value(filters)
            .map_err(|e| RuntimeError::internal(e.to_string()))?;
        let data = self.call_default(command::LIST_CONTAINERS, args).await?;
        Self::decode(data)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        let data = self
            .call_default(command::LIST_CONTAINERS, json!({ "all": true, "name": id }))
            .await?;
        let mut infos: Vec<ContainerInfo> = Self::decode(data)?;
        infos
            .drain(..)
            .next()
            .ok_or_else(|| RuntimeError::not_found(format!("container {id}")))
    }

    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<String> {
        let data = self
            .call_default(
                command::CONTAINER_LOGS,
                json!({ "id": id, "tail": opts.tail, "timestamps": opts.timestamps }),
            )
            .await?;
        let logs = data
            .get("logs")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuntimeError::internal("container-logs response missing logs"))?;
        Ok(logs.to_string())
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<StatsSnapshot> {
        let data = self
            .call_default(command::CONTAINER_STATS, json!({ "id": id }))
            .await?;
        Self::decode(data)
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        let data = self
            .call_default(command::IMAGE_EXISTS, json!({ "image": image }))
            .await?;
        data.get("exists")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| RuntimeError::internal("image-exists response missing flag"))
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        // Pulls can legitimately take minutes.
        self.call(
            command::PULL_IMAGE,
            json!({ "image": image }),
            Duration::from_secs(600),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_classify_as_connection_failed() {
        for err in [
            NodeError::Connect("refused".to_string()),
            NodeError::Auth("rejected".to_string()),
            NodeError::KeyDecode("bad pem".to_string()),
        ] {
            assert_eq!(classify(err).code, ErrorCode::ConnectionFailed);
        }
    }

    #[test]
    fn timeouts_and_protocol_failures_classify() {
        assert_eq!(classify(NodeError::Timeout(60)).code, ErrorCode::Timeout);
        assert_eq!(
            classify(NodeError::Protocol("garbage".to_string())).code,
            ErrorCode::Internal
        );
        assert_eq!(
            classify(NodeError::Exec("channel".to_string())).code,
            ErrorCode::Internal
        );
    }
}
