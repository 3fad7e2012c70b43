//! Deployment execution flows.
//!
//! Each flow loads the deployment, plans its transitions through the
//! state machine, executes against the right runtime, and writes the
//! outcome back. Two concurrent flows on one deployment race at the
//! database; the loser gets an invalid-transition error and re-plans.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use hoster_core::SecretCipher;
use hoster_docker::{ContainerRuntime, ErrorCode, ListFilters};
use hoster_nodes::{NodePool, NodeTarget, RemoteRuntime};
use hoster_planner::compose::ComposeSpec;
use hoster_planner::plan::PlanContext;
use hoster_planner::plan_deployment;
use hoster_store::lifecycle::{determine_start_path, determine_stop_path, PathPlan};
use hoster_store::store::NewUsageEvent;
use hoster_store::{
    event_kind, ContainerRecord, Deployment, DeploymentStatus, PortRecord, Store, StoreError,
    Template,
};

use crate::convert::plan_to_spec;
use crate::{DeployError, DeployResult};

/// Grace period handed to the daemon when stopping containers.
const STOP_GRACE_SECS: u32 = 10;

/// Executes deployment lifecycle flows against container runtimes.
pub struct Deployer {
    store: Store,
    local: Arc<dyn ContainerRuntime>,
    pool: Option<Arc<NodePool>>,
    cipher: Option<SecretCipher>,
    port_range: (u16, u16),
}

impl Deployer {
    pub fn new(store: Store, local: Arc<dyn ContainerRuntime>, port_range: (u16, u16)) -> Self {
        Self {
            store,
            local,
            pool: None,
            cipher: None,
            port_range,
        }
    }

    /// Enable execution on remote nodes through the shared pool.
    pub fn with_remote(mut self, pool: Arc<NodePool>, cipher: SecretCipher) -> Self {
        self.pool = Some(pool);
        self.cipher = Some(cipher);
        self
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Drive a deployment to `running`: planned transitions, port
    /// allocation, then container execution in dependency order.
    pub async fn start(&self, reference_id: &str) -> DeployResult<Deployment> {
        let dep = self.store.get_deployment(reference_id).await?;
        let path = match determine_start_path(dep.status) {
            PathPlan::Valid(path) => path,
            PathPlan::Rejected(reason) => return Err(DeployError::Rejected(reason.to_string())),
        };

        // Template problems surface before any state changes.
        let template = self.store.get_template_by_id(dep.template_id).await?;
        let compose = ComposeSpec::parse(&template.compose_spec)?;

        let mut dep = dep;
        for status in path {
            if status == DeploymentStatus::Starting && dep.proxy_port == 0 {
                dep = self.allocate_port(dep).await?;
            }
            dep = self.store.transition_deployment(reference_id, status).await?;
        }

        match self.run_start(&mut dep, &template, &compose).await {
            Ok(()) => {
                dep.transition(DeploymentStatus::Running)?;
                dep.started_at = Some(Utc::now());
                dep.stopped_at = None;
                dep.error_message.clear();
                self.store.update_deployment(&dep).await?;
                self.record_usage(&dep, event_kind::DEPLOYMENT_STARTED).await;
                info!(deployment = %dep.reference_id, port = dep.proxy_port, "deployment running");
                Ok(dep)
            }
            Err(e) => {
                dep.transition(DeploymentStatus::Failed)?;
                dep.error_message = e.to_string();
                self.store.update_deployment(&dep).await?;
                let _ = self
                    .store
                    .record_container_event(dep.id, "deployment.failed", "", &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_start(
        &self,
        dep: &mut Deployment,
        template: &Template,
        compose: &ComposeSpec,
    ) -> DeployResult<()> {
        let runtime = self.runtime_for(dep).await?;
        let ctx = PlanContext {
            deployment_ref: dep.reference_id.clone(),
            template_ref: template.reference_id.clone(),
            bindings: dep.variables.clone(),
        };

        self.ensure_network(runtime.as_ref(), &ctx.network_name(), dep).await?;
        for volume in compose.declared_volumes() {
            let name = ctx.volume_name(&volume);
            match runtime.create_volume(&name).await {
                Ok(()) | Err(hoster_docker::RuntimeError { code: ErrorCode::AlreadyExists, .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // The first input-order service exposing a port owns the proxy
        // port.
        let entry_container = compose
            .services
            .iter()
            .find(|(_, s)| !s.ports.is_empty())
            .map(|(name, _)| ctx.container_name(name));

        let plans = plan_deployment(&ctx, compose)?;
        let mut records = Vec::with_capacity(plans.len());

        for plan in &plans {
            if !runtime.image_exists(&plan.image).await? {
                self.record_event(dep, "image.pulling", &plan.name, &plan.image).await;
                runtime.pull_image(&plan.image).await?;
            }

            let pin = (Some(&plan.name) == entry_container.as_ref()).then_some(dep.proxy_port);
            let spec = plan_to_spec(plan, pin);

            let id = match runtime.create_container(&spec).await {
                Ok(id) => id,
                // A previous run left the container behind; reuse it.
                Err(e) if e.code == ErrorCode::AlreadyExists => {
                    runtime.inspect_container(&plan.name).await?.id
                }
                Err(e) => return Err(e.into()),
            };
            runtime.start_container(&id).await?;
            self.record_event(dep, "container.started", &plan.name, &plan.image).await;

            records.push(ContainerRecord {
                name: plan.name.clone(),
                id,
                image: plan.image.clone(),
                status: "running".to_string(),
                ports: spec
                    .ports
                    .iter()
                    .map(|p| PortRecord {
                        container_port: p.container_port,
                        host_port: p.host_port,
                        protocol: p.protocol.clone(),
                    })
                    .collect(),
                started_at: Some(Utc::now()),
            });
        }

        dep.containers = records;
        Ok(())
    }

    async fn ensure_network(
        &self,
        runtime: &dyn ContainerRuntime,
        name: &str,
        dep: &Deployment,
    ) -> DeployResult<()> {
        match runtime.create_network(name).await {
            Ok(()) => {
                self.record_event(dep, "network.created", "", name).await;
                Ok(())
            }
            Err(e) if e.code == ErrorCode::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Stop a running deployment. Only valid from `running`.
    pub async fn stop(&self, reference_id: &str) -> DeployResult<Deployment> {
        let dep = self.store.get_deployment(reference_id).await?;
        if let PathPlan::Rejected(reason) = determine_stop_path(dep.status) {
            return Err(DeployError::Rejected(reason.to_string()));
        }

        let mut dep = self
            .store
            .transition_deployment(reference_id, DeploymentStatus::Stopping)
            .await?;

        match self.runtime_for(&dep).await {
            Ok(runtime) => {
                for record in &dep.containers {
                    match runtime.stop_container(&record.id, Some(STOP_GRACE_SECS)).await {
                        Ok(())
                        | Err(hoster_docker::RuntimeError {
                            code: ErrorCode::NotRunning | ErrorCode::NotFound,
                            ..
                        }) => {
                            self.record_event(&dep, "container.stopped", &record.name, "").await;
                        }
                        Err(e) => {
                            warn!(container = %record.name, error = %e, "stop failed");
                            self.record_event(&dep, "container.stop_failed", &record.name, &e.to_string())
                                .await;
                        }
                    }
                }
            }
            Err(e) => warn!(deployment = %dep.reference_id, error = %e, "runtime unavailable during stop"),
        }

        dep.transition(DeploymentStatus::Stopped)?;
        dep.stopped_at = Some(Utc::now());
        for record in &mut dep.containers {
            record.status = "exited".to_string();
        }
        self.store.update_deployment(&dep).await?;
        self.record_usage(&dep, event_kind::DEPLOYMENT_STOPPED).await;
        info!(deployment = %dep.reference_id, "deployment stopped");
        Ok(dep)
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Tear a deployment down and mark it deleted. Cleanup is
    /// best-effort: a vanished node doesn't block deletion.
    pub async fn delete(&self, reference_id: &str) -> DeployResult<Deployment> {
        let dep = self.store.get_deployment(reference_id).await?;
        if dep.status == DeploymentStatus::Deleted {
            return Ok(dep);
        }

        let mut dep = self
            .store
            .transition_deployment(reference_id, DeploymentStatus::Deleting)
            .await?;

        match self.runtime_for(&dep).await {
            Ok(runtime) => self.cleanup_resources(runtime.as_ref(), &dep).await,
            Err(e) => warn!(deployment = %dep.reference_id, error = %e, "skipping cleanup, runtime unavailable"),
        }

        dep.containers.clear();
        dep.proxy_port = 0;
        dep.transition(DeploymentStatus::Deleted)?;
        self.store.update_deployment(&dep).await?;
        self.record_usage(&dep, event_kind::DEPLOYMENT_DELETED).await;
        info!(deployment = %dep.reference_id, "deployment deleted");
        Ok(dep)
    }

    async fn cleanup_resources(&self, runtime: &dyn ContainerRuntime, dep: &Deployment) {
        for record in &dep.containers {
            if let Err(e) = runtime.remove_container(&record.id, true).await {
                if !e.is_not_found() {
                    warn!(container = %record.name, error = %e, "remove failed");
                }
            }
        }
        // Catch strays the records missed (e.g. a crash between create
        // and record).
        if let Ok(strays) = runtime
            .list_containers(&ListFilters::deployment(&dep.reference_id))
            .await
        {
            for stray in strays {
                let _ = runtime.remove_container(&stray.id, true).await;
            }
        }

        let network = format!("hoster_{}", dep.reference_id);
        if let Err(e) = runtime.remove_network(&network).await {
            if !e.is_not_found() {
                warn!(network = %network, error = %e, "network remove failed");
            }
        }

        if let Ok(template) = self.store.get_template_by_id(dep.template_id).await {
            if let Ok(compose) = ComposeSpec::parse(&template.compose_spec) {
                for volume in compose.declared_volumes() {
                    let name = format!("hoster_{}_{volume}", dep.reference_id);
                    if let Err(e) = runtime.remove_volume(&name).await {
                        if !e.is_not_found() {
                            warn!(volume = %name, error = %e, "volume remove failed");
                        }
                    }
                }
            }
        }
    }

    // ── Restart ────────────────────────────────────────────────────

    /// Stop-path then start-path.
    pub async fn restart(&self, reference_id: &str) -> DeployResult<Deployment> {
        self.stop(reference_id).await?;
        self.start(reference_id).await
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Fetch logs for one container of a deployment. The container may
    /// be addressed by its full name or its service name.
    pub async fn container_logs(
        &self,
        reference_id: &str,
        container: &str,
        tail: Option<u32>,
    ) -> DeployResult<String> {
        let dep = self.store.get_deployment(reference_id).await?;
        let record = find_container(&dep, container)?;
        let runtime = self.runtime_for(&dep).await?;
        Ok(runtime
            .container_logs(&record.id, &hoster_docker::LogOptions { tail, timestamps: false })
            .await?)
    }

    /// Fetch a resource usage snapshot for one container.
    pub async fn container_stats(
        &self,
        reference_id: &str,
        container: &str,
    ) -> DeployResult<hoster_docker::StatsSnapshot> {
        let dep = self.store.get_deployment(reference_id).await?;
        let record = find_container(&dep, container)?;
        let runtime = self.runtime_for(&dep).await?;
        Ok(runtime.container_stats(&record.id).await?)
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Claim a free proxy port from the configured range. The partial
    /// unique index on `(node_id, proxy_port)` arbitrates races: a
    /// conflicting claim just advances to the next candidate.
    async fn allocate_port(&self, mut dep: Deployment) -> DeployResult<Deployment> {
        let (start, end) = self.port_range;
        for port in start..=end {
            dep.proxy_port = port;
            match self.store.update_deployment(&dep).await {
                Ok(()) => {
                    debug!(deployment = %dep.reference_id, port, "proxy port allocated");
                    return Ok(dep);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DeployError::PortsExhausted(start, end))
    }

    /// Pick the runtime for a deployment: local daemon for an empty
    /// node ref, pooled SSH runtime otherwise.
    async fn runtime_for(&self, dep: &Deployment) -> DeployResult<Arc<dyn ContainerRuntime>> {
        if dep.node_id.is_empty() {
            return Ok(self.local.clone());
        }
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| DeployError::NodeUnavailable("remote nodes are disabled".to_string()))?;
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| DeployError::NodeUnavailable("no encryption key configured".to_string()))?;

        let node = self.store.get_node(&dep.node_id).await?;
        let key_ref = node.ssh_key_id.as_ref().ok_or_else(|| {
            DeployError::NodeUnavailable(format!("node {} has no ssh key", node.reference_id))
        })?;
        let key = self.store.get_ssh_key(key_ref).await?;
        let private_key = cipher
            .decrypt_string(&key.encrypted_key)
            .map_err(|e| DeployError::NodeUnavailable(format!("key decrypt: {e}")))?;

        let target = NodeTarget {
            reference_id: node.reference_id,
            host: node.ssh_host,
            port: node.ssh_port,
            user: node.ssh_user,
            private_key,
        };
        Ok(Arc::new(RemoteRuntime::new(pool, target)))
    }

    async fn record_usage(&self, dep: &Deployment, kind: &str) {
        let result = self
            .store
            .record_usage_event(NewUsageEvent {
                user_id: dep.customer_id.clone(),
                event_type: kind.to_string(),
                resource_id: dep.reference_id.clone(),
                resource_type: "deployment".to_string(),
                quantity: 1,
                metadata: Default::default(),
            })
            .await;
        if let Err(e) = result {
            warn!(deployment = %dep.reference_id, error = %e, "usage event not recorded");
        }
    }

    async fn record_event(&self, dep: &Deployment, kind: &str, container: &str, message: &str) {
        if let Err(e) = self
            .store
            .record_container_event(dep.id, kind, container, message)
            .await
        {
            warn!(deployment = %dep.reference_id, error = %e, "container event not recorded");
        }
    }
}

fn find_container<'a>(
    dep: &'a Deployment,
    container: &str,
) -> DeployResult<&'a ContainerRecord> {
    dep.containers
        .iter()
        .find(|c| c.name == container || c.name.ends_with(&format!("_{container}")))
        .ok_or_else(|| {
            DeployError::Store(StoreError::NotFound(format!("container {container}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hoster_docker::{
        ContainerInfo, ContainerSpec, LogOptions, RuntimeError, RuntimeResult, StatsSnapshot,
        SystemInfo,
    };
    use hoster_store::store::{NewDeployment, NewTemplate};
    use hoster_store::{DeploymentDomain, ResourceLimits};

    #[derive(Default)]
    struct MockState {
        created: Vec<ContainerSpec>,
        started: Vec<String>,
        stopped: Vec<String>,
        removed: Vec<String>,
        networks: HashSet<String>,
        volumes: HashSet<String>,
        images: HashSet<String>,
        pulled: Vec<String>,
        fail_start: Option<RuntimeError>,
        next_id: u32,
    }

    #[derive(Default)]
    struct MockRuntime {
        state: Mutex<MockState>,
    }

    impl MockRuntime {
        fn with_image(image: &str) -> Self {
            let mock = Self::default();
            mock.state.lock().unwrap().images.insert(image.to_string());
            mock
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ping(&self) -> RuntimeResult<()> {
            Ok(())
        }
        async fn system_info(&self) -> RuntimeResult<SystemInfo> {
            Ok(SystemInfo::default())
        }
        async fn create_network(&self, name: &str) -> RuntimeResult<()> {
            let mut s = self.state.lock().unwrap();
            if !s.networks.insert(name.to_string()) {
                return Err(RuntimeError::new(ErrorCode::AlreadyExists, name));
            }
            Ok(())
        }
        async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
            self.state.lock().unwrap().networks.remove(name);
            Ok(())
        }
        async fn create_volume(&self, name: &str) -> RuntimeResult<()> {
            self.state.lock().unwrap().volumes.insert(name.to_string());
            Ok(())
        }
        async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
            self.state.lock().unwrap().volumes.remove(name);
            Ok(())
        }
        async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
            let mut s = self.state.lock().unwrap();
            if s.created.iter().any(|c| c.name == spec.name) {
                return Err(RuntimeError::new(ErrorCode::AlreadyExists, spec.name.clone()));
            }
            s.next_id += 1;
            let id = format!("ctr-{}", s.next_id);
            s.created.push(spec.clone());
            Ok(id)
        }
        async fn start_container(&self, id: &str) -> RuntimeResult<()> {
            let mut s = self.state.lock().unwrap();
            if let Some(err) = s.fail_start.clone() {
                return Err(err);
            }
            s.started.push(id.to_string());
            Ok(())
        }
        async fn stop_container(&self, id: &str, _t: Option<u32>) -> RuntimeResult<()> {
            self.state.lock().unwrap().stopped.push(id.to_string());
            Ok(())
        }
        async fn remove_container(&self, id: &str, _force: bool) -> RuntimeResult<()> {
            self.state.lock().unwrap().removed.push(id.to_string());
            Ok(())
        }
        async fn list_containers(&self, _f: &ListFilters) -> RuntimeResult<Vec<ContainerInfo>> {
            Ok(vec![])
        }
        async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
            let s = self.state.lock().unwrap();
            let idx = s
                .created
                .iter()
                .position(|c| c.name == id)
                .ok_or_else(|| RuntimeError::not_found(id))?;
            Ok(ContainerInfo {
                id: format!("ctr-{}", idx + 1),
                name: id.to_string(),
                ..Default::default()
            })
        }
        async fn container_logs(&self, _id: &str, _o: &LogOptions) -> RuntimeResult<String> {
            Ok(String::new())
        }
        async fn container_stats(&self, _id: &str) -> RuntimeResult<StatsSnapshot> {
            Ok(StatsSnapshot::default())
        }
        async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
            Ok(self.state.lock().unwrap().images.contains(image))
        }
        async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
            let mut s = self.state.lock().unwrap();
            s.pulled.push(image.to_string());
            s.images.insert(image.to_string());
            Ok(())
        }
    }

    const COMPOSE: &str = r#"
services:
  web:
    image: nginx:alpine
    ports: ["80"]
    depends_on: [db]
  db:
    image: postgres:16
volumes:
  data:
"#;

    async fn seed(store: &Store, compose: &str) -> Deployment {
        let template = store
            .create_template(NewTemplate {
                slug: "nginx-demo".to_string(),
                compose_spec: compose.to_string(),
                creator_id: "creator-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_deployment(NewDeployment {
                name: "blog".to_string(),
                template_id: template.id,
                template_version: template.version,
                customer_id: "user-1".to_string(),
                node_id: String::new(),
                variables: HashMap::new(),
                domains: vec![DeploymentDomain::auto("blog", "apps.localhost")],
                resources: ResourceLimits::default(),
            })
            .await
            .unwrap()
    }

    fn deployer(store: Store, runtime: Arc<MockRuntime>) -> Deployer {
        Deployer::new(store, runtime, (20000, 20010))
    }

    #[tokio::test]
    async fn start_runs_containers_in_dependency_order() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let runtime = Arc::new(MockRuntime::default());
        let deployer = deployer(store.clone(), runtime.clone());

        let dep = deployer.start(&dep.reference_id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Running);
        assert!(dep.proxy_port >= 20000 && dep.proxy_port <= 20010);
        assert!(dep.started_at.is_some());
        assert_eq!(dep.containers.len(), 2);

        let state = runtime.state.lock().unwrap();
        // db before web, and both images pulled (absent from the mock).
        let names: Vec<&str> = state.created.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![
            format!("hoster_{}_db", dep.reference_id),
            format!("hoster_{}_web", dep.reference_id),
        ]);
        assert_eq!(state.pulled.len(), 2);
        assert!(state.networks.contains(&format!("hoster_{}", dep.reference_id)));
        assert!(state.volumes.contains(&format!("hoster_{}_data", dep.reference_id)));

        // The web container's auto port is pinned to the proxy port.
        let web = state.created.iter().find(|c| c.name.ends_with("_web")).unwrap();
        assert_eq!(web.ports[0].host_port, dep.proxy_port);
    }

    #[tokio::test]
    async fn start_rejects_when_already_running() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let runtime = Arc::new(MockRuntime::default());
        let deployer = deployer(store.clone(), runtime);

        deployer.start(&dep.reference_id).await.unwrap();
        let err = deployer.start(&dep.reference_id).await.unwrap_err();
        assert!(matches!(err, DeployError::Rejected(ref r) if r == "deployment is already running"));
    }

    #[tokio::test]
    async fn stop_then_start_reuses_port_and_containers() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let runtime = Arc::new(MockRuntime::default());
        let deployer = deployer(store.clone(), runtime.clone());

        let running = deployer.start(&dep.reference_id).await.unwrap();
        let port = running.proxy_port;

        let stopped = deployer.stop(&dep.reference_id).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
        assert_eq!(stopped.proxy_port, port);
        assert!(stopped.containers.iter().all(|c| c.status == "exited"));

        // Containers exist already: start reuses them instead of failing.
        let running = deployer.start(&dep.reference_id).await.unwrap();
        assert_eq!(running.status, DeploymentStatus::Running);
        assert_eq!(running.proxy_port, port);
    }

    #[tokio::test]
    async fn stop_rejected_unless_running() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let deployer = deployer(store.clone(), Arc::new(MockRuntime::default()));

        let err = deployer.stop(&dep.reference_id).await.unwrap_err();
        assert!(matches!(err, DeployError::Rejected(ref r) if r == "deployment is not running"));
    }

    #[tokio::test]
    async fn execution_failure_marks_failed_and_allows_retry() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let runtime = Arc::new(MockRuntime::default());
        runtime.state.lock().unwrap().fail_start =
            Some(RuntimeError::new(ErrorCode::PortConflict, "port taken"));
        let deployer = deployer(store.clone(), runtime.clone());

        deployer.start(&dep.reference_id).await.unwrap_err();
        let failed = store.get_deployment(&dep.reference_id).await.unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert!(failed.error_message.contains("port_conflict"));

        // failed → starting is a legal retry path.
        runtime.state.lock().unwrap().fail_start = None;
        let running = deployer.start(&dep.reference_id).await.unwrap();
        assert_eq!(running.status, DeploymentStatus::Running);
        assert!(running.error_message.is_empty());
    }

    #[tokio::test]
    async fn delete_clears_port_and_frees_name() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let runtime = Arc::new(MockRuntime::default());
        let deployer = deployer(store.clone(), runtime.clone());

        deployer.start(&dep.reference_id).await.unwrap();
        let deleted = deployer.delete(&dep.reference_id).await.unwrap();
        assert_eq!(deleted.status, DeploymentStatus::Deleted);
        assert_eq!(deleted.proxy_port, 0);
        assert!(deleted.containers.is_empty());
        assert!(!runtime.state.lock().unwrap().networks.iter().any(|n| n.contains(&dep.reference_id)));

        // Deleting again is idempotent.
        deployer.delete(&dep.reference_id).await.unwrap();

        // The name is free for a new deployment.
        let template = store.get_template_by_id(dep.template_id).await.unwrap();
        store
            .create_deployment(NewDeployment {
                name: "blog".to_string(),
                template_id: template.id,
                template_version: template.version,
                customer_id: "user-1".to_string(),
                domains: vec![DeploymentDomain::auto("blog", "apps.localhost")],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ports_allocate_distinctly_across_deployments() {
        let store = Store::open_in_memory().await.unwrap();
        let runtime = Arc::new(MockRuntime::with_image("nginx:alpine"));
        let deployer = deployer(store.clone(), runtime);

        let template = store
            .create_template(NewTemplate {
                slug: "solo".to_string(),
                compose_spec: "services:\n  web:\n    image: nginx:alpine\n    ports: [\"80\"]\n"
                    .to_string(),
                creator_id: "creator-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut ports = HashSet::new();
        for name in ["a", "b", "c"] {
            let dep = store
                .create_deployment(NewDeployment {
                    name: name.to_string(),
                    template_id: template.id,
                    template_version: template.version,
                    customer_id: "user-1".to_string(),
                    domains: vec![DeploymentDomain::auto(name, "apps.localhost")],
                    ..Default::default()
                })
                .await
                .unwrap();
            let running = deployer.start(&dep.reference_id).await.unwrap();
            assert!(ports.insert(running.proxy_port), "port reused");
        }
    }

    #[tokio::test]
    async fn usage_events_cover_the_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = seed(&store, COMPOSE).await;
        let deployer = deployer(store.clone(), Arc::new(MockRuntime::default()));

        deployer.start(&dep.reference_id).await.unwrap();
        deployer.stop(&dep.reference_id).await.unwrap();
        deployer.delete(&dep.reference_id).await.unwrap();

        let events = store.get_unreported_events(10).await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                event_kind::DEPLOYMENT_CREATED,
                event_kind::DEPLOYMENT_STARTED,
                event_kind::DEPLOYMENT_STOPPED,
                event_kind::DEPLOYMENT_DELETED,
            ]
        );
    }
}
