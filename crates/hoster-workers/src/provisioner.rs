//! Cloud provisioner.
//!
//! Each tick dispatches every active provision to the step its
//! persisted status calls for. Steps are crash-safe: side effects are
//! persisted before the status transition that depends on them, and
//! every step re-enters cleanly on the next tick after a write failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hoster_cloud::{CloudError, CloudProvider, CloudResult, InstanceSpec};
use hoster_core::SecretCipher;
use hoster_nodes::keys::generate_keypair;
use hoster_store::store::{NewNode, NewSshKey, NewUsageEvent};
use hoster_store::{
    event_kind, CloudProvision, DeploymentStatus, NodeStatus, ProvisionStatus, Store, StoreError,
};

use crate::WorkerHandle;

/// Error message stamped onto deployments whose node is destroyed.
const NODE_DESTROYED_MESSAGE: &str = "Node destroyed via cloud provision";

/// Indirection over `hoster_cloud::provider_for` so tests can inject a
/// fake provider.
pub trait ProviderFactory: Send + Sync {
    fn provider(
        &self,
        provider: &str,
        credential_json: &str,
        default_region: &str,
    ) -> CloudResult<Box<dyn CloudProvider>>;
}

/// The real factory.
pub struct CloudProviderFactory;

impl ProviderFactory for CloudProviderFactory {
    fn provider(
        &self,
        provider: &str,
        credential_json: &str,
        default_region: &str,
    ) -> CloudResult<Box<dyn CloudProvider>> {
        hoster_cloud::provider_for(provider, credential_json, default_region)
    }
}

/// Periodic reconciler over active cloud provisions.
pub struct Provisioner {
    store: Store,
    cipher: SecretCipher,
    factory: Arc<dyn ProviderFactory>,
    interval: Duration,
    max_concurrent: usize,
}

impl Provisioner {
    pub fn new(
        store: Store,
        cipher: SecretCipher,
        interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            cipher,
            factory: Arc::new(CloudProviderFactory),
            interval,
            max_concurrent,
        }
    }

    /// Swap the provider factory (tests).
    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factory = factory;
        self
    }

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
        WorkerHandle::new("provisioner", shutdown_tx, handle)
    }

    /// One cycle over every active provision, bounded fan-out, all
    /// tasks joined before returning.
    pub async fn tick(&self) {
        let provisions = match self.store.list_active_provisions().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "listing provisions failed");
                return;
            }
        };
        if provisions.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for provision in provisions {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let cipher = self.cipher.clone();
            let factory = self.factory.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                step(&store, &cipher, factory.as_ref(), provision).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// Dispatch one provision to the step its status calls for.
pub async fn step(
    store: &Store,
    cipher: &SecretCipher,
    factory: &dyn ProviderFactory,
    provision: CloudProvision,
) {
    let reference_id = provision.reference_id.clone();
    let result = match provision.status {
        ProvisionStatus::Pending => step_pending(store, cipher, factory, provision).await,
        ProvisionStatus::Creating => step_creating(store, provision).await,
        ProvisionStatus::Configuring => step_configuring(store, provision).await,
        ProvisionStatus::Destroying => step_destroying(store, cipher, factory, provision).await,
        // Terminal states are filtered out by the active listing.
        _ => Ok(()),
    };

    if let Err(e) = result {
        match e {
            StepError::Transient(message) => {
                // Leave state untouched; the next tick retries.
                debug!(provision = %reference_id, error = %message, "step will retry");
                let _ = record_step(store, &reference_id, &format!("retrying: {message}")).await;
            }
            StepError::Fatal(message) => {
                warn!(provision = %reference_id, error = %message, "provision failed");
                if let Ok(mut prov) = store.get_provision(&reference_id).await {
                    if prov.transition(ProvisionStatus::Failed).is_ok() {
                        prov.error_message = message;
                        prov.completed_at = Some(Utc::now());
                        let _ = store.update_provision(&prov).await;
                    }
                }
            }
        }
    }
}

enum StepError {
    /// Retry next tick without changing state.
    Transient(String),
    /// Move the provision to `failed`.
    Fatal(String),
}

impl From<StoreError> for StepError {
    fn from(e: StoreError) -> Self {
        // Store write failures re-enter the same step next tick.
        StepError::Transient(e.to_string())
    }
}

impl From<CloudError> for StepError {
    fn from(e: CloudError) -> Self {
        if e.is_transient() {
            StepError::Transient(e.to_string())
        } else {
            StepError::Fatal(e.to_string())
        }
    }
}

async fn record_step(store: &Store, reference_id: &str, step: &str) -> Result<(), StoreError> {
    let mut prov = store.get_provision(reference_id).await?;
    prov.current_step = step.to_string();
    store.update_provision(&prov).await
}

/// pending: ensure a key pair, create the instance, persist its id and
/// address, then advance through creating to configuring.
async fn step_pending(
    store: &Store,
    cipher: &SecretCipher,
    factory: &dyn ProviderFactory,
    mut provision: CloudProvision,
) -> Result<(), StepError> {
    // Crash recovery: the instance already exists, skip straight to the
    // transitions without re-calling CreateInstance.
    if provision.provider_instance_id.is_some() {
        store
            .transition_provision(&provision.reference_id, ProvisionStatus::Creating)
            .await?;
        store
            .transition_provision(&provision.reference_id, ProvisionStatus::Configuring)
            .await?;
        return Ok(());
    }

    let public_key = ensure_ssh_key(store, cipher, &mut provision).await?;

    let credential = store.get_credential(&provision.credential_id).await?;
    let credential_json = cipher
        .decrypt_string(&credential.encrypted_credential)
        .map_err(|e| StepError::Fatal(format!("credential decrypt: {e}")))?;
    let provider = factory
        .provider(
            provision.provider.as_str(),
            &credential_json,
            &credential.default_region,
        )
        .map_err(|e| StepError::Fatal(e.to_string()))?;

    provision.current_step = "creating instance".to_string();
    store.update_provision(&provision).await?;

    let created = provider
        .create_instance(&InstanceSpec {
            name: provision.instance_name.clone(),
            region: provision.region.clone(),
            size: provision.size.clone(),
            user_data: cloud_init(&public_key),
        })
        .await?;
    info!(
        provision = %provision.reference_id,
        instance = %created.provider_instance_id,
        ip = %created.public_ip,
        "instance created"
    );

    // Persist the instance identity BEFORE any status transition: a
    // crash between the two leaves a pending provision whose recovery
    // path above skips the create.
    provision.provider_instance_id = Some(created.provider_instance_id);
    provision.public_ip = Some(created.public_ip);
    provision.current_step = "instance created".to_string();
    store.update_provision(&provision).await?;

    store
        .transition_provision(&provision.reference_id, ProvisionStatus::Creating)
        .await?;
    store
        .transition_provision(&provision.reference_id, ProvisionStatus::Configuring)
        .await?;
    Ok(())
}

/// creating: only reachable after a crash between transitions.
async fn step_creating(store: &Store, provision: CloudProvision) -> Result<(), StepError> {
    if provision.provider_instance_id.is_some() {
        store
            .transition_provision(&provision.reference_id, ProvisionStatus::Configuring)
            .await?;
        Ok(())
    } else {
        // No instance recorded in `creating`: nothing to configure.
        Err(StepError::Fatal(
            "provision in creating without an instance id".to_string(),
        ))
    }
}

/// configuring: register the node row, persist its ref, then go ready.
async fn step_configuring(store: &Store, mut provision: CloudProvision) -> Result<(), StepError> {
    if provision.node_id.is_none() {
        let public_ip = provision
            .public_ip
            .clone()
            .ok_or_else(|| StepError::Fatal("provision has no public ip".to_string()))?;

        // Reuse an existing row if a previous attempt already created
        // it.
        let node = match store
            .get_node_by_creator_and_name(&provision.creator_id, &provision.instance_name)
            .await?
        {
            Some(node) => node,
            None => {
                store
                    .create_node(NewNode {
                        name: provision.instance_name.clone(),
                        creator_id: provision.creator_id.clone(),
                        ssh_host: public_ip,
                        ssh_port: 22,
                        ssh_user: "root".to_string(),
                        ssh_key_id: provision.ssh_key_id.clone(),
                        status: Some(NodeStatus::Offline),
                        capabilities: vec!["standard".to_string()],
                        location: provision.region.clone(),
                        provider: Some(provision.provider),
                        provision_id: Some(provision.reference_id.clone()),
                        ..Default::default()
                    })
                    .await?
            }
        };

        // Node ref persists BEFORE the ready transition.
        provision.node_id = Some(node.reference_id);
        provision.current_step = "node registered".to_string();
        store.update_provision(&provision).await?;
    }

    let mut prov = store
        .transition_provision(&provision.reference_id, ProvisionStatus::Ready)
        .await?;
    prov.completed_at = Some(Utc::now());
    prov.current_step = "ready".to_string();
    store.update_provision(&prov).await?;
    info!(provision = %provision.reference_id, "provision ready");
    Ok(())
}

/// destroying: tear down the instance, cascade-mark its deployments,
/// drop the node and key rows.
async fn step_destroying(
    store: &Store,
    cipher: &SecretCipher,
    factory: &dyn ProviderFactory,
    provision: CloudProvision,
) -> Result<(), StepError> {
    if let Some(instance_id) = &provision.provider_instance_id {
        let credential = store.get_credential(&provision.credential_id).await?;
        let credential_json = cipher
            .decrypt_string(&credential.encrypted_credential)
            .map_err(|e| StepError::Fatal(format!("credential decrypt: {e}")))?;
        let provider = factory
            .provider(
                provision.provider.as_str(),
                &credential_json,
                &credential.default_region,
            )
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        // Instance-not-found inside destroy is success (idempotence).
        provider.destroy_instance(instance_id).await?;
    }

    if let Some(node_ref) = &provision.node_id {
        let deployments = store.list_deployments_by_node(node_ref).await?;
        for mut dep in deployments {
            if dep.transition(DeploymentStatus::Deleting).is_err() {
                continue;
            }
            dep.transition(DeploymentStatus::Deleted)?;
            dep.error_message = NODE_DESTROYED_MESSAGE.to_string();
            dep.proxy_port = 0;
            dep.containers.clear();
            store.update_deployment(&dep).await?;
        }
        match store.delete_node(node_ref).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(key_ref) = &provision.ssh_key_id {
        match store.delete_ssh_key(key_ref).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut prov = store
        .transition_provision(&provision.reference_id, ProvisionStatus::Destroyed)
        .await?;
    prov.completed_at = Some(Utc::now());
    prov.current_step = "destroyed".to_string();
    store.update_provision(&prov).await?;

    let _ = store
        .record_usage_event(NewUsageEvent {
            user_id: provision.creator_id.clone(),
            event_type: event_kind::PROVISION_DESTROYED.to_string(),
            resource_id: provision.reference_id.clone(),
            resource_type: "provision".to_string(),
            quantity: 1,
            metadata: Default::default(),
        })
        .await;
    info!(provision = %provision.reference_id, "provision destroyed");
    Ok(())
}

/// Ensure the provision has an SSH key: reuse the linked one, else
/// reuse by `(creator, name)`, else generate and store a new ed25519
/// pair. Returns the public key for cloud-init.
async fn ensure_ssh_key(
    store: &Store,
    cipher: &SecretCipher,
    provision: &mut CloudProvision,
) -> Result<String, StepError> {
    if let Some(key_ref) = &provision.ssh_key_id {
        let key = store.get_ssh_key(key_ref).await?;
        return Ok(key.public_key);
    }

    let key_name = format!("provision-{}", provision.instance_name);
    let existing = store
        .get_ssh_key_by_creator_and_name(&provision.creator_id, &key_name)
        .await?;
    let key = match existing {
        Some(key) => key,
        None => {
            let generated =
                generate_keypair().map_err(|e| StepError::Fatal(format!("keygen: {e}")))?;
            let encrypted = cipher
                .encrypt(generated.private_key.as_bytes())
                .map_err(|e| StepError::Fatal(format!("key encrypt: {e}")))?;
            match store
                .create_ssh_key(NewSshKey {
                    creator_id: provision.creator_id.clone(),
                    name: key_name.clone(),
                    encrypted_key: encrypted,
                    public_key: generated.public_key,
                    fingerprint: generated.fingerprint,
                })
                .await
            {
                Ok(key) => key,
                // Concurrent tick won the insert; reuse its row.
                Err(StoreError::Conflict(_)) => store
                    .get_ssh_key_by_creator_and_name(&provision.creator_id, &key_name)
                    .await?
                    .ok_or_else(|| StepError::Transient("key vanished".to_string()))?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    provision.ssh_key_id = Some(key.reference_id.clone());
    provision.current_step = "ssh key ready".to_string();
    store.update_provision(provision).await?;
    Ok(key.public_key)
}

/// cloud-init document: inject the key for root and install docker.
fn cloud_init(public_key: &str) -> String {
    format!(
        r#"#cloud-config
disable_root: false
ssh_authorized_keys:
  - {public_key}
runcmd:
  - curl -fsSL https://get.docker.com | sh
  - systemctl enable --now docker
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use hoster_cloud::{CreatedInstance, ProviderRegion, ProviderSize};
    use hoster_store::store::{NewCredential, NewDeployment, NewProvision, NewTemplate};
    use hoster_store::{DeploymentDomain, ProviderKind};

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[derive(Default)]
    struct MockProviderState {
        create_calls: u32,
        destroy_calls: Vec<String>,
        fail_create: bool,
    }

    #[derive(Clone, Default)]
    struct MockFactory {
        state: Arc<Mutex<MockProviderState>>,
    }

    struct MockProvider {
        state: Arc<Mutex<MockProviderState>>,
    }

    impl ProviderFactory for MockFactory {
        fn provider(
            &self,
            _provider: &str,
            _credential_json: &str,
            _default_region: &str,
        ) -> CloudResult<Box<dyn CloudProvider>> {
            Ok(Box::new(MockProvider { state: self.state.clone() }))
        }
    }

    #[async_trait]
    impl CloudProvider for MockProvider {
        async fn create_instance(&self, _spec: &InstanceSpec) -> CloudResult<CreatedInstance> {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(CloudError::Transient("api 502".to_string()));
            }
            state.create_calls += 1;
            Ok(CreatedInstance {
                provider_instance_id: "i-abc123".to_string(),
                public_ip: "1.2.3.4".to_string(),
            })
        }
        async fn destroy_instance(&self, instance_id: &str) -> CloudResult<()> {
            self.state.lock().unwrap().destroy_calls.push(instance_id.to_string());
            Ok(())
        }
        async fn list_regions(&self) -> CloudResult<Vec<ProviderRegion>> {
            Ok(vec![])
        }
        async fn list_sizes(&self) -> CloudResult<Vec<ProviderSize>> {
            Ok(vec![])
        }
    }

    async fn seeded_provision(store: &Store) -> CloudProvision {
        let cipher = SecretCipher::new(KEY).unwrap();
        let credential = store
            .create_credential(NewCredential {
                creator_id: "creator-1".to_string(),
                name: "do-main".to_string(),
                provider: ProviderKind::Digitalocean,
                encrypted_credential: cipher.encrypt(br#"{"token":"dop_v1"}"#).unwrap(),
                default_region: "fra1".to_string(),
            })
            .await
            .unwrap();
        store
            .create_provision(NewProvision {
                creator_id: "creator-1".to_string(),
                credential_id: credential.reference_id,
                provider: ProviderKind::Digitalocean,
                instance_name: "worker-1".to_string(),
                region: "fra1".to_string(),
                size: "s-1vcpu-1gb".to_string(),
            })
            .await
            .unwrap()
    }

    async fn run_step(store: &Store, factory: &MockFactory, reference_id: &str) {
        let provision = store.get_provision(reference_id).await.unwrap();
        step(store, &SecretCipher::new(KEY).unwrap(), factory, provision).await;
    }

    #[tokio::test]
    async fn pending_to_ready_happy_path() {
        let store = Store::open_in_memory().await.unwrap();
        let factory = MockFactory::default();
        let provision = seeded_provision(&store).await;

        // pending: key + instance, lands in configuring.
        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Configuring);
        assert_eq!(prov.provider_instance_id.as_deref(), Some("i-abc123"));
        assert_eq!(prov.public_ip.as_deref(), Some("1.2.3.4"));
        assert!(prov.ssh_key_id.is_some());

        // configuring: node registered, ready.
        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Ready);
        assert!(prov.completed_at.is_some());

        let node = store.get_node(prov.node_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(node.ssh_host, "1.2.3.4");
        assert_eq!(node.provider, ProviderKind::Digitalocean);
        assert_eq!(node.provision_id.as_deref(), Some(provision.reference_id.as_str()));
        assert_eq!(node.ssh_key_id, prov.ssh_key_id);
    }

    // Crash between persisting the instance id and the transitions: the
    // re-picked pending provision must not create a second instance.
    #[tokio::test]
    async fn pending_recovery_skips_create_instance() {
        let store = Store::open_in_memory().await.unwrap();
        let factory = MockFactory::default();
        let provision = seeded_provision(&store).await;

        // Simulate the crash point: instance persisted, still pending.
        let mut prov = store.get_provision(&provision.reference_id).await.unwrap();
        prov.provider_instance_id = Some("i-abc123".to_string());
        prov.public_ip = Some("1.2.3.4".to_string());
        store.update_provision(&prov).await.unwrap();

        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Configuring);
        assert_eq!(factory.state.lock().unwrap().create_calls, 0);
    }

    #[tokio::test]
    async fn creating_with_instance_advances() {
        let store = Store::open_in_memory().await.unwrap();
        let factory = MockFactory::default();
        let provision = seeded_provision(&store).await;

        let mut prov = store.get_provision(&provision.reference_id).await.unwrap();
        prov.provider_instance_id = Some("i-abc123".to_string());
        prov.public_ip = Some("1.2.3.4".to_string());
        store.update_provision(&prov).await.unwrap();
        store
            .transition_provision(&provision.reference_id, ProvisionStatus::Creating)
            .await
            .unwrap();

        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Configuring);
    }

    #[tokio::test]
    async fn transient_create_failure_stays_pending() {
        let store = Store::open_in_memory().await.unwrap();
        let factory = MockFactory::default();
        factory.state.lock().unwrap().fail_create = true;
        let provision = seeded_provision(&store).await;

        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Pending);
        // The key step already completed and is reused on retry.
        assert!(prov.ssh_key_id.is_some());

        factory.state.lock().unwrap().fail_create = false;
        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Configuring);
        assert_eq!(factory.state.lock().unwrap().create_calls, 1);
    }

    #[tokio::test]
    async fn destroy_cascades_deployments_node_and_key() {
        let store = Store::open_in_memory().await.unwrap();
        let factory = MockFactory::default();
        let provision = seeded_provision(&store).await;

        // Drive to ready.
        run_step(&store, &factory, &provision.reference_id).await;
        run_step(&store, &factory, &provision.reference_id).await;
        let prov = store.get_provision(&provision.reference_id).await.unwrap();
        let node_ref = prov.node_id.clone().unwrap();
        let key_ref = prov.ssh_key_id.clone().unwrap();

        // A deployment lives on the node.
        let template = store
            .create_template(NewTemplate {
                slug: "t".to_string(),
                compose_spec: "services:\n  web:\n    image: nginx:alpine\n".to_string(),
                creator_id: "creator-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let dep = store
            .create_deployment(NewDeployment {
                name: "on-node".to_string(),
                template_id: template.id,
                template_version: 1,
                customer_id: "user-1".to_string(),
                node_id: node_ref.clone(),
                domains: vec![DeploymentDomain::auto("on-node", "apps.localhost")],
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .transition_provision(&prov.reference_id, ProvisionStatus::Destroying)
            .await
            .unwrap();
        run_step(&store, &factory, &prov.reference_id).await;

        let prov = store.get_provision(&prov.reference_id).await.unwrap();
        assert_eq!(prov.status, ProvisionStatus::Destroyed);
        assert_eq!(factory.state.lock().unwrap().destroy_calls, vec!["i-abc123"]);

        let dep = store.get_deployment(&dep.reference_id).await.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Deleted);
        assert_eq!(dep.error_message, NODE_DESTROYED_MESSAGE);

        assert!(store.get_node(&node_ref).await.unwrap_err().is_not_found());
        assert!(store.get_ssh_key(&key_ref).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cloud_init_carries_key_and_docker_install() {
        let doc = cloud_init("ssh-ed25519 AAAA test");
        assert!(doc.starts_with("#cloud-config"));
        assert!(doc.contains("ssh-ed25519 AAAA test"));
        assert!(doc.contains("get.docker.com"));
    }
}
