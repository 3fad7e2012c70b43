//! Node, SSH key, credential, provision, and usage-event handlers.

use axum::extract::{Path, State};
use axum::response::Response;
use russh::keys::{decode_secret_key, HashAlg};
use serde::Deserialize;

use hoster_nodes::keys::generate_keypair;
use hoster_store::store::{NewCredential, NewNode, NewProvision, NewSshKey, NewUsageEvent};
use hoster_store::{event_kind, NodeStatus, ProviderKind, ProvisionStatus, ResourceLimits};

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::handlers::{created, ok, require_owner};
use crate::ApiState;

use axum::Json;

fn require_cipher(state: &ApiState) -> ApiResult<&hoster_core::SecretCipher> {
    state.cipher.as_ref().ok_or_else(|| {
        ApiError::Unavailable(
            "remote-node features are disabled: no encryption key configured".to_string(),
        )
    })
}

// ── Nodes ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key_id: Option<String>,
    #[serde(default)]
    pub docker_socket: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub capacity: ResourceLimits,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub base_domain: Option<String>,
}

/// POST /api/v1/nodes
pub async fn create_node(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateNodeRequest>,
) -> ApiResult<Response> {
    require_cipher(&state)?;
    if req.name.is_empty() || req.ssh_host.is_empty() {
        return Err(ApiError::BadRequest("name and ssh_host are required".to_string()));
    }
    if let Some(key_ref) = &req.ssh_key_id {
        let key = state.store.get_ssh_key(key_ref).await?;
        require_owner(&key.creator_id, &identity)?;
    }

    let capabilities = if req.capabilities.is_empty() {
        vec!["standard".to_string()]
    } else {
        req.capabilities
    };
    let node = state
        .store
        .create_node(NewNode {
            name: req.name,
            creator_id: identity.user_id,
            ssh_host: req.ssh_host,
            ssh_port: req.ssh_port,
            ssh_user: req.ssh_user,
            ssh_key_id: req.ssh_key_id,
            docker_socket: req.docker_socket,
            status: Some(NodeStatus::Offline),
            capabilities,
            capacity: req.capacity,
            location: req.location,
            base_domain: req.base_domain,
            ..Default::default()
        })
        .await?;
    Ok(created(node))
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>, identity: Identity) -> ApiResult<Response> {
    let nodes = state.store.list_nodes().await?;
    let own: Vec<_> = nodes
        .into_iter()
        .filter(|n| n.creator_id == identity.user_id)
        .collect();
    Ok(ok(own))
}

/// GET /api/v1/nodes/{ref}
pub async fn get_node(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let node = state.store.get_node(&reference).await?;
    require_owner(&node.creator_id, &identity)?;
    Ok(ok(node))
}

#[derive(Deserialize)]
pub struct UpdateNodeRequest {
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub capacity: Option<ResourceLimits>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub base_domain: Option<String>,
}

/// PUT /api/v1/nodes/{ref} — maintenance toggles and metadata edits.
pub async fn update_node(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> ApiResult<Response> {
    let mut node = state.store.get_node(&reference).await?;
    require_owner(&node.creator_id, &identity)?;

    if let Some(status) = req.status {
        node.status = status;
    }
    if let Some(capacity) = req.capacity {
        node.capacity = capacity;
    }
    if let Some(location) = req.location {
        node.location = location;
    }
    if let Some(base_domain) = req.base_domain {
        node.base_domain = Some(base_domain);
    }
    state.store.update_node(&node).await?;
    Ok(ok(node))
}

/// DELETE /api/v1/nodes/{ref}
pub async fn delete_node(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let node = state.store.get_node(&reference).await?;
    require_owner(&node.creator_id, &identity)?;

    let deployments = state.store.list_deployments_by_node(&reference).await?;
    if !deployments.is_empty() {
        return Err(ApiError::Conflict(format!(
            "node hosts {} deployments",
            deployments.len()
        )));
    }
    state.store.delete_node(&reference).await?;
    Ok(ok(serde_json::json!({ "deleted": reference })))
}

// ── SSH keys ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSshKeyRequest {
    pub name: String,
    /// OpenSSH-encoded private key to import; omitted means generate.
    #[serde(default)]
    pub private_key: Option<String>,
}

/// POST /api/v1/ssh-keys
pub async fn create_ssh_key(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateSshKeyRequest>,
) -> ApiResult<Response> {
    let cipher = require_cipher(&state)?;
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let (private_key, public_key, fingerprint) = match req.private_key {
        Some(pem) => {
            let key = decode_secret_key(&pem, None)
                .map_err(|e| ApiError::BadRequest(format!("unparseable private key: {e}")))?;
            let public = key.public_key();
            let public_key = public
                .to_openssh()
                .map_err(|e| ApiError::BadRequest(format!("unparseable private key: {e}")))?;
            let fingerprint = public.fingerprint(HashAlg::Sha256).to_string();
            (pem, public_key, fingerprint)
        }
        None => {
            let generated = generate_keypair()
                .map_err(|e| ApiError::Internal(format!("key generation: {e}")))?;
            (generated.private_key, generated.public_key, generated.fingerprint)
        }
    };

    let encrypted_key = cipher
        .encrypt(private_key.as_bytes())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let key = state
        .store
        .create_ssh_key(NewSshKey {
            creator_id: identity.user_id,
            name: req.name,
            encrypted_key,
            public_key,
            fingerprint,
        })
        .await?;
    Ok(created(key))
}

/// GET /api/v1/ssh-keys
pub async fn list_ssh_keys(
    State(state): State<ApiState>,
    identity: Identity,
) -> ApiResult<Response> {
    Ok(ok(state.store.list_ssh_keys(&identity.user_id).await?))
}

/// DELETE /api/v1/ssh-keys/{ref}
pub async fn delete_ssh_key(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let key = state.store.get_ssh_key(&reference).await?;
    require_owner(&key.creator_id, &identity)?;
    state.store.delete_ssh_key(&reference).await?;
    Ok(ok(serde_json::json!({ "deleted": reference })))
}

// ── Cloud credentials ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub provider: ProviderKind,
    /// Provider secret material, stored encrypted.
    pub credential: serde_json::Value,
    #[serde(default)]
    pub default_region: String,
}

/// POST /api/v1/cloud-credentials
pub async fn create_credential(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateCredentialRequest>,
) -> ApiResult<Response> {
    let cipher = require_cipher(&state)?;
    if req.provider == ProviderKind::Manual {
        return Err(ApiError::BadRequest("manual is not a cloud provider".to_string()));
    }
    let blob = serde_json::to_vec(&req.credential)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let encrypted_credential = cipher
        .encrypt(&blob)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let credential = state
        .store
        .create_credential(NewCredential {
            creator_id: identity.user_id,
            name: req.name,
            provider: req.provider,
            encrypted_credential,
            default_region: req.default_region,
        })
        .await?;
    Ok(created(credential))
}

/// GET /api/v1/cloud-credentials
pub async fn list_credentials(
    State(state): State<ApiState>,
    identity: Identity,
) -> ApiResult<Response> {
    Ok(ok(state.store.list_credentials(&identity.user_id).await?))
}

/// DELETE /api/v1/cloud-credentials/{ref}
pub async fn delete_credential(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let credential = state.store.get_credential(&reference).await?;
    require_owner(&credential.creator_id, &identity)?;
    state.store.delete_credential(&reference).await?;
    Ok(ok(serde_json::json!({ "deleted": reference })))
}

/// Build the provider adapter behind a credential.
async fn provider_for_credential(
    state: &ApiState,
    identity: &Identity,
    reference: &str,
) -> ApiResult<(Box<dyn hoster_cloud::CloudProvider>, hoster_store::CloudCredential)> {
    let cipher = require_cipher(state)?;
    let credential = state.store.get_credential(reference).await?;
    require_owner(&credential.creator_id, identity)?;
    let material = cipher
        .decrypt_string(&credential.encrypted_credential)
        .map_err(|e| ApiError::Internal(format!("credential decrypt: {e}")))?;
    let provider = hoster_cloud::provider_for(
        credential.provider.as_str(),
        &material,
        &credential.default_region,
    )
    .map_err(map_cloud_error)?;
    Ok((provider, credential))
}

fn map_cloud_error(e: hoster_cloud::CloudError) -> ApiError {
    use hoster_cloud::CloudError;
    match e {
        CloudError::Auth(m) => ApiError::BadRequest(format!("provider rejected credentials: {m}")),
        CloudError::Rejected(m) | CloudError::Credential(m) => ApiError::BadRequest(m),
        CloudError::NotFound(m) => ApiError::NotFound(m),
        CloudError::Transient(m) => ApiError::Unavailable(m),
    }
}

/// GET /api/v1/cloud-credentials/{ref}/regions
pub async fn list_provider_regions(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let (provider, _) = provider_for_credential(&state, &identity, &reference).await?;
    Ok(ok(provider.list_regions().await.map_err(map_cloud_error)?))
}

/// GET /api/v1/cloud-credentials/{ref}/sizes
pub async fn list_provider_sizes(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let (provider, _) = provider_for_credential(&state, &identity, &reference).await?;
    Ok(ok(provider.list_sizes().await.map_err(map_cloud_error)?))
}

// ── Provisions ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProvisionRequest {
    pub credential_id: String,
    pub instance_name: String,
    #[serde(default)]
    pub region: String,
    pub size: String,
}

/// POST /api/v1/provisions
pub async fn create_provision(
    State(state): State<ApiState>,
    identity: Identity,
    Json(req): Json<CreateProvisionRequest>,
) -> ApiResult<Response> {
    require_cipher(&state)?;
    let credential = state.store.get_credential(&req.credential_id).await?;
    require_owner(&credential.creator_id, &identity)?;

    let region = if req.region.is_empty() {
        credential.default_region.clone()
    } else {
        req.region
    };
    if region.is_empty() {
        return Err(ApiError::BadRequest(
            "region required (credential has no default)".to_string(),
        ));
    }
    if req.instance_name.is_empty() || req.size.is_empty() {
        return Err(ApiError::BadRequest("instance_name and size are required".to_string()));
    }

    let provision = state
        .store
        .create_provision(NewProvision {
            creator_id: identity.user_id.clone(),
            credential_id: credential.reference_id,
            provider: credential.provider,
            instance_name: req.instance_name,
            region,
            size: req.size,
        })
        .await?;

    state
        .store
        .record_usage_event(NewUsageEvent {
            user_id: identity.user_id,
            event_type: event_kind::PROVISION_CREATED.to_string(),
            resource_id: provision.reference_id.clone(),
            resource_type: "provision".to_string(),
            quantity: 1,
            metadata: Default::default(),
        })
        .await?;
    Ok(created(provision))
}

/// GET /api/v1/provisions
pub async fn list_provisions(
    State(state): State<ApiState>,
    identity: Identity,
) -> ApiResult<Response> {
    Ok(ok(state.store.list_provisions(&identity.user_id).await?))
}

/// GET /api/v1/provisions/{ref}
pub async fn get_provision(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let provision = state.store.get_provision(&reference).await?;
    require_owner(&provision.creator_id, &identity)?;
    Ok(ok(provision))
}

/// DELETE /api/v1/provisions/{ref} — queue the teardown; the
/// provisioner worker destroys the instance.
pub async fn destroy_provision(
    State(state): State<ApiState>,
    identity: Identity,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let provision = state.store.get_provision(&reference).await?;
    require_owner(&provision.creator_id, &identity)?;
    let provision = state
        .store
        .transition_provision(&reference, ProvisionStatus::Destroying)
        .await?;
    Ok(ok(provision))
}

// ── Usage events ──────────────────────────────────────────────────

/// GET /api/v1/usage-events
pub async fn list_usage_events(
    State(state): State<ApiState>,
    identity: Identity,
) -> ApiResult<Response> {
    Ok(ok(state.store.list_usage_events(&identity.user_id, 100).await?))
}
