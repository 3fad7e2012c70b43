//! hoster-cloud — thin cloud provider adapters.
//!
//! The provisioner consumes exactly four capabilities per provider:
//! create an instance, destroy it, list regions, list sizes. SSH access
//! and docker installation ride in via cloud-init user data, so no
//! provider-side key registration is needed.

pub mod aws;
pub mod digitalocean;
pub mod hetzner;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Result type alias for provider operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors from provider APIs, split along the retry boundary.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Credentials rejected; the provision should fail, not retry.
    #[error("provider auth failed: {0}")]
    Auth(String),

    /// Provider-side 4xx other than auth; not retryable.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// 5xx, network, or timeout; the worker retries next tick.
    #[error("provider unavailable: {0}")]
    Transient(String),

    #[error("instance {0} not found")]
    NotFound(String),

    #[error("invalid credential blob: {0}")]
    Credential(String),
}

impl CloudError {
    /// Whether the provisioner should leave state untouched and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

/// Request to create one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    pub size: String,
    /// cloud-init document injecting the SSH key and docker install.
    pub user_data: String,
}

/// A created instance, reported once its public address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub provider_instance_id: String,
    pub public_ip: String,
}

/// A provider region/location.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProviderRegion {
    pub slug: String,
    pub name: String,
}

/// An instance size offering.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProviderSize {
    pub slug: String,
    pub cpu_cores: i64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    /// Monthly price in the provider's base currency; zero if unknown.
    pub price_monthly: f64,
}

/// The narrow provider surface the provisioner consumes.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create an instance and wait until its public IP is known.
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<CreatedInstance>;

    /// Destroy an instance. A missing instance is success: destroy is
    /// idempotent.
    async fn destroy_instance(&self, instance_id: &str) -> CloudResult<()>;

    async fn list_regions(&self) -> CloudResult<Vec<ProviderRegion>>;
    async fn list_sizes(&self) -> CloudResult<Vec<ProviderSize>>;
}

/// Decrypted credential material. DigitalOcean and Hetzner use a single
/// API token; AWS uses a key pair.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialMaterial {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl CredentialMaterial {
    pub fn parse(json: &str) -> CloudResult<Self> {
        serde_json::from_str(json).map_err(|e| CloudError::Credential(e.to_string()))
    }

    fn require_token(&self) -> CloudResult<String> {
        self.token
            .clone()
            .ok_or_else(|| CloudError::Credential("missing token".to_string()))
    }
}

/// Build a provider from its name and a decrypted credential blob.
pub fn provider_for(
    provider: &str,
    credential_json: &str,
    default_region: &str,
) -> CloudResult<Box<dyn CloudProvider>> {
    let material = CredentialMaterial::parse(credential_json)?;
    match provider {
        "digitalocean" => Ok(Box::new(digitalocean::DigitalOcean::new(
            material.require_token()?,
        ))),
        "hetzner" => Ok(Box::new(hetzner::Hetzner::new(material.require_token()?))),
        "aws" => {
            let access_key = material
                .access_key_id
                .ok_or_else(|| CloudError::Credential("missing access_key_id".to_string()))?;
            let secret_key = material
                .secret_access_key
                .ok_or_else(|| CloudError::Credential("missing secret_access_key".to_string()))?;
            Ok(Box::new(aws::Aws::new(
                access_key,
                secret_key,
                default_region.to_string(),
            )))
        }
        other => Err(CloudError::Credential(format!("unknown provider {other:?}"))),
    }
}

/// Shared helper: classify a reqwest failure as transient.
pub(crate) fn transport_error(e: reqwest::Error) -> CloudError {
    CloudError::Transient(e.to_string())
}

/// Shared helper: classify an HTTP status + body.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> CloudError {
    match status.as_u16() {
        401 | 403 => CloudError::Auth(body.to_string()),
        404 => CloudError::NotFound(body.to_string()),
        400..=499 => CloudError::Rejected(format!("{status}: {body}")),
        _ => CloudError::Transient(format!("{status}: {body}")),
    }
}
