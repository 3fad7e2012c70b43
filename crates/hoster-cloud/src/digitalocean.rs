//! DigitalOcean adapter over the v2 REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    status_error, transport_error, CloudError, CloudProvider, CloudResult, CreatedInstance,
    InstanceSpec, ProviderRegion, ProviderSize,
};

const API_BASE: &str = "https://api.digitalocean.com/v2";
const DROPLET_IMAGE: &str = "ubuntu-24-04-x64";

/// How long to wait for a droplet's public IPv4 to appear.
const IP_WAIT_ATTEMPTS: u32 = 40;
const IP_WAIT_INTERVAL: Duration = Duration::from_secs(3);

pub struct DigitalOcean {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl DigitalOcean {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: API_BASE.to_string(),
        }
    }

    /// Point at a different API base (for tests).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> CloudResult<T> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        response.json().await.map_err(transport_error)
    }

    async fn droplet_public_ip(&self, id: u64) -> CloudResult<Option<String>> {
        let wrapper: DropletWrapper = self.get_json(&format!("/droplets/{id}")).await?;
        Ok(wrapper.droplet.public_v4())
    }
}

#[derive(Deserialize)]
struct DropletWrapper {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    #[serde(default)]
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn public_v4(&self) -> Option<String> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone())
    }
}

#[derive(Deserialize)]
struct RegionsWrapper {
    regions: Vec<DoRegion>,
}

#[derive(Deserialize)]
struct DoRegion {
    slug: String,
    name: String,
    available: bool,
}

#[derive(Deserialize)]
struct SizesWrapper {
    sizes: Vec<DoSize>,
}

#[derive(Deserialize)]
struct DoSize {
    slug: String,
    vcpus: i64,
    /// Megabytes.
    memory: i64,
    /// Gigabytes.
    disk: i64,
    price_monthly: f64,
}

#[async_trait]
impl CloudProvider for DigitalOcean {
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<CreatedInstance> {
        let body = serde_json::json!({
            "name": spec.name,
            "region": spec.region,
            "size": spec.size,
            "image": DROPLET_IMAGE,
            "user_data": spec.user_data,
            "tags": ["hoster"],
        });

        let response = self
            .client
            .post(format!("{}/droplets", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let wrapper: DropletWrapper = response.json().await.map_err(transport_error)?;
        let id = wrapper.droplet.id;
        debug!(droplet = id, "droplet created, waiting for public ip");

        // Droplets come up without a public address; poll until assigned.
        if let Some(ip) = wrapper.droplet.public_v4() {
            return Ok(CreatedInstance {
                provider_instance_id: id.to_string(),
                public_ip: ip,
            });
        }
        for _ in 0..IP_WAIT_ATTEMPTS {
            tokio::time::sleep(IP_WAIT_INTERVAL).await;
            if let Some(ip) = self.droplet_public_ip(id).await? {
                return Ok(CreatedInstance {
                    provider_instance_id: id.to_string(),
                    public_ip: ip,
                });
            }
        }
        Err(CloudError::Transient(format!(
            "droplet {id} has no public ip yet"
        )))
    }

    async fn destroy_instance(&self, instance_id: &str) -> CloudResult<()> {
        let response = self
            .client
            .delete(format!("{}/droplets/{instance_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        // Already gone counts as destroyed.
        if status == reqwest::StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn list_regions(&self) -> CloudResult<Vec<ProviderRegion>> {
        let wrapper: RegionsWrapper = self.get_json("/regions?per_page=200").await?;
        Ok(wrapper
            .regions
            .into_iter()
            .filter(|r| r.available)
            .map(|r| ProviderRegion { slug: r.slug, name: r.name })
            .collect())
    }

    async fn list_sizes(&self) -> CloudResult<Vec<ProviderSize>> {
        let wrapper: SizesWrapper = self.get_json("/sizes?per_page=200").await?;
        Ok(wrapper
            .sizes
            .into_iter()
            .map(|s| ProviderSize {
                slug: s.slug,
                cpu_cores: s.vcpus,
                memory_mb: s.memory,
                disk_gb: s.disk,
                price_monthly: s.price_monthly,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_v4_skips_private_networks() {
        let droplet: Droplet = serde_json::from_value(serde_json::json!({
            "id": 42,
            "networks": {
                "v4": [
                    {"ip_address": "10.0.0.5", "type": "private"},
                    {"ip_address": "203.0.113.9", "type": "public"}
                ]
            }
        }))
        .unwrap();
        assert_eq!(droplet.public_v4().as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn droplet_without_networks_has_no_ip() {
        let droplet: Droplet = serde_json::from_value(serde_json::json!({"id": 42})).unwrap();
        assert_eq!(droplet.public_v4(), None);
    }
}
