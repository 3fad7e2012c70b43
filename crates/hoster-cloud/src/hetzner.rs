//! Hetzner Cloud adapter over the v1 REST API.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    status_error, transport_error, CloudProvider, CloudResult, CreatedInstance, InstanceSpec,
    ProviderRegion, ProviderSize,
};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const SERVER_IMAGE: &str = "ubuntu-24.04";

pub struct Hetzner {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl Hetzner {
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
}

#[derive(Deserialize)]
struct ServerWrapper {
    server: Server,
}

#[derive(Deserialize)]
struct Server {
    id: u64,
    #[serde(default)]
    public_net: PublicNet,
}

#[derive(Deserialize, Default)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<Ipv4>,
}

#[derive(Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Deserialize)]
struct LocationsWrapper {
    locations: Vec<Location>,
}

#[derive(Deserialize)]
struct Location {
    name: String,
    description: String,
}

#[derive(Deserialize)]
struct ServerTypesWrapper {
    server_types: Vec<ServerType>,
}

#[derive(Deserialize)]
struct ServerType {
    name: String,
    cores: i64,
    /// Gigabytes, fractional for shared types.
    memory: f64,
    /// Gigabytes.
    disk: i64,
    #[serde(default)]
    prices: Vec<Price>,
}

#[derive(Deserialize)]
struct Price {
    #[serde(default)]
    price_monthly: Option<PriceAmount>,
}

#[derive(Deserialize)]
struct PriceAmount {
    gross: String,
}

impl ServerType {
    fn monthly_price(&self) -> f64 {
        self.prices
            .first()
            .and_then(|p| p.price_monthly.as_ref())
            .and_then(|p| p.gross.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl CloudProvider for Hetzner {
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<CreatedInstance> {
        let body = serde_json::json!({
            "name": spec.name,
            "server_type": spec.size,
            "location": spec.region,
            "image": SERVER_IMAGE,
            "user_data": spec.user_data,
            "labels": {"managed-by": "hoster"},
        });

        let response = self
            .client
            .post(format!("{}/servers", self.base_url))
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

        let wrapper: ServerWrapper = response.json().await.map_err(transport_error)?;
        let ip = wrapper
            .server
            .public_net
            .ipv4
            .map(|v| v.ip)
            .unwrap_or_default();
        debug!(server = wrapper.server.id, ip = %ip, "server created");
        Ok(CreatedInstance {
            provider_instance_id: wrapper.server.id.to_string(),
            public_ip: ip,
        })
    }

    async fn destroy_instance(&self, instance_id: &str) -> CloudResult<()> {
        let response = self
            .client
            .delete(format!("{}/servers/{instance_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn list_regions(&self) -> CloudResult<Vec<ProviderRegion>> {
        let wrapper: LocationsWrapper = self.get_json("/locations").await?;
        Ok(wrapper
            .locations
            .into_iter()
            .map(|l| ProviderRegion { slug: l.name, name: l.description })
            .collect())
    }

    async fn list_sizes(&self) -> CloudResult<Vec<ProviderSize>> {
        let wrapper: ServerTypesWrapper = self.get_json("/server_types").await?;
        Ok(wrapper
            .server_types
            .into_iter()
            .map(|t| ProviderSize {
                slug: t.name.clone(),
                cpu_cores: t.cores,
                memory_mb: (t.memory * 1024.0) as i64,
                disk_gb: t.disk,
                price_monthly: t.monthly_price(),
            })
            .collect())
    }
}
