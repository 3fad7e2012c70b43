//! AWS EC2 adapter over aws-sdk-ec2.
//!
//! The AMI is resolved at create time: latest available Canonical Ubuntu
//! 24.04 image in the target region. Instance access rides in via
//! base64-encoded cloud-init user data like the other providers.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::config::Credentials;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, InstanceType, ResourceType, Tag, TagSpecification};
use aws_sdk_ec2::Client;
use base64::Engine as _;
use tracing::debug;

use crate::{
    CloudError, CloudProvider, CloudResult, CreatedInstance, InstanceSpec, ProviderRegion,
    ProviderSize,
};

const UBUNTU_OWNER: &str = "099720109477";
const UBUNTU_NAME_FILTER: &str = "ubuntu/images/hvm-ssd*/ubuntu-*-24.04-amd64-server-*";

const IP_WAIT_ATTEMPTS: u32 = 40;
const IP_WAIT_INTERVAL: Duration = Duration::from_secs(3);

pub struct Aws {
    access_key_id: String,
    secret_access_key: String,
    default_region: String,
}

impl Aws {
    pub fn new(access_key_id: String, secret_access_key: String, default_region: String) -> Self {
        let default_region = if default_region.is_empty() {
            "us-east-1".to_string()
        } else {
            default_region
        };
        Self { access_key_id, secret_access_key, default_region }
    }

    async fn client(&self, region: &str) -> Client {
        let region = if region.is_empty() { &self.default_region } else { region };
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                self.access_key_id.clone(),
                self.secret_access_key.clone(),
                None,
                None,
                "hoster",
            ))
            .load()
            .await;
        Client::new(&config)
    }

    /// Latest available Canonical Ubuntu 24.04 AMI in the region.
    async fn resolve_ami(&self, client: &Client) -> CloudResult<String> {
        let output = client
            .describe_images()
            .owners(UBUNTU_OWNER)
            .filters(Filter::builder().name("name").values(UBUNTU_NAME_FILTER).build())
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .map_err(map_sdk)?;

        let mut images = output.images().to_vec();
        images.sort_by(|a, b| a.creation_date().cmp(&b.creation_date()));
        images
            .last()
            .and_then(|i| i.image_id())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Rejected("no ubuntu 24.04 ami found".to_string()))
    }
}

fn map_sdk<E, R>(e: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata,
{
    let code = e.meta().code().unwrap_or("").to_string();
    let message = e.meta().message().unwrap_or("aws request failed").to_string();
    match &e {
        SdkError::ServiceError(_) => {
            if code.contains("AuthFailure")
                || code.contains("Unauthorized")
                || code.contains("InvalidClientTokenId")
                || code.contains("SignatureDoesNotMatch")
            {
                CloudError::Auth(format!("{code}: {message}"))
            } else if code.contains("NotFound") {
                CloudError::NotFound(format!("{code}: {message}"))
            } else {
                CloudError::Rejected(format!("{code}: {message}"))
            }
        }
        _ => CloudError::Transient(message),
    }
}

#[async_trait]
impl CloudProvider for Aws {
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<CreatedInstance> {
        let client = self.client(&spec.region).await;
        let ami = self.resolve_ami(&client).await?;

        let run = client
            .run_instances()
            .image_id(&ami)
            .instance_type(InstanceType::from(spec.size.as_str()))
            .min_count(1)
            .max_count(1)
            .user_data(base64::engine::general_purpose::STANDARD.encode(&spec.user_data))
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key("Name").value(&spec.name).build())
                    .tags(Tag::builder().key("managed-by").value("hoster").build())
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk)?;

        let instance_id = run
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Transient("run-instances returned no instance".to_string()))?;
        debug!(%instance_id, ami = %ami, "instance launched, waiting for public ip");

        for _ in 0..IP_WAIT_ATTEMPTS {
            let output = client
                .describe_instances()
                .instance_ids(&instance_id)
                .send()
                .await
                .map_err(map_sdk)?;
            let ip = output
                .reservations()
                .first()
                .and_then(|r| r.instances().first())
                .and_then(|i| i.public_ip_address())
                .map(str::to_string);
            if let Some(public_ip) = ip {
                return Ok(CreatedInstance { provider_instance_id: instance_id, public_ip });
            }
            tokio::time::sleep(IP_WAIT_INTERVAL).await;
        }
        Err(CloudError::Transient(format!(
            "instance {instance_id} has no public ip yet"
        )))
    }

    async fn destroy_instance(&self, instance_id: &str) -> CloudResult<()> {
        let client = self.client(&self.default_region).await;
        match client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            // Instance already gone: destroy is idempotent.
            Err(e) => match map_sdk(e) {
                CloudError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_regions(&self) -> CloudResult<Vec<ProviderRegion>> {
        let client = self.client(&self.default_region).await;
        let output = client.describe_regions().send().await.map_err(map_sdk)?;
        Ok(output
            .regions()
            .iter()
            .filter_map(|r| {
                let name = r.region_name()?.to_string();
                Some(ProviderRegion { slug: name.clone(), name })
            })
            .collect())
    }

    async fn list_sizes(&self) -> CloudResult<Vec<ProviderSize>> {
        let client = self.client(&self.default_region).await;
        let output = client
            .describe_instance_types()
            .max_results(100)
            .send()
            .await
            .map_err(map_sdk)?;
        Ok(output
            .instance_types()
            .iter()
            .filter_map(|t| {
                Some(ProviderSize {
                    slug: t.instance_type()?.as_str().to_string(),
                    cpu_cores: t
                        .v_cpu_info()
                        .and_then(|v| v.default_v_cpus())
                        .unwrap_or(0) as i64,
                    memory_mb: t.memory_info().and_then(|m| m.size_in_mib()).unwrap_or(0),
                    disk_gb: t
                        .instance_storage_info()
                        .and_then(|s| s.total_size_in_gb())
                        .unwrap_or(0),
                    price_monthly: 0.0,
                })
            })
            .collect())
    }
}
