//! Local container runtime over the Docker socket.
//!
//! Thin bollard client mapping `ContainerSpec` onto daemon requests. Error
//! responses map onto the shared `ErrorCode` set so local and remote
//! runtimes fail identically.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HealthConfig, HostConfig, PortBinding as DockerPortBinding, RestartPolicy,
    RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::runtime::ContainerRuntime;
use crate::types::*;

/// `ContainerRuntime` implementation against the local daemon socket.
#[derive(Clone)]
pub struct LocalRuntime {
    docker: Docker,
}

impl LocalRuntime {
    /// Connect using the default local socket.
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::connection_failed(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Connect to a specific Unix socket path.
    pub fn connect_socket(path: &str) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RuntimeError::connection_failed(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn system_info(&self) -> RuntimeResult<SystemInfo> {
        let info = self.docker.info().await.map_err(map_err)?;
        let version = self.docker.version().await.map_err(map_err)?;
        Ok(SystemInfo {
            containers: info.containers.unwrap_or(0),
            containers_running: info.containers_running.unwrap_or(0),
            images: info.images.unwrap_or(0),
            cpu_cores: info.ncpu.unwrap_or(0),
            memory_bytes: info.mem_total.unwrap_or(0),
            docker_version: version.version.unwrap_or_default(),
            os: info.operating_system.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
        })
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(map_err)?;
        debug!(network = name, "network created");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.docker.remove_network(name).await.map_err(map_err)
    }

    async fn create_volume(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(map_err)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(map_err)?;
        debug!(container = %spec.name, id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err_status(e, ErrorCode::AlreadyRunning))
    }

    async fn stop_container(&self, id: &str, timeout_secs: Option<u32>) -> RuntimeResult<()> {
        let options = timeout_secs.map(|t| StopContainerOptions { t: t as i64 });
        self.docker
            .stop_container(id, options)
            .await
            .map_err(|e| map_err_status(e, ErrorCode::NotRunning))
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn list_containers(&self, filters: &ListFilters) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut filter_map: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(label) = &filters.label {
            filter_map.insert("label".to_string(), vec![label.clone()]);
        }
        if let Some(name) = &filters.name {
            filter_map.insert("name".to_string(), vec![name.clone()]);
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: filters.all,
                filters: filter_map,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        Ok(summaries
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PortBinding {
                        container_port: p.private_port as u16,
                        host_port: p.public_port.unwrap_or(0) as u16,
                        protocol: p.typ.map(|t| t.to_string()).unwrap_or_else(|| "tcp".to_string()),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;

        let config = inspect.config.unwrap_or_default();
        let state = inspect.state.unwrap_or_default();
        let ports = inspect
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let (port, proto) = key.split_once('/')?;
                let container_port = port.parse::<u16>().ok()?;
                let host_port = bindings
                    .unwrap_or_default()
                    .iter()
                    .find_map(|b| b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok()))
                    .unwrap_or(0);
                Some(PortBinding {
                    container_port,
                    host_port,
                    protocol: proto.to_string(),
                })
            })
            .collect();

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            state: state.status.map(|s| s.to_string()).unwrap_or_default(),
            status: String::new(),
            labels: config.labels.unwrap_or_default(),
            ports,
        })
    }

    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: opts.timestamps,
                tail: opts.tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<StatsSnapshot> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let stats = match stream.next().await {
            Some(result) => result.map_err(map_err)?,
            None => return Err(RuntimeError::not_found(format!("no stats for {id}"))),
        };

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(StatsSnapshot {
            cpu_percent,
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let mapped = map_err(e);
                if mapped.is_not_found() {
                    Ok(false)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            progress.map_err(|e| RuntimeError::new(ErrorCode::PullFailed, e.to_string()))?;
        }
        debug!(image, "image pulled");
        Ok(())
    }
}

/// Build the daemon create request from a `ContainerSpec`.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for port in &spec.ports {
        let key = port_key(port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![DockerPortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                // Empty host port means "assign a free one".
                host_port: Some(if port.host_port == 0 {
                    String::new()
                } else {
                    port.host_port.to_string()
                }),
            }]),
        );
    }

    let binds: Vec<String> = spec
        .volumes
        .iter()
        .map(|v| {
            if v.read_only {
                format!("{}:{}:ro", v.source, v.target)
            } else {
                format!("{}:{}", v.source, v.target)
            }
        })
        .collect();

    let restart_policy = match spec.restart_policy.as_str() {
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        _ => None,
    };

    let healthcheck = spec.health_check.as_ref().map(|hc| HealthConfig {
        test: if hc.test.is_empty() { None } else { Some(hc.test.clone()) },
        interval: positive(hc.interval_ns),
        timeout: positive(hc.timeout_ns),
        retries: positive(hc.retries),
        start_period: positive(hc.start_period_ns),
        ..Default::default()
    });

    Config {
        image: Some(spec.image.clone()),
        cmd: non_empty(&spec.command),
        entrypoint: non_empty(&spec.entrypoint),
        env: Some(env),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        healthcheck,
        host_config: Some(HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            restart_policy: restart_policy.map(|name| RestartPolicy {
                name: Some(name),
                maximum_retry_count: None,
            }),
            memory: positive(spec.memory_bytes),
            nano_cpus: if spec.cpu_cores > 0.0 {
                Some((spec.cpu_cores * 1_000_000_000.0) as i64)
            } else {
                None
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port_key(port: &PortBinding) -> String {
    let protocol = if port.protocol.is_empty() { "tcp" } else { &port.protocol };
    format!("{}/{}", port.container_port, protocol)
}

fn positive(v: i64) -> Option<i64> {
    (v > 0).then_some(v)
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    if v.is_empty() { None } else { Some(v.to_vec()) }
}

/// Map a bollard error onto the shared code set.
fn map_err(e: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error as E;
    match e {
        E::DockerResponseServerError { status_code, message } => {
            let code = match status_code {
                404 => ErrorCode::NotFound,
                409 => {
                    if message.contains("port is already allocated") {
                        ErrorCode::PortConflict
                    } else if message.contains("in use") {
                        ErrorCode::InUse
                    } else {
                        ErrorCode::AlreadyExists
                    }
                }
                400 => ErrorCode::InvalidInput,
                _ => ErrorCode::Internal,
            };
            RuntimeError::new(code, message)
        }
        E::RequestTimeoutError => RuntimeError::new(ErrorCode::Timeout, "request timed out"),
        E::IOError { err } => RuntimeError::connection_failed(err.to_string()),
        other => RuntimeError::internal(other.to_string()),
    }
}

/// Like `map_err`, but 304 Not Modified maps to a call-specific code
/// (already running for start, not running for stop).
fn map_err_status(e: bollard::errors::Error, on_not_modified: ErrorCode) -> RuntimeError {
    if let bollard::errors::Error::DockerResponseServerError { status_code: 304, message } = &e {
        return RuntimeError::new(on_not_modified, message.clone());
    }
    map_err(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "hoster_dep_abc_web".to_string(),
            image: "nginx:alpine".to_string(),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            labels: HashMap::from([("com.hoster.managed".to_string(), "true".to_string())]),
            ports: vec![PortBinding { container_port: 80, host_port: 0, protocol: "tcp".to_string() }],
            volumes: vec![
                VolumeBinding {
                    source: "hoster_dep_abc_data".to_string(),
                    target: "/data".to_string(),
                    read_only: false,
                },
                VolumeBinding {
                    source: "/etc/localtime".to_string(),
                    target: "/etc/localtime".to_string(),
                    read_only: true,
                },
            ],
            network: Some("hoster_dep_abc".to_string()),
            restart_policy: "unless-stopped".to_string(),
            cpu_cores: 1.5,
            memory_bytes: 512 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn config_maps_ports_and_auto_assign() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();

        let web = bindings["80/tcp"].as_ref().unwrap();
        // host_port 0 becomes the empty string: daemon picks a free port.
        assert_eq!(web[0].host_port.as_deref(), Some(""));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
    }

    #[test]
    fn config_maps_binds_and_limits() {
        let config = container_config(&spec());
        let host = config.host_config.unwrap();

        assert_eq!(
            host.binds.unwrap(),
            vec!["hoster_dep_abc_data:/data", "/etc/localtime:/etc/localtime:ro"]
        );
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(host.network_mode.as_deref(), Some("hoster_dep_abc"));
    }

    #[test]
    fn config_zero_limits_are_unlimited() {
        let mut s = spec();
        s.cpu_cores = 0.0;
        s.memory_bytes = 0;
        s.restart_policy = String::new();

        let config = container_config(&s);
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, None);
        assert_eq!(host.nano_cpus, None);
        assert!(host.restart_policy.is_none());
    }

    #[test]
    fn config_env_is_key_value_lines() {
        let config = container_config(&spec());
        assert_eq!(config.env.unwrap(), vec!["FOO=bar"]);
        // Empty command/entrypoint stay unset so the image defaults apply.
        assert!(config.cmd.is_none());
        assert!(config.entrypoint.is_none());
    }

    #[test]
    fn fixed_host_port_is_passed_through() {
        let mut s = spec();
        s.ports = vec![PortBinding { container_port: 80, host_port: 20001, protocol: String::new() }];
        let config = container_config(&s);
        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let web = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(web[0].host_port.as_deref(), Some("20001"));
    }

    #[test]
    fn server_errors_map_to_codes() {
        use bollard::errors::Error as E;
        let not_found = map_err(E::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        });
        assert_eq!(not_found.code, ErrorCode::NotFound);

        let port = map_err(E::DockerResponseServerError {
            status_code: 409,
            message: "Bind for 0.0.0.0:20001 failed: port is already allocated".to_string(),
        });
        assert_eq!(port.code, ErrorCode::PortConflict);

        let exists = map_err(E::DockerResponseServerError {
            status_code: 409,
            message: "Conflict. The container name is already taken".to_string(),
        });
        assert_eq!(exists.code, ErrorCode::AlreadyExists);
    }

    #[test]
    fn not_modified_is_call_specific() {
        use bollard::errors::Error as E;
        let err = map_err_status(
            E::DockerResponseServerError { status_code: 304, message: "not modified".to_string() },
            ErrorCode::AlreadyRunning,
        );
        assert_eq!(err.code, ErrorCode::AlreadyRunning);
    }
}
