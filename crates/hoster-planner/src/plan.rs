//! Container plan construction.
//!
//! Turns one service of a parsed compose spec into a `ContainerPlan`:
//! the exact create-container request the deployer hands to a container
//! runtime, with stable resource names and managed labels.

use std::collections::HashMap;
use std::time::Duration;

use crate::compose::{ComposeSpec, PortMapping, Service};
use crate::order::order_services;
use crate::substitute::substitute_variables;
use crate::{PlanError, PlanResult};

/// Label keys stamped onto every managed container.
pub mod label {
    pub const MANAGED: &str = "com.hoster.managed";
    pub const DEPLOYMENT: &str = "com.hoster.deployment";
    pub const TEMPLATE: &str = "com.hoster.template";
    pub const SERVICE: &str = "com.hoster.service";
}

/// Identity inputs shared by every service plan of one deployment.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub deployment_ref: String,
    pub template_ref: String,
    pub bindings: HashMap<String, String>,
}

impl PlanContext {
    /// Stable network name for the deployment.
    pub fn network_name(&self) -> String {
        format!("hoster_{}", self.deployment_ref)
    }

    /// Stable container name for a service.
    pub fn container_name(&self, service: &str) -> String {
        format!("hoster_{}_{}", self.deployment_ref, service)
    }

    /// Stable name for a declared named volume.
    pub fn volume_name(&self, source: &str) -> String {
        format!("hoster_{}_{}", self.deployment_ref, source)
    }
}

/// Restart policy in daemon terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        }
    }

    /// Map a compose restart string. Anything unrecognized, including
    /// the empty string, means no restart.
    pub fn from_compose(s: &str) -> Self {
        match s {
            "always" => Self::Always,
            "on-failure" => Self::OnFailure,
            "unless-stopped" => Self::UnlessStopped,
            _ => Self::No,
        }
    }
}

/// A volume mount in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Named volume (prefixed) or bind-mount path (verbatim).
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Resource limits in daemon units. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlanResources {
    pub cpu_cores: f64,
    pub memory_bytes: i64,
}

/// Health check with parsed durations. Zero durations mean
/// "daemon default".
#[derive(Debug, Clone, PartialEq)]
pub struct HealthProbe {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// The fully-resolved request for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPlan {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub networks: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub resources: PlanResources,
    pub health_check: Option<HealthProbe>,
}

/// Plan a single service.
pub fn plan_service(
    ctx: &PlanContext,
    service_name: &str,
    service: &Service,
    declared_volumes: &[String],
) -> PlanResult<ContainerPlan> {
    let mut labels = HashMap::new();
    labels.insert(label::MANAGED.to_string(), "true".to_string());
    labels.insert(label::DEPLOYMENT.to_string(), ctx.deployment_ref.clone());
    labels.insert(label::TEMPLATE.to_string(), ctx.template_ref.clone());
    labels.insert(label::SERVICE.to_string(), service_name.to_string());
    // Service-provided labels merge on top; collisions favor the service.
    for (k, v) in service.labels.to_map() {
        labels.insert(k, v);
    }

    let env: HashMap<String, String> = service
        .environment
        .to_map()
        .into_iter()
        .map(|(k, v)| (k, substitute_variables(&v, &ctx.bindings)))
        .collect();

    let ports = service
        .ports
        .iter()
        .map(|p| p.to_mapping())
        .collect::<PlanResult<Vec<_>>>()?;

    let volumes = service
        .volumes
        .iter()
        .map(|spec| parse_volume(ctx, spec, declared_volumes))
        .collect::<PlanResult<Vec<_>>>()?;

    let resources = service
        .deploy
        .as_ref()
        .and_then(|d| d.resources.as_ref())
        .and_then(|r| r.limits.as_ref())
        .map(|limits| PlanResources {
            cpu_cores: limits.cpu_cores().max(0.0),
            memory_bytes: limits.memory_bytes().max(0),
        })
        .unwrap_or_default();

    let health_check = service.healthcheck.as_ref().map(|hc| HealthProbe {
        test: hc.test.as_ref().map(|t| t.to_argv()).unwrap_or_default(),
        interval: parse_go_duration(&hc.interval),
        timeout: parse_go_duration(&hc.timeout),
        retries: hc.retries,
        start_period: parse_go_duration(&hc.start_period),
    });

    Ok(ContainerPlan {
        name: ctx.container_name(service_name),
        image: service.image.clone(),
        command: service.command.as_ref().map(|c| c.to_argv()).unwrap_or_default(),
        entrypoint: service.entrypoint.as_ref().map(|c| c.to_argv()).unwrap_or_default(),
        env,
        labels,
        ports,
        volumes,
        networks: vec![ctx.network_name()],
        restart_policy: RestartPolicy::from_compose(&service.restart),
        resources,
        health_check,
    })
}

/// Plan every service of a compose spec in dependency order.
pub fn plan_deployment(ctx: &PlanContext, spec: &ComposeSpec) -> PlanResult<Vec<ContainerPlan>> {
    let declared = spec.declared_volumes();
    let order = order_services(&spec.services);
    order
        .iter()
        .map(|name| {
            let service = spec
                .services
                .get(name)
                .ok_or_else(|| PlanError::Parse(format!("ordering produced unknown service {name:?}")))?;
            plan_service(ctx, name, service, &declared)
        })
        .collect()
}

/// Parse a `source:target[:ro]` volume spec. Declared named volumes get
/// the deployment prefix; bind-mount sources pass through unchanged.
fn parse_volume(
    ctx: &PlanContext,
    spec: &str,
    declared_volumes: &[String],
) -> PlanResult<VolumeMount> {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let target = parts
        .next()
        .ok_or_else(|| PlanError::InvalidVolume(spec.to_string()))?;
    let read_only = parts.next() == Some("ro");
    if source.is_empty() || target.is_empty() {
        return Err(PlanError::InvalidVolume(spec.to_string()));
    }

    let named = declared_volumes.iter().any(|v| v == source);
    Ok(VolumeMount {
        source: if named {
            ctx.volume_name(source)
        } else {
            source.to_string()
        },
        target: target.to_string(),
        read_only,
    })
}

/// Parse a Go-style duration (`30s`, `1m30s`, `500ms`, `1h`). Invalid
/// strings silently yield a zero duration, which callers treat as
/// "use the default".
pub fn parse_go_duration(s: &str) -> Duration {
    let s = s.trim();
    if s.is_empty() {
        return Duration::ZERO;
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            continue;
        }
        // Collect the unit: one or two letters.
        let mut unit = String::from(c);
        if matches!((c, chars.peek()), ('m', Some('s')) | ('u', Some('s')) | ('n', Some('s'))) {
            unit.push(chars.next().unwrap_or_default());
        }
        let Ok(value) = digits.parse::<f64>() else {
            return Duration::ZERO;
        };
        digits.clear();

        let unit_nanos: f64 = match unit.as_str() {
            "ns" => 1.0,
            "us" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3600.0 * 1_000_000_000.0,
            _ => return Duration::ZERO,
        };
        total += Duration::from_nanos((value * unit_nanos) as u64);
    }

    // Trailing digits without a unit are invalid.
    if !digits.is_empty() {
        return Duration::ZERO;
    }
    total
}
