//! Closed compose-spec model.
//!
//! Templates carry a compose-style YAML document. The model here is
//! deliberately closed: unknown keys are validation errors rather than
//! silent drops. List-or-map conveniences (environment, labels,
//! depends_on) and string-or-list commands normalize into one canonical
//! shape at parse time.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::{PlanError, PlanResult};

/// A parsed compose document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ComposeSpec {
    /// Legacy compose version marker; accepted and ignored.
    #[serde(default)]
    pub version: Option<String>,
    pub services: IndexMap<String, Service>,
    /// Top-level named volume declarations.
    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeDecl>>,
    /// Top-level network declarations; accepted for compatibility, the
    /// planner always attaches containers to the deployment network.
    #[serde(default)]
    pub networks: IndexMap<String, Option<NetworkDecl>>,
}

/// One service entry.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Service {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub entrypoint: Option<Command>,
    #[serde(default)]
    pub environment: KeyValues,
    #[serde(default)]
    pub labels: KeyValues,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub restart: String,
    #[serde(default)]
    pub healthcheck: Option<HealthCheck>,
    #[serde(default)]
    pub deploy: Option<Deploy>,
}

/// A command given either as a shell string or an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    /// Normalize to an argv list. Shell strings split on whitespace;
    /// quoting is the template author's problem, as in compose itself.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Command::Line(s) => s.split_whitespace().map(str::to_string).collect(),
            Command::Argv(v) => v.clone(),
        }
    }
}

/// Environment or labels: either a `KEY: value` map or a `KEY=value` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
    Map(IndexMap<String, String>),
    List(Vec<String>),
}

impl Default for KeyValues {
    fn default() -> Self {
        KeyValues::Map(IndexMap::new())
    }
}

impl KeyValues {
    /// Normalize to an ordered map. List entries without `=` get an
    /// empty value.
    pub fn to_map(&self) -> IndexMap<String, String> {
        match self {
            KeyValues::Map(m) => m.clone(),
            KeyValues::List(entries) => entries
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (entry.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// `depends_on`: either a plain list or a map with conditions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(IndexMap<String, DependsOnCondition>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(v) => v.clone(),
            DependsOn::Map(m) => m.keys().cloned().collect(),
        }
    }
}

/// Long-form depends_on condition; only ordering is honored.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DependsOnCondition {
    #[serde(default)]
    pub condition: Option<String>,
}

/// A port mapping: short string form (`"8080:80"`, `"80"`,
/// `"8080:80/udp"`), bare number, or the long map form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Short(String),
    Number(u16),
    Long {
        target: u16,
        #[serde(default)]
        published: u16,
        #[serde(default)]
        protocol: String,
    },
}

/// A normalized port mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub target: u16,
    /// Zero means auto-assign at execution time.
    pub published: u16,
    pub protocol: String,
}

impl PortSpec {
    /// Normalize to `PortMapping`. Empty protocol defaults to `tcp`.
    pub fn to_mapping(&self) -> PlanResult<PortMapping> {
        match self {
            PortSpec::Number(target) => Ok(PortMapping {
                target: *target,
                published: 0,
                protocol: "tcp".to_string(),
            }),
            PortSpec::Long { target, published, protocol } => Ok(PortMapping {
                target: *target,
                published: *published,
                protocol: if protocol.is_empty() { "tcp".to_string() } else { protocol.clone() },
            }),
            PortSpec::Short(s) => {
                let (spec, protocol) = match s.split_once('/') {
                    Some((spec, proto)) if !proto.is_empty() => (spec, proto.to_string()),
                    Some((spec, _)) => (spec, "tcp".to_string()),
                    None => (s.as_str(), "tcp".to_string()),
                };
                let parse = |v: &str| {
                    v.parse::<u16>()
                        .map_err(|_| PlanError::InvalidPort(s.clone()))
                };
                match spec.split_once(':') {
                    Some((published, target)) => Ok(PortMapping {
                        target: parse(target)?,
                        published: parse(published)?,
                        protocol,
                    }),
                    None => Ok(PortMapping {
                        target: parse(spec)?,
                        published: 0,
                        protocol,
                    }),
                }
            }
        }
    }
}

/// Container health check.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    #[serde(default)]
    pub test: Option<Command>,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub start_period: String,
}

/// Deploy-time settings; only resource limits are honored.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Deploy {
    #[serde(default)]
    pub resources: Option<DeployResources>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeployResources {
    #[serde(default)]
    pub limits: Option<ResourceSpec>,
}

/// CPU/memory limits in compose notation (`cpus: "1.5"`, `memory: 512M`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceSpec {
    /// CPU limit in cores; zero when absent or unparseable.
    pub fn cpu_cores(&self) -> f64 {
        self.cpus
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    /// Memory limit in bytes; zero when absent or unparseable.
    pub fn memory_bytes(&self) -> i64 {
        parse_memory(self.memory.as_deref().unwrap_or(""))
    }
}

/// Parse compose memory notation: plain bytes or a K/M/G suffix
/// (optionally with a trailing `b`/`B`). Unparseable input yields zero.
pub fn parse_memory(s: &str) -> i64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    let lower = s.to_ascii_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1024),
        Some('m') => (&lower[..lower.len() - 1], 1024 * 1024),
        Some('g') => (&lower[..lower.len() - 1], 1024 * 1024 * 1024),
        _ => (lower, 1),
    };
    digits.trim().parse::<i64>().map(|n| n * multiplier).unwrap_or(0)
}

/// Named volume declaration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct VolumeDecl {
    #[serde(default)]
    pub driver: Option<String>,
}

/// Network declaration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkDecl {
    #[serde(default)]
    pub driver: Option<String>,
}

impl ComposeSpec {
    /// Parse and validate a compose document.
    pub fn parse(yaml: &str) -> PlanResult<Self> {
        let spec: ComposeSpec =
            serde_yaml::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> PlanResult<()> {
        if self.services.is_empty() {
            return Err(PlanError::NoServices);
        }
        for (name, service) in &self.services {
            if service.image.is_empty() {
                return Err(PlanError::MissingImage { service: name.clone() });
            }
            for dep in service.depends_on.names() {
                if !self.services.contains_key(&dep) {
                    return Err(PlanError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep,
                    });
                }
            }
            for port in &service.ports {
                port.to_mapping()?;
            }
        }
        Ok(())
    }

    /// Names of declared top-level volumes.
    pub fn declared_volumes(&self) -> Vec<String> {
        self.volumes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
"#;

    #[test]
    fn parses_minimal_spec() {
        let spec = ComposeSpec::parse(BASIC).unwrap();
        assert_eq!(spec.services.len(), 1);
        assert_eq!(spec.services["web"].image, "nginx:alpine");
    }

    #[test]
    fn unknown_service_keys_are_rejected() {
        let yaml = r#"
services:
  web:
    image: nginx:alpine
    restrat: always
"#;
        let err = ComposeSpec::parse(yaml).unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)), "{err}");
    }

    #[test]
    fn missing_image_is_rejected() {
        let yaml = "services:\n  web:\n    restart: always\n";
        assert!(matches!(
            ComposeSpec::parse(yaml),
            Err(PlanError::MissingImage { .. })
        ));
    }

    #[test]
    fn empty_services_rejected() {
        assert!(matches!(
            ComposeSpec::parse("services: {}\n"),
            Err(PlanError::NoServices)
        ));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let yaml = r#"
services:
  web:
    image: nginx:alpine
    depends_on: [db]
"#;
        assert!(matches!(
            ComposeSpec::parse(yaml),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn environment_accepts_map_and_list() {
        let yaml = r#"
services:
  a:
    image: x
    environment:
      FOO: bar
  b:
    image: x
    environment:
      - FOO=bar
      - EMPTY
"#;
        let spec = ComposeSpec::parse(yaml).unwrap();
        assert_eq!(spec.services["a"].environment.to_map()["FOO"], "bar");
        let b = spec.services["b"].environment.to_map();
        assert_eq!(b["FOO"], "bar");
        assert_eq!(b["EMPTY"], "");
    }

    #[test]
    fn depends_on_accepts_map_form() {
        let yaml = r#"
services:
  db:
    image: postgres:16
  web:
    image: nginx:alpine
    depends_on:
      db:
        condition: service_started
"#;
        let spec = ComposeSpec::parse(yaml).unwrap();
        assert_eq!(spec.services["web"].depends_on.names(), vec!["db"]);
    }

    #[test]
    fn port_short_forms() {
        assert_eq!(
            PortSpec::Short("8080:80".into()).to_mapping().unwrap(),
            PortMapping { target: 80, published: 8080, protocol: "tcp".into() }
        );
        assert_eq!(
            PortSpec::Short("53:53/udp".into()).to_mapping().unwrap(),
            PortMapping { target: 53, published: 53, protocol: "udp".into() }
        );
        // No published side: auto-assign.
        assert_eq!(
            PortSpec::Short("80".into()).to_mapping().unwrap(),
            PortMapping { target: 80, published: 0, protocol: "tcp".into() }
        );
        assert_eq!(
            PortSpec::Number(80).to_mapping().unwrap(),
            PortMapping { target: 80, published: 0, protocol: "tcp".into() }
        );
    }

    #[test]
    fn port_long_form_defaults_protocol() {
        let yaml = r#"
services:
  web:
    image: nginx:alpine
    ports:
      - target: 80
        published: 0
"#;
        let spec = ComposeSpec::parse(yaml).unwrap();
        let mapping = spec.services["web"].ports[0].to_mapping().unwrap();
        assert_eq!(mapping.protocol, "tcp");
        assert_eq!(mapping.published, 0);
    }

    #[test]
    fn invalid_port_rejected() {
        assert!(PortSpec::Short("eighty".into()).to_mapping().is_err());
        assert!(ComposeSpec::parse(
            "services:\n  w:\n    image: x\n    ports: [\"nope:80\"]\n"
        )
        .is_err());
    }

    #[test]
    fn command_string_and_list() {
        assert_eq!(
            Command::Line("redis-server --appendonly yes".into()).to_argv(),
            vec!["redis-server", "--appendonly", "yes"]
        );
        assert_eq!(
            Command::Argv(vec!["a".into(), "b c".into()]).to_argv(),
            vec!["a", "b c"]
        );
    }

    #[test]
    fn memory_notation() {
        assert_eq!(parse_memory("512M"), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1g"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("64kb"), 64 * 1024);
        assert_eq!(parse_memory("1048576"), 1048576);
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("lots"), 0);
    }

    #[test]
    fn declared_volumes_listed_in_order() {
        let yaml = r#"
services:
  db:
    image: postgres:16
    volumes:
      - data:/var/lib/postgresql/data
volumes:
  data:
  cache:
    driver: local
"#;
        let spec = ComposeSpec::parse(yaml).unwrap();
        assert_eq!(spec.declared_volumes(), vec!["data", "cache"]);
    }
}
