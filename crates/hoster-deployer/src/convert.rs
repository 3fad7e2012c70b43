//! Plan → daemon request conversion.

use hoster_docker::{ContainerSpec, HealthCheckSpec, PortBinding, VolumeBinding};
use hoster_planner::plan::ContainerPlan;

/// Convert a container plan into the daemon create request. The entry
/// plan's first auto-assign port is pinned to `proxy_port` so the
/// hostname router has a stable upstream.
pub fn plan_to_spec(plan: &ContainerPlan, entry_proxy_port: Option<u16>) -> ContainerSpec {
    let mut pinned = entry_proxy_port;
    let ports = plan
        .ports
        .iter()
        .map(|p| {
            let host_port = if p.published == 0 {
                pinned.take().unwrap_or(0)
            } else {
                p.published
            };
            PortBinding {
                container_port: p.target,
                host_port,
                protocol: p.protocol.clone(),
            }
        })
        .collect();

    ContainerSpec {
        name: plan.name.clone(),
        image: plan.image.clone(),
        command: plan.command.clone(),
        entrypoint: plan.entrypoint.clone(),
        env: plan.env.clone(),
        labels: plan.labels.clone(),
        ports,
        volumes: plan
            .volumes
            .iter()
            .map(|v| VolumeBinding {
                source: v.source.clone(),
                target: v.target.clone(),
                read_only: v.read_only,
            })
            .collect(),
        network: plan.networks.first().cloned(),
        restart_policy: plan.restart_policy.as_str().to_string(),
        cpu_cores: plan.resources.cpu_cores,
        memory_bytes: plan.resources.memory_bytes,
        health_check: plan.health_check.as_ref().map(|hc| HealthCheckSpec {
            test: hc.test.clone(),
            interval_ns: hc.interval.as_nanos() as i64,
            timeout_ns: hc.timeout.as_nanos() as i64,
            retries: hc.retries as i64,
            start_period_ns: hc.start_period.as_nanos() as i64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use hoster_planner::plan::{ContainerPlan, PlanResources, RestartPolicy};
    use hoster_planner::compose::PortMapping;

    fn plan() -> ContainerPlan {
        ContainerPlan {
            name: "hoster_dep_x_web".to_string(),
            image: "nginx:alpine".to_string(),
            command: vec![],
            entrypoint: vec![],
            env: HashMap::new(),
            labels: HashMap::new(),
            ports: vec![
                PortMapping { target: 80, published: 0, protocol: "tcp".to_string() },
                PortMapping { target: 9000, published: 0, protocol: "tcp".to_string() },
            ],
            volumes: vec![],
            networks: vec!["hoster_dep_x".to_string()],
            restart_policy: RestartPolicy::UnlessStopped,
            resources: PlanResources::default(),
            health_check: Some(hoster_planner::plan::HealthProbe {
                test: vec!["CMD".to_string(), "true".to_string()],
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
                retries: 3,
                start_period: Duration::ZERO,
            }),
        }
    }

    #[test]
    fn entry_port_pins_only_first_auto_port() {
        let spec = plan_to_spec(&plan(), Some(20001));
        assert_eq!(spec.ports[0].host_port, 20001);
        // Second auto port stays daemon-assigned.
        assert_eq!(spec.ports[1].host_port, 0);
        assert_eq!(spec.network.as_deref(), Some("hoster_dep_x"));
        assert_eq!(spec.restart_policy, "unless-stopped");
    }

    #[test]
    fn fixed_published_ports_are_untouched() {
        let mut p = plan();
        p.ports[0].published = 8080;
        let spec = plan_to_spec(&p, Some(20001));
        assert_eq!(spec.ports[0].host_port, 8080);
        // The pin lands on the first auto-assign port instead.
        assert_eq!(spec.ports[1].host_port, 20001);
    }

    #[test]
    fn health_durations_become_nanos() {
        let spec = plan_to_spec(&plan(), None);
        let hc = spec.health_check.unwrap();
        assert_eq!(hc.interval_ns, 30_000_000_000);
        assert_eq!(hc.timeout_ns, 5_000_000_000);
        assert_eq!(hc.start_period_ns, 0);
        assert_eq!(hc.retries, 3);
    }
}
