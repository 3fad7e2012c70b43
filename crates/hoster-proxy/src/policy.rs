//! Routing policy: whether and where a resolved deployment may receive
//! traffic.

use hoster_store::{Deployment, DomainKind, VerificationStatus};

/// Gate outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteGate {
    /// Forward to the upstream.
    Allow,
    /// Custom domain not verified yet.
    VerificationPending,
    /// Deployment exists but is not running (or has no port).
    Stopped,
}

/// Evaluate the verification and routability gates for a request that
/// resolved to `deployment` via `hostname`.
pub fn evaluate(deployment: &Deployment, hostname: &str) -> RouteGate {
    let matched = deployment
        .domains
        .iter()
        .find(|d| d.hostname.eq_ignore_ascii_case(hostname));

    if let Some(domain) = matched {
        if domain.kind == DomainKind::Custom
            && domain.verification_status != VerificationStatus::Verified
        {
            return RouteGate::VerificationPending;
        }
    }

    if !deployment.is_routable() {
        return RouteGate::Stopped;
    }
    RouteGate::Allow
}

/// Upstream base URL for a routable deployment. Local deployments
/// answer on the loopback; remote deployments expose their port on the
/// node's public address.
pub fn upstream_url(deployment: &Deployment, node_host: Option<&str>) -> String {
    match node_host {
        Some(host) if !deployment.node_id.is_empty() => {
            format!("http://{host}:{}", deployment.proxy_port)
        }
        _ => format!("http://127.0.0.1:{}", deployment.proxy_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hoster_store::{DeploymentDomain, DeploymentStatus, ResourceLimits};
    use std::collections::HashMap;

    fn deployment() -> Deployment {
        Deployment {
            id: 1,
            reference_id: "dep_route".to_string(),
            name: "blog".to_string(),
            template_id: 1,
            template_version: 1,
            customer_id: "user-1".to_string(),
            node_id: String::new(),
            status: DeploymentStatus::Running,
            variables: HashMap::new(),
            domains: vec![
                DeploymentDomain::auto("blog", "apps.localhost"),
                DeploymentDomain::custom("shop.example.com"),
            ],
            containers: vec![],
            resources: ResourceLimits::default(),
            proxy_port: 20001,
            error_message: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    #[test]
    fn auto_domain_routes_when_running() {
        assert_eq!(evaluate(&deployment(), "blog.apps.localhost"), RouteGate::Allow);
    }

    #[test]
    fn unverified_custom_domain_is_gated() {
        assert_eq!(
            evaluate(&deployment(), "shop.example.com"),
            RouteGate::VerificationPending
        );
    }

    #[test]
    fn verified_custom_domain_routes() {
        let mut dep = deployment();
        dep.domains[1].verification_status = VerificationStatus::Verified;
        assert_eq!(evaluate(&dep, "shop.example.com"), RouteGate::Allow);
    }

    #[test]
    fn stopped_deployment_is_gated() {
        let mut dep = deployment();
        dep.status = DeploymentStatus::Stopped;
        assert_eq!(evaluate(&dep, "blog.apps.localhost"), RouteGate::Stopped);

        let mut dep = deployment();
        dep.proxy_port = 0;
        assert_eq!(evaluate(&dep, "blog.apps.localhost"), RouteGate::Stopped);
    }

    #[test]
    fn verification_gate_wins_over_stopped() {
        let mut dep = deployment();
        dep.status = DeploymentStatus::Stopped;
        assert_eq!(
            evaluate(&dep, "shop.example.com"),
            RouteGate::VerificationPending
        );
    }

    #[test]
    fn upstream_selection() {
        let mut dep = deployment();
        assert_eq!(upstream_url(&dep, None), "http://127.0.0.1:20001");

        dep.node_id = "node_x".to_string();
        assert_eq!(
            upstream_url(&dep, Some("203.0.113.7")),
            "http://203.0.113.7:20001"
        );
    }
}
