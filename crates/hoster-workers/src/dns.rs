//! DNS verifier for custom domains.
//!
//! A custom domain verifies when its CNAME chain ends at the
//! deployment's auto-domain, or when any of its A records matches an
//! expected node address. The classification is pure; resolution goes
//! through the system resolver.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use trust_dns_resolver::proto::rr::RecordType;
use trust_dns_resolver::TokioAsyncResolver;

use hoster_store::{Deployment, DomainKind, Store, VerificationStatus};

use crate::WorkerHandle;

/// Maximum CNAME hops followed before giving up.
const MAX_CNAME_HOPS: usize = 5;

/// What resolution observed for one hostname.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsObservation {
    /// Every CNAME target seen along the chain, normalized.
    pub cnames: Vec<String>,
    pub a_records: Vec<IpAddr>,
}

/// Outcome of classifying an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Pending(String),
}

/// Pure classification: verified when the CNAME chain reaches the
/// auto-domain or an A record matches an expected address.
pub fn classify(
    observation: &DnsObservation,
    auto_domain: &str,
    expected_ips: &[IpAddr],
) -> VerifyOutcome {
    let auto = normalize(auto_domain);
    if observation.cnames.iter().any(|c| normalize(c) == auto) {
        return VerifyOutcome::Verified;
    }
    if observation
        .a_records
        .iter()
        .any(|ip| expected_ips.contains(ip))
    {
        return VerifyOutcome::Verified;
    }

    if observation.cnames.is_empty() && observation.a_records.is_empty() {
        VerifyOutcome::Pending("no DNS records found".to_string())
    } else {
        VerifyOutcome::Pending(format!(
            "records do not point at {auto_domain} or an assigned node address"
        ))
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Periodic verifier over unverified custom domains.
pub struct DnsVerifier {
    store: Store,
    interval: Duration,
    startup_delay: Duration,
    max_concurrent: usize,
}

impl DnsVerifier {
    pub fn new(
        store: Store,
        interval: Duration,
        startup_delay: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self { store, interval, startup_delay, max_concurrent }
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.startup_delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                self.tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        WorkerHandle::new("dns-verifier", shutdown_tx, handle)
    }

    /// One cycle: collect unverified custom domains and check them with
    /// bounded concurrency.
    pub async fn tick(&self) {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => {
                warn!(error = %e, "system resolver unavailable");
                return;
            }
        };

        let deployments = match self.store.list_deployments().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "listing deployments failed");
                return;
            }
        };

        let mut pending = Vec::new();
        for deployment in deployments {
            let has_unverified = deployment.domains.iter().any(|d| {
                d.kind == DomainKind::Custom && d.verification_status != VerificationStatus::Verified
            });
            if has_unverified {
                pending.push(deployment);
            }
        }
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "dns cycle starting");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for deployment in pending {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let resolver = resolver.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                verify_deployment(&store, resolver.as_ref(), deployment).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

/// Check every unverified custom domain of one deployment and persist
/// the outcome.
async fn verify_deployment(store: &Store, resolver: &TokioAsyncResolver, mut dep: Deployment) {
    let auto_domain = match dep.auto_domain() {
        Some(domain) => domain.hostname.clone(),
        None => {
            warn!(deployment = %dep.reference_id, "deployment has no auto domain");
            return;
        }
    };
    let expected_ips = expected_node_ips(store, resolver, &dep).await;

    let mut changed = false;
    for domain in &mut dep.domains {
        if domain.kind != DomainKind::Custom
            || domain.verification_status == VerificationStatus::Verified
        {
            continue;
        }

        let observation = observe(resolver, &domain.hostname).await;
        match classify(&observation, &auto_domain, &expected_ips) {
            VerifyOutcome::Verified => {
                info!(deployment = %dep.reference_id, domain = %domain.hostname, "domain verified");
                domain.verification_status = VerificationStatus::Verified;
                domain.verified_at = Some(Utc::now());
                domain.last_check_error = None;
                changed = true;
            }
            VerifyOutcome::Pending(reason) => {
                debug!(domain = %domain.hostname, reason = %reason, "verification pending");
                if domain.last_check_error.as_deref() != Some(reason.as_str()) {
                    domain.last_check_error = Some(reason);
                    changed = true;
                }
            }
        }
    }

    if changed {
        if let Err(e) = store.update_deployment(&dep).await {
            warn!(deployment = %dep.reference_id, error = %e, "verification update failed");
        }
    }
}

/// The addresses a correctly-configured record may point at, derived
/// from the deployment's node.
async fn expected_node_ips(
    store: &Store,
    resolver: &TokioAsyncResolver,
    dep: &Deployment,
) -> Vec<IpAddr> {
    if dep.node_id.is_empty() {
        return Vec::new();
    }
    let host = match store.get_node_ssh_host(&dep.node_id).await {
        Ok(host) => host,
        Err(_) => return Vec::new(),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip];
    }
    match resolver.lookup_ip(host.as_str()).await {
        Ok(lookup) => lookup.iter().collect(),
        Err(_) => Vec::new(),
    }
}

/// Resolve the CNAME chain and A records for a hostname.
async fn observe(resolver: &TokioAsyncResolver, hostname: &str) -> DnsObservation {
    let mut observation = DnsObservation::default();

    let mut current = hostname.to_string();
    for _ in 0..MAX_CNAME_HOPS {
        let target = match resolver.lookup(current.as_str(), RecordType::CNAME).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|rdata| rdata.as_cname().map(|cname| cname.0.to_utf8()))
                .next(),
            Err(_) => None,
        };
        match target {
            Some(target) => {
                observation.cnames.push(target.clone());
                current = target;
            }
            None => break,
        }
    }

    if let Ok(lookup) = resolver.lookup_ip(hostname).await {
        observation.a_records = lookup.iter().collect();
    }
    observation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cname_to_auto_domain_verifies() {
        let observation = DnsObservation {
            cnames: vec!["blog.apps.localhost.".to_string()],
            a_records: vec![],
        };
        assert_eq!(
            classify(&observation, "blog.apps.localhost", &[]),
            VerifyOutcome::Verified
        );
    }

    #[test]
    fn cname_chain_end_verifies() {
        let observation = DnsObservation {
            cnames: vec![
                "edge.cdn.example.net.".to_string(),
                "Blog.Apps.Localhost.".to_string(),
            ],
            a_records: vec![],
        };
        assert_eq!(
            classify(&observation, "blog.apps.localhost", &[]),
            VerifyOutcome::Verified
        );
    }

    #[test]
    fn a_record_match_verifies() {
        let observation = DnsObservation {
            cnames: vec![],
            a_records: vec![ip("203.0.113.7")],
        };
        assert_eq!(
            classify(&observation, "blog.apps.localhost", &[ip("203.0.113.7")]),
            VerifyOutcome::Verified
        );
    }

    #[test]
    fn wrong_records_stay_pending() {
        let observation = DnsObservation {
            cnames: vec!["other.example.com.".to_string()],
            a_records: vec![ip("198.51.100.1")],
        };
        let outcome = classify(&observation, "blog.apps.localhost", &[ip("203.0.113.7")]);
        assert!(matches!(outcome, VerifyOutcome::Pending(_)));
    }

    #[test]
    fn empty_observation_pends_with_reason() {
        let outcome = classify(&DnsObservation::default(), "blog.apps.localhost", &[]);
        assert_eq!(
            outcome,
            VerifyOutcome::Pending("no DNS records found".to_string())
        );
    }

    #[test]
    fn normalization_handles_dots_and_case() {
        assert_eq!(normalize("Blog.Apps.LOCALHOST."), "blog.apps.localhost");
        assert_eq!(normalize("x"), "x");
    }
}
