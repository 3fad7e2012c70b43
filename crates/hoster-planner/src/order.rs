//! Service ordering via Kahn's algorithm.
//!
//! Services are emitted dependencies-first. Ties break by input order so
//! the result is stable. Cycles are recovered best-effort: the parser is
//! expected to reject them upstream, so the remainder is appended in
//! input order instead of failing the plan.

use indexmap::IndexMap;

use crate::compose::Service;

/// Topologically order services by `depends_on`.
pub fn order_services(services: &IndexMap<String, Service>) -> Vec<String> {
    let names: Vec<&String> = services.keys().collect();
    let mut in_degree: IndexMap<&str, usize> =
        names.iter().map(|n| (n.as_str(), 0)).collect();
    // dependency -> dependents
    let mut dependents: IndexMap<&str, Vec<&str>> =
        names.iter().map(|n| (n.as_str(), Vec::new())).collect();

    for (name, service) in services {
        for dep in service.depends_on.names() {
            // Only known dependencies count; validation rejects the rest.
            if let Some(list) = dependents.get_mut(dep.as_str()) {
                list.push(name.as_str());
                if let Some(entry) = in_degree.get_mut(name.as_str()) {
                    *entry += 1;
                }
            }
        }
    }

    let mut ordered: Vec<String> = Vec::with_capacity(names.len());
    let mut emitted: Vec<bool> = vec![false; names.len()];

    loop {
        // Lowest input index among ready services keeps the order stable.
        let next = names.iter().enumerate().find(|(idx, name)| {
            !emitted[*idx] && in_degree[name.as_str()] == 0
        });
        let Some((idx, name)) = next else { break };

        emitted[idx] = true;
        ordered.push(name.to_string());
        for dependent in &dependents[name.as_str()] {
            if let Some(entry) = in_degree.get_mut(*dependent) {
                *entry = entry.saturating_sub(1);
            }
        }
    }

    // Cycle remainder, in input order.
    for (idx, name) in names.iter().enumerate() {
        if !emitted[idx] {
            ordered.push(name.to_string());
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{DependsOn, Service};

    fn service(deps: &[&str]) -> Service {
        Service {
            image: "img".to_string(),
            depends_on: DependsOn::List(deps.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    fn build(entries: &[(&str, &[&str])]) -> IndexMap<String, Service> {
        entries
            .iter()
            .map(|(name, deps)| (name.to_string(), service(deps)))
            .collect()
    }

    #[test]
    fn empty_input_returns_empty() {
        assert!(order_services(&IndexMap::new()).is_empty());
    }

    #[test]
    fn single_service() {
        let services = build(&[("web", &[])]);
        assert_eq!(order_services(&services), vec!["web"]);
    }

    #[test]
    fn diamond_dependency_order() {
        let services = build(&[
            ("web", &["api", "cache"]),
            ("api", &["db"]),
            ("cache", &["db"]),
            ("db", &[]),
        ]);
        let order = order_services(&services);

        assert_eq!(order.len(), 4);
        assert_eq!(order.first().map(String::as_str), Some("db"));
        assert_eq!(order.last().map(String::as_str), Some("web"));
        let api = order.iter().position(|s| s == "api").unwrap();
        let cache = order.iter().position(|s| s == "cache").unwrap();
        assert!(api >= 1 && api <= 2);
        assert!(cache >= 1 && cache <= 2);
    }

    #[test]
    fn ties_break_by_input_order() {
        let services = build(&[("c", &[]), ("a", &[]), ("b", &[])]);
        assert_eq!(order_services(&services), vec!["c", "a", "b"]);
    }

    #[test]
    fn no_loss_no_duplication() {
        let services = build(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a", "c"]),
        ]);
        let mut order = order_services(&services);
        assert_eq!(order.len(), 4);
        order.sort();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_recovers_in_input_order() {
        let services = build(&[("a", &["b"]), ("b", &["a"]), ("ok", &[])]);
        let order = order_services(&services);
        // `ok` is emitted normally; the cycle appends in input order.
        assert_eq!(order, vec!["ok", "a", "b"]);
    }

    #[test]
    fn chain_is_fully_ordered() {
        let services = build(&[("web", &["app"]), ("app", &["db"]), ("db", &[])]);
        assert_eq!(order_services(&services), vec!["db", "app", "web"]);
    }
}
