//! Host-header parsing.

/// Strip a `:port` suffix from a Host header. Bracketed IPv6 literals
/// keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        return &host[..=end];
    }
    match host.split_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

/// How a hostname relates to the platform's base domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatch {
    /// `{slug}.{base_domain}` with a single non-empty label.
    Subdomain(String),
    /// Anything else: a user-supplied custom domain.
    Custom(String),
}

impl HostMatch {
    /// The hostname to look up, lowercased.
    pub fn hostname(&self, base_domain: &str) -> String {
        match self {
            HostMatch::Subdomain(slug) => format!("{slug}.{base_domain}"),
            HostMatch::Custom(host) => host.clone(),
        }
    }
}

/// Classify a (already port-stripped) Host value against the base
/// domain. Comparison is case-insensitive.
pub fn classify_host(host: &str, base_domain: &str) -> HostMatch {
    let host = host.to_ascii_lowercase();
    let base = base_domain.to_ascii_lowercase();

    if let Some(slug) = host.strip_suffix(&format!(".{base}")) {
        if !slug.is_empty() && !slug.contains('.') {
            return HostMatch::Subdomain(slug.to_string());
        }
    }
    HostMatch::Custom(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("blog.apps.localhost:9091"), "blog.apps.localhost");
        assert_eq!(strip_port("blog.apps.localhost"), "blog.apps.localhost");
        assert_eq!(strip_port("[::1]:9091"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn subdomain_match() {
        assert_eq!(
            classify_host("blog.apps.localhost", "apps.localhost"),
            HostMatch::Subdomain("blog".to_string())
        );
        // Case-insensitive on both sides.
        assert_eq!(
            classify_host("Blog.APPS.localhost", "apps.Localhost"),
            HostMatch::Subdomain("blog".to_string())
        );
    }

    #[test]
    fn nested_labels_are_custom() {
        assert_eq!(
            classify_host("a.b.apps.localhost", "apps.localhost"),
            HostMatch::Custom("a.b.apps.localhost".to_string())
        );
    }

    #[test]
    fn bare_base_domain_is_custom() {
        assert_eq!(
            classify_host("apps.localhost", "apps.localhost"),
            HostMatch::Custom("apps.localhost".to_string())
        );
    }

    #[test]
    fn unrelated_hosts_are_custom() {
        assert_eq!(
            classify_host("shop.example.com", "apps.localhost"),
            HostMatch::Custom("shop.example.com".to_string())
        );
    }

    #[test]
    fn hostname_reconstruction() {
        let m = classify_host("blog.apps.localhost", "apps.localhost");
        assert_eq!(m.hostname("apps.localhost"), "blog.apps.localhost");
        let m = classify_host("Shop.Example.com", "apps.localhost");
        assert_eq!(m.hostname("apps.localhost"), "shop.example.com");
    }
}
