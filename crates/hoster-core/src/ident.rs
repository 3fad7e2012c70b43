//! Reference-id minting and name validation.
//!
//! Every API-visible row carries an opaque reference id, stable across
//! restarts and distinct from the internal integer primary key. Reference
//! ids are `{prefix}_{uuid}` with a short per-entity prefix.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Entity prefixes for reference ids.
pub mod prefix {
    pub const TEMPLATE: &str = "tpl";
    pub const DEPLOYMENT: &str = "dep";
    pub const NODE: &str = "node";
    pub const SSH_KEY: &str = "key";
    pub const CREDENTIAL: &str = "cred";
    pub const PROVISION: &str = "prov";
    pub const EVENT: &str = "evt";
}

/// Mint a new reference id with the given prefix.
pub fn new_ref(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap())
}

/// Validate a customer-chosen name: lowercase slug, 1-63 chars, no
/// leading/trailing dash. Deployment names become DNS labels of the
/// auto-domain, hence the DNS-label shape.
pub fn validate_slug(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.len() > 63 || !slug_re().is_match(name) {
        return Err(CoreError::InvalidSlug(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_carry_prefix_and_are_unique() {
        let a = new_ref(prefix::DEPLOYMENT);
        let b = new_ref(prefix::DEPLOYMENT);
        assert!(a.starts_with("dep_"));
        assert_ne!(a, b);
        // uuid simple form: 32 hex chars after the prefix
        assert_eq!(a.len(), "dep_".len() + 32);
    }

    #[test]
    fn valid_slugs() {
        for name in ["blog", "my-app", "a", "app2", "x1-y2-z3"] {
            assert!(validate_slug(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_slugs() {
        for name in ["", "Blog", "my_app", "-app", "app-", "app.example", "a b"] {
            assert!(validate_slug(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn slug_length_limit() {
        let ok = "a".repeat(63);
        let too_long = "a".repeat(64);
        assert!(validate_slug(&ok).is_ok());
        assert!(validate_slug(&too_long).is_err());
    }
}
