//! hoster-proxy — the hostname router.
//!
//! A second HTTP listener resolving each request's `Host` header to a
//! deployment and reverse-proxying to its upstream port, on the local
//! host or a remote node's public address. Misses and gates render HTML
//! error pages.

pub mod hostname;
pub mod pages;
pub mod policy;
pub mod server;

pub use hostname::{classify_host, strip_port, HostMatch};
pub use policy::{evaluate, upstream_url, RouteGate};
pub use server::{proxy_router, ProxyState};
