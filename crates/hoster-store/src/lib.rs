//! hoster-store — SQLite-backed relational persistence for Hoster.
//!
//! Owns every persisted row: templates, deployments, nodes, SSH keys,
//! cloud credentials, cloud provisions, usage events, and container
//! events. Workers read snapshots, compute updates in memory, and write
//! back; concurrent writers are serialized per-row by SQLite transactions.
//!
//! The lifecycle module is pure: a transition table for deployment and
//! provision state machines, consulted by every status mutation.

pub mod error;
pub mod lifecycle;
pub mod migrations;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::Store;
pub use types::*;
