//! hoster-core — shared foundation for the Hoster control plane.
//!
//! Holds the pieces every other crate leans on: layered configuration
//! (TOML file + `HOSTER_*` environment overrides), AES-256-GCM encryption
//! for secrets at rest, and reference-id minting/validation.

pub mod config;
pub mod crypto;
pub mod ident;

pub use config::Config;
pub use crypto::SecretCipher;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("encryption key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid name {0:?}: must be a lowercase slug (1-63 chars, [a-z0-9-], no leading/trailing dash)")]
    InvalidSlug(String),
}
