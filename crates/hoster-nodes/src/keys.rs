//! SSH keypair generation for provisioned nodes.

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey};

use crate::{NodeError, NodeResult};

/// A freshly generated ed25519 keypair, ready for encryption at rest
/// and cloud-init injection.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// OpenSSH-encoded private key (PEM).
    pub private_key: String,
    /// One-line `ssh-ed25519 ...` public key.
    pub public_key: String,
    /// `SHA256:...` fingerprint of the public key.
    pub fingerprint: String,
}

/// Generate an ed25519 keypair.
pub fn generate_keypair() -> NodeResult<GeneratedKey> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| NodeError::KeyDecode(format!("generate: {e}")))?;

    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| NodeError::KeyDecode(format!("encode private: {e}")))?
        .to_string();
    let public = key.public_key();
    let public_key = public
        .to_openssh()
        .map_err(|e| NodeError::KeyDecode(format!("encode public: {e}")))?;
    let fingerprint = public.fingerprint(HashAlg::Sha256).to_string();

    Ok(GeneratedKey { private_key, public_key, fingerprint })
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::decode_secret_key;

    #[test]
    fn generated_keys_are_well_formed() {
        let key = generate_keypair().unwrap();
        assert!(key.private_key.contains("OPENSSH PRIVATE KEY"));
        assert!(key.public_key.starts_with("ssh-ed25519 "));
        assert!(key.fingerprint.starts_with("SHA256:"));
    }

    #[test]
    fn private_key_round_trips_through_decode() {
        let key = generate_keypair().unwrap();
        let decoded = decode_secret_key(&key.private_key, None).unwrap();
        assert_eq!(decoded.public_key().to_openssh().unwrap(), key.public_key);
    }

    #[test]
    fn keys_are_unique() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
