//! Minion installation and version management.
//!
//! Before a node serves its first RPC, the locally configured minion
//! binary's content hash is compared to the remote `minion --version`
//! output. Missing or stale installs get the binary uploaded over SFTP
//! and marked executable. The whole operation is idempotent; the pool
//! serializes it per node.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::client::NodeClient;
use crate::{NodeError, NodeResult};

/// Install location relative to the remote home directory.
pub const MINION_REMOTE_DIR: &str = ".hoster";
pub const MINION_REMOTE_PATH: &str = "~/.hoster/minion";

const MINION_UPLOAD_PATH: &str = ".hoster/minion";

/// Budget for the whole ensure step; generous because a first contact
/// uploads the binary.
pub const ENSURE_TIMEOUT: Duration = Duration::from_secs(120);

/// The local minion binary plus its content hash.
pub struct MinionBinary {
    pub bytes: Vec<u8>,
    pub hash: String,
}

impl MinionBinary {
    /// Load the binary from disk and hash it.
    pub fn load(path: &PathBuf) -> NodeResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| NodeError::Sftp(format!("read minion binary {path:?}: {e}")))?;
        let hash = hex::encode(Sha256::digest(&bytes));
        Ok(Self { bytes, hash })
    }

    /// The `--version` line an up-to-date install prints.
    pub fn version_line(&self) -> String {
        version_line(&self.hash)
    }
}

/// Format of the minion's `--version` output.
pub fn version_line(hash: &str) -> String {
    format!("hoster-minion {hash}")
}

/// Whether remote `--version` output matches the expected hash.
pub fn version_matches(output: &str, expected_hash: &str) -> bool {
    output.trim() == version_line(expected_hash)
}

/// Make sure the node runs the expected minion build. Returns true when
/// an upload happened.
pub async fn ensure_minion(client: &NodeClient, binary: &MinionBinary) -> NodeResult<bool> {
    let current = client
        .exec(
            &format!("{MINION_REMOTE_PATH} --version"),
            None,
            Some(Duration::from_secs(15)),
        )
        .await;

    if let Ok(output) = &current {
        if output.exit_code == 0 && version_matches(&output.stdout_string(), &binary.hash) {
            debug!("minion up to date");
            return Ok(false);
        }
    }

    info!(hash = %binary.hash, "deploying minion binary");
    client
        .exec(&format!("mkdir -p ~/{MINION_REMOTE_DIR}"), None, None)
        .await?;
    client.upload(&binary.bytes, MINION_UPLOAD_PATH).await?;
    client
        .exec(&format!("chmod 0755 ~/{MINION_UPLOAD_PATH}"), None, None)
        .await?;

    // Verify the install round-trips before declaring success.
    let verify = client
        .exec(
            &format!("{MINION_REMOTE_PATH} --version"),
            None,
            Some(Duration::from_secs(15)),
        )
        .await?;
    if !version_matches(&verify.stdout_string(), &binary.hash) {
        return Err(NodeError::Protocol(format!(
            "minion verify mismatch: {:?}",
            verify.stdout_string().trim()
        )));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_line_format() {
        assert_eq!(version_line("abc123"), "hoster-minion abc123");
    }

    #[test]
    fn version_match_is_exact_after_trim() {
        assert!(version_matches("hoster-minion abc\n", "abc"));
        assert!(!version_matches("hoster-minion other\n", "abc"));
        assert!(!version_matches("", "abc"));
        assert!(!version_matches("bash: minion: command not found", "abc"));
    }

    #[test]
    fn binary_hash_is_content_hash() {
        let dir = std::env::temp_dir().join("hoster-minion-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("minion");
        std::fs::write(&path, b"fake-binary").unwrap();

        let binary = MinionBinary::load(&path).unwrap();
        assert_eq!(binary.hash, hex::encode(Sha256::digest(b"fake-binary")));
        assert!(binary.version_line().starts_with("hoster-minion "));
        std::fs::remove_file(&path).unwrap();
    }
}
