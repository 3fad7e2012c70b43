//! SSH client for a single node.
//!
//! One authenticated connection per node, multiplexing an `exec` channel
//! per request. The minion is stateless, so many execs can share the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use hoster_docker::RuntimeResult;

use crate::protocol::Envelope;
use crate::{NodeError, NodeResult};

/// Where to reach a node and how to authenticate.
#[derive(Debug, Clone)]
pub struct NodeTarget {
    /// The node's reference id; the pool's cache key.
    pub reference_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Decrypted OpenSSH-encoded private key.
    pub private_key: String,
}

impl NodeTarget {
    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

/// Output of one remote exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Nodes are registered by the operator; host keys are trusted on
        // first use.
        Ok(true)
    }
}

/// An authenticated SSH connection to one node.
pub struct NodeClient {
    handle: client::Handle<ClientHandler>,
    target_host: String,
    exec_timeout: Duration,
}

impl NodeClient {
    /// Open a connection and authenticate with the target's private key.
    pub async fn connect(target: &NodeTarget, exec_timeout: Duration) -> NodeResult<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });

        let mut handle = client::connect(config, target.address(), ClientHandler)
            .await
            .map_err(|e| NodeError::Connect(e.to_string()))?;

        let key = decode_secret_key(&target.private_key, None)
            .map_err(|e| NodeError::KeyDecode(e.to_string()))?;
        let auth = handle
            .authenticate_publickey(
                &target.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| NodeError::Auth(e.to_string()))?;

        if !matches!(auth, AuthResult::Success) {
            return Err(NodeError::Auth(format!(
                "publickey rejected for {}@{}",
                target.user, target.host
            )));
        }

        debug!(host = %target.host, user = %target.user, "ssh connected");
        Ok(Self {
            handle,
            target_host: target.host.clone(),
            exec_timeout,
        })
    }

    /// Whether the underlying connection is still usable.
    pub fn is_healthy(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Run a command, optionally feeding stdin, collecting stdout/stderr
    /// and the exit status. Bounded by the client's exec timeout unless
    /// a longer one is supplied.
    pub async fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> NodeResult<ExecOutput> {
        let budget = timeout.unwrap_or(self.exec_timeout);
        tokio::time::timeout(budget, self.exec_inner(command, stdin))
            .await
            .map_err(|_| NodeError::Timeout(budget.as_secs()))?
    }

    async fn exec_inner(&self, command: &str, stdin: Option<&[u8]>) -> NodeResult<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| NodeError::Connect(e.to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| NodeError::Exec(e.to_string()))?;

        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| NodeError::Exec(e.to_string()))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| NodeError::Exec(e.to_string()))?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_code = exit_status,
                _ => {}
            }
        }
        Ok(output)
    }

    /// Invoke a minion command: JSON args on stdin, one envelope back on
    /// stdout.
    pub async fn minion_call(
        &self,
        command: &str,
        args: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> RuntimeResult<serde_json::Value> {
        let stdin = serde_json::to_vec(args)
            .map_err(|e| hoster_docker::RuntimeError::internal(e.to_string()))?;

        let output = self
            .exec(
                &format!("{} {command}", crate::minion::MINION_REMOTE_PATH),
                Some(&stdin),
                timeout,
            )
            .await
            .map_err(crate::remote::classify)?;

        // A nonzero exit with a valid envelope still carries the real
        // error; only unparseable stdout is a protocol failure.
        let envelope: Envelope = serde_json::from_slice(&output.stdout).map_err(|e| {
            warn!(
                host = %self.target_host,
                command,
                exit_code = output.exit_code,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "minion returned invalid JSON"
            );
            hoster_docker::RuntimeError::internal(format!("invalid minion response: {e}"))
        })?;
        envelope.into_result()
    }

    /// Upload bytes to a path relative to the remote home directory via
    /// SFTP.
    pub async fn upload(&self, data: &[u8], remote_path: &str) -> NodeResult<()> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| NodeError::Connect(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| NodeError::Sftp(e.to_string()))?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| NodeError::Sftp(e.to_string()))?;

        if let Some((dir, _)) = remote_path.rsplit_once('/') {
            // Already-existing directories are fine.
            let _ = sftp.create_dir(dir).await;
        }

        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| NodeError::Sftp(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| NodeError::Sftp(e.to_string()))?;
        file.shutdown()
            .await
            .map_err(|e| NodeError::Sftp(e.to_string()))?;

        debug!(host = %self.target_host, remote_path, bytes = data.len(), "uploaded");
        Ok(())
    }

    /// Close the underlying connection.
    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}
