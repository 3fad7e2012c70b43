//! The minion wire protocol.
//!
//! Transport is an SSH `exec` of `~/.hoster/minion <command>`: command
//! arguments as JSON on stdin, a single JSON response envelope on
//! stdout. These types are the contract between the control plane and
//! the minion binary; hoster-docker's wire types ride inside `data`.

use serde::{Deserialize, Serialize};

use hoster_docker::{ErrorCode, RuntimeError, RuntimeResult};

/// Minion command names, as passed on the command line.
pub mod command {
    pub const VERSION: &str = "version";
    pub const PING: &str = "ping";
    pub const SYSTEM_INFO: &str = "system-info";
    pub const CREATE_CONTAINER: &str = "create-container";
    pub const START_CONTAINER: &str = "start-container";
    pub const STOP_CONTAINER: &str = "stop-container";
    pub const REMOVE_CONTAINER: &str = "remove-container";
    pub const LIST_CONTAINERS: &str = "list-containers";
    pub const CONTAINER_LOGS: &str = "container-logs";
    pub const CONTAINER_STATS: &str = "container-stats";
    pub const CREATE_NETWORK: &str = "create-network";
    pub const REMOVE_NETWORK: &str = "remove-network";
    pub const CREATE_VOLUME: &str = "create-volume";
    pub const REMOVE_VOLUME: &str = "remove-volume";
    pub const IMAGE_EXISTS: &str = "image-exists";
    pub const PULL_IMAGE: &str = "pull-image";

    /// Every known command, for the minion's dispatcher.
    pub const ALL: &[&str] = &[
        VERSION,
        PING,
        SYSTEM_INFO,
        CREATE_CONTAINER,
        START_CONTAINER,
        STOP_CONTAINER,
        REMOVE_CONTAINER,
        LIST_CONTAINERS,
        CONTAINER_LOGS,
        CONTAINER_STATS,
        CREATE_NETWORK,
        REMOVE_NETWORK,
        CREATE_VOLUME,
        REMOVE_VOLUME,
        IMAGE_EXISTS,
        PULL_IMAGE,
    ];
}

/// The single JSON response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

/// Error payload inside a failed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub command: String,
    pub code: String,
    pub message: String,
}

impl Envelope {
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn ok_empty() -> Self {
        Self { success: true, data: None, error: None }
    }

    pub fn err(command: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(EnvelopeError {
                command: command.to_string(),
                code: code.as_str().to_string(),
                message: message.into(),
            }),
        }
    }

    /// Unwrap into the command's data, propagating envelope errors as
    /// `RuntimeError` with the carried code.
    pub fn into_result(self) -> RuntimeResult<serde_json::Value> {
        if self.success {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }
        match self.error {
            Some(err) => Err(RuntimeError::new(
                ErrorCode::parse(&err.code).unwrap_or(ErrorCode::Internal),
                err.message,
            )),
            None => Err(RuntimeError::internal("failure envelope without error")),
        }
    }
}

// ── Command arguments ─────────────────────────────────────────────

/// Arguments for `stop-container`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopArgs {
    pub id: String,
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

/// Arguments for `remove-container`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveArgs {
    pub id: String,
    #[serde(default)]
    pub force: bool,
}

/// Arguments for `container-logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsArgs {
    pub id: String,
    #[serde(default)]
    pub tail: Option<u32>,
    #[serde(default)]
    pub timestamps: bool,
}

/// Arguments for network/volume commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

/// Arguments for image commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageArgs {
    pub image: String,
}

/// `version` response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // JSON-encoding then decoding any envelope is the identity.
    #[test]
    fn envelope_round_trips() {
        let cases = vec![
            Envelope::ok(serde_json::json!({"id": "abc123"})),
            Envelope::ok_empty(),
            Envelope::err(command::PULL_IMAGE, ErrorCode::PullFailed, "registry unreachable"),
        ];
        for envelope in cases {
            let encoded = serde_json::to_string(&envelope).unwrap();
            let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn success_envelope_omits_error_field() {
        let encoded = serde_json::to_string(&Envelope::ok(serde_json::json!(1))).unwrap();
        assert!(!encoded.contains("error"));

        let encoded = serde_json::to_string(&Envelope::err(
            command::PING,
            ErrorCode::ConnectionFailed,
            "daemon down",
        ))
        .unwrap();
        assert!(!encoded.contains("data"));
    }

    #[test]
    fn into_result_propagates_code() {
        let err = Envelope::err(command::START_CONTAINER, ErrorCode::AlreadyRunning, "running")
            .into_result()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyRunning);

        // Unknown codes degrade to internal rather than failing to parse.
        let envelope = Envelope {
            success: false,
            data: None,
            error: Some(EnvelopeError {
                command: "ping".to_string(),
                code: "martian".to_string(),
                message: "?".to_string(),
            }),
        };
        assert_eq!(envelope.into_result().unwrap_err().code, ErrorCode::Internal);
    }

    #[test]
    fn into_result_returns_data() {
        let value = Envelope::ok(serde_json::json!({"version": "abc"}))
            .into_result()
            .unwrap();
        assert_eq!(value["version"], "abc");
        assert_eq!(Envelope::ok_empty().into_result().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn sixteen_commands_exist() {
        assert_eq!(command::ALL.len(), 16);
    }
}
