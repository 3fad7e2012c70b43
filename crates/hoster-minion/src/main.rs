//! minion — the per-node helper binary.
//!
//! Invoked over SSH as `minion <command>` with JSON arguments on stdin;
//! prints exactly one JSON response envelope on stdout. Logs go to
//! stderr so they never pollute the protocol stream.
//!
//! `--version` prints the binary's own content hash; the control plane
//! compares it against the binary it would upload.

use std::process::ExitCode;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use hoster_docker::{
    ContainerRuntime, ContainerSpec, ErrorCode, ListFilters, LocalRuntime, LogOptions,
    RuntimeError, RuntimeResult,
};
use hoster_nodes::protocol::{command, Envelope, LogsArgs, RemoveArgs, StopArgs};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .init();

    let Some(cmd) = std::env::args().nth(1) else {
        emit(Envelope::err("", ErrorCode::InvalidInput, "usage: minion <command>"));
        return ExitCode::FAILURE;
    };

    if cmd == "--version" {
        match self_hash() {
            Ok(hash) => {
                println!("hoster-minion {hash}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                emit(Envelope::err("version", ErrorCode::Internal, e));
                return ExitCode::FAILURE;
            }
        }
    }

    let envelope = match run(&cmd).await {
        Ok(data) => match data {
            serde_json::Value::Null => Envelope::ok_empty(),
            data => Envelope::ok(data),
        },
        Err(e) => Envelope::err(&cmd, e.code, e.message),
    };

    let success = envelope.success;
    emit(envelope);
    if success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn emit(envelope: Envelope) {
    match serde_json::to_string(&envelope) {
        Ok(line) => println!("{line}"),
        Err(e) => println!(
            "{{\"success\":false,\"error\":{{\"command\":\"\",\"code\":\"internal\",\"message\":\"encode: {e}\"}}}}"
        ),
    }
}

/// Hash of this executable's own bytes.
fn self_hash() -> Result<String, String> {
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let bytes = std::fs::read(&exe).map_err(|e| e.to_string())?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

async fn read_args() -> RuntimeResult<serde_json::Value> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .map_err(|e| RuntimeError::internal(format!("read stdin: {e}")))?;
    if input.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_slice(&input)
        .map_err(|e| RuntimeError::new(ErrorCode::InvalidInput, format!("parse stdin: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> RuntimeResult<T> {
    serde_json::from_value(args)
        .map_err(|e| RuntimeError::new(ErrorCode::InvalidInput, e.to_string()))
}

async fn run(cmd: &str) -> RuntimeResult<serde_json::Value> {
    let args = read_args().await?;
    let runtime = LocalRuntime::connect()?;
    debug!(command = cmd, "dispatching");

    match cmd {
        command::VERSION => {
            let hash = self_hash().map_err(RuntimeError::internal)?;
            Ok(serde_json::json!({ "version": hash }))
        }
        command::PING => {
            runtime.ping().await?;
            Ok(serde_json::Value::Null)
        }
        command::SYSTEM_INFO => {
            let info = runtime.system_info().await?;
            to_value(info)
        }
        command::CREATE_CONTAINER => {
            let spec: ContainerSpec = decode(args)?;
            let id = runtime.create_container(&spec).await?;
            Ok(serde_json::json!({ "id": id }))
        }
        command::START_CONTAINER => {
            let id = require_id(&args)?;
            runtime.start_container(&id).await?;
            Ok(serde_json::Value::Null)
        }
        command::STOP_CONTAINER => {
            let stop: StopArgs = decode(args)?;
            runtime.stop_container(&stop.id, stop.timeout_secs).await?;
            Ok(serde_json::Value::Null)
        }
        command::REMOVE_CONTAINER => {
            let remove: RemoveArgs = decode(args)?;
            runtime.remove_container(&remove.id, remove.force).await?;
            Ok(serde_json::Value::Null)
        }
        command::LIST_CONTAINERS => {
            let filters: ListFilters = decode(args)?;
            let containers = runtime.list_containers(&filters).await?;
            to_value(containers)
        }
        command::CONTAINER_LOGS => {
            let logs_args: LogsArgs = decode(args)?;
            let logs = runtime
                .container_logs(
                    &logs_args.id,
                    &LogOptions { tail: logs_args.tail, timestamps: logs_args.timestamps },
                )
                .await?;
            Ok(serde_json::json!({ "logs": logs }))
        }
        command::CONTAINER_STATS => {
            let id = require_id(&args)?;
            let stats = runtime.container_stats(&id).await?;
            to_value(stats)
        }
        command::CREATE_NETWORK => {
            runtime.create_network(&require_name(&args)?).await?;
            Ok(serde_json::Value::Null)
        }
        command::REMOVE_NETWORK => {
            runtime.remove_network(&require_name(&args)?).await?;
            Ok(serde_json::Value::Null)
        }
        command::CREATE_VOLUME => {
            runtime.create_volume(&require_name(&args)?).await?;
            Ok(serde_json::Value::Null)
        }
        command::REMOVE_VOLUME => {
            runtime.remove_volume(&require_name(&args)?).await?;
            Ok(serde_json::Value::Null)
        }
        command::IMAGE_EXISTS => {
            let exists = runtime.image_exists(&require_image(&args)?).await?;
            Ok(serde_json::json!({ "exists": exists }))
        }
        command::PULL_IMAGE => {
            runtime.pull_image(&require_image(&args)?).await?;
            Ok(serde_json::Value::Null)
        }
        unknown => Err(RuntimeError::new(
            ErrorCode::InvalidInput,
            format!("unknown command {unknown:?}"),
        )),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> RuntimeResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| RuntimeError::internal(e.to_string()))
}

fn require_field(args: &serde_json::Value, field: &str) -> RuntimeResult<String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| RuntimeError::new(ErrorCode::InvalidInput, format!("missing {field:?}")))
}

fn require_id(args: &serde_json::Value) -> RuntimeResult<String> {
    require_field(args, "id")
}

fn require_name(args: &serde_json::Value) -> RuntimeResult<String> {
    require_field(args, "name")
}

fn require_image(args: &serde_json::Value) -> RuntimeResult<String> {
    require_field(args, "image")
}
