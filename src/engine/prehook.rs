use std::collections::BTreeMap;
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::client::RequestOptions;

#[derive(Debug, Error)]
pub enum PreHookError {
    #[error("pre-hook failed to start: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("pre-hook exited with {status}")]
    Failed { status: std::process::ExitStatus },

    #[error("pre-hook produced no output")]
    EmptyOutput,

    #[error("pre-hook output is not valid JSON: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct PreHookPayload {
    #[serde(default)]
    cookie: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
}

/// Runs the pre-hook command once through a shell and parses its stdout as a
/// JSON object `{cookie?, headers?}`. Stderr is forwarded to the parent. An
/// empty stdout or a decode failure is fatal at startup.
pub async fn run(command: &str) -> Result<RequestOptions, PreHookError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await
        .map_err(|e| PreHookError::Spawn { source: e })?;

    if !output.status.success() {
        return Err(PreHookError::Failed {
            status: output.status,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(PreHookError::EmptyOutput);
    }

    let payload: PreHookPayload =
        serde_json::from_str(trimmed).map_err(|e| PreHookError::Decode { source: e })?;

    Ok(RequestOptions {
        cookie: payload.cookie,
        headers: payload.headers.unwrap_or_default(),
    })
}
