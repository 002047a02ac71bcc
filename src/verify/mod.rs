use std::collections::BTreeMap;
use std::process::Stdio;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::engine::ProbeResult;

/// Event handed to an external verifier on stdin when a result matched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchEvent {
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub content_length: i64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MatchEvent {
    /// Builds the wire event for a matched result; the body travels
    /// base64-encoded.
    pub fn from_result(res: &ProbeResult, method: &reqwest::Method) -> Self {
        Self {
            url: res.url.clone(),
            method: method.to_string(),
            status_code: res.status,
            content_length: res.content_length,
            duration_ms: res.duration.as_millis() as u64,
            body: if res.body.is_empty() {
                None
            } else {
                Some(BASE64.encode(&res.body))
            },
            error: res.error.clone(),
        }
    }
}

/// Verdict returned by the verifier on stdout.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerifierResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSpec>,
}

/// Optional follow-up request overrides a verifier may ask for.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_redirects: Option<bool>,
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("verifier path is empty")]
    EmptyPath,

    #[error("failed to start verifier: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("verifier I/O failure: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("verifier exited with {status}: {stderr}")]
    Failed {
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("verifier returned no output")]
    NoOutput,

    #[error("verifier response is not valid JSON: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("verifier produced extra output beyond a single JSON object")]
    ExtraOutput,
}

/// Exchanges one JSON document with the verifier executable over
/// stdin/stdout. Anything beyond a single JSON document on stdout is an
/// error.
pub async fn call(path: &str, event: &MatchEvent) -> Result<VerifierResponse, VerifierError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(VerifierError::EmptyPath);
    }

    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| VerifierError::Spawn { source: e })?;

    let payload = serde_json::to_vec(event).map_err(|e| VerifierError::Decode { source: e })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| VerifierError::Io { source: e })?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| VerifierError::Io { source: e })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| VerifierError::Io { source: e })?;

    if !output.status.success() {
        return Err(VerifierError::Failed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(VerifierError::NoOutput);
    }

    let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<VerifierResponse>();
    let response = match stream.next() {
        Some(Ok(response)) => response,
        Some(Err(e)) => return Err(VerifierError::Decode { source: e }),
        None => return Err(VerifierError::NoOutput),
    };
    if stream.next().is_some() {
        return Err(VerifierError::ExtraOutput);
    }

    Ok(response)
}
