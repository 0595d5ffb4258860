//! Frame protocol spoken with the in-sandbox interpreter server.
//!
//! A request is the marker line `>>> REQUEST_START <<<`, a single JSON
//! document, and `>>> REQUEST_END <<<`; responses use the matching
//! `RESPONSE` markers. Anything outside the markers is log noise and is
//! skipped by readers. After warmup the interpreter emits the bare ready
//! marker line once.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use crate::error::ExecError;
use crate::sandbox::ReplProcess;

pub const REQUEST_START: &str = ">>> REQUEST_START <<<";
pub const REQUEST_END: &str = ">>> REQUEST_END <<<";
pub const RESPONSE_START: &str = ">>> RESPONSE_START <<<";
pub const RESPONSE_END: &str = ">>> RESPONSE_END <<<";
pub const READY_MARKER: &str = ">>> READY <<<";

/// Body of a request frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBody {
    pub code: String,
    /// Base64 of the compressed snapshot to overlay before execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_state: Option<bool>,
}

/// Body of a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    /// Base64 of the captured snapshot, when requested and non-empty.
    #[serde(default)]
    pub state: Option<String>,
    /// Names of files created or modified under the scratch directory.
    /// A hint; the host-side scan is authoritative.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Writes exactly one request frame and flushes.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &RequestBody,
) -> std::io::Result<()> {
    let payload = serde_json::to_string(body).map_err(std::io::Error::other)?;
    writer.write_all(REQUEST_START.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(REQUEST_END.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Reads one response frame, skipping noise outside the markers.
///
/// # Errors
///
/// `ExecError::SandboxUnhealthy` on EOF before a complete frame or on a
/// body that does not parse. The caller owns the deadline; wrap this in
/// `tokio::time::timeout`.
pub async fn read_response<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> Result<ResponseBody, ExecError> {
    let mut line = String::new();

    // Skip until the start marker.
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ExecError::SandboxUnhealthy {
                reason: format!("read from interpreter failed: {e}"),
            })?;
        if read == 0 {
            return Err(ExecError::SandboxUnhealthy {
                reason: "interpreter closed stdout before response".to_string(),
            });
        }
        if line.trim_end() == RESPONSE_START {
            break;
        }
        trace!(noise = line.trim_end(), "Skipping bytes outside response frame");
    }

    // Collect the body until the end marker.
    let mut body = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ExecError::SandboxUnhealthy {
                reason: format!("read from interpreter failed: {e}"),
            })?;
        if read == 0 {
            return Err(ExecError::SandboxUnhealthy {
                reason: "interpreter closed stdout before response end marker".to_string(),
            });
        }
        if line.trim_end() == RESPONSE_END {
            break;
        }
        body.push_str(&line);
    }

    serde_json::from_str(&body).map_err(|e| ExecError::SandboxUnhealthy {
        reason: format!("malformed response body: {e}"),
    })
}

/// Sends a no-op request and waits briefly for a well-formed response.
///
/// Used as the acquisition-time liveness probe; any failure (write error,
/// timeout, malformed frame) reports the interpreter as unhealthy.
pub async fn ping(repl: &mut ReplProcess, budget: Duration) -> bool {
    let body = RequestBody {
        code: String::new(),
        state: None,
        capture_state: None,
    };
    if write_request(&mut repl.stdin, &body).await.is_err() {
        return false;
    }
    matches!(
        timeout(budget, read_response(&mut repl.stdout)).await,
        Ok(Ok(response)) if response.error.is_none()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn framed(body: &str) -> String {
        format!("{RESPONSE_START}\n{body}\n{RESPONSE_END}\n")
    }

    #[tokio::test]
    async fn test_request_frame_shape() {
        let mut buf = Vec::new();
        let body = RequestBody {
            code: "x = 1".to_string(),
            state: None,
            capture_state: Some(true),
        };
        write_request(&mut buf, &body).await.unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], REQUEST_START);
        assert_eq!(lines[2], REQUEST_END);
        let parsed: RequestBody = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.code, "x = 1");
        assert_eq!(parsed.capture_state, Some(true));
        // absent fields are omitted, not null
        assert!(!lines[1].contains("\"state\""));
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let body = r#"{"stdout":"42\n","stderr":"","exit_code":0,"state":null,"files":["plot.png"],"error":null}"#;
        let text = framed(body);
        let mut reader = BufReader::new(text.as_bytes());
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.stdout, "42\n");
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.files, vec!["plot.png"]);
        assert!(response.state.is_none());
    }

    #[tokio::test]
    async fn test_noise_outside_markers_is_ignored() {
        let text = format!(
            "import warning: blah\n{}\nsome stray line\n{}",
            framed(r#"{"stdout":"","stderr":"","exit_code":1}"#),
            "trailing noise\n"
        );
        let mut reader = BufReader::new(text.as_bytes());
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.exit_code, 1);
    }

    #[tokio::test]
    async fn test_eof_before_start_is_unhealthy() {
        let mut reader = BufReader::new(&b"log noise only\n"[..]);
        let err = read_response(&mut reader).await.unwrap_err();
        assert!(matches!(err, ExecError::SandboxUnhealthy { .. }));
    }

    #[tokio::test]
    async fn test_eof_before_end_is_unhealthy() {
        let text = format!("{RESPONSE_START}\n{{\"stdout\":\"\"}}\n");
        let mut reader = BufReader::new(text.as_bytes());
        let err = read_response(&mut reader).await.unwrap_err();
        assert!(matches!(err, ExecError::SandboxUnhealthy { .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_unhealthy() {
        let text = framed("not json");
        let mut reader = BufReader::new(text.as_bytes());
        let err = read_response(&mut reader).await.unwrap_err();
        assert!(matches!(err, ExecError::SandboxUnhealthy { .. }));
    }

    #[tokio::test]
    async fn test_multiline_body_accumulates() {
        let body = "{\n  \"stdout\": \"hi\",\n  \"exit_code\": 0\n}";
        let text = framed(body);
        let mut reader = BufReader::new(text.as_bytes());
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.stdout, "hi");
    }
}
