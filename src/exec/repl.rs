//! REPL executor: drives the frame protocol over an acquired interactive
//! sandbox's stdio.
//!
//! Contract per execution: exactly one request frame goes out, one
//! response frame comes back within the wall-clock budget. On timeout,
//! EOF, or a malformed frame the sandbox is unusable; the caller's scoped
//! acquisition destroys it. At most one request is ever in flight per
//! sandbox, enforced by single-use ownership.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::exec::protocol::{self, RequestBody};
use crate::exec::{cap_output, collect_new_files, snapshot_names, OutputCaps, RawOutcome};
use crate::sandbox::Sandbox;

/// Inputs for one interactive execution.
#[derive(Debug, Clone, Default)]
pub struct ReplRequest {
    pub code: String,
    /// Snapshot bytes to overlay into the namespace before execution.
    pub state: Option<Vec<u8>>,
    pub capture_state: bool,
}

/// Runs one framed request against the sandbox's interpreter server.
#[instrument(skip_all, fields(sandbox_id = %sandbox.id, budget_secs = budget.as_secs()))]
pub async fn execute(
    sandbox: &mut Sandbox,
    request: &ReplRequest,
    budget: Duration,
    caps: OutputCaps,
) -> Result<RawOutcome, ExecError> {
    let data_dir = sandbox.paths.data.clone();
    let started = Instant::now();

    let repl = sandbox
        .process
        .as_mut()
        .ok_or_else(|| ExecError::SandboxUnhealthy {
            reason: "sandbox has no interpreter session".to_string(),
        })?;
    if !repl.is_alive() {
        return Err(ExecError::SandboxUnhealthy {
            reason: "interpreter process already exited".to_string(),
        });
    }

    let before = snapshot_names(&data_dir);

    let body = RequestBody {
        code: request.code.clone(),
        state: request.state.as_deref().map(|bytes| BASE64.encode(bytes)),
        capture_state: Some(request.capture_state),
    };
    protocol::write_request(&mut repl.stdin, &body)
        .await
        .map_err(|e| ExecError::SandboxUnhealthy {
            reason: format!("failed to write request frame: {e}"),
        })?;

    let response = match timeout(budget, protocol::read_response(&mut repl.stdout)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!(elapsed_ms = %started.elapsed().as_millis(), "No response within budget");
            return Err(ExecError::TimeoutExceeded {
                limit_secs: budget.as_secs(),
            });
        }
    };

    let mut stderr = cap_output(response.stderr.as_bytes(), caps.max_output_bytes);
    let state = match response.state {
        Some(encoded) => match BASE64.decode(&encoded) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                stderr.push_str(&format!("\nstate snapshot was undecodable: {e}"));
                None
            }
        },
        None => None,
    };

    let (files, warnings) = collect_new_files(&data_dir, &before, &response.files, caps);

    debug!(
        exit_code = response.exit_code,
        elapsed_ms = %started.elapsed().as_millis(),
        file_count = files.len(),
        has_state = state.is_some(),
        "Interactive execution completed"
    );

    Ok(RawOutcome {
        stdout: cap_output(response.stdout.as_bytes(), caps.max_output_bytes),
        stderr,
        exit_code: response.exit_code,
        state,
        files,
        warnings,
    })
}
