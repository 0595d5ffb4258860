//! One-shot executor for non-interactive languages.
//!
//! Interpreted languages stage the source and invoke the runner on it.
//! Compiled languages make two separate isolation invocations in the same
//! sandbox: compile (with its own, larger budget) then run; a compile
//! failure returns the compiler's output without attempting the run.

use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::Settings;
use crate::error::{ExecError, SandboxError};
use crate::exec::{cap_output, collect_new_files, snapshot_names, OutputCaps, RawOutcome};
use crate::languages::{expand_template, LanguageKind, BUILD_DIR, DATA_MOUNT};
use crate::sandbox::{IsolationSpec, Sandbox};

/// Extra wall-clock slack past the isolation tool's own kill-timer before
/// the host gives up on the child.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Resource limits for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub time_limit: Duration,
    pub compile_time_limit: Duration,
    pub memory_limit_mb: u64,
}

struct StepOutput {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// The child died to a signal before its time budget elapsed,
    /// which is how a cgroup memory or pid kill presents.
    resource_killed: bool,
}

/// Runs one program to completion in a fresh one-shot sandbox.
#[instrument(skip_all, fields(sandbox_id = %sandbox.id, language = %sandbox.language))]
pub async fn execute(
    sandbox: &Sandbox,
    code: &str,
    limits: RunLimits,
    settings: &Settings,
    caps: OutputCaps,
) -> Result<RawOutcome, ExecError> {
    let config = sandbox.language.config();
    let source_guest = format!("{DATA_MOUNT}/{}", config.source_file);
    let bin_guest = format!("{BUILD_DIR}/main");

    let source_host = sandbox.paths.data.join(config.source_file);
    tokio::fs::write(&source_host, code)
        .await
        .map_err(|e| ExecError::Internal(format!("failed to stage source: {e}")))?;

    let before = snapshot_names(&sandbox.paths.data);

    let step = match config.kind {
        LanguageKind::Interactive => {
            return Err(ExecError::Internal(
                "interactive language routed to the one-shot executor".to_string(),
            ))
        }
        LanguageKind::Interpreted { runner } => {
            let argv = expand_template(runner, &source_guest, &bin_guest);
            run_step(sandbox, argv, limits.time_limit, limits.memory_limit_mb, settings).await?
        }
        LanguageKind::Compiled { compile, run } => {
            let compile_argv = expand_template(compile, &source_guest, &bin_guest);
            let compile_out = run_step(
                sandbox,
                compile_argv,
                limits.compile_time_limit,
                limits.memory_limit_mb,
                settings,
            )
            .await?;

            if compile_out.exit_code != 0 {
                debug!(exit_code = compile_out.exit_code, "Compilation failed, skipping run");
                return Ok(finish(sandbox, compile_out, &before, caps));
            }

            let run_argv = expand_template(run, &source_guest, &bin_guest);
            run_step(sandbox, run_argv, limits.time_limit, limits.memory_limit_mb, settings)
                .await?
        }
    };

    Ok(finish(sandbox, step, &before, caps))
}

fn finish(
    sandbox: &Sandbox,
    step: StepOutput,
    before: &std::collections::HashSet<String>,
    caps: OutputCaps,
) -> RawOutcome {
    let mut stderr = cap_output(&step.stderr, caps.max_output_bytes);
    if step.resource_killed {
        stderr.push_str(
            "\nprocess was killed by the sandbox: memory or process limit exceeded",
        );
    }

    let (files, warnings) = collect_new_files(&sandbox.paths.data, before, &[], caps);

    RawOutcome {
        stdout: cap_output(&step.stdout, caps.max_output_bytes),
        stderr,
        exit_code: step.exit_code,
        state: None,
        files,
        warnings,
    }
}

/// One isolation invocation: spawn, wait with a deadline, classify the exit.
async fn run_step(
    sandbox: &Sandbox,
    argv: Vec<String>,
    time_limit: Duration,
    memory_limit_mb: u64,
    settings: &Settings,
) -> Result<StepOutput, ExecError> {
    let spec = IsolationSpec::new(sandbox.language, &sandbox.paths.data, argv)
        .with_time_limit(time_limit)
        .with_memory_limit_mb(memory_limit_mb)
        .with_tmpfs_size_mb(settings.tmpfs_size_mb);

    let child = spec
        .spawn(&settings.isolation_binary)
        .map_err(|e| match e {
            SandboxError::ConfigInvalid(reason) => ExecError::BadRequest { reason },
            other => ExecError::Internal(other.to_string()),
        })?;
    let pid = child.id();
    let started = Instant::now();

    let output = match timeout(time_limit + REAP_GRACE, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ExecError::Internal(format!(
                "failed to reap sandboxed process: {e}"
            )))
        }
        Err(_) => {
            // The isolation tool's own kill-timer did not fire; take the
            // whole group down before reporting the timeout.
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            warn!(elapsed_ms = %started.elapsed().as_millis(), "Killed sandbox past its deadline");
            return Err(ExecError::TimeoutExceeded {
                limit_secs: time_limit.as_secs(),
            });
        }
    };

    let elapsed = started.elapsed();
    if let Some(signal) = output.status.signal() {
        // Killed at the wall-clock boundary means the kill-timer fired.
        if elapsed + Duration::from_millis(250) >= time_limit {
            return Err(ExecError::TimeoutExceeded {
                limit_secs: time_limit.as_secs(),
            });
        }
        debug!(signal, elapsed_ms = %elapsed.as_millis(), "Sandboxed process killed by signal");
        return Ok(StepOutput {
            exit_code: 128 + signal,
            stdout: output.stdout,
            stderr: output.stderr,
            resource_killed: true,
        });
    }

    Ok(StepOutput {
        exit_code: output.status.code().unwrap_or(1),
        stdout: output.stdout,
        stderr: output.stderr,
        resource_killed: false,
    })
}
