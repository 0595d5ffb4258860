//! Execution orchestrator: the single entry point for a request.
//!
//! Pipeline: validate, resolve session, load state, acquire a sandbox,
//! stage input files, dispatch to the REPL or one-shot executor, collect
//! outputs, persist state, destroy the sandbox. Acquisition is scoped: a
//! guard destroys the sandbox on every exit path, including cancellation.
//! Persistence failures degrade to response warnings, never to errors.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, ExecError, StateError};
use crate::exec::{
    effective_time_limit, oneshot, repl, ExecutionRequest, InputFile, InputFileSource, OutputCaps,
    RawOutcome,
};
use crate::files::{sanitize_name, FileRef, FileStore};
use crate::languages::Language;
use crate::sandbox::{Sandbox, SandboxPool};
use crate::state::{SessionMeta, StateStore};

/// Result of one orchestrated execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Echoed or freshly created session identifier.
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub files: Vec<FileRef>,
    pub warnings: Vec<String>,
}

/// Coordinates the execution workflow across pool, executors, and stores.
pub struct Orchestrator {
    pool: SandboxPool,
    state: Arc<StateStore>,
    files: Arc<FileStore>,
    settings: Settings,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        pool: SandboxPool,
        state: Arc<StateStore>,
        files: Arc<FileStore>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            state,
            files,
            settings,
        }
    }

    /// Runs one execution request to completion.
    #[instrument(skip(self, request), fields(language = %request.language, request_id = %Uuid::new_v4().simple()))]
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, Error> {
        self.validate(&request)?;

        let mut warnings = Vec::new();
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let interactive = request.language.is_interactive();

        if request.capture_state && !interactive {
            warnings.push(format!(
                "state capture is only supported for the interactive language, not {}",
                request.language
            ));
        }

        // Load the previous snapshot, degrading to a fresh session when
        // storage is unreachable.
        let loaded_state = if interactive && request.session_id.is_some() {
            match self.state.load(&session_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "State load failed, treating session as fresh");
                    warnings.push("session state was unavailable; starting fresh".to_string());
                    None
                }
            }
        } else {
            None
        };

        let caps = OutputCaps {
            max_output_bytes: self.settings.max_output_bytes,
            max_files: self.settings.max_output_files,
            max_file_bytes: self.settings.max_output_file_bytes,
        };
        let time_limit =
            effective_time_limit(request.language, request.time_limit, self.settings.time_limit);
        let memory_limit_mb = request
            .memory_limit_mb
            .unwrap_or(self.settings.memory_limit_mb);

        let mut raw = if interactive {
            self.run_interactive(&request, loaded_state, time_limit, caps, &mut warnings)
                .await?
        } else {
            self.run_oneshot(&request, time_limit, memory_limit_mb, caps, &mut warnings)
                .await?
        };
        warnings.append(&mut raw.warnings);

        let mut stored = Vec::new();
        for file in &raw.files {
            if file.truncated {
                continue;
            }
            match self.files.store(&session_id, &file.name, &file.bytes).await {
                Ok(file_ref) => stored.push(file_ref),
                Err(e) => warnings.push(format!("failed to store output file '{}': {e}", file.name)),
            }
        }

        // State save completes before the response is emitted so the next
        // execution on this session observes it.
        if interactive && request.capture_state {
            if let Some(snapshot) = raw.state.take() {
                if raw.exit_code == 0 || self.settings.capture_state_on_error {
                    match self.state.save(&session_id, snapshot).await {
                        Ok(()) => {}
                        Err(StateError::TooLarge { size, limit }) => warnings.push(format!(
                            "StateTooLarge: snapshot is {size} bytes (limit {limit}); session state was not saved"
                        )),
                        Err(e) => {
                            warn!(error = %e, "State save failed");
                            warnings.push("session state could not be saved".to_string());
                        }
                    }
                }
            }
        }
        self.touch_session_meta(&session_id, request.language).await;

        info!(
            session_id = %session_id,
            exit_code = raw.exit_code,
            file_count = stored.len(),
            warning_count = warnings.len(),
            "Execution finished"
        );

        Ok(ExecutionOutcome {
            session_id,
            stdout: raw.stdout,
            stderr: raw.stderr,
            exit_code: raw.exit_code,
            files: stored,
            warnings,
        })
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<(), ExecError> {
        if request.code.trim().is_empty() {
            return Err(ExecError::BadRequest {
                reason: "code cannot be empty".to_string(),
            });
        }
        if request.code.len() > self.settings.max_code_bytes {
            return Err(ExecError::BadRequest {
                reason: format!(
                    "code is {} bytes, over the {} byte limit",
                    request.code.len(),
                    self.settings.max_code_bytes
                ),
            });
        }
        if let Some(id) = &request.session_id {
            let ok = !id.is_empty()
                && id.len() <= 128
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !ok {
                return Err(ExecError::BadRequest {
                    reason: format!("invalid session id {id:?}"),
                });
            }
        }
        if let Some(limit) = request.time_limit {
            if limit.is_zero() || limit > self.settings.max_time_limit {
                return Err(ExecError::BadRequest {
                    reason: format!(
                        "time limit must be between 1 and {} seconds",
                        self.settings.max_time_limit.as_secs()
                    ),
                });
            }
        }
        if let Some(mb) = request.memory_limit_mb {
            if mb == 0 || mb > self.settings.max_memory_limit_mb {
                return Err(ExecError::BadRequest {
                    reason: format!(
                        "memory limit must be between 1 and {} MB",
                        self.settings.max_memory_limit_mb
                    ),
                });
            }
        }
        for file in &request.files {
            match &file.source {
                InputFileSource::Inline(_) => {
                    sanitize_name(&file.name).map_err(|e| ExecError::BadRequest {
                        reason: e.to_string(),
                    })?;
                }
                InputFileSource::Stored { session_id, file_id } => {
                    if session_id.is_empty() || file_id.is_empty() {
                        return Err(ExecError::BadRequest {
                            reason: "stored file references need a session id and file id"
                                .to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_interactive(
        &self,
        request: &ExecutionRequest,
        state: Option<Vec<u8>>,
        time_limit: std::time::Duration,
        caps: OutputCaps,
        warnings: &mut Vec<String>,
    ) -> Result<RawOutcome, Error> {
        let repl_request = repl::ReplRequest {
            code: request.code.clone(),
            state,
            capture_state: request.capture_state,
        };

        // An unhealthy sandbox is destroyed and the execution retried once
        // on a fresh one before the error becomes the caller's problem.
        let mut attempts = 0;
        loop {
            attempts += 1;
            let sandbox = self.pool.acquire(request.language).await?;
            let mut guard = SandboxGuard::new(sandbox, self.pool.clone());

            self.stage_files(guard.sandbox(), &request.files, warnings)
                .await?;

            match repl::execute(guard.sandbox_mut(), &repl_request, time_limit, caps).await {
                Ok(raw) => return Ok(raw),
                Err(ExecError::SandboxUnhealthy { reason }) if attempts == 1 => {
                    warn!(%reason, "Interactive sandbox unhealthy, retrying on a fresh one");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_oneshot(
        &self,
        request: &ExecutionRequest,
        time_limit: std::time::Duration,
        memory_limit_mb: u64,
        caps: OutputCaps,
        warnings: &mut Vec<String>,
    ) -> Result<RawOutcome, Error> {
        let sandbox = self.pool.acquire(request.language).await?;
        let guard = SandboxGuard::new(sandbox, self.pool.clone());

        self.stage_files(guard.sandbox(), &request.files, warnings)
            .await?;

        let limits = oneshot::RunLimits {
            time_limit,
            compile_time_limit: self
                .settings
                .compile_time_limit
                .max(time_limit),
            memory_limit_mb,
        };
        let raw = oneshot::execute(guard.sandbox(), &request.code, limits, &self.settings, caps)
            .await?;
        Ok(raw)
    }

    /// Writes input files into the sandbox scratch. A stored reference
    /// that cannot be resolved degrades to a warning; the execution
    /// proceeds without the file.
    async fn stage_files(
        &self,
        sandbox: &Sandbox,
        files: &[InputFile],
        warnings: &mut Vec<String>,
    ) -> Result<(), Error> {
        for file in files {
            let (name, bytes) = match &file.source {
                InputFileSource::Inline(bytes) => (file.name.clone(), bytes.clone()),
                InputFileSource::Stored { session_id, file_id } => {
                    match self.files.load(session_id, file_id).await {
                        Ok((name, bytes)) => (name, bytes),
                        Err(e) => {
                            warn!(error = %e, "Input file reference unresolved");
                            warnings.push(format!(
                                "input file {session_id}/{file_id} was not found and was skipped"
                            ));
                            continue;
                        }
                    }
                }
            };
            let name = sanitize_name(&name).map_err(|e| {
                Error::Exec(ExecError::BadRequest {
                    reason: e.to_string(),
                })
            })?;
            let path = sandbox.paths.data.join(&name);
            tokio::fs::write(&path, &bytes).await.map_err(|e| {
                Error::Exec(ExecError::Internal(format!(
                    "failed to stage input file '{name}': {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn touch_session_meta(&self, session_id: &str, language: Language) {
        let meta = match self.state.load_meta(session_id).await {
            Ok(Some(mut meta)) => {
                meta.touch(language);
                meta
            }
            _ => SessionMeta::new(language),
        };
        if let Err(e) = self.state.save_meta(session_id, &meta).await {
            warn!(session_id, error = %e, "Failed to save session metadata");
        }
    }
}

/// Scoped acquisition: destroys the sandbox on drop, on every exit path
/// including cancellation. Destruction happens on a detached task so drop
/// never blocks.
struct SandboxGuard {
    sandbox: Option<Sandbox>,
    pool: SandboxPool,
}

impl SandboxGuard {
    fn new(sandbox: Sandbox, pool: SandboxPool) -> Self {
        Self {
            sandbox: Some(sandbox),
            pool,
        }
    }

    fn sandbox(&self) -> &Sandbox {
        self.sandbox
            .as_ref()
            .expect("sandbox taken before guard drop")
    }

    fn sandbox_mut(&mut self) -> &mut Sandbox {
        self.sandbox
            .as_mut()
            .expect("sandbox taken before guard drop")
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(sandbox).await;
            });
        }
    }
}
