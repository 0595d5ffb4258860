//! Execution paths: the frame protocol, the REPL and one-shot executors,
//! and the orchestrator that ties them to the pool and the state store.

pub mod oneshot;
pub mod orchestrator;
pub mod protocol;
pub mod repl;

pub use orchestrator::{ExecutionOutcome, Orchestrator};

use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::languages::Language;

/// An input file staged into the sandbox before execution.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub source: InputFileSource,
}

/// Where an input file's bytes come from.
#[derive(Debug, Clone)]
pub enum InputFileSource {
    Inline(Vec<u8>),
    /// Reference into the upload bucket: `{sessionId}/{fileId}`.
    Stored { session_id: String, file_id: String },
}

/// One execution request, consumed once.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub code: String,
    pub session_id: Option<String>,
    pub files: Vec<InputFile>,
    /// For the interactive language: persist the post-execution namespace.
    pub capture_state: bool,
    pub time_limit: Option<std::time::Duration>,
    pub memory_limit_mb: Option<u64>,
}

/// A file produced by user code under the scratch directory.
#[derive(Debug, Clone)]
pub struct ProducedFile {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Set when the file exceeded the per-file size cap; `bytes` is empty.
    pub truncated: bool,
}

/// Raw result of one executor run, before persistence and response shaping.
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Decoded snapshot bytes, when the interpreter captured one.
    pub state: Option<Vec<u8>>,
    pub files: Vec<ProducedFile>,
    /// Non-fatal notes surfaced to the caller (dropped files, caps hit).
    pub warnings: Vec<String>,
}

/// Caps applied when collecting outputs.
#[derive(Debug, Clone, Copy)]
pub struct OutputCaps {
    pub max_output_bytes: usize,
    pub max_files: usize,
    pub max_file_bytes: usize,
}

/// Names of visible files under the scratch data directory, relative to
/// it. Hidden entries (the staged interpreter, build artifacts) and
/// anything beneath them are excluded.
pub(crate) fn snapshot_names(data_dir: &Path) -> HashSet<String> {
    let mut names = HashSet::new();
    let walker = WalkDir::new(data_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !entry.file_name().to_string_lossy().starts_with('.'));
    for entry in walker.flatten() {
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(data_dir) {
                names.insert(rel.to_string_lossy().into_owned());
            }
        }
    }
    names
}

/// Collects files that appeared since `before`, honoring count and size
/// caps. The interpreter's `files` hint is merged in so in-place edits of
/// pre-existing files are returned too; the scan stays authoritative (a
/// hinted name that does not exist on disk is dropped).
pub(crate) fn collect_new_files(
    data_dir: &Path,
    before: &HashSet<String>,
    hints: &[String],
    caps: OutputCaps,
) -> (Vec<ProducedFile>, Vec<String>) {
    let after = snapshot_names(data_dir);
    let mut candidates: Vec<String> = after.difference(before).cloned().collect();
    for hint in hints {
        if after.contains(hint) && !candidates.contains(hint) {
            candidates.push(hint.clone());
        }
    }
    candidates.sort();

    let mut warnings = Vec::new();
    if candidates.len() > caps.max_files {
        warnings.push(format!(
            "{} output files exceed the limit of {}; extra files were dropped",
            candidates.len(),
            caps.max_files
        ));
        candidates.truncate(caps.max_files);
    }

    let mut produced = Vec::new();
    for name in candidates {
        let path = data_dir.join(&name);
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() as usize,
            Err(_) => continue,
        };
        if size > caps.max_file_bytes {
            warnings.push(format!(
                "output file '{name}' is {size} bytes, over the {} byte cap; content omitted",
                caps.max_file_bytes
            ));
            produced.push(ProducedFile {
                name,
                bytes: Vec::new(),
                truncated: true,
            });
            continue;
        }
        match std::fs::read(&path) {
            Ok(bytes) => produced.push(ProducedFile {
                name,
                bytes,
                truncated: false,
            }),
            Err(e) => warnings.push(format!("failed to read output file '{name}': {e}")),
        }
    }
    (produced, warnings)
}

/// Truncates captured output at the cap, appending a marker when cut.
pub(crate) fn cap_output(raw: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= cap {
        return text.into_owned();
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated: size limit exceeded]", &text[..cut])
}

/// Default wall-clock budget for a language, scaled by its multiplier.
pub(crate) fn effective_time_limit(
    language: Language,
    requested: Option<std::time::Duration>,
    base: std::time::Duration,
) -> std::time::Duration {
    match requested {
        Some(limit) => limit,
        None => base.mul_f64(language.config().timeout_multiplier),
    }
}
