//! End-to-end tests for the orchestrated execution path, using a fake
//! isolation binary in place of the external tool.

mod common;

use std::time::Duration;

use tempfile::TempDir;

use codebox::error::{Error, ExecError};
use codebox::exec::{ExecutionRequest, InputFile, InputFileSource};
use codebox::languages::Language;
use codebox::state::hot_state_key;
use codebox::state::HotTier as _;

use common::*;

fn request(language: Language, code: &str) -> ExecutionRequest {
    ExecutionRequest {
        language,
        code: code.to_string(),
        session_id: None,
        files: Vec::new(),
        capture_state: language.is_interactive(),
        time_limit: None,
        memory_limit_mb: None,
    }
}

#[tokio::test]
async fn interactive_execution_returns_output_and_session() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_INTERPRETER);
    let stack = build_stack(test_settings(root.path(), &fake, 1));

    let outcome = stack
        .orchestrator
        .execute(request(Language::Python, "print('hi')"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "ok\n");
    assert!(!outcome.session_id.is_empty());
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn state_is_saved_before_the_response_returns() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_INTERPRETER);
    let stack = build_stack(test_settings(root.path(), &fake, 1));

    let mut req = request(Language::Python, "x = 40 + 2");
    req.session_id = Some("sess-state".to_string());
    req.capture_state = true;
    stack.orchestrator.execute(req).await.unwrap();

    // the fake interpreter captures snapshot bytes [1, 2, 3] ("AQID")
    let saved = stack.hot.peek(&hot_state_key("sess-state")).await.unwrap();
    assert_eq!(saved, Some(vec![1u8, 2, 3]));
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn stateless_requests_save_nothing() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_INTERPRETER);
    let stack = build_stack(test_settings(root.path(), &fake, 1));

    let mut req = request(Language::Python, "x = 1");
    req.session_id = Some("sess-stateless".to_string());
    req.capture_state = false;
    stack.orchestrator.execute(req).await.unwrap();

    let saved = stack
        .hot
        .peek(&hot_state_key("sess-stateless"))
        .await
        .unwrap();
    assert_eq!(saved, None);
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn timeout_kills_the_conversation_and_saves_no_state() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_HANGING_INTERPRETER);
    let stack = build_stack(test_settings(root.path(), &fake, 1));

    let mut req = request(Language::Python, "while True: pass");
    req.session_id = Some("sess-timeout".to_string());
    req.capture_state = true;
    req.time_limit = Some(Duration::from_secs(1));

    let err = stack.orchestrator.execute(req).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Exec(ExecError::TimeoutExceeded { limit_secs: 1 })
    ));
    let saved = stack.hot.peek(&hot_state_key("sess-timeout")).await.unwrap();
    assert_eq!(saved, None);
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn broken_interpreter_is_retried_once_then_fails() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_BROKEN_INTERPRETER);
    let stack = build_stack(test_settings(root.path(), &fake, 2));

    let err = stack
        .orchestrator
        .execute(request(Language::Python, "x = 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Exec(ExecError::SandboxUnhealthy { .. })));
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn validation_fails_fast_without_touching_resources() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_INTERPRETER);
    let settings = test_settings(root.path(), &fake, 1);
    let sandbox_dir = settings.sandbox_base_dir.clone();
    let stack = build_stack(settings);

    let cases = [
        request(Language::Python, "   "),
        {
            let mut r = request(Language::Python, "x = 1");
            r.session_id = Some("no spaces allowed".to_string());
            r
        },
        {
            let mut r = request(Language::Python, "x = 1");
            r.time_limit = Some(Duration::from_secs(10_000));
            r
        },
        {
            let mut r = request(Language::Python, "x = 1");
            r.memory_limit_mb = Some(0);
            r
        },
        {
            let mut r = request(Language::Python, "x = 1");
            r.files = vec![InputFile {
                name: "../escape".to_string(),
                source: InputFileSource::Inline(b"x".to_vec()),
            }];
            r
        },
    ];
    for req in cases {
        let err = stack.orchestrator.execute(req).await.unwrap_err();
        assert!(matches!(err, Error::Exec(ExecError::BadRequest { .. })));
    }

    // fail-fast means no sandbox was ever created for these
    let entries = std::fs::read_dir(&sandbox_dir)
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(entries, 0);
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn oneshot_collects_output_files() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_RUNNER_WITH_FILE);
    let stack = build_stack(test_settings(root.path(), &fake, 0));

    let outcome = stack
        .orchestrator
        .execute(request(Language::JavaScript, "console.log('hello')"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.files.len(), 1);
    assert_eq!(outcome.files[0].name, "out.txt");

    // the produced file is downloadable through the file store
    let (name, bytes) = stack
        .files
        .load(&outcome.session_id, &outcome.files[0].id)
        .await
        .unwrap();
    assert_eq!(name, "out.txt");
    assert_eq!(bytes, b"artifact\n");
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn staged_input_files_are_visible_to_the_program() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_RUNNER_CAT_INPUT);
    let stack = build_stack(test_settings(root.path(), &fake, 0));

    let uploaded = stack
        .files
        .store("sess-up", "input.txt", b"staged content\n")
        .await
        .unwrap();

    let mut req = request(Language::JavaScript, "ignored");
    req.files = vec![InputFile {
        name: String::new(),
        source: InputFileSource::Stored {
            session_id: "sess-up".to_string(),
            file_id: uploaded.id,
        },
    }];

    let outcome = stack.orchestrator.execute(req).await.unwrap();
    assert_eq!(outcome.stdout, "staged content\n");
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn compile_failure_returns_diagnostic_and_no_files() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_FAILING_COMPILER);
    let stack = build_stack(test_settings(root.path(), &fake, 0));

    let outcome = stack
        .orchestrator
        .execute(request(Language::C, "int main( { }"))
        .await
        .unwrap();

    assert_ne!(outcome.exit_code, 0);
    assert!(outcome.stderr.contains("error: expected declaration"));
    assert!(outcome.files.is_empty());
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn resource_kill_is_a_user_facing_failure() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_RESOURCE_KILLED);
    let stack = build_stack(test_settings(root.path(), &fake, 0));

    let outcome = stack
        .orchestrator
        .execute(request(Language::JavaScript, "explode()"))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 128 + 9);
    assert!(outcome.stderr.contains("memory or process limit exceeded"));
    stack.pool.shutdown().await;
}

#[tokio::test]
async fn capture_state_for_oneshot_language_yields_warning() {
    let root = TempDir::new().unwrap();
    let fake = write_fake_isolation(root.path(), "fake-nsjail", FAKE_RUNNER_WITH_FILE);
    let stack = build_stack(test_settings(root.path(), &fake, 0));

    let mut req = request(Language::JavaScript, "console.log(1)");
    req.capture_state = true;
    let outcome = stack.orchestrator.execute(req).await.unwrap();
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.contains("interactive language")));
    stack.pool.shutdown().await;
}
