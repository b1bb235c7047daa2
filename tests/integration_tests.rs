//! Integration tests for the assistant gateway
//!
//! Turns run against small shell scripts that speak the stream-json protocol,
//! so no real assistant CLI is needed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use assistant_gateway::config::GatewayConfig;
use assistant_gateway::orchestrator::{
    ControlDelivery, ControlMessage, ControlPlane, Orchestrator, PermissionWireFormat,
    Termination, Turn, TurnStatus, TurnStream,
};
use assistant_gateway::session::{InMemorySessionStore, SessionStore};
use assistant_gateway::stream::ProtocolEvent;

const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"opus","tools":["Read"]}"#;
const HELLO: &str =
    r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
const RESULT: &str =
    r#"{"type":"result","result":"hello","total_cost_usd":0.01,"usage":{"output_tokens":1},"is_error":false}"#;

/// Helper to create a gateway Command
fn gateway() -> Command {
    cargo_bin_cmd!("assistant-gateway")
}

/// Write an executable `#!/bin/sh` script standing in for the assistant CLI.
fn fake_assistant(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn test_config(dir: &Path, command: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.assistant.command = command.display().to_string();
    config.storage.upload_dir = dir.join("uploads");
    config.storage.db_path = dir.join("gateway.db");
    config.shutdown.exit_grace_ms = 2_000;
    config.shutdown.terminate_grace_ms = 500;
    config
}

fn orchestrator(config: GatewayConfig) -> (Orchestrator, Arc<InMemorySessionStore>) {
    let sessions = Arc::new(InMemorySessionStore::new());
    (Orchestrator::new(Arc::new(config), sessions.clone()), sessions)
}

async fn collect(stream: &mut TurnStream) -> Vec<ProtocolEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }
    events
}

fn kinds(events: &[ProtocolEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

// =============================================================================
// Turn Orchestration Tests
// =============================================================================

mod turns {
    use super::*;

    #[tokio::test]
    async fn test_full_turn_emits_init_text_and_result() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\necho '{}'\necho '{}'\necho '{}'", INIT, HELLO, RESULT),
        );
        let (orch, sessions) = orchestrator(test_config(dir.path(), &script));

        let mut stream = orch.start_turn(Turn::new("c_1", "hi"));
        let events = collect(&mut stream).await;
        assert_eq!(kinds(&events), vec!["system_init", "assistant_text", "final_result"]);
        match &events[2] {
            ProtocolEvent::FinalResult { text, cost, .. } => {
                assert_eq!(text, "hello");
                assert_eq!(*cost, Some(0.01));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let outcome = stream.finish().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.session_token.as_deref(), Some("abc123"));
        assert_eq!(
            sessions.get("c_1").await.unwrap().as_deref(),
            Some("abc123")
        );
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_stored_session_is_resumed_on_next_turn() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\nread line\necho '{}'\necho '{}'",
                args_file.display(),
                INIT,
                RESULT
            ),
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let first = orch.run_to_completion(Turn::new("c_2", "one")).await.unwrap();
        assert!(first.is_completed());
        let args = fs::read_to_string(&args_file).unwrap();
        assert!(!args.contains("--resume"));

        let second = orch.run_to_completion(Turn::new("c_2", "two")).await.unwrap();
        assert!(second.is_completed());
        let args = fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();
        let pos = args.iter().position(|a| *a == "--resume").unwrap();
        assert_eq!(args[pos + 1], "abc123");
        assert!(args.contains(&"--output-format"));
        assert!(args.contains(&"stream-json"));
    }

    #[tokio::test]
    async fn test_explicit_resume_token_and_model_are_passed() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\nread line\necho '{}'",
                args_file.display(),
                RESULT
            ),
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let turn = Turn::new("c_3", "hi")
            .with_resume_token(Some("tok-1".to_string()))
            .with_model(Some("sonnet".to_string()));
        let outcome = orch.run_to_completion(turn).await.unwrap();
        assert!(outcome.is_completed());

        let args = fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();
        let resume = args.iter().position(|a| *a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "tok-1");
        let model = args.iter().position(|a| *a == "--model").unwrap();
        assert_eq!(args[model + 1], "sonnet");
    }

    #[tokio::test]
    async fn test_line_limit_ends_turn_with_single_error() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!(
                "read line\ni=0\nwhile [ $i -lt 10001 ]; do\n  echo '{}'\n  i=$((i+1))\ndone",
                HELLO
            ),
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let mut stream = orch.start_turn(Turn::new("c_4", "hi"));
        let events = collect(&mut stream).await;
        let errors: Vec<&ProtocolEvent> = events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::StreamError { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        match events.last() {
            Some(ProtocolEvent::StreamError { message }) => assert!(message.contains("too long")),
            other => panic!("unexpected last event: {:?}", other),
        }
        assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::FinalResult { .. })));

        let outcome = stream.finish().await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_idle_assistant_times_out() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(dir.path(), "assistant.sh", "read line\nexec sleep 30");
        let mut config = test_config(dir.path(), &script);
        config.limits.idle_timeout_secs = 1;
        let (orch, _sessions) = orchestrator(config);

        let started = std::time::Instant::now();
        let mut stream = orch.start_turn(Turn::new("c_5", "hi"));
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProtocolEvent::StreamError { message } => assert!(message.contains("timed out")),
            other => panic!("unexpected event: {:?}", other),
        }

        let outcome = stream.finish().await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        let exit = outcome.exit.unwrap();
        assert_ne!(exit.termination, Termination::Natural);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_turn_time_limit_ends_a_chatty_assistant() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\nwhile true; do\n  echo '{}'\n  sleep 0.2\ndone", HELLO),
        );
        let mut config = test_config(dir.path(), &script);
        config.limits.turn_timeout_secs = 1;
        let (orch, _sessions) = orchestrator(config);

        let started = std::time::Instant::now();
        let mut stream = orch.start_turn(Turn::new("c_time", "hi"));
        let events = collect(&mut stream).await;
        assert!(events.iter().any(|e| e.kind() == "assistant_text"));
        let errors: Vec<&ProtocolEvent> = events
            .iter()
            .filter(|e| e.is_terminal())
            .collect();
        assert_eq!(errors.len(), 1);
        match events.last() {
            Some(ProtocolEvent::StreamError { message }) => assert!(message.contains("time limit")),
            other => panic!("unexpected last event: {:?}", other),
        }

        let outcome = stream.finish().await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert_ne!(outcome.exit.unwrap().termination, Termination::Natural);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_to_stalled_assistant_is_abandoned() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(dir.path(), "assistant.sh", "exec sleep 60");
        let mut config = test_config(dir.path(), &script);
        config.limits.idle_timeout_secs = 1;
        config.limits.turn_timeout_secs = 2;
        let (orch, _sessions) = orchestrator(config);

        let stream = orch.start_turn(Turn::new("c_big", "x".repeat(300_000)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let outcome = tokio::time::timeout(Duration::from_secs(10), stream.abandon())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, TurnStatus::Abandoned);
        assert_ne!(outcome.exit.unwrap().termination, Termination::Natural);
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_to_stalled_assistant_times_out() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(dir.path(), "assistant.sh", "exec sleep 60");
        let mut config = test_config(dir.path(), &script);
        config.limits.idle_timeout_secs = 1;
        config.limits.turn_timeout_secs = 2;
        let (orch, _sessions) = orchestrator(config);

        let mut stream = orch.start_turn(Turn::new("c_big", "x".repeat(300_000)));
        let events = tokio::time::timeout(Duration::from_secs(10), collect(&mut stream))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProtocolEvent::StreamError { message } => assert!(message.contains("timed out")),
            other => panic!("unexpected event: {:?}", other),
        }
        let outcome = stream.finish().await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_time_limit_holds_while_caller_is_not_draining() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!(
                "echo $$ > '{}'\nread line\ni=0\nwhile [ $i -lt 200 ]; do\n  echo '{}'\n  i=$((i+1))\ndone\nexec sleep 60",
                pid_file.display(),
                HELLO
            ),
        );
        let mut config = test_config(dir.path(), &script);
        config.limits.turn_timeout_secs = 1;
        let (orch, _sessions) = orchestrator(config);

        let mut stream = orch.start_turn(Turn::new("c_slow", "hi"));
        // Leave the event buffer full past the deadline
        tokio::time::sleep(Duration::from_secs(3)).await;

        let pid = fs::read_to_string(&pid_file).unwrap();
        let alive = std::process::Command::new("kill")
            .args(["-0", pid.trim()])
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive, "assistant still running after the time limit");

        let events = collect(&mut stream).await;
        match events.last() {
            Some(ProtocolEvent::StreamError { message }) => assert!(message.contains("time limit")),
            other => panic!("unexpected last event: {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        let outcome = stream.finish().await.unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            "read line\necho 'fatal: no credentials' >&2\nexit 3",
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let mut stream = orch.start_turn(Turn::new("c_6", "hi"));
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProtocolEvent::StreamError { message } => {
                assert!(message.contains("exit code 3"));
                assert!(message.contains("no credentials"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.exit.unwrap().code, Some(3));
    }

    #[tokio::test]
    async fn test_clean_exit_without_result_synthesizes_one() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\necho '{}'", HELLO),
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let mut stream = orch.start_turn(Turn::new("c_7", "hi"));
        let events = collect(&mut stream).await;
        assert_eq!(kinds(&events), vec!["assistant_text", "final_result"]);
        match &events[1] {
            ProtocolEvent::FinalResult { text, cost, .. } => {
                assert_eq!(text, "hello");
                assert_eq!(*cost, None);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(stream.finish().await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_missing_executable_reports_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-assistant");
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &missing));

        let mut stream = orch.start_turn(Turn::new("c_8", "hi"));
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProtocolEvent::StreamError { message } => {
                assert!(message.contains("Failed to spawn"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let outcome = stream.finish().await.unwrap();
        assert!(outcome.exit.is_none());
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_abandon_terminates_running_process() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\necho '{}'\nexec sleep 30", INIT),
        );
        let (orch, _sessions) = orchestrator(test_config(dir.path(), &script));

        let started = std::time::Instant::now();
        let mut stream = orch.start_turn(Turn::new("c_9", "hi"));
        let first = stream.next_event().await.unwrap();
        assert_eq!(first.kind(), "system_init");

        let outcome = stream.abandon().await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Abandoned);
        assert!(outcome.text.is_empty());
        assert_ne!(outcome.exit.unwrap().termination, Termination::Natural);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(orch.admission().in_use(), 0);
    }

    #[tokio::test]
    async fn test_turns_beyond_capacity_wait_their_turn() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\nsleep 1\necho '{}'", RESULT),
        );
        let mut config = test_config(dir.path(), &script);
        config.limits.max_concurrent = 1;
        let (orch, _sessions) = orchestrator(config);

        let first = orch.start_turn(Turn::new("c_10", "one"));
        let second = orch.start_turn(Turn::new("c_11", "two"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orch.admission().in_use(), 1);

        let (a, b) = tokio::join!(first.finish(), second.finish());
        assert!(a.unwrap().is_completed());
        assert!(b.unwrap().is_completed());
        assert_eq!(orch.admission().in_use(), 0);
    }
}

// =============================================================================
// Control Plane Tests
// =============================================================================

mod control {
    use super::*;

    #[tokio::test]
    async fn test_forward_without_live_process_is_dropped() {
        let plane = ControlPlane::new(PermissionWireFormat::ALL.to_vec());
        let message = ControlMessage::PermissionResponse {
            tool_use_id: "toolu_1".to_string(),
            allowed: true,
        };
        assert_eq!(plane.forward("c_missing", &message).await, ControlDelivery::NoLiveProcess);
        assert!(!plane.is_live("c_missing"));
    }

    #[tokio::test]
    async fn test_permission_response_reaches_running_process() {
        let dir = TempDir::new().unwrap();
        let frame_file = dir.path().join("frame.json");
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!(
                "read line\necho '{}'\nread frame\nprintf '%s\\n' \"$frame\" > '{}'\necho '{}'",
                INIT,
                frame_file.display(),
                RESULT
            ),
        );
        let mut config = test_config(dir.path(), &script);
        config.assistant.permission_formats = vec![PermissionWireFormat::Permission];
        let (orch, _sessions) = orchestrator(config);

        let mut stream = orch.start_turn(Turn::new("c_12", "hi"));
        let mut plane = ControlPlane::new(vec![PermissionWireFormat::Permission]);
        plane.attach("c_12", stream.process_slot());

        let first = stream.next_event().await.unwrap();
        assert_eq!(first.kind(), "system_init");
        assert!(plane.is_live("c_12"));

        let message = ControlMessage::PermissionResponse {
            tool_use_id: "toolu_1".to_string(),
            allowed: true,
        };
        assert_eq!(
            plane.forward("c_12", &message).await,
            ControlDelivery::Delivered { frames: 1 }
        );

        let rest = collect(&mut stream).await;
        assert_eq!(kinds(&rest), vec!["final_result"]);
        assert!(stream.finish().await.unwrap().is_completed());
        assert!(!plane.is_live("c_12"));

        let frame: serde_json::Value =
            serde_json::from_str(fs::read_to_string(&frame_file).unwrap().trim()).unwrap();
        assert_eq!(frame["type"], "permission");
        assert_eq!(frame["permission"]["tool_use_id"], "toolu_1");
        assert_eq!(frame["permission"]["allowed"], true);
    }
}

// =============================================================================
// CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_gateway_help() {
        gateway()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("ask"));
    }

    #[test]
    fn test_gateway_version() {
        gateway().arg("--version").assert().success();
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        gateway()
            .current_dir(dir.path())
            .env_remove("CLAUDE_CMD")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(defaults)"))
            .stdout(predicate::str::contains("[limits]"))
            .stdout(predicate::str::contains("max_concurrent = 3"));
    }

    #[test]
    fn test_config_validate_clean() {
        let dir = TempDir::new().unwrap();
        gateway()
            .current_dir(dir.path())
            .env_remove("MAX_CONCURRENT")
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_clamped_values() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("gateway.toml"),
            "[limits]\nmax_concurrent = 50\n",
        )
        .unwrap();

        gateway()
            .current_dir(dir.path())
            .env_remove("MAX_CONCURRENT")
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gateway.toml"))
            .stdout(predicate::str::contains("limits.max_concurrent"));
    }

    #[test]
    fn test_bad_config_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[limits\nmax_concurrent = ").unwrap();

        gateway()
            .current_dir(dir.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse"));
    }
}

mod cli_ask {
    use super::*;

    #[test]
    fn test_ask_prints_events_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            &format!("read line\necho '{}'\necho '{}'\necho '{}'", INIT, HELLO, RESULT),
        );

        gateway()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", &script)
            .args(["ask", "hi", "--conversation", "c_cli"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""kind":"system_init""#))
            .stdout(predicate::str::contains(r#""kind":"assistant_text""#))
            .stdout(predicate::str::contains(r#""kind":"final_result""#));
    }

    #[test]
    fn test_ask_fails_when_assistant_fails() {
        let dir = TempDir::new().unwrap();
        let script = fake_assistant(
            dir.path(),
            "assistant.sh",
            "read line\necho 'fatal: no credentials' >&2\nexit 3",
        );

        gateway()
            .current_dir(dir.path())
            .env("CLAUDE_CMD", &script)
            .args(["ask", "hi"])
            .assert()
            .failure()
            .stdout(predicate::str::contains(r#""kind":"stream_error""#))
            .stderr(predicate::str::contains("Turn failed"));
    }

    #[test]
    fn test_ask_rejects_empty_message() {
        let dir = TempDir::new().unwrap();
        gateway()
            .current_dir(dir.path())
            .args(["ask", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Empty message"));
    }
}
