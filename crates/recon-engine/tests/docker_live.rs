//! Runs against a real Docker daemon and the worker image.
//!
//! `cargo test -p recon-engine --features docker-tests --test docker_live`
//! with `RECON_WORKER_IMAGE` pointing at an image that has `/bin/sh`.

use std::sync::Arc;

use recon_engine::{DockerRuntime, EngineConfig, ToolExecutionRequest, WorkerManager};

async fn live_manager(test: &str) -> Option<WorkerManager> {
    let config = EngineConfig {
        container_prefix: "recon-test".into(),
        ..EngineConfig::from_env().expect("invalid RECON_* environment")
    };
    let runtime = Arc::new(DockerRuntime::new(&config.docker_socket));
    let manager = WorkerManager::new(runtime, config);
    let health = manager.health_check().await;
    if !health.docker_available || !health.image_exists {
        eprintln!("skipping {test}: docker or worker image not available ({health:?})");
        return None;
    }
    Some(manager)
}

/// Shell command printing how many live processes have a command line starting with `prefix`.
fn running_count(prefix: &str) -> String {
    format!(
        "for p in /proc/[0-9]*; do tr '\\0' ' ' < \"$p/cmdline\" 2>/dev/null; echo; done \
         | grep -c '^{prefix}' || true"
    )
}

#[tokio::test]
async fn oneshot_separates_stdout_and_stderr() {
    let Some(manager) = live_manager("oneshot_separates_stdout_and_stderr").await else {
        return;
    };
    let result = manager
        .run_tool(&ToolExecutionRequest::new(
            "echo out; echo err >&2; exit 3",
            "live-oneshot",
        ))
        .await
        .unwrap();
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.success);
}

#[tokio::test]
async fn session_keeps_shell_state_on_disk_and_survives_timeouts() {
    let Some(manager) = live_manager("session_keeps_shell_state_on_disk_and_survives_timeouts").await
    else {
        return;
    };
    let key = "live-session";

    manager
        .run_tool_in_session(&ToolExecutionRequest::new("echo 1 > /tmp/counter", key))
        .await
        .unwrap();
    let slow = manager
        .run_tool_in_session(&ToolExecutionRequest::new("sleep 60", key).timeout_ms(500))
        .await
        .unwrap();
    assert!(slow.timed_out);

    let read = manager
        .run_tool_in_session(&ToolExecutionRequest::new("cat /tmp/counter", key))
        .await
        .unwrap();
    assert_eq!(read.stdout.trim(), "1");

    // the killed sleep must not linger in the session
    let left = manager
        .run_tool_in_session(&ToolExecutionRequest::new(running_count("sleep 60"), key))
        .await
        .unwrap();
    assert_eq!(left.stdout.trim(), "0");

    assert!(manager.end_session(key).await.unwrap());
}

#[tokio::test]
async fn session_carries_directory_and_exports_between_commands() {
    let Some(manager) = live_manager("session_carries_directory_and_exports_between_commands").await
    else {
        return;
    };
    let key = "live-shell-state";

    manager
        .run_tool_in_session(&ToolExecutionRequest::new(
            "mkdir -p /tmp/recon-work && cd /tmp/recon-work && export SCAN_TARGET=example.com",
            key,
        ))
        .await
        .unwrap();
    let read = manager
        .run_tool_in_session(&ToolExecutionRequest::new("pwd; echo \"$SCAN_TARGET\"", key))
        .await
        .unwrap();
    assert_eq!(read.stdout, "/tmp/recon-work\nexample.com\n");

    assert!(manager.end_session(key).await.unwrap());
}

#[tokio::test]
async fn session_timeout_kills_background_grandchildren() {
    let Some(manager) = live_manager("session_timeout_kills_background_grandchildren").await else {
        return;
    };
    let key = "live-process-group";
    manager.start_session(key).await.unwrap();

    let slow = manager
        .run_tool_in_session(
            &ToolExecutionRequest::new("sh -c 'sleep 61 & wait'", key).timeout_ms(500),
        )
        .await
        .unwrap();
    assert!(slow.timed_out);

    let left = manager
        .run_tool_in_session(&ToolExecutionRequest::new(running_count("sleep 61"), key))
        .await
        .unwrap();
    assert_eq!(left.stdout.trim(), "0");

    assert!(manager.end_session(key).await.unwrap());
}
