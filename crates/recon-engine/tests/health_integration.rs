#[path = "helpers.rs"]
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::manager;
use recon_engine::fixtures::MockRuntime;
use recon_engine::{ContainerRuntime, HealthStatus, ToolExecutionRequest};

#[tokio::test]
async fn healthy_runtime_reports_everything() {
    let runtime = Arc::new(MockRuntime::new());
    let manager = manager(&runtime);
    manager.start_session("scan-1").await.unwrap();
    manager.start_session("terminal").await.unwrap();

    let health = manager.health_check().await;
    assert!(health.docker_available);
    assert!(health.image_exists);
    assert_eq!(health.active_containers, 2);
    assert_eq!(health.active_sessions, 2);
    assert_eq!(health.version.as_deref(), Some("24.0.7-mock"));
}

#[tokio::test]
async fn unreachable_runtime_degrades_without_failing() {
    let runtime = Arc::new(MockRuntime::unreachable());
    let manager = manager(&runtime);

    let health = manager.health_check().await;
    assert_eq!(
        health,
        HealthStatus {
            docker_available: false,
            image_exists: false,
            active_containers: 0,
            active_sessions: 0,
            version: None,
        }
    );
}

#[tokio::test]
async fn missing_image_only_affects_its_field() {
    let runtime = Arc::new(MockRuntime::without_image());
    let manager = manager(&runtime);

    let health = manager.health_check().await;
    assert!(health.docker_available);
    assert!(!health.image_exists);
    assert_eq!(health.active_containers, 0);
}

#[tokio::test]
async fn orphans_are_counted_and_sessions_survive_an_outage() {
    let runtime = Arc::new(MockRuntime::new());
    let orphaned = manager(&runtime);
    orphaned.start_session("old-scan").await.unwrap();

    let manager = manager(&runtime);
    manager
        .run_tool_in_session(&ToolExecutionRequest::new("id", "scan-1"))
        .await
        .unwrap();

    let health = manager.health_check().await;
    assert_eq!(health.active_containers, 2);
    assert_eq!(health.active_sessions, 1);

    runtime.set_reachable(false);
    let health = manager.health_check().await;
    assert!(!health.docker_available);
    assert_eq!(health.active_containers, 0);
    assert_eq!(health.active_sessions, 1);
}

#[tokio::test]
async fn exited_managed_containers_are_counted() {
    let runtime = Arc::new(MockRuntime::new());
    let info = manager(&runtime).start_session("old-scan").await.unwrap();
    let id = info.container_id.unwrap();
    runtime.stop_container(&id, Duration::ZERO).await.unwrap();

    let health = manager(&runtime).health_check().await;
    assert_eq!(health.active_containers, 1);
    assert_eq!(health.active_sessions, 0);
}

#[tokio::test]
async fn health_serializes_camel_case() {
    let runtime = Arc::new(MockRuntime::new());
    let value = serde_json::to_value(manager(&runtime).health_check().await).unwrap();
    assert_eq!(value["dockerAvailable"], true);
    assert_eq!(value["imageExists"], true);
    assert_eq!(value["activeContainers"], 0);
    assert_eq!(value["activeSessions"], 0);
}
