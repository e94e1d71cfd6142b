#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use recon_engine::fixtures::MockRuntime;
use recon_engine::{EngineConfig, WorkerManager};

/// Defaults with grace periods short enough for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        collect_grace: Duration::from_millis(500),
        stop_grace: Duration::from_millis(10),
        session_start_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

pub fn manager(runtime: &Arc<MockRuntime>) -> WorkerManager {
    WorkerManager::new(runtime.clone(), test_config())
}

pub fn manager_with(runtime: &Arc<MockRuntime>, config: EngineConfig) -> WorkerManager {
    WorkerManager::new(runtime.clone(), config)
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
