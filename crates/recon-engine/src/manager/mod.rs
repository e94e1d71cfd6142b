//! The worker manager: one-shot runs, session runs, session lifecycle and
//! health reporting on top of a [`ContainerRuntime`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::demux::{DemuxedOutput, FrameDecoder};
use crate::error::EngineError;
use crate::registry::SessionRegistry;
use crate::runtime::{ByteStream, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::types::{SessionInfo, ToolExecutionRequest, ToolExecutionResult};

mod health;
mod oneshot;
mod session;
pub mod wrapper;

pub const ROLE_ONESHOT: &str = "oneshot";
pub const ROLE_SESSION: &str = "session";

const MAX_NAME_KEY_LEN: usize = 48;

pub struct WorkerManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: SessionRegistry,
    config: EngineConfig,
}

impl WorkerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: EngineConfig) -> Self {
        Self {
            runtime,
            registry: SessionRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// End every registered session. Returns how many were torn down.
    pub async fn shutdown(&self) -> usize {
        let keys = self.registry.keys();
        if keys.is_empty() {
            return 0;
        }
        info!(sessions = keys.len(), "shutting down worker sessions");
        let results = join_all(keys.iter().map(|key| self.end_session(key))).await;
        let mut ended = 0;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(true) => ended += 1,
                Ok(false) => {}
                Err(err) => {
                    ended += 1;
                    warn!(session = %key, "session cleanup incomplete during shutdown: {err}");
                }
            }
        }
        ended
    }

    /// Request timeout, then the tool table, then the global default.
    pub fn timeout_for(&self, request: &ToolExecutionRequest) -> Duration {
        request
            .timeout
            .unwrap_or_else(|| self.config.timeout_for_tool(&request.tool))
    }

    fn labels(
        &self,
        role: &str,
        key: &str,
        request: Option<&ToolExecutionRequest>,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(self.config.managed_label(), "true".to_owned());
        labels.insert(self.config.label("role"), role.to_owned());
        labels.insert(self.config.label("session"), key.to_owned());
        if let Some(request) = request {
            if !request.stage.is_empty() {
                labels.insert(self.config.label("stage"), request.stage.clone());
            }
            if !request.tool.is_empty() {
                labels.insert(self.config.label("tool"), request.tool.clone());
            }
        }
        labels
    }

    fn container_spec(&self, name: String, cmd: Vec<String>, labels: BTreeMap<String, String>) -> ContainerSpec {
        ContainerSpec {
            name,
            image: self.config.image.clone(),
            cmd,
            labels,
            env: Vec::new(),
            cap_add: self.config.cap_add.clone(),
            network_mode: self.config.network_mode.clone(),
            init: true,
        }
    }

    pub(crate) fn session_container_name(&self, key: &str) -> String {
        format!(
            "{}-{}-{}",
            self.config.container_prefix,
            ROLE_SESSION,
            container_name_fragment(key)
        )
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.try_create_container(spec)
            .await
            .map_err(|err| EngineError::from_runtime("create_container", err))
    }

    /// Create a container, pulling the image first when allowed and missing.
    async fn try_create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        match self.runtime.create_container(spec).await {
            Err(RuntimeError::ImageNotFound(image)) if self.config.pull_missing_image => {
                info!(%image, "worker image missing; pulling");
                self.runtime.pull_image(&image).await?;
                self.runtime.create_container(spec).await
            }
            other => other,
        }
    }

    /// Remove a container, logging instead of failing.
    async fn discard_container(&self, id: &str) {
        if let Err(err) = self.runtime.remove_container(id).await {
            warn!(container = %id, "failed to remove container: {err}");
        }
    }

    /// Run a caller-supplied parser over stdout. Failures and panics leave `parsed` unset.
    fn apply_parser(&self, request: &ToolExecutionRequest, result: &mut ToolExecutionResult) {
        let Some(parser) = request.result_parser.as_ref() else {
            return;
        };
        if result.stdout.is_empty() && !parser.accepts_empty() {
            debug!(tool = %request.tool, "skipping result parser on empty output");
            return;
        }
        match std::panic::catch_unwind(AssertUnwindSafe(|| parser.parse(&result.stdout))) {
            Ok(Ok(value)) => result.parsed = Some(value),
            Ok(Err(err)) => {
                warn!(stage = %request.stage, tool = %request.tool, "result parser failed: {err:#}");
            }
            Err(_) => {
                warn!(stage = %request.stage, tool = %request.tool, "result parser panicked");
            }
        }
    }
}

/// Feed a runtime output stream into `decoder` until it ends.
async fn drain_into(mut stream: ByteStream, decoder: &mut FrameDecoder) -> Result<(), RuntimeError> {
    while let Some(chunk) = stream.next().await {
        decoder.push(&chunk?);
    }
    Ok(())
}

fn finish_result(
    output: DemuxedOutput,
    exit_code: Option<i64>,
    timed_out: bool,
    duration: Duration,
) -> ToolExecutionResult {
    let mut result = if timed_out {
        ToolExecutionResult::timed_out(output.stdout, output.stderr, duration)
    } else {
        ToolExecutionResult::completed(output.stdout, output.stderr, exit_code, duration)
    };
    result.stdout_truncated = output.stdout_truncated;
    result.stderr_truncated = output.stderr_truncated;
    result
}

/// Turn an arbitrary key into a string the runtime accepts as part of a
/// container name. Keys that had to be rewritten get a hash suffix so two
/// different keys never map to the same name.
pub(crate) fn container_name_fragment(key: &str) -> String {
    let mut fragment: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '-'
            }
        })
        .take(MAX_NAME_KEY_LEN)
        .collect();
    if fragment.is_empty() {
        fragment.push('x');
    }
    if fragment != key {
        fragment.push_str(&format!("-{:08x}", fnv1a(key.as_bytes())));
    }
    fragment
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
