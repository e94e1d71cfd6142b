use std::sync::Arc;

use tokio::time::{Instant, timeout, timeout_at};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ROLE_ONESHOT, WorkerManager, container_name_fragment, drain_into, finish_result};
use crate::demux::FrameDecoder;
use crate::error::EngineError;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{ToolExecutionRequest, ToolExecutionResult};

/// Owns a disposable container until it is released. Dropping an unreleased
/// guard (the caller's future was cancelled) schedules the removal instead.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    async fn release(mut self) -> Result<(), RuntimeError> {
        match self.id.take() {
            Some(id) => self.runtime.remove_container(&id).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                handle.spawn(async move {
                    if let Err(err) = runtime.remove_container(&id).await {
                        warn!(container = %id, "failed to remove abandoned container: {err}");
                    }
                });
            }
            Err(_) => warn!(container = %id, "no async runtime to remove abandoned container"),
        }
    }
}

impl WorkerManager {
    /// Run `request.command` in a fresh container that is removed afterwards
    /// on every path.
    pub async fn run_tool(
        &self,
        request: &ToolExecutionRequest,
    ) -> Result<ToolExecutionResult, EngineError> {
        let limit = self.timeout_for(request);
        let started = Instant::now();
        let deadline = started + limit;

        let name = format!(
            "{}-run-{}-{}",
            self.config.container_prefix,
            container_name_fragment(&request.session_key),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let spec = self.container_spec(
            name,
            vec!["/bin/sh".into(), "-c".into(), request.command.clone()],
            self.labels(ROLE_ONESHOT, &request.session_key, Some(request)),
        );

        info!(
            session = %request.session_key,
            stage = %request.stage,
            tool = %request.tool,
            container = %spec.name,
            "running one-shot tool"
        );

        let id = match timeout_at(deadline, self.create_container(&spec)).await {
            Ok(created) => created?,
            Err(_) => {
                // the create call may still have gone through under this name
                self.discard_container(&spec.name).await;
                return Err(EngineError::Substrate {
                    operation: "create_container",
                    message: format!("timed out after {limit:?}"),
                });
            }
        };

        let guard = ContainerGuard::new(self.runtime.clone(), id.clone());
        let outcome = self.drive_oneshot(&id, request, started, deadline).await;
        if let Err(err) = guard.release().await {
            warn!(container = %id, "failed to remove one-shot container: {err}");
        }

        let mut result = outcome?;
        self.apply_parser(request, &mut result);
        info!(
            session = %request.session_key,
            stage = %request.stage,
            tool = %request.tool,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms(),
            "one-shot tool finished"
        );
        Ok(result)
    }

    async fn drive_oneshot(
        &self,
        id: &str,
        request: &ToolExecutionRequest,
        started: Instant,
        deadline: Instant,
    ) -> Result<ToolExecutionResult, EngineError> {
        let run = async {
            self.runtime
                .start_container(id)
                .await
                .map_err(|err| EngineError::from_runtime("start_container", err))?;
            self.runtime
                .wait_container(id)
                .await
                .map_err(|err| EngineError::from_runtime("wait_container", err))
        };

        let mut decoder = FrameDecoder::with_limit(self.config.max_output_bytes);
        match timeout_at(deadline, run).await {
            Ok(exit) => {
                let exit_code = exit?;
                // logs of an exited container are finite; allow a short grace past the deadline
                let logs_deadline = deadline.max(Instant::now() + self.config.collect_grace);
                let collected = timeout_at(logs_deadline, async {
                    let stream = self.runtime.container_logs(id).await?;
                    drain_into(stream, &mut decoder).await
                })
                .await;
                match collected {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.is_not_found() => {
                        warn!(container = %id, "container removed before its output was collected")
                    }
                    Ok(Err(err)) => return Err(EngineError::from_runtime("container_logs", err)),
                    Err(_) => warn!(container = %id, tool = %request.tool, "log collection cut short"),
                }
                Ok(finish_result(
                    decoder.finish(),
                    Some(exit_code),
                    false,
                    started.elapsed(),
                ))
            }
            Err(_) => {
                warn!(
                    container = %id,
                    stage = %request.stage,
                    tool = %request.tool,
                    "one-shot tool timed out; killing container"
                );
                if let Err(err) = self.runtime.kill_container(id).await {
                    warn!(container = %id, "forced kill failed: {err}");
                }
                let partial = timeout(self.config.collect_grace, async {
                    let stream = self.runtime.container_logs(id).await?;
                    drain_into(stream, &mut decoder).await
                })
                .await;
                if !matches!(partial, Ok(Ok(()))) {
                    warn!(container = %id, "could not collect output of timed out container");
                }
                Ok(finish_result(decoder.finish(), None, true, started.elapsed()))
            }
        }
    }
}
