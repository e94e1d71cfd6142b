use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ROLE_SESSION, WorkerManager, drain_into, finish_result, wrapper};
use crate::demux::FrameDecoder;
use crate::error::EngineError;
use crate::registry::SessionSlot;
use crate::runtime::{ExecSpec, RuntimeError};
use crate::types::{SessionInfo, SessionStatus, ToolExecutionRequest, ToolExecutionResult};

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl WorkerManager {
    /// Start the session for `key`, or return it if it is already running.
    pub async fn start_session(&self, key: &str) -> Result<SessionInfo, EngineError> {
        match self.ensure_session(key, None).await? {
            Some((slot, _)) => Ok(slot.info()),
            None => Err(EngineError::SessionCreateFailed {
                key: key.to_owned(),
                message: "session start was cut short".into(),
            }),
        }
    }

    /// Stop and remove the session container. Returns `false` when no session
    /// was registered under `key`.
    pub async fn end_session(&self, key: &str) -> Result<bool, EngineError> {
        let Some(slot) = self.registry.slot(key) else {
            return Ok(false);
        };
        let mut state = slot.lock_lifecycle().await;
        if !state.status.is_live() {
            self.registry.remove_slot(&slot);
            return Ok(false);
        }

        let container = state.container_id.clone();
        slot.transition(&mut state, SessionStatus::Stopping, container.clone());
        let mut removed = Ok(());
        if let Some(id) = &container {
            if let Err(err) = self.runtime.stop_container(id, self.config.stop_grace).await {
                debug!(session = %key, container = %id, "graceful stop failed: {err}");
            }
            removed = self.runtime.remove_container(id).await;
        }
        slot.transition(&mut state, SessionStatus::Stopped, None);
        self.registry.remove_slot(&slot);
        drop(state);

        removed.map_err(|err| EngineError::from_runtime("remove_container", err))?;
        info!(session = %key, "session ended");
        Ok(true)
    }

    /// Force-kill and remove everything running on behalf of `key`: the
    /// registered session container and any other managed container labelled
    /// with the key (one-shot runs, sessions left behind by another process).
    /// Returns the number of containers killed.
    pub async fn kill_container(&self, key: &str) -> Result<usize, EngineError> {
        let mut killed: Vec<String> = Vec::new();
        let mut failure = None;

        if let Some(slot) = self.registry.slot(key) {
            // kill first, then wait for the lifecycle lock; a session start may hold it
            if let Some(id) = slot.info().container_id {
                match self.force_remove(&id).await {
                    Ok(()) => killed.push(id),
                    Err(err) => failure = Some(err),
                }
            }
            let mut state = slot.lock_lifecycle().await;
            if let Some(id) = state.container_id.clone().filter(|id| !killed.contains(id)) {
                match self.force_remove(&id).await {
                    Ok(()) => killed.push(id),
                    Err(err) => failure = failure.or(Some(err)),
                }
            }
            slot.transition(&mut state, SessionStatus::Stopped, None);
            self.registry.remove_slot(&slot);
        }

        let filter = [
            (self.config.managed_label(), "true".to_owned()),
            (self.config.label("session"), key.to_owned()),
        ];
        match self.runtime.list_containers(&filter).await {
            Ok(containers) => {
                for container in containers {
                    if killed.contains(&container.id) {
                        continue;
                    }
                    match self.force_remove(&container.id).await {
                        Ok(()) => killed.push(container.id),
                        Err(err) => failure = failure.or(Some(err)),
                    }
                }
            }
            Err(err) => failure = failure.or(Some(err)),
        }

        info!(session = %key, killed = killed.len(), "killed session containers");
        match failure {
            Some(err) => Err(EngineError::from_runtime("kill_container", err)),
            None => Ok(killed.len()),
        }
    }

    /// Run `request.command` inside the session named by `request.session_key`,
    /// starting the session first if needed. A timeout kills only the command;
    /// the session stays up.
    ///
    /// The request's timeout covers starting the session as well. Time spent
    /// queued behind another command on the same key does not count.
    pub async fn run_tool_in_session(
        &self,
        request: &ToolExecutionRequest,
    ) -> Result<ToolExecutionResult, EngineError> {
        let key = request.session_key.as_str();
        let started = Instant::now();
        let mut deadline = started + self.timeout_for(request);
        let mut recreated = false;
        loop {
            let Some((slot, container)) = self.ensure_session(key, Some(deadline)).await? else {
                info!(
                    session = %key,
                    stage = %request.stage,
                    tool = %request.tool,
                    "session tool timed out while the session was starting"
                );
                return Ok(ToolExecutionResult::timed_out(
                    String::new(),
                    String::new(),
                    started.elapsed(),
                ));
            };
            let queued = Instant::now();
            let _turn = slot.lock_exec().await;
            deadline += queued.elapsed();

            // the session may have been ended or killed while we waited
            let info = slot.info();
            if info.status != SessionStatus::Ready || info.container_id.as_deref() != Some(container.as_str()) {
                continue;
            }

            match self.exec_in_session(&container, request, started, deadline).await {
                Ok(mut result) => {
                    slot.touch();
                    self.apply_parser(request, &mut result);
                    info!(
                        session = %key,
                        stage = %request.stage,
                        tool = %request.tool,
                        exit_code = ?result.exit_code,
                        timed_out = result.timed_out,
                        duration_ms = result.duration_ms(),
                        "session tool finished"
                    );
                    return Ok(result);
                }
                Err(err) if err.is_container_gone() && !recreated => {
                    warn!(session = %key, container = %container, "session container is gone: {err}; recreating");
                    recreated = true;
                    self.evict_session(&slot, &container).await;
                }
                Err(err) => return Err(EngineError::from_runtime("exec", err)),
            }
        }
    }

    /// Returns a Ready slot and its container id, creating the container
    /// under the key's lifecycle lock when needed.
    ///
    /// Creation is bounded by `session_start_timeout` and, when given, by
    /// `deadline`. `Ok(None)` means `deadline` passed first.
    async fn ensure_session(
        &self,
        key: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<(Arc<SessionSlot>, String)>, EngineError> {
        let container_name = self.session_container_name(key);
        loop {
            let slot = self.registry.get_or_insert(key, &container_name);
            let mut state = slot.lock_lifecycle().await;
            match (state.status, state.container_id.clone()) {
                (SessionStatus::Ready, Some(id)) => return Ok(Some((slot.clone(), id))),
                (SessionStatus::Stopping | SessionStatus::Stopped, _) => {
                    // retired while we waited; start over with a fresh slot
                    self.registry.remove_slot(&slot);
                    continue;
                }
                _ => {}
            }

            let start_limit = self.config.session_start_timeout;
            let budget = deadline.map_or(start_limit, |deadline| {
                start_limit.min(deadline.saturating_duration_since(Instant::now()))
            });

            info!(session = %key, container = %container_name, "starting session");
            let created = match timeout(budget, self.create_session_container(&slot)).await {
                Ok(created) => created,
                Err(_) => {
                    // the create call may have gone through under the session name
                    self.discard_container(slot.container_name()).await;
                    if budget < start_limit {
                        slot.transition(&mut state, SessionStatus::Stopped, None);
                        self.registry.remove_slot(&slot);
                        warn!(session = %key, "request timed out before the session started");
                        return Ok(None);
                    }
                    Err(EngineError::SessionCreateFailed {
                        key: key.to_owned(),
                        message: format!(
                            "session did not start within {:?}",
                            self.config.session_start_timeout
                        ),
                    })
                }
            };

            return match created {
                Ok(id) => {
                    slot.transition(&mut state, SessionStatus::Ready, Some(id.clone()));
                    info!(session = %key, container = %id, "session ready");
                    Ok(Some((slot.clone(), id)))
                }
                Err(err) => {
                    slot.transition(&mut state, SessionStatus::Stopped, None);
                    self.registry.remove_slot(&slot);
                    warn!(session = %key, "session start failed: {err}");
                    Err(EngineError::session_create(key, err))
                }
            };
        }
    }

    async fn create_session_container(&self, slot: &SessionSlot) -> Result<String, EngineError> {
        let spec = self.container_spec(
            slot.container_name().to_owned(),
            self.config.keepalive_command.clone(),
            self.labels(ROLE_SESSION, slot.key(), None),
        );
        let id = match self.try_create_container(&spec).await {
            Err(RuntimeError::Conflict(name)) => {
                warn!(session = %slot.key(), container = %name, "replacing stale session container");
                self.runtime
                    .remove_container(&name)
                    .await
                    .map_err(|err| EngineError::from_runtime("remove_container", err))?;
                self.try_create_container(&spec).await
            }
            other => other,
        }
        .map_err(|err| EngineError::from_runtime("create_container", err))?;

        if let Err(err) = self.runtime.start_container(&id).await {
            self.discard_container(&id).await;
            return Err(EngineError::from_runtime("start_container", err));
        }
        Ok(id)
    }

    /// One exec against a running session container. Timeouts come back as
    /// results; runtime failures as errors.
    async fn exec_in_session(
        &self,
        container: &str,
        request: &ToolExecutionRequest,
        started: Instant,
        deadline: Instant,
    ) -> Result<ToolExecutionResult, RuntimeError> {
        let pidfile = wrapper::pidfile_path(
            &self.config.container_prefix,
            &Uuid::new_v4().simple().to_string(),
        );
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        let spec = ExecSpec {
            cmd: wrapper::wrap_command(
                &pidfile,
                &wrapper::session_state_path(&self.config.container_prefix),
                &request.command,
                request.working_dir.as_deref(),
                &env,
            ),
            env,
            working_dir: request.working_dir.clone(),
        };

        debug!(
            session = %request.session_key,
            stage = %request.stage,
            tool = %request.tool,
            container = %container,
            "exec in session"
        );

        let mut decoder = FrameDecoder::with_limit(self.config.max_output_bytes);
        let run = async {
            let exec_id = self.runtime.create_exec(container, &spec).await?;
            let output = self.runtime.start_exec(&exec_id).await?;
            drain_into(output, &mut decoder).await?;
            Ok::<_, RuntimeError>(exec_id)
        };
        let outcome = timeout_at(deadline, run).await;

        match outcome {
            Ok(Ok(exec_id)) => {
                let exit_code = self.exec_exit_code(&exec_id).await?;
                Ok(finish_result(decoder.finish(), exit_code, false, started.elapsed()))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(
                    session = %request.session_key,
                    stage = %request.stage,
                    tool = %request.tool,
                    "session command timed out after {:?}; killing it",
                    started.elapsed()
                );
                match timeout(self.config.collect_grace, self.kill_exec(container, &pidfile)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(container = %container, "kill exec failed: {err}"),
                    Err(_) => warn!(container = %container, "kill exec did not finish in time"),
                }
                Ok(finish_result(decoder.finish(), None, true, started.elapsed()))
            }
        }
    }

    /// The output stream can end a moment before the runtime records the exit
    /// status, so poll briefly.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let give_up = Instant::now() + self.config.collect_grace;
        loop {
            let state = match self.runtime.inspect_exec(exec_id).await {
                Ok(state) => state,
                // container killed and removed underneath the command
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            };
            if !state.running {
                return Ok(state.exit_code);
            }
            if Instant::now() >= give_up {
                warn!(exec = %exec_id, "exec still reported running after its output closed");
                return Ok(None);
            }
            sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    async fn kill_exec(&self, container: &str, pidfile: &str) -> Result<(), RuntimeError> {
        let spec = ExecSpec {
            cmd: wrapper::kill_command(pidfile),
            ..ExecSpec::default()
        };
        let exec_id = self.runtime.create_exec(container, &spec).await?;
        let output = self.runtime.start_exec(&exec_id).await?;
        drain_into(output, &mut FrameDecoder::new()).await
    }

    /// Drop a session whose container disappeared underneath it.
    async fn evict_session(&self, slot: &Arc<SessionSlot>, container: &str) {
        let mut state = slot.lock_lifecycle().await;
        if state.container_id.as_deref() == Some(container) {
            slot.transition(&mut state, SessionStatus::Stopped, None);
            self.registry.remove_slot(slot);
        }
        drop(state);
        self.discard_container(container).await;
    }

    async fn force_remove(&self, id: &str) -> Result<(), RuntimeError> {
        if let Err(err) = self.runtime.kill_container(id).await {
            debug!(container = %id, "kill before removal failed: {err}");
        }
        self.runtime.remove_container(id).await
    }
}
