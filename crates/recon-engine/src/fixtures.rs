//! In-memory container runtime for tests. Enable with the `test-fixtures` feature.
//!
//! [`MockRuntime`] keeps containers and exec instances in a map and answers
//! commands from a table of [`Script`]s matched by substring. Output is
//! produced in the runtime's framed wire format and delivered in small chunks,
//! so the engine's decoder sees frames split across reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::sync::watch;

use crate::demux::{StreamKind, encode_frame};
use crate::manager::wrapper::{WrappedExec, unwrap_command};
use crate::runtime::{
    ByteStream, ContainerRuntime, ContainerSpec, ContainerSummary, ExecSpec, ExecState,
    RuntimeError,
};

/// Exit status reported for anything killed by a signal.
pub const KILLED_EXIT_CODE: i64 = 137;

const CHUNK_LEN: usize = 5;

/// Canned behaviour for a command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub delay: Duration,
}

impl Script {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_ms(self, ms: u64) -> Self {
        self.delay(Duration::from_millis(ms))
    }

    fn frames(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.stdout.is_empty() {
            out.extend(encode_frame(StreamKind::Stdout, self.stdout.as_bytes()));
        }
        if !self.stderr.is_empty() {
            out.extend(encode_frame(StreamKind::Stderr, self.stderr.as_bytes()));
        }
        out
    }
}

/// Counters of calls that reached the mock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub containers_created: usize,
    pub containers_started: usize,
    pub containers_stopped: usize,
    /// Kill calls against containers that existed.
    pub containers_killed: usize,
    /// Removals of containers that existed.
    pub containers_removed: usize,
    pub images_pulled: usize,
    pub execs_started: usize,
    pub kill_execs: usize,
    pub max_parallel_execs: usize,
    pub max_parallel_execs_per_container: usize,
}

/// One command exec'd into a container, as the engine requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container: String,
    pub command: String,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

struct MockContainer {
    name: String,
    labels: BTreeMap<String, String>,
    cmd: Vec<String>,
    started: bool,
    exit: Arc<watch::Sender<Option<i64>>>,
    output: Arc<Mutex<Vec<u8>>>,
    active_execs: usize,
}

impl MockContainer {
    fn is_running(&self) -> bool {
        self.started && self.exit.borrow().is_none()
    }

    fn state(&self) -> &'static str {
        match (self.started, self.exit.borrow().is_some()) {
            (_, true) => "exited",
            (true, false) => "running",
            (false, false) => "created",
        }
    }

    fn is_oneshot(&self) -> bool {
        self.labels
            .iter()
            .any(|(key, value)| key.ends_with(".role") && value == "oneshot")
    }
}

enum ExecKind {
    Command { pidfile: String, command: String },
    Kill { pidfile: String },
}

struct MockExec {
    container: String,
    kind: ExecKind,
    started: bool,
    exit: Arc<watch::Sender<Option<i64>>>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    containers: HashMap<String, MockContainer>,
    execs: HashMap<String, MockExec>,
    exec_log: Vec<ExecRecord>,
    active_execs: usize,
    stats: MockStats,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:06}", self.next_id)
    }

    /// The runtime accepts either a container id or its name.
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_owned());
        }
        self.containers
            .iter()
            .find(|(_, container)| container.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn terminate_execs(&self, container: &str) {
        for exec in self.execs.values().filter(|exec| exec.container == container) {
            set_exit(&exec.exit, KILLED_EXIT_CODE);
        }
    }
}

pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    scripts: Mutex<Vec<(String, Script)>>,
    reachable: AtomicBool,
    image_present: AtomicBool,
    fail_starts: AtomicBool,
    create_delay: Mutex<Duration>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            scripts: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            image_present: AtomicBool::new(true),
            fail_starts: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// A runtime whose every call fails as if the daemon socket were closed.
    pub fn unreachable() -> Self {
        let runtime = Self::new();
        runtime.set_reachable(false);
        runtime
    }

    pub fn without_image() -> Self {
        let runtime = Self::new();
        runtime.image_present.store(false, Ordering::SeqCst);
        runtime
    }

    /// Commands containing `pattern` behave as `script`. First match wins.
    pub fn script(self, pattern: impl Into<String>, script: Script) -> Self {
        self.add_script(pattern, script);
        self
    }

    pub fn add_script(&self, pattern: impl Into<String>, script: Script) {
        lock(&self.scripts).push((pattern.into(), script));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    pub fn stats(&self) -> MockStats {
        lock(&self.state).stats
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        lock(&self.state).exec_log.clone()
    }

    /// Names of containers that still exist, sorted.
    pub fn container_names(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut names: Vec<String> = state
            .containers
            .values()
            .map(|container| container.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container_exists(&self, id_or_name: &str) -> bool {
        lock(&self.state).resolve(id_or_name).is_some()
    }

    /// Drop a container behind the engine's back, as an operator running
    /// `docker rm -f` would. Not counted as a removal.
    pub fn vanish(&self, id_or_name: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(id) = state.resolve(id_or_name) else {
            return false;
        };
        state.terminate_execs(&id);
        if let Some(container) = state.containers.remove(&id) {
            set_exit(&container.exit, KILLED_EXIT_CODE);
        }
        true
    }

    fn check(&self) -> Result<(), RuntimeError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(
                "connect to mock socket: connection refused".into(),
            ))
        }
    }

    fn script_for(&self, command: &str) -> Script {
        lock(&self.scripts)
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_default()
    }

    fn container_not_found(id: &str) -> RuntimeError {
        RuntimeError::NotFound(format!("No such container: {id}"))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check()
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        self.check()?;
        Ok("24.0.7-mock".into())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        self.check()?;
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.check()?;
        lock(&self.state).stats.images_pulled += 1;
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check()?;
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.image_present.load(Ordering::SeqCst) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }

        let mut state = lock(&self.state);
        if state.resolve(&spec.name).is_some() {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        let id = state.next_id("ctr");
        let (exit, _) = watch::channel(None);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                cmd: spec.cmd.clone(),
                started: false,
                exit: Arc::new(exit),
                output: Arc::new(Mutex::new(Vec::new())),
                active_execs: 0,
            },
        );
        state.stats.containers_created += 1;
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check()?;
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock start failure".into(),
            });
        }

        let (exit, output, command) = {
            let mut state = lock(&self.state);
            let key = state.resolve(id).ok_or_else(|| Self::container_not_found(id))?;
            let container = state
                .containers
                .get_mut(&key)
                .ok_or_else(|| Self::container_not_found(id))?;
            if container.started {
                return Ok(());
            }
            container.started = true;
            let command = match container.cmd.as_slice() {
                [_, _, command] if container.is_oneshot() => Some(command.clone()),
                _ => None,
            };
            let handles = (container.exit.clone(), container.output.clone(), command);
            state.stats.containers_started += 1;
            handles
        };

        // keep-alive containers run until stopped or killed
        let Some(command) = command else {
            return Ok(());
        };
        let script = self.script_for(&command);
        tokio::spawn(async move {
            let mut exited = exit.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(script.delay) => {
                    lock(&output).extend(script.frames());
                    set_exit(&exit, script.exit_code);
                }
                _ = exited.wait_for(Option::is_some) => {}
            }
        });
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        self.check()?;
        let exit = {
            let state = lock(&self.state);
            let key = state.resolve(id).ok_or_else(|| Self::container_not_found(id))?;
            state.containers[&key].exit.clone()
        };
        let mut exited = exit.subscribe();
        let code = *exited
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::Transport("wait interrupted".into()))?;
        Ok(code.unwrap_or(KILLED_EXIT_CODE))
    }

    async fn container_logs(&self, id: &str) -> Result<ByteStream, RuntimeError> {
        self.check()?;
        let bytes = {
            let state = lock(&self.state);
            let key = state.resolve(id).ok_or_else(|| Self::container_not_found(id))?;
            lock(&state.containers[&key].output).clone()
        };
        Ok(Box::pin(stream::iter(chunked(bytes))))
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.check()?;
        let mut state = lock(&self.state);
        let Some(key) = state.resolve(id) else {
            return Ok(());
        };
        state.terminate_execs(&key);
        set_exit(&state.containers[&key].exit, 0);
        state.stats.containers_stopped += 1;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check()?;
        let mut state = lock(&self.state);
        let Some(key) = state.resolve(id) else {
            return Ok(());
        };
        state.terminate_execs(&key);
        set_exit(&state.containers[&key].exit, KILLED_EXIT_CODE);
        state.stats.containers_killed += 1;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.check()?;
        let mut state = lock(&self.state);
        let Some(key) = state.resolve(id) else {
            return Ok(());
        };
        state.terminate_execs(&key);
        if let Some(container) = state.containers.remove(&key) {
            set_exit(&container.exit, KILLED_EXIT_CODE);
        }
        state.stats.containers_removed += 1;
        Ok(())
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, RuntimeError> {
        self.check()?;
        let mut state = lock(&self.state);
        let key = state
            .resolve(container)
            .ok_or_else(|| Self::container_not_found(container))?;
        if !state.containers[&key].is_running() {
            return Err(RuntimeError::NotRunning(format!(
                "Container {container} is not running"
            )));
        }

        let kind = match unwrap_command(&spec.cmd) {
            Some(WrappedExec::Command { pidfile, command }) => ExecKind::Command {
                pidfile: pidfile.to_owned(),
                command: command.to_owned(),
            },
            Some(WrappedExec::Kill { pidfile }) => ExecKind::Kill {
                pidfile: pidfile.to_owned(),
            },
            None => ExecKind::Command {
                pidfile: String::new(),
                command: spec.cmd.join(" "),
            },
        };
        if let ExecKind::Command { command, .. } = &kind {
            state.exec_log.push(ExecRecord {
                container: key.clone(),
                command: command.clone(),
                env: spec.env.clone(),
                working_dir: spec.working_dir.clone(),
            });
        }

        let id = state.next_id("exec");
        let (exit, _) = watch::channel(None);
        state.execs.insert(
            id.clone(),
            MockExec {
                container: key,
                kind,
                started: false,
                exit: Arc::new(exit),
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream, RuntimeError> {
        self.check()?;
        let mut state = lock(&self.state);
        let (container, exit, kill_pidfile, command) = {
            let exec = state.execs.get_mut(exec_id).ok_or_else(|| {
                RuntimeError::NotFound(format!("No such exec instance: {exec_id}"))
            })?;
            exec.started = true;
            match &exec.kind {
                ExecKind::Kill { pidfile } => (
                    exec.container.clone(),
                    exec.exit.clone(),
                    Some(pidfile.clone()),
                    String::new(),
                ),
                ExecKind::Command { command, .. } => (
                    exec.container.clone(),
                    exec.exit.clone(),
                    None,
                    command.clone(),
                ),
            }
        };

        if let Some(pidfile) = kill_pidfile {
            set_exit(&exit, 0);
            state.stats.kill_execs += 1;
            for other in state.execs.values() {
                let targets = matches!(
                    &other.kind,
                    ExecKind::Command { pidfile: target, .. } if *target == pidfile
                );
                if targets && other.container == container {
                    set_exit(&other.exit, KILLED_EXIT_CODE);
                }
            }
            return Ok(Box::pin(stream::empty()));
        }

        if !state.containers.contains_key(&container) {
            return Err(Self::container_not_found(&container));
        }
        state.stats.execs_started += 1;
        state.active_execs += 1;
        state.stats.max_parallel_execs = state.stats.max_parallel_execs.max(state.active_execs);
        let per_container = {
            let entry = state
                .containers
                .get_mut(&container)
                .ok_or_else(|| Self::container_not_found(&container))?;
            entry.active_execs += 1;
            entry.active_execs
        };
        state.stats.max_parallel_execs_per_container =
            state.stats.max_parallel_execs_per_container.max(per_container);
        drop(state);

        let active = ActiveExec {
            state: self.state.clone(),
            container,
        };
        let script = self.script_for(&command);
        let body = async move {
            let _active = active;
            let mut killed = exit.subscribe();
            let finished = tokio::select! {
                _ = tokio::time::sleep(script.delay) => true,
                _ = killed.wait_for(Option::is_some) => false,
            };
            if finished {
                set_exit(&exit, script.exit_code);
                script.frames()
            } else {
                Vec::new()
            }
        };
        Ok(Box::pin(
            stream::once(body).flat_map(|frames| stream::iter(chunked(frames))),
        ))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState, RuntimeError> {
        self.check()?;
        let state = lock(&self.state);
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such exec instance: {exec_id}")))?;
        let exit_code = *exec.exit.borrow();
        Ok(ExecState {
            running: exec.started && exit_code.is_none(),
            exit_code,
        })
    }

    async fn list_containers(
        &self,
        labels: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.check()?;
        let state = lock(&self.state);
        let mut found: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, container)| {
                labels
                    .iter()
                    .all(|(key, value)| container.labels.get(key) == Some(value))
            })
            .map(|(id, container)| ContainerSummary {
                id: id.clone(),
                names: vec![container.name.clone()],
                state: container.state().to_owned(),
                labels: container
                    .labels
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }
}

/// Decrements the in-flight counters when an exec's output stream finishes or is dropped.
struct ActiveExec {
    state: Arc<Mutex<MockState>>,
    container: String,
}

impl Drop for ActiveExec {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.active_execs = state.active_execs.saturating_sub(1);
        if let Some(container) = state.containers.get_mut(&self.container) {
            container.active_execs = container.active_execs.saturating_sub(1);
        }
    }
}

fn set_exit(exit: &watch::Sender<Option<i64>>, code: i64) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
}

fn chunked(bytes: Vec<u8>) -> Vec<Result<Bytes, RuntimeError>> {
    let bytes = Bytes::from(bytes);
    (0..bytes.len())
        .step_by(CHUNK_LEN)
        .map(|start| Ok(bytes.slice(start..(start + CHUNK_LEN).min(bytes.len()))))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
