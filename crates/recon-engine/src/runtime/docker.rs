//! [`ContainerRuntime`] backed by the Docker Engine API through `bollard`.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, KillContainerOptionsBuilder,
    ListContainersOptionsBuilder, ListImagesOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tracing::debug;

use super::{
    ByteStream, ContainerRuntime, ContainerSpec, ContainerSummary, ExecSpec, ExecState,
    RuntimeError,
};
use crate::demux::{StreamKind, encode_frame};

/// Client-level timeout. Waits and output streams are bounded by the manager's deadlines.
const CLIENT_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DockerRuntime {
    socket: String,
    docker: Result<Docker, String>,
    request_timeout: Duration,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("socket", &self.socket)
            .field("connected", &self.docker.is_ok())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl DockerRuntime {
    /// Connect to the daemon socket. A socket that cannot be opened is not an
    /// error here; every call then reports [`RuntimeError::Unavailable`].
    pub fn new(socket: impl AsRef<Path>) -> Self {
        let socket = socket.as_ref().to_string_lossy().into_owned();
        let docker = Docker::connect_with_socket(&socket, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|err| format!("{socket}: {err}"));
        Self {
            socket,
            docker,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound for short control calls.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn socket(&self) -> &str {
        &self.socket
    }

    fn client(&self) -> Result<&Docker, RuntimeError> {
        self.docker
            .as_ref()
            .map_err(|message| RuntimeError::Unavailable(message.clone()))
    }

    async fn control<T>(
        &self,
        operation: &'static str,
        target: &str,
        call: impl Future<Output = Result<T, BollardError>>,
    ) -> Result<T, RuntimeError> {
        debug!(operation, target, "docker request");
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(|err| runtime_error(err, target)),
            Err(_) => Err(RuntimeError::Transport(format!(
                "{operation} {target} timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        self.control("ping", &self.socket, docker.ping()).await?;
        Ok(())
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        let docker = self.client()?;
        let version = self.control("version", &self.socket, docker.version()).await?;
        let number = version.version.unwrap_or_else(|| "unknown".to_owned());
        Ok(match version.api_version {
            Some(api) => format!("{number} (api {api})"),
            None => number,
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let docker = self.client()?;
        let filters = HashMap::from([("reference".to_owned(), vec![image.to_owned()])]);
        let options = ListImagesOptionsBuilder::new().filters(&filters).build();
        let images = self
            .control("list_images", image, docker.list_images(Some(options)))
            .await?;
        Ok(!images.is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        let (from_image, tag) = split_image_tag(image);
        debug!(image, "pulling image");
        // Pulls can take far longer than a control call.
        docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| runtime_error(err, image))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let docker = self.client()?;
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
                init: Some(spec.init),
                auto_remove: Some(false),
                network_mode: spec.network_mode.clone(),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        match self
            .control(
                "create_container",
                &spec.name,
                docker.create_container(Some(options), body),
            )
            .await
        {
            Ok(created) => Ok(created.id),
            Err(RuntimeError::NotFound(_)) => Err(RuntimeError::ImageNotFound(spec.image.clone())),
            Err(RuntimeError::Api { status: 409, .. }) => {
                Err(RuntimeError::Conflict(spec.name.clone()))
            }
            Err(err) => Err(err),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        match self
            .control(
                "start_container",
                id,
                docker.start_container(id, None::<StartContainerOptions>),
            )
            .await
        {
            // already started
            Err(RuntimeError::Api { status: 304, .. }) => Ok(()),
            other => other,
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let docker = self.client()?;
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut waits = Box::pin(docker.wait_container(id, Some(options)));
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // non-zero exits arrive as an error carrying the status
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(runtime_error(err, id)),
            None => Err(RuntimeError::Decode(format!("wait on {id} returned no status"))),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<ByteStream, RuntimeError> {
        let docker = self.client()?;
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(false)
            .build();
        let target = id.to_owned();
        let logs = docker.logs(id, Some(options)).map(move |chunk| {
            chunk
                .map(reframe)
                .map_err(|err| runtime_error(err, &target))
        });
        Ok(Box::pin(logs))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        let seconds = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(seconds).build();
        match self
            .control("stop_container", id, docker.stop_container(id, Some(options)))
            .await
        {
            Err(RuntimeError::Api { status: 304, .. } | RuntimeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        match self
            .control("kill_container", id, docker.kill_container(id, Some(options)))
            .await
        {
            // not running, or already gone
            Err(RuntimeError::Api { status: 409, .. } | RuntimeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.client()?;
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self
            .control("remove_container", id, docker.remove_container(id, Some(options)))
            .await
        {
            // gone, or removal already in progress
            Err(RuntimeError::NotFound(_) | RuntimeError::Api { status: 409, .. }) => Ok(()),
            other => other,
        }
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, RuntimeError> {
        let docker = self.client()?;
        let config = ExecConfig {
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..ExecConfig::default()
        };
        let created = self
            .control("create_exec", container, docker.create_exec(container, config))
            .await
            .map_err(|err| not_running(err, container))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream, RuntimeError> {
        let docker = self.client()?;
        let started = self
            .control(
                "start_exec",
                exec_id,
                docker.start_exec(exec_id, None::<StartExecOptions>),
            )
            .await
            .map_err(|err| not_running(err, exec_id))?;
        match started {
            StartExecResults::Attached { output, .. } => {
                let target = exec_id.to_owned();
                Ok(Box::pin(output.map(move |chunk| {
                    chunk
                        .map(reframe)
                        .map_err(|err| runtime_error(err, &target))
                })))
            }
            StartExecResults::Detached => Err(RuntimeError::Decode(format!(
                "exec {exec_id} started detached"
            ))),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState, RuntimeError> {
        let docker = self.client()?;
        let inspected = self
            .control("inspect_exec", exec_id, docker.inspect_exec(exec_id))
            .await?;
        let running = inspected.running.unwrap_or(false);
        Ok(ExecState {
            running,
            exit_code: if running { None } else { inspected.exit_code },
        })
    }

    async fn list_containers(
        &self,
        labels: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let docker = self.client()?;
        let selectors: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let filters = HashMap::from([("label".to_owned(), selectors)]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let entries = self
            .control(
                "list_containers",
                &self.socket,
                docker.list_containers(Some(options)),
            )
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| ContainerSummary {
                id: entry.id.unwrap_or_default(),
                names: entry
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|name| name.trim_start_matches('/').to_owned())
                    .collect(),
                state: entry.state.map(|state| state.to_string()).unwrap_or_default(),
                labels: entry.labels.unwrap_or_default(),
            })
            .collect())
    }
}

/// Put demultiplexed output back into the framed wire format the engine decodes.
fn reframe(output: LogOutput) -> Bytes {
    let (kind, message) = match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            (StreamKind::Stdout, message)
        }
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::StdIn { message } => (StreamKind::Stdin, message),
    };
    Bytes::from(encode_frame(kind, &message))
}

fn split_image_tag(image: &str) -> (&str, &str) {
    // A colon inside the last path segment separates the tag; earlier colons belong to a registry port.
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        if let Some((name, tag)) = image.rsplit_once(':') {
            return (name, tag);
        }
    }
    (image, "latest")
}

fn runtime_error(err: BollardError, target: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{target}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        err if is_connect_failure(&err) => RuntimeError::Unavailable(err.to_string()),
        err => RuntimeError::Transport(err.to_string()),
    }
}

/// Exec calls answer 409 when the target container has stopped.
fn not_running(err: RuntimeError, target: &str) -> RuntimeError {
    match err {
        RuntimeError::Api { status: 409, message } => {
            RuntimeError::NotRunning(format!("{target}: {message}"))
        }
        other => other,
    }
}

fn is_connect_failure(err: &BollardError) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::PermissionDenied
            );
        }
        source = current.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::demux;

    #[test]
    fn image_tags_are_split_on_the_last_segment() {
        assert_eq!(split_image_tag("recon-worker:1.2"), ("recon-worker", "1.2"));
        assert_eq!(split_image_tag("recon-worker"), ("recon-worker", "latest"));
        assert_eq!(
            split_image_tag("registry.local:5000/team/worker"),
            ("registry.local:5000/team/worker", "latest")
        );
        assert_eq!(
            split_image_tag("registry.local:5000/team/worker:dev"),
            ("registry.local:5000/team/worker", "dev")
        );
    }

    #[test]
    fn daemon_errors_map_onto_runtime_errors() {
        let err = runtime_error(
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container: abc".into(),
            },
            "abc",
        );
        assert!(err.is_not_found());

        let err = runtime_error(
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "Container abc is not running".into(),
            },
            "abc",
        );
        assert!(matches!(err, RuntimeError::Api { status: 409, .. }));
        let err = not_running(err, "abc");
        assert!(matches!(err, RuntimeError::NotRunning(_)));
        assert!(err.is_container_gone());
    }

    #[test]
    fn reframed_output_decodes_back_into_streams() {
        let mut wire = Vec::new();
        for output in [
            LogOutput::StdOut {
                message: Bytes::from_static(b"80/tcp open\n"),
            },
            LogOutput::StdErr {
                message: Bytes::from_static(b"warning\n"),
            },
            LogOutput::Console {
                message: Bytes::from_static(b"tty line\n"),
            },
        ] {
            wire.extend_from_slice(&reframe(output));
        }
        let out = demux(&wire);
        assert_eq!(out.stdout, "80/tcp open\ntty line\n");
        assert_eq!(out.stderr, "warning\n");
    }

    #[tokio::test]
    async fn unreachable_socket_reports_unavailable() {
        let runtime = DockerRuntime::new("/nonexistent/recon-test/docker.sock")
            .with_request_timeout(Duration::from_secs(2));
        let err = runtime.ping().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)), "{err:?}");
    }
}
