//! Capability surface the engine needs from a container runtime.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

/// Output in the runtime's framed wire format, chunked however the transport
/// delivers it. Decode with [`crate::demux::FrameDecoder`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unreachable: {0}")]
    Unavailable(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("no such image: {0}")]
    ImageNotFound(String),
    /// A container with the requested name already exists.
    #[error("name already in use: {0}")]
    Conflict(String),
    /// The container exists but its main process has exited.
    #[error("container is not running: {0}")]
    NotRunning(String),
    #[error("runtime returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected runtime response: {0}")]
    Decode(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// The target container can no longer run anything: removed, or stopped.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_) | RuntimeError::NotRunning(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub cap_add: Vec<String>,
    pub network_mode: Option<String>,
    /// Run an init process as PID 1 so orphaned children are reaped.
    pub init: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub state: String,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn version(&self) -> Result<String, RuntimeError>;

    /// Whether an image with this reference is listed locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Returns the new container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its exit status.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn container_logs(&self, id: &str) -> Result<ByteStream, RuntimeError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Forced removal. Removing a missing container is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Returns the exec instance id.
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String, RuntimeError>;

    /// Start an attached exec and stream its multiplexed output until it exits.
    async fn start_exec(&self, exec_id: &str) -> Result<ByteStream, RuntimeError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState, RuntimeError>;

    /// Containers in any state (created, running, exited) carrying every
    /// `key=value` label given.
    async fn list_containers(
        &self,
        labels: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;
}
