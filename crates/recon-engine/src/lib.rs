//! Sandboxed execution of recon tools in worker containers.
//!
//! [`WorkerManager`] runs shell commands either in disposable containers
//! ([`WorkerManager::run_tool`]) or inside named, long-lived sessions
//! ([`WorkerManager::run_tool_in_session`]), enforces per-request timeouts,
//! demultiplexes the runtime's framed output and reports runtime health.

pub mod config;
pub mod demux;
pub mod error;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod types;

#[cfg(any(feature = "test-fixtures", test))]
pub mod fixtures;

pub use config::{ConfigError, EngineConfig};
pub use demux::{DemuxedOutput, FrameDecoder, StreamKind};
pub use error::EngineError;
pub use manager::WorkerManager;
pub use registry::SessionRegistry;
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
pub use types::{
    ExecutionOutcome, HealthStatus, ResultParser, SessionInfo, SessionStatus,
    ToolExecutionRequest, ToolExecutionResult,
};
