//! Global CLI options and engine construction.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use recon_engine::{DockerRuntime, EngineConfig, WorkerManager};

/// Global options for every command. Unset options fall back to the
/// `RECON_*` environment read by [`EngineConfig::from_env`].
#[derive(Args, Debug, Clone)]
pub struct WorkerOpts {
    /// Docker daemon socket (env: RECON_DOCKER_SOCKET)
    #[arg(long, global = true, env = "RECON_DOCKER_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Worker image reference (env: RECON_WORKER_IMAGE)
    #[arg(long, global = true, env = "RECON_WORKER_IMAGE")]
    pub image: Option<String>,

    /// Default command timeout in milliseconds (env: RECON_DEFAULT_TIMEOUT_MS)
    #[arg(long, global = true, env = "RECON_DEFAULT_TIMEOUT_MS")]
    pub default_timeout_ms: Option<u64>,

    /// Pull the worker image when it is missing
    #[arg(long, global = true)]
    pub pull: bool,

    /// JSON output
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl WorkerOpts {
    pub fn config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_env().context("read RECON_* environment")?;
        if let Some(socket) = &self.socket {
            config.docker_socket = socket.clone();
        }
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(ms) = self.default_timeout_ms {
            config.default_timeout = std::time::Duration::from_millis(ms);
        }
        if self.pull {
            config.pull_missing_image = true;
        }
        Ok(config)
    }

    pub fn runtime(&self, config: &EngineConfig) -> Arc<DockerRuntime> {
        Arc::new(DockerRuntime::new(&config.docker_socket))
    }

    pub fn manager(&self) -> Result<WorkerManager> {
        let config = self.config()?;
        let runtime = self.runtime(&config);
        Ok(WorkerManager::new(runtime, config))
    }
}
