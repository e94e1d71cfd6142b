use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_WORKER_IMAGE: &str = "recon-worker:latest";
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_CONTAINER_PREFIX: &str = "recon";

const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

/// Per-tool timeouts consulted when a request does not carry its own.
const TOOL_TIMEOUTS_MS: &[(&str, u64)] = &[
    ("nmap", 600_000),
    ("masscan", 600_000),
    ("subfinder", 300_000),
    ("amass", 900_000),
    ("dnsx", 180_000),
    ("dig", 30_000),
    ("whois", 30_000),
    ("httpx", 300_000),
    ("whatweb", 120_000),
    ("ffuf", 600_000),
    ("gobuster", 600_000),
    ("nuclei", 900_000),
    ("nikto", 900_000),
    ("sqlmap", 900_000),
    ("curl", 60_000),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Image every worker container is created from.
    pub image: String,
    /// Unix socket of the container runtime daemon.
    pub docker_socket: PathBuf,
    /// Used for container names and the management label namespace.
    pub container_prefix: String,
    /// Fallback when neither the request nor the tool table provides a timeout.
    pub default_timeout: Duration,
    pub tool_timeouts: HashMap<String, Duration>,
    /// Capabilities granted to every worker container. Raw sockets are needed
    /// for SYN scans and similar probes.
    pub cap_add: Vec<String>,
    /// `None` leaves the runtime's default network.
    pub network_mode: Option<String>,
    /// Upper bound for creating and starting a session container.
    pub session_start_timeout: Duration,
    /// Grace period handed to the runtime when stopping a session container.
    pub stop_grace: Duration,
    /// How long to keep collecting logs from a container that was killed on timeout.
    pub collect_grace: Duration,
    /// Per-stream cap on collected output; the rest is dropped and flagged.
    pub max_output_bytes: usize,
    pub pull_missing_image: bool,
    /// Main process of a session container. It must never exit on its own.
    pub keepalive_command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_WORKER_IMAGE.into(),
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            container_prefix: DEFAULT_CONTAINER_PREFIX.into(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            tool_timeouts: default_tool_timeouts(),
            cap_add: vec!["NET_RAW".into(), "NET_ADMIN".into()],
            network_mode: None,
            session_start_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            collect_grace: Duration::from_secs(5),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            pull_missing_image: false,
            keepalive_command: vec![
                "/bin/sh".into(),
                "-c".into(),
                "trap 'exit 0' TERM INT; while :; do sleep 3600 & wait $!; done".into(),
            ],
        }
    }
}

impl EngineConfig {
    /// Build a config from `RECON_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(image) = non_empty(lookup("RECON_WORKER_IMAGE")) {
            config.image = image;
        }
        if let Some(socket) = non_empty(lookup("RECON_DOCKER_SOCKET")) {
            config.docker_socket = PathBuf::from(socket);
        } else if let Some(host) = non_empty(lookup("DOCKER_HOST")) {
            // Only unix endpoints are supported; tcp hosts keep the default socket.
            if let Some(path) = host.strip_prefix("unix://") {
                config.docker_socket = PathBuf::from(path);
            }
        }
        if let Some(prefix) = non_empty(lookup("RECON_CONTAINER_PREFIX")) {
            config.container_prefix = prefix;
        }
        if let Some(raw) = non_empty(lookup("RECON_DEFAULT_TIMEOUT_MS")) {
            config.default_timeout =
                Duration::from_millis(parse_number("RECON_DEFAULT_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = non_empty(lookup("RECON_MAX_OUTPUT_BYTES")) {
            config.max_output_bytes = parse_number("RECON_MAX_OUTPUT_BYTES", &raw)?;
        }
        if let Some(raw) = non_empty(lookup("RECON_PULL_MISSING_IMAGE")) {
            config.pull_missing_image = parse_flag("RECON_PULL_MISSING_IMAGE", &raw)?;
        }
        if let Some(mode) = non_empty(lookup("RECON_NETWORK_MODE")) {
            config.network_mode = Some(mode);
        }
        if let Some(raw) = non_empty(lookup("RECON_CAP_ADD")) {
            config.cap_add = raw
                .split(',')
                .map(str::trim)
                .filter(|cap| !cap.is_empty())
                .map(str::to_owned)
                .collect();
        }

        Ok(config)
    }

    /// Resolve the effective timeout for a tool: table entry, then the default.
    pub fn timeout_for_tool(&self, tool: &str) -> Duration {
        self.tool_timeouts
            .get(&tool.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Label key marking containers created by this engine.
    pub fn managed_label(&self) -> String {
        format!("{}.managed", self.container_prefix)
    }

    pub fn label(&self, name: &str) -> String {
        format!("{}.{}", self.container_prefix, name)
    }
}

pub fn default_tool_timeouts() -> HashMap<String, Duration> {
    TOOL_TIMEOUTS_MS
        .iter()
        .map(|(tool, ms)| ((*tool).to_owned(), Duration::from_millis(*ms)))
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::InvalidEnv {
        var,
        value: raw.to_owned(),
        reason: err.to_string(),
    })
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_owned(),
            reason: "expected a boolean".into(),
        }),
    }
}
