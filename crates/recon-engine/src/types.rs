use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Turns a tool's raw stdout into a structured value.
///
/// Implemented for any `Fn(&str) -> anyhow::Result<Value>`. Parsers are not
/// called on empty output unless they opt in through [`accepts_empty`].
///
/// [`accepts_empty`]: ResultParser::accepts_empty
pub trait ResultParser: Send + Sync {
    fn parse(&self, stdout: &str) -> anyhow::Result<Value>;

    fn accepts_empty(&self) -> bool {
        false
    }
}

impl<F> ResultParser for F
where
    F: Fn(&str) -> anyhow::Result<Value> + Send + Sync,
{
    fn parse(&self, stdout: &str) -> anyhow::Result<Value> {
        self(stdout)
    }
}

#[derive(Clone)]
pub struct ToolExecutionRequest {
    pub command: String,
    /// Target session for session mode; a label on the disposable container otherwise.
    pub session_key: String,
    pub stage: String,
    pub tool: String,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub result_parser: Option<Arc<dyn ResultParser>>,
}

impl ToolExecutionRequest {
    pub fn new(command: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            session_key: session_key.into(),
            stage: String::new(),
            tool: String::new(),
            timeout: None,
            env: BTreeMap::new(),
            working_dir: None,
            result_parser: None,
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, ms: u64) -> Self {
        self.timeout(Duration::from_millis(ms))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn parser<P: ResultParser + 'static>(mut self, parser: P) -> Self {
        self.result_parser = Some(Arc::new(parser));
        self
    }
}

impl fmt::Debug for ToolExecutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolExecutionRequest")
            .field("command", &self.command)
            .field("session_key", &self.session_key)
            .field("stage", &self.stage)
            .field("tool", &self.tool)
            .field("timeout", &self.timeout)
            .field("env", &self.env)
            .field("working_dir", &self.working_dir)
            .field("result_parser", &self.result_parser.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed before reporting an exit status.
    pub exit_code: Option<i64>,
    pub success: bool,
    pub timed_out: bool,
    #[serde(rename = "durationMs", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ToolExecutionResult {
    pub(crate) fn completed(
        stdout: String,
        stderr: String,
        exit_code: Option<i64>,
        duration: Duration,
    ) -> Self {
        Self {
            success: exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            timed_out: false,
            duration,
            parsed: None,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub(crate) fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: None,
            success: false,
            timed_out: true,
            duration,
            parsed: None,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn outcome(&self) -> ExecutionOutcome {
        if self.timed_out {
            ExecutionOutcome::TimedOut
        } else if self.success {
            ExecutionOutcome::Succeeded
        } else {
            ExecutionOutcome::Failed
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub docker_available: bool,
    pub image_exists: bool,
    pub active_containers: usize,
    pub active_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl SessionStatus {
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub key: String,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub container_name: String,
    pub created_at: SystemTime,
    pub last_used_at: SystemTime,
    pub executions: u64,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
