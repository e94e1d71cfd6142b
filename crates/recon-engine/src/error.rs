use thiserror::Error;

use crate::runtime::RuntimeError;

/// Failures that prevented a command from running at all.
///
/// Outcomes of a command that did run (non-zero exit, timeout, parser
/// failure) are reported through [`crate::ToolExecutionResult`] instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution runtime not available: {message}")]
    SubstrateUnavailable { message: String },
    #[error("worker image '{image}' is not present on the execution runtime")]
    ImageMissing { image: String },
    #[error("failed to start session '{key}': {message}")]
    SessionCreateFailed { key: String, message: String },
    #[error("runtime operation `{operation}` failed: {message}")]
    Substrate {
        operation: &'static str,
        message: String,
    },
}

impl EngineError {
    /// True for conditions an operator fixes by setting up the runtime.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            EngineError::SubstrateUnavailable { .. } | EngineError::ImageMissing { .. }
        )
    }

    pub(crate) fn from_runtime(operation: &'static str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(message) => EngineError::SubstrateUnavailable { message },
            RuntimeError::ImageNotFound(image) => EngineError::ImageMissing { image },
            other => EngineError::Substrate {
                operation,
                message: other.to_string(),
            },
        }
    }

    /// Session creation keeps the setup errors distinct and folds everything
    /// else into `SessionCreateFailed`.
    pub(crate) fn session_create(key: &str, err: EngineError) -> Self {
        match err {
            err @ (EngineError::SubstrateUnavailable { .. } | EngineError::ImageMissing { .. }) => {
                err
            }
            EngineError::SessionCreateFailed { message, .. } => EngineError::SessionCreateFailed {
                key: key.to_owned(),
                message,
            },
            EngineError::Substrate { operation, message } => EngineError::SessionCreateFailed {
                key: key.to_owned(),
                message: format!("{operation}: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_to_taxonomy() {
        let err = EngineError::from_runtime(
            "create_container",
            RuntimeError::Unavailable("connection refused".into()),
        );
        assert!(matches!(err, EngineError::SubstrateUnavailable { .. }));
        assert!(err.is_setup_error());

        let err = EngineError::from_runtime(
            "create_container",
            RuntimeError::ImageNotFound("worker:latest".into()),
        );
        assert!(matches!(err, EngineError::ImageMissing { ref image } if image == "worker:latest"));

        let err = EngineError::from_runtime(
            "create_exec",
            RuntimeError::Api {
                status: 500,
                message: "boom".into(),
            },
        );
        assert!(matches!(
            err,
            EngineError::Substrate {
                operation: "create_exec",
                ..
            }
        ));
        assert!(!err.is_setup_error());
    }

    #[test]
    fn session_create_wraps_only_non_setup_errors() {
        let wrapped = EngineError::session_create(
            "scan-1",
            EngineError::Substrate {
                operation: "start_container",
                message: "exited".into(),
            },
        );
        match wrapped {
            EngineError::SessionCreateFailed { key, message } => {
                assert_eq!(key, "scan-1");
                assert!(message.starts_with("start_container"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let kept = EngineError::session_create(
            "scan-1",
            EngineError::SubstrateUnavailable {
                message: "down".into(),
            },
        );
        assert!(matches!(kept, EngineError::SubstrateUnavailable { .. }));
    }
}
