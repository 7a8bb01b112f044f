use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while resolving or acting on UI elements
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element not actionable: {0}")]
    NotActionable(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Verification failed: expected text starting with {expected:?}, field reads {actual:?}")]
    VerificationFailed { expected: String, actual: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Another bridged operation is still in flight: {0}")]
    Busy(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure category reported to the calling agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotActionable,
    ExecutionFailed,
    VerificationFailed,
    Timeout,
    PermissionDenied,
    PeerUnavailable,
    InvalidArgument,
    Internal,
}

impl AutomationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutomationError::ElementNotFound(_) => ErrorKind::NotFound,
            AutomationError::NotActionable(_) => ErrorKind::NotActionable,
            AutomationError::ExecutionFailed(_)
            | AutomationError::PlatformError(_)
            | AutomationError::UnsupportedOperation(_) => ErrorKind::ExecutionFailed,
            AutomationError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            AutomationError::Timeout(_) | AutomationError::Busy(_) => ErrorKind::Timeout,
            AutomationError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            AutomationError::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            AutomationError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AutomationError::UnsupportedPlatform(_) | AutomationError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// What the caller should try next. The agent has no other source of remediation hints.
    pub fn suggestion(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => {
                "Re-resolve with a shorter query or a role filter, check the app name, or pass x/y coordinates"
            }
            ErrorKind::NotActionable => {
                "The element is disabled or hidden; wait for it to become visible or scroll it into view"
            }
            ErrorKind::ExecutionFailed => {
                "Focus the target app and retry, or act on the element's coordinates instead"
            }
            ErrorKind::VerificationFailed => {
                "Click the field first, clear it, then type again; read the value back to confirm"
            }
            ErrorKind::Timeout => {
                "The target app may be frozen; wait a moment and retry with a narrower locator"
            }
            ErrorKind::PermissionDenied => {
                "Grant accessibility and screen-recording access to this process in system settings"
            }
            ErrorKind::PeerUnavailable => {
                "Start the vision sidecar or the browser debugging port, or use a more specific locator"
            }
            ErrorKind::InvalidArgument => "Check the request arguments against the operation's contract",
            ErrorKind::Internal => "Retry the request; if it keeps failing, restart the agent",
        }
    }

    /// Errors that make every later resolution tier pointless.
    pub(crate) fn aborts_resolution(&self) -> bool {
        matches!(
            self,
            AutomationError::PermissionDenied(_) | AutomationError::UnsupportedPlatform(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_suggestion() {
        let errors = [
            AutomationError::ElementNotFound("x".into()),
            AutomationError::NotActionable("x".into()),
            AutomationError::ExecutionFailed("x".into()),
            AutomationError::VerificationFailed {
                expected: "a".into(),
                actual: "b".into(),
            },
            AutomationError::Timeout("x".into()),
            AutomationError::PermissionDenied("x".into()),
            AutomationError::PeerUnavailable("x".into()),
            AutomationError::InvalidArgument("x".into()),
            AutomationError::Internal("x".into()),
        ];
        for error in errors {
            assert!(!error.suggestion().is_empty(), "{error:?}");
        }
    }

    #[test]
    fn busy_is_reported_as_timeout() {
        assert_eq!(
            AutomationError::Busy("capture".into()).kind(),
            ErrorKind::Timeout
        );
    }
}
