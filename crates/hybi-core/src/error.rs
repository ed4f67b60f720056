use thiserror::Error;

/// Symbolic error codes surfaced to callers.
///
/// The numeric values are part of the wire contract with existing clients and
/// must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionClosed,
    IllegalAccess,
    RequestAuthFail,
    RepeatRequest,
    ExecuteTimeoutAfter,
}

impl ErrorCode {
    /// Numeric errno value.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::ConnectionClosed => -30003,
            ErrorCode::IllegalAccess => -30005,
            ErrorCode::RequestAuthFail => -30015,
            ErrorCode::RepeatRequest => -30023,
            ErrorCode::ExecuteTimeoutAfter => -30028,
        }
    }

    /// Short symbolic name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "connection-closed",
            ErrorCode::IllegalAccess => "illegal-access",
            ErrorCode::RequestAuthFail => "request-auth-fail",
            ErrorCode::RepeatRequest => "repeat-request",
            ErrorCode::ExecuteTimeoutAfter => "execute-timeout-after",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.errno())
    }
}

/// Errors produced by the conversation layer.
#[derive(Debug, Error)]
pub enum HybiError {
    #[error("invalid bind list: {0}")]
    InvalidBindList(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("illegal origin: {0}")]
    IllegalOrigin(String),

    #[error("invalid upgrade request: {0}")]
    InvalidRequest(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already bound: {0}")]
    RepeatBinding(String),

    #[error("request auth failed: {0}")]
    AuthFailed(String),

    #[error("execute timeout after {millis}ms: {operation}")]
    ExecuteTimeout { operation: String, millis: u128 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("service error: {0}")]
    Service(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HybiError {
    /// The symbolic code for this error, if it maps onto one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            HybiError::ConnectionClosed => Some(ErrorCode::ConnectionClosed),
            HybiError::ServiceNotFound(_) | HybiError::IllegalOrigin(_) => {
                Some(ErrorCode::IllegalAccess)
            }
            HybiError::AuthFailed(_) => Some(ErrorCode::RequestAuthFail),
            HybiError::RepeatBinding(_) => Some(ErrorCode::RepeatRequest),
            HybiError::ExecuteTimeout { .. } => Some(ErrorCode::ExecuteTimeoutAfter),
            _ => None,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        HybiError::ExecuteTimeout {
            operation: operation.into(),
            millis: after.as_millis(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HybiError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => HybiError::ConnectionClosed,
            other => HybiError::Transport(other.to_string()),
        }
    }
}

pub type HybiResult<T> = Result<T, HybiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn codes_match_errno_table() {
        assert_eq!(HybiError::ConnectionClosed.code().unwrap().errno(), -30003);
        assert_eq!(
            HybiError::AuthFailed("chat".into()).code(),
            Some(ErrorCode::RequestAuthFail)
        );
        assert_eq!(
            HybiError::RepeatBinding("chat".into()).code(),
            Some(ErrorCode::RepeatRequest)
        );
        assert_eq!(
            HybiError::timeout("auth chat", Duration::from_secs(20)).code(),
            Some(ErrorCode::ExecuteTimeoutAfter)
        );
        assert_eq!(HybiError::Config("x".into()).code(), None);
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = HybiError::timeout("load chat", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "execute timeout after 1500ms: load chat");
    }
}
