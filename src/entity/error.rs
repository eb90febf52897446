/// Error code the backend uses when a user hits its per-user rate limit.
pub const RATE_LIMIT_CODE_PREFIX: &str = "rate_limited";

/// Errors raised by the trading channel.
///
/// The `code()` of an error is machine-readable and stable; callers branch
/// on it instead of matching display strings.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not connected")]
    NotConnected,

    #[error("channel connection error: {0}")]
    Connection(String),

    #[error("request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("backend error [{code}]: {message}")]
    Backend { code: String, message: String },

    #[error("malformed backend message: {0}")]
    Malformed(String),
}

impl ChannelError {
    /// Stable machine-readable code, separate from the human message.
    pub fn code(&self) -> &str {
        match self {
            ChannelError::NotConnected => "channel_not_connected",
            ChannelError::Connection(_) => "channel_connection_error",
            ChannelError::Timeout { .. } => "request_timeout",
            ChannelError::Auth(_) => "auth_failed",
            ChannelError::Backend { code, .. } => code,
            ChannelError::Malformed(_) => "malformed_message",
        }
    }

    /// Transport-class failures are the only ones a caller may retry, and
    /// only once, after forcing a fresh connect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConnected | ChannelError::Connection(_)
        )
    }

    /// Rate-limit responses trigger backoff instead of an immediate retry.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ChannelError::Backend { code, .. } if code.starts_with(RATE_LIMIT_CODE_PREFIX))
    }
}

/// Errors raised by the execution pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid trade intent: {0}")]
    InvalidIntent(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The backend omitted a field its contract requires. Fatal, never
    /// retried.
    #[error("backend contract violation: {0}")]
    ContractViolation(String),

    #[error("transaction signing failed: {0}")]
    Signing(String),

    #[error("transaction submission failed: {0}")]
    Submission(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("delegated execution unavailable: {0}")]
    Delegated(String),
}

/// Errors raised by the delegated fast session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active fast session")]
    NotActive,

    #[error("a fast session is already active")]
    AlreadyActive,

    #[error("arm transaction not confirmed: {0}")]
    ArmFailed(String),

    #[error("revoke transaction not confirmed: {0}")]
    RevokeFailed(String),

    #[error("wallet signing failed: {0}")]
    WalletSigning(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_code_is_exposed_verbatim() {
        let err = ChannelError::Backend {
            code: "rate_limited_user".to_string(),
            message: "slow down".to_string(),
        };
        assert_eq!(err.code(), "rate_limited_user");
        assert!(err.is_rate_limit());
        assert!(!err.is_transport());
    }

    #[test]
    fn transport_classification() {
        assert!(ChannelError::NotConnected.is_transport());
        assert!(ChannelError::Connection("reset".to_string()).is_transport());
        assert!(!ChannelError::Timeout { after_ms: 12_000 }.is_transport());
        assert!(!ChannelError::Auth("bad key".to_string()).is_transport());
    }
}
