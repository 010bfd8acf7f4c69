use thiserror::Error;

/// Error taxonomy for the voice session and its backend plumbing.
///
/// Fatal categories move the session to `Error` and release every acquired
/// resource; `Decode` is the only per-message, non-fatal category.
#[derive(Debug, Error)]
pub enum MentorError {
    /// Pre-flight check failed: the live endpoint is not reachable over a
    /// secure transport (wss:// or loopback ws://).
    #[error("insecure transport: {0}")]
    InsecureContext(String),

    /// The backend returned no usable API key for this attempt.
    #[error("credential error: {0}")]
    Credential(String),

    /// Audio input or output device could not be acquired.
    #[error("device access error: {0}")]
    DeviceAccess(String),

    /// The connection attempt did not open within its wall-clock budget.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Transport-level failure on the live connection. Retried once with a
    /// fixed backoff before becoming fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound payload. Logged and dropped, never fatal.
    #[error("decode error: {0}")]
    Decode(String),

    /// The proxy backend was unreachable or answered with an error body.
    #[error("backend error: {0}")]
    Backend(String),

    /// Channel to the connection task closed.
    #[error("failed to send message: connection task is gone")]
    SendError,

    /// Operation attempted on a session that is closed or not yet started.
    #[error("session is not ready")]
    NotReady,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MentorError {
    /// True when the failure points at the proxy backend rather than the
    /// remote model, in which case the UI shows a deployment hint.
    pub fn is_backend_reachability(&self) -> bool {
        matches!(self, MentorError::Backend(_))
    }
}
