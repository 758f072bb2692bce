use thiserror::Error;

/// Classification of failures raised by the underlying consumer client.
///
/// Transient errors are retried (with backoff) inside the receiver loop and
/// never surface to delivery streams. Fatal errors terminate the loop and
/// propagate to every active stream and pending action future.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transient consumer error: {0}")]
    Transient(String),
    #[error("fatal consumer error: {0}")]
    Fatal(String),
}

impl ClientError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Fatal(_))
    }
}

/// Errors surfaced through the public receiver API.
#[derive(Debug, Clone, Error)]
pub enum ReceiverError {
    /// The receiver loop has terminated; the consumer handle is released and
    /// all outstanding offset handles are invalid.
    #[error("receiver is closed")]
    Closed,

    /// Only one delivery stream may be opened per receiver.
    #[error("a delivery stream is already active for this receiver")]
    StreamAlreadyActive,

    /// Creating the underlying consumer client failed.
    #[error("failed to create consumer client: {0}")]
    ClientCreation(String),

    /// A commit issued on behalf of the caller failed.
    #[error("offset commit failed: {0}")]
    Commit(#[source] ClientError),

    /// The consumer client raised a fatal error; the loop has terminated.
    #[error("consumer client failed: {0}")]
    Client(#[from] ClientError),
}
