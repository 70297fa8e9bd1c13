use thiserror::Error;

/// The error taxonomy of the reconnect core. Every error that can terminate
/// a reconnect attempt is one of these kinds; the core never retries
/// internally — the caller decides whether to reconnect from scratch.
#[derive(Debug, Error)]
pub enum ReconnectError {
    /// The underlying byte stream failed to read, write, or close.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The send or poll timeout elapsed. The stream has already been closed
    /// by the time this is returned (closing is the only way to unblock a
    /// thread stuck in a blocking `read`).
    #[error("timeout waiting on {0}")]
    Timeout(&'static str),

    /// The peer sent something that violates the wire contract: an unknown
    /// class-id, an unsupported version, an inconsistent child-count, or a
    /// malformed hash.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A local invariant was violated (expected-lesson queue underflow,
    /// lesson-kind mismatch against the query it answers). This indicates a
    /// bug in this implementation, not a hostile or buggy peer.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    /// Cooperative cancellation requested by the caller or by a sibling task
    /// failing within the same work group.
    #[error("interrupted")]
    Interrupted,

    /// `TeacherTreeView::wait_until_ready` failed: the view's backing store
    /// could not reach a traversable state before reconnect could start.
    #[error("view failed to become ready: {0}")]
    ViewReadyFailed(String),
}

pub type Result<T> = std::result::Result<T, ReconnectError>;

impl From<serde_cbor::Error> for ReconnectError {
    fn from(e: serde_cbor::Error) -> Self {
        ReconnectError::Protocol(format!("(de)serialisation error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for ReconnectError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ReconnectError::Timeout("operation")
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ReconnectError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ReconnectError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "message pump has shut down",
        ))
    }
}
