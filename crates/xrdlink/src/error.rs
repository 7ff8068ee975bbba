use thiserror::Error;

/// Progress report from a non-failing step of the send, receive, or
/// handshake machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More readiness events are needed before the step can finish.
    Continue,
    /// The step completed.
    Done,
    /// The step should be invoked again immediately.
    Retry,
}

/// Recoverable stream errors. These are eligible for the bounded
/// reconnect logic in the fault handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("socket error (errno {0})")]
    Socket(i32),

    #[error("operation timed out")]
    SocketTimeout,

    #[error("connection error")]
    ConnectionError,

    #[error("stream disconnected")]
    StreamDisconnect,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Fatal errors. These bypass retry entirely: the stream goes to
/// `Error` and every pending handler is failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error("poller registration failure")]
    PollerError,

    #[error("unable to read socket options")]
    SocketOptError,
}

/// A stream fault, tagged by severity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error(transparent)]
    Recoverable(#[from] LinkError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl Fault {
    /// Whether this fault must bypass the retry logic.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Fatal(_))
    }

    /// Builds a recoverable socket fault from an I/O error, preserving
    /// the OS errno when one is available.
    pub fn from_io(err: &std::io::Error) -> Self {
        Fault::Recoverable(LinkError::Socket(err.raw_os_error().unwrap_or(0)))
    }
}

/// Result of one step of the stream machinery.
pub type StreamResult<T> = std::result::Result<T, Fault>;

/// Terminal status delivered to an outbound message's handler.
pub type SendOutcome = std::result::Result<(), Fault>;
