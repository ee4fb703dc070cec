use thiserror::Error;

/// Error taxonomy for the real-time acquisition client.
///
/// Every failure surfaces synchronously at the call that triggered it;
/// nothing is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// The acquisition server was unreachable, or did not accept the
    /// connection within the configured timeout.
    #[error("connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    /// The server sent something the protocol does not allow: a malformed
    /// or truncated block, an unexpected response code, an unsupported data
    /// type, or no header within `wait_max`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session was closed (explicitly, or because the transport died)
    /// while a blocking retrieval was still pending, or an operation was
    /// attempted on an already-closed session.
    #[error("session closed")]
    SessionClosed,

    /// A caller-supplied parameter can never be satisfied: zero-length
    /// epoch, an epoch request larger than the ring capacity, an FFT
    /// window longer than the epoch, an empty frequency range, an empty
    /// channel selection.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
