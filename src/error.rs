use thiserror::Error;

/// Failure taxonomy shared by every subsystem of the connection core.
///
/// Handshakes map any of these into a `Failed` terminal state; established
/// channels decide per-kind whether the channel survives (see the channel
/// event loops in [`crate::coordinator`]).
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed or truncated wire message.
    #[error("decode error: {0}")]
    Decode(String),
    /// AEAD authentication failed, signature mismatch, or password mismatch.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// Legal encoding but illegal in the current handshake state.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// No pending descriptor or established channel for an incoming message.
    #[error("lookup miss: {0}")]
    LookupMiss(String),
    /// The peer closed mid-operation or the channel was torn down.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    /// Cipher, mode, or key-exchange value not recognized or not supported.
    #[error("configuration error: {0}")]
    Config(String),
    /// Message larger than the configured maximum.
    #[error("resource limit exceeded: {size} > {limit}")]
    ResourceExceeded { size: usize, limit: usize },
    /// A setup, inactivity, or discard timer expired.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Transport-level failure outside the protocol's control.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    /// True for errors that must close an established channel rather than
    /// being logged and skipped.
    pub fn closes_channel(&self) -> bool {
        matches!(
            self,
            NetError::Auth(_)
                | NetError::ResourceExceeded { .. }
                | NetError::ChannelClosed(_)
                | NetError::Io(_)
        )
    }
}
