//! Error taxonomy for the exchange protocol
// (c) 2025 Ross Younger

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Everything that can go wrong during an exchange.
///
/// The variants are deliberately coarse: a caller decides what to do with a
/// connection (usually: discard it), not how to repair the protocol state.
/// Once any variant other than a handler-produced response has been raised,
/// the connection is poisoned and must not be reused.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The peer sent a token we were not expecting at this point in the
    /// conversation. Carries both sides of the disagreement so the log line
    /// is actually useful.
    #[error("protocol violation: expected {expected}, got {got:?}")]
    UnexpectedToken {
        /// What the state machine required here
        expected: &'static str,
        /// What actually arrived
        got: String,
    },

    /// Any other wire-format violation: a malformed identity line, an
    /// attachment block with an unknown id, a truncated attachment, trailing
    /// garbage inside an envelope.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer closed the stream while we were waiting for `PROCEED`.
    ///
    /// This is raised distinctly from [`ExchangeError::Protocol`] because in
    /// the target deployment a silent close at exactly this point almost
    /// always means the TLS layer above us rejected our certificate.
    #[error("connection closed while awaiting PROCEED (the remote likely rejected our credentials)")]
    Rejected,

    /// A failure during the client-side identify/hello/proceed sequence,
    /// wrapping the underlying cause. These failures happen before any
    /// request bytes were sent, so the operation is safe to retry on a
    /// fresh connection.
    #[error("failed to initialize connection: {0}")]
    ConnectionInit(#[source] Box<ExchangeError>),

    /// The transport failed underneath us.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An envelope could not be serialized.
    #[error("envelope encode failed: {0}")]
    Encode(#[from] bson::ser::Error),

    /// An envelope could not be deserialized.
    #[error("envelope decode failed: {0}")]
    Decode(#[from] bson::de::Error),
}

impl ExchangeError {
    /// Shorthand constructor for [`ExchangeError::Protocol`].
    pub(crate) fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Unwraps [`ExchangeError::ConnectionInit`] to the underlying cause,
    /// if any. Useful when a caller wants to react to [`ExchangeError::Rejected`]
    /// specifically, wherever it arose.
    #[must_use]
    pub fn root(&self) -> &ExchangeError {
        match self {
            ExchangeError::ConnectionInit(inner) => inner.root(),
            other => other,
        }
    }
}
