//! Error kinds shared by every layer of the crate.
//!
//! Construction-time validation failures are returned synchronously;
//! runtime transport failures are reported through event handlers and the
//! reconnection state machines; per-call failures (publish, ack) surface
//! through the returned `Result` of the call itself.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MqError>;

/// Errors of the messaging layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MqError {
    /// Malformed options, out-of-range numerics, a wrong connection family
    /// at queue construction, or a wrong host scheme.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation requires `Connected` state but the queue or the
    /// connection is not there.
    #[error("not connected")]
    NotConnected,

    /// `send_msg` was called on a receiver queue.
    #[error("queue is a receiver")]
    QueueIsReceiver,

    /// A receiver queue was asked to connect without a message handler.
    #[error("no message handler")]
    NoMsgHandler,

    /// Broker-reported I/O or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An external collaborator (auth service, management API) is
    /// unreachable.
    #[error("resource unavailable: {0}")]
    RscUnavailable(String),
}

impl MqError {
    /// Create an `InvalidArgument` error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a `Transport` error.
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }
}

impl From<lapin::Error> for MqError {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rumqttc::v5::ClientError> for MqError {
    fn from(err: rumqttc::v5::ClientError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rumqttc::v5::ConnectionError> for MqError {
    fn from(err: rumqttc::v5::ConnectionError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            MqError::invalid_argument("prefetch out of range").to_string(),
            "invalid argument: prefetch out of range"
        );
        assert_eq!(MqError::NotConnected.to_string(), "not connected");
        assert_eq!(MqError::QueueIsReceiver.to_string(), "queue is a receiver");
        assert_eq!(MqError::NoMsgHandler.to_string(), "no message handler");
        assert_eq!(
            MqError::transport("connection reset").to_string(),
            "transport error: connection reset"
        );
    }

    #[test]
    fn test_constructor_helpers() {
        assert!(matches!(
            MqError::invalid_argument("x"),
            MqError::InvalidArgument(_)
        ));
        assert!(matches!(MqError::transport("x"), MqError::Transport(_)));
    }
}
