//! Connection error taxonomy.

use parley_proto::{DecodeError, GrammarError, MessageId, MessageKind};

use crate::{DuplicateUsername, TransportError};

/// Why a connection failed.
///
/// Every variant is contained to its own connection. Only `Grammar` earns the
/// peer an ERR frame; `DuplicateIdentity` is answered with a negative reply
/// and does not end the connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Frame failed to decode, a field failed validation, or the message is
    /// not legal in the current state
    #[error("protocol violation: {reason}")]
    Grammar {
        /// Kind of the offending message, when known
        kind: Option<MessageKind>,
        /// What was wrong
        reason: String,
    },

    /// Username already authenticated on another connection
    #[error(transparent)]
    DuplicateIdentity(#[from] DuplicateUsername),

    /// Send or receive failed at the socket level
    #[error("transport failure: {0}")]
    TransportFailure(#[source] TransportError),

    /// A reliable send went unconfirmed on every attempt
    #[error("message {id} unconfirmed after {attempts} attempts")]
    ReliabilityExhausted {
        /// Identifier of the abandoned message
        id: MessageId,
        /// Transmissions made
        attempts: u32,
    },

    /// Peer sent ERR
    #[error("peer reported error: {content}")]
    PeerReportedError {
        /// Peer's display name
        display_name: String,
        /// Peer's error text
        content: String,
    },
}

impl ConnectionError {
    /// Message of kind `kind` is not legal in the current state.
    pub(crate) fn unexpected(kind: MessageKind, state: &str) -> Self {
        Self::Grammar { kind: Some(kind), reason: format!("{kind} not allowed while {state}") }
    }

    /// Whether the peer can still be reached after this failure.
    pub fn peer_reachable(&self) -> bool {
        !matches!(self, Self::TransportFailure(_) | Self::ReliabilityExhausted { .. })
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(err: DecodeError) -> Self {
        Self::Grammar { kind: err.kind(), reason: err.to_string() }
    }
}

impl From<(MessageKind, GrammarError)> for ConnectionError {
    fn from((kind, err): (MessageKind, GrammarError)) -> Self {
        Self::Grammar { kind: Some(kind), reason: err.to_string() }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unconfirmed { id, attempts } => Self::ReliabilityExhausted { id, attempts },
            TransportError::Decode { source, .. } => source.into(),
            other => Self::TransportFailure(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfirmed_maps_to_reliability_exhausted() {
        let err = ConnectionError::from(TransportError::Unconfirmed { id: 4, attempts: 4 });
        assert!(matches!(err, ConnectionError::ReliabilityExhausted { id: 4, attempts: 4 }));
        assert!(!err.peer_reachable());
    }

    #[test]
    fn decode_maps_to_grammar_with_kind() {
        let err = ConnectionError::from(TransportError::Decode {
            id: 2,
            source: DecodeError::EmptyField { kind: MessageKind::Msg },
        });
        assert!(matches!(err, ConnectionError::Grammar { kind: Some(MessageKind::Msg), .. }));
        assert!(err.peer_reachable());
    }

    #[test]
    fn io_maps_to_transport_failure() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let err = ConnectionError::from(TransportError::Io(io));
        assert!(matches!(err, ConnectionError::TransportFailure(_)));
        assert!(!err.peer_reachable());
    }

    #[test]
    fn unexpected_message_display() {
        let err = ConnectionError::unexpected(MessageKind::Join, "unauthenticated");
        assert_eq!(err.to_string(), "protocol violation: JOIN not allowed while unauthenticated");
    }
}
