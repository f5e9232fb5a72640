//! Transport abstraction.
//!
//! One duplex message stream per client. The connection logic is written once
//! against [`Transport`]; the server provides a text/TCP and a binary/UDP
//! implementation.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use parley_proto::{DecodeError, EncodeError, Envelope, Message, MessageId};

/// Errors surfaced by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Inbound bytes did not decode; the transport itself is still usable
    #[error("decode error in message {id}: {source}")]
    Decode {
        /// Identifier of the offending message, `0` where the transport has
        /// none
        id: MessageId,
        /// Decoder failure
        #[source]
        source: DecodeError,
    },

    /// Outbound message has no representation on this transport
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A reliable send went unconfirmed on every attempt
    #[error("message {id} unconfirmed after {attempts} attempts")]
    Unconfirmed {
        /// Identifier of the abandoned message
        id: MessageId,
        /// Transmissions made
        attempts: u32,
    },
}

/// Duplex message stream to one client.
///
/// `receive` must be cancel-safe: the session driver races it against the
/// participant's outbox and the shutdown signal.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next message from the peer.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream. The envelope
    /// identifier is `0` on transports without message identifiers.
    async fn receive(&mut self) -> Result<Option<Envelope>, TransportError>;

    /// Deliver `message` to the peer, reliably where the transport requires
    /// it.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Release the underlying resources. Errors are swallowed.
    async fn close(&mut self);

    /// Remote endpoint.
    fn peer(&self) -> SocketAddr;
}
