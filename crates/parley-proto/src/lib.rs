//! Parley wire protocol.
//!
//! One logical chat protocol spoken over two transports:
//!
//! - Text (TCP): one message per `\r\n`-terminated line, see [`text`]
//! - Binary (UDP): `[kind][id: u16 BE]` header followed by NUL-terminated
//!   fields, see [`binary`]
//!
//! Both codecs decode into the same typed [`Message`]. Decoding only checks
//! structure; the character classes and length bounds of individual fields
//! live in [`grammar`] and are applied by the connection state machine, which
//! decides whether a bad field earns a negative reply or a protocol error.
//!
//! # Components
//!
//! - [`Message`] / [`MessageKind`]: the typed message model
//! - [`Envelope`]: a binary message together with its message identifier
//! - [`DecodeError`] / [`EncodeError`]: codec failures
//! - [`GrammarError`]: field validation failures

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod binary;
mod error;
pub mod grammar;
mod message;
pub mod text;

pub use error::{DecodeError, EncodeError, GrammarError};
pub use message::{
    DEFAULT_CHANNEL, Envelope, Message, MessageId, MessageKind, SERVER_DISPLAY_NAME,
    UNASSIGNED_CHANNEL,
};
