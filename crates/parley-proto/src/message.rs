//! Typed message model shared by both transports.

use std::fmt;

/// 16-bit identifier a binary sender assigns to each message.
pub type MessageId = u16;

/// Channel every participant lands in after authenticating.
pub const DEFAULT_CHANNEL: &str = "default";

/// Placeholder channel for connections that have not joined anything yet.
///
/// Never a broadcast target.
pub const UNASSIGNED_CHANNEL: &str = "Unknown";

/// Display name the server uses for its own announcements and errors.
pub const SERVER_DISPLAY_NAME: &str = "Server";

/// Message kinds with their binary tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Delivery confirmation (binary transport only)
    Confirm = 0x00,
    /// Reply to AUTH or JOIN
    Reply = 0x01,
    /// Authentication request
    Auth = 0x02,
    /// Channel change request
    Join = 0x03,
    /// Chat message
    Msg = 0x04,
    /// Error report
    Err = 0xFE,
    /// Graceful termination
    Bye = 0xFF,
}

impl MessageKind {
    /// Binary tag byte.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a binary tag byte.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Self::Confirm),
            0x01 => Some(Self::Reply),
            0x02 => Some(Self::Auth),
            0x03 => Some(Self::Join),
            0x04 => Some(Self::Msg),
            0xFE => Some(Self::Err),
            0xFF => Some(Self::Bye),
            _ => None,
        }
    }

    /// Upper-case protocol name, as used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Confirm => "CONFIRM",
            Self::Reply => "REPLY",
            Self::Auth => "AUTH",
            Self::Join => "JOIN",
            Self::Msg => "MSG",
            Self::Err => "ERR",
            Self::Bye => "BYE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A protocol message, independent of the transport that carried it.
///
/// # Security
///
/// - **Debug Redaction**: the `Debug` impl redacts the AUTH secret so that
///   tracing a message never leaks credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// Confirms delivery of the binary message with identifier `ref_id`.
    Confirm {
        /// Identifier being confirmed
        ref_id: MessageId,
    },

    /// Outcome of an AUTH or JOIN.
    Reply {
        /// `true` for `OK`, `false` for `NOK`
        success: bool,
        /// Identifier of the request this answers (binary only, `0` on text)
        ref_id: MessageId,
        /// Human-readable outcome
        content: String,
    },

    /// Authenticate as `username`.
    Auth {
        /// Unique login name
        username: String,
        /// Name shown to other participants
        display_name: String,
        /// Shared secret
        secret: String,
    },

    /// Move to another channel.
    Join {
        /// Target channel
        channel_id: String,
        /// New display name; text `JOIN` may omit it
        display_name: Option<String>,
    },

    /// Chat message for the sender's channel.
    Msg {
        /// Sender's display name
        display_name: String,
        /// Message body
        content: String,
    },

    /// Error report; ends the conversation.
    Err {
        /// Reporter's display name
        display_name: String,
        /// Error description
        content: String,
    },

    /// Graceful termination.
    Bye,
}

impl Message {
    /// Kind of this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Confirm { .. } => MessageKind::Confirm,
            Self::Reply { .. } => MessageKind::Reply,
            Self::Auth { .. } => MessageKind::Auth,
            Self::Join { .. } => MessageKind::Join,
            Self::Msg { .. } => MessageKind::Msg,
            Self::Err { .. } => MessageKind::Err,
            Self::Bye => MessageKind::Bye,
        }
    }

    /// Reply to the request identified by `ref_id`.
    pub fn reply(success: bool, ref_id: MessageId, content: impl Into<String>) -> Self {
        Self::Reply { success, ref_id, content: content.into() }
    }

    /// Chat message authored by the server.
    pub fn announcement(content: impl Into<String>) -> Self {
        Self::Msg { display_name: SERVER_DISPLAY_NAME.to_string(), content: content.into() }
    }

    /// Error authored by the server.
    pub fn server_error(content: impl Into<String>) -> Self {
        Self::Err { display_name: SERVER_DISPLAY_NAME.to_string(), content: content.into() }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirm { ref_id } => f.debug_struct("Confirm").field("ref_id", ref_id).finish(),
            Self::Reply { success, ref_id, content } => f
                .debug_struct("Reply")
                .field("success", success)
                .field("ref_id", ref_id)
                .field("content", content)
                .finish(),
            Self::Auth { username, display_name, secret } => f
                .debug_struct("Auth")
                .field("username", username)
                .field("display_name", display_name)
                .field("secret", &format!("<redacted {} bytes>", secret.len()))
                .finish(),
            Self::Join { channel_id, display_name } => f
                .debug_struct("Join")
                .field("channel_id", channel_id)
                .field("display_name", display_name)
                .finish(),
            Self::Msg { display_name, content } => f
                .debug_struct("Msg")
                .field("display_name", display_name)
                .field("content", content)
                .finish(),
            Self::Err { display_name, content } => f
                .debug_struct("Err")
                .field("display_name", display_name)
                .field("content", content)
                .finish(),
            Self::Bye => f.write_str("Bye"),
        }
    }
}

/// A binary message together with its header identifier.
///
/// For [`Message::Confirm`] the header identifier is the confirmed one, so
/// `id == ref_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Header message identifier
    pub id: MessageId,
    /// Decoded message
    pub message: Message,
}

impl Envelope {
    /// Wrap `message` under identifier `id`.
    pub const fn new(id: MessageId, message: Message) -> Self {
        Self { id, message }
    }

    /// Confirmation for identifier `ref_id`.
    pub const fn confirm(ref_id: MessageId) -> Self {
        Self { id: ref_id, message: Message::Confirm { ref_id } }
    }
}
