//! Codec and grammar error types.

use thiserror::Error;

use crate::MessageKind;

/// Errors from decoding a line or datagram.
///
/// Where the kind of the offending message could be determined it is
/// carried along, so the state machine can answer a malformed AUTH or JOIN
/// with a negative reply instead of a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Text line does not start with any known keyword.
    #[error("unrecognised message")]
    UnknownKind,

    /// Datagram tag byte is not a known kind.
    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    /// Datagram is shorter than its fixed header.
    #[error("truncated frame: {len} bytes")]
    Truncated {
        /// Bytes available
        len: usize,
    },

    /// Text line exceeds the maximum accepted length.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Maximum accepted line length
        max: usize,
    },

    /// Field bytes are not valid UTF-8.
    #[error("invalid UTF-8 in message")]
    InvalidUtf8 {
        /// Kind of the offending message, if known
        kind: Option<MessageKind>,
    },

    /// A NUL-terminated field has no terminator.
    #[error("missing field terminator in {kind} message")]
    MissingTerminator {
        /// Kind of the offending message
        kind: MessageKind,
    },

    /// A NUL-terminated field is empty.
    #[error("empty field in {kind} message")]
    EmptyField {
        /// Kind of the offending message
        kind: MessageKind,
    },

    /// Bytes follow the final terminator.
    #[error("trailing bytes after {kind} message")]
    TrailingBytes {
        /// Kind of the offending message
        kind: MessageKind,
    },

    /// Message structure does not match its kind's layout.
    #[error("malformed {kind} message: {reason}")]
    Malformed {
        /// Kind of the offending message
        kind: MessageKind,
        /// What was wrong
        reason: &'static str,
    },
}

impl DecodeError {
    /// Kind of the message that failed to decode, when known.
    pub const fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::UnknownKind
            | Self::UnknownTag(_)
            | Self::Truncated { .. }
            | Self::LineTooLong { .. } => None,
            Self::InvalidUtf8 { kind } => *kind,
            Self::MissingTerminator { kind }
            | Self::EmptyField { kind }
            | Self::TrailingBytes { kind }
            | Self::Malformed { kind, .. } => Some(*kind),
        }
    }
}

/// Errors from encoding a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The message kind has no representation on this transport.
    #[error("{0} has no text representation")]
    NoTextForm(MessageKind),

    /// A required field is absent.
    #[error("{kind} message is missing {field}")]
    MissingField {
        /// Kind being encoded
        kind: MessageKind,
        /// Absent field
        field: &'static str,
    },

    /// A field contains a byte that would break framing.
    #[error("{field} of {kind} message contains a frame delimiter")]
    Delimiter {
        /// Kind being encoded
        kind: MessageKind,
        /// Offending field
        field: &'static str,
    },
}

/// Field validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrammarError {
    /// Username outside `[A-Za-z0-9-]+`.
    #[error("invalid username")]
    Username,

    /// Display name outside `[!-~]{1,20}`.
    #[error("invalid display name")]
    DisplayName,

    /// Secret outside `[A-Za-z0-9-]{1,120}`.
    #[error("invalid secret")]
    Secret,

    /// Channel id outside `[A-Za-z0-9-]+`.
    #[error("invalid channel id")]
    ChannelId,

    /// Content outside `[\r\n -~]{1,1400}`.
    #[error("invalid message content")]
    Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_known_for_field_errors() {
        let err = DecodeError::EmptyField { kind: MessageKind::Auth };
        assert_eq!(err.kind(), Some(MessageKind::Auth));
    }

    #[test]
    fn kind_is_unknown_for_header_errors() {
        assert_eq!(DecodeError::Truncated { len: 2 }.kind(), None);
        assert_eq!(DecodeError::UnknownTag(0x42).kind(), None);
        assert_eq!(DecodeError::UnknownKind.kind(), None);
    }

    #[test]
    fn error_display() {
        let err = DecodeError::UnknownTag(0x42);
        assert_eq!(err.to_string(), "unknown message tag: 0x42");
    }
}
