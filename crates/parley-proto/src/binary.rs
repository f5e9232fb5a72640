//! Length-framed binary codec (UDP transport).
//!
//! # Wire format
//!
//! Every datagram starts with a fixed 3-byte header; integers are
//! big-endian.
//!
//! ```text
//! +--------+--------+--------+----------------------------
//! |  kind  |   message id    |  kind-specific fields ...
//! +--------+--------+--------+----------------------------
//! ```
//!
//! | Kind    | Tag    | Fields                                         |
//! |---------|--------|------------------------------------------------|
//! | CONFIRM | `0x00` | none (the header id is the confirmed id)       |
//! | REPLY   | `0x01` | `result: u8`, `ref_id: u16`, `content\0`       |
//! | AUTH    | `0x02` | `username\0`, `display_name\0`, `secret\0`     |
//! | JOIN    | `0x03` | `channel_id\0`, `display_name\0`               |
//! | MSG     | `0x04` | `display_name\0`, `content\0`                  |
//! | ERR     | `0xFE` | `display_name\0`, `content\0`                  |
//! | BYE     | `0xFF` | none                                           |
//!
//! A field ends at the next `0x00`. A missing terminator, an empty field,
//! or any byte after the final terminator is a decode failure.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{DecodeError, EncodeError, Envelope, Message, MessageId, MessageKind};

/// Size of the fixed header: kind tag plus message identifier.
pub const HEADER_LEN: usize = 3;

/// Size of the REPLY prefix that precedes its content field.
const REPLY_PREFIX_LEN: usize = 3;

/// Read the raw tag and message identifier from the header.
///
/// The reliability layer uses this to confirm a datagram before (and
/// regardless of whether) its body decodes.
pub fn header(buf: &[u8]) -> Result<(u8, MessageId), DecodeError> {
    match buf {
        [tag, hi, lo, ..] => Ok((*tag, u16::from_be_bytes([*hi, *lo]))),
        _ => Err(DecodeError::Truncated { len: buf.len() }),
    }
}

/// Cursor over the NUL-terminated fields of one datagram.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: MessageKind,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], pos: usize, kind: MessageKind) -> Self {
        Self { buf, pos, kind }
    }

    fn next(&mut self) -> Result<&'a str, DecodeError> {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::MissingTerminator { kind: self.kind })?;
        if end == 0 {
            return Err(DecodeError::EmptyField { kind: self.kind });
        }

        let field = std::str::from_utf8(&rest[..end])
            .map_err(|_| DecodeError::InvalidUtf8 { kind: Some(self.kind) })?;
        self.pos += end + 1;
        Ok(field)
    }

    fn next_owned(&mut self) -> Result<String, DecodeError> {
        self.next().map(str::to_string)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes { kind: self.kind })
        }
    }
}

/// Decode one datagram.
pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
    let (tag, id) = header(buf)?;
    let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;
    let mut fields = Fields::new(buf, HEADER_LEN, kind);

    let message = match kind {
        MessageKind::Confirm => Message::Confirm { ref_id: id },
        MessageKind::Bye => Message::Bye,
        MessageKind::Reply => {
            let [result, hi, lo] = buf
                .get(HEADER_LEN..HEADER_LEN + REPLY_PREFIX_LEN)
                .and_then(|prefix| <[u8; 3]>::try_from(prefix).ok())
                .ok_or(DecodeError::Truncated { len: buf.len() })?;
            let success = match result {
                0x01 => true,
                0x00 => false,
                _ => return Err(DecodeError::Malformed { kind, reason: "result must be 0 or 1" }),
            };
            fields.pos += REPLY_PREFIX_LEN;
            Message::Reply {
                success,
                ref_id: u16::from_be_bytes([hi, lo]),
                content: fields.next_owned()?,
            }
        },
        MessageKind::Auth => Message::Auth {
            username: fields.next_owned()?,
            display_name: fields.next_owned()?,
            secret: fields.next_owned()?,
        },
        MessageKind::Join => Message::Join {
            channel_id: fields.next_owned()?,
            display_name: Some(fields.next_owned()?),
        },
        MessageKind::Msg => Message::Msg {
            display_name: fields.next_owned()?,
            content: fields.next_owned()?,
        },
        MessageKind::Err => Message::Err {
            display_name: fields.next_owned()?,
            content: fields.next_owned()?,
        },
    };

    fields.finish()?;
    Ok(Envelope { id, message })
}

fn put_field(
    buf: &mut BytesMut,
    kind: MessageKind,
    name: &'static str,
    value: &str,
) -> Result<(), EncodeError> {
    if value.is_empty() {
        return Err(EncodeError::MissingField { kind, field: name });
    }
    if value.as_bytes().contains(&0) {
        return Err(EncodeError::Delimiter { kind, field: name });
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Encode one datagram.
///
/// For CONFIRM the header carries `ref_id` and `envelope.id` is ignored.
pub fn encode(envelope: &Envelope) -> Result<Bytes, EncodeError> {
    let message = &envelope.message;
    let kind = message.kind();
    let id = match message {
        Message::Confirm { ref_id } => *ref_id,
        _ => envelope.id,
    };

    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(kind.tag());
    buf.put_u16(id);

    match message {
        Message::Confirm { .. } | Message::Bye => {},
        Message::Reply { success, ref_id, content } => {
            buf.put_u8(u8::from(*success));
            buf.put_u16(*ref_id);
            put_field(&mut buf, kind, "content", content)?;
        },
        Message::Auth { username, display_name, secret } => {
            put_field(&mut buf, kind, "username", username)?;
            put_field(&mut buf, kind, "display name", display_name)?;
            put_field(&mut buf, kind, "secret", secret)?;
        },
        Message::Join { channel_id, display_name } => {
            put_field(&mut buf, kind, "channel id", channel_id)?;
            let display_name = display_name
                .as_deref()
                .ok_or(EncodeError::MissingField { kind, field: "display name" })?;
            put_field(&mut buf, kind, "display name", display_name)?;
        },
        Message::Msg { display_name, content } | Message::Err { display_name, content } => {
            put_field(&mut buf, kind, "display name", display_name)?;
            put_field(&mut buf, kind, "content", content)?;
        },
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_is_header_only() {
        let bytes = encode(&Envelope::confirm(0x0102)).unwrap();
        assert_eq!(bytes.as_ref(), &[0x00, 0x01, 0x02]);
        assert_eq!(decode(&bytes).unwrap(), Envelope::confirm(0x0102));
    }

    #[test]
    fn bye_is_header_only() {
        let bytes = encode(&Envelope::new(7, Message::Bye)).unwrap();
        assert_eq!(bytes.as_ref(), &[0xFF, 0x00, 0x07]);
    }

    #[test]
    fn reply_layout() {
        let bytes = encode(&Envelope::new(1, Message::reply(true, 0x0A0B, "ok"))).unwrap();
        assert_eq!(bytes.as_ref(), &[0x01, 0x00, 0x01, 0x01, 0x0A, 0x0B, b'o', b'k', 0x00]);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.message, Message::reply(true, 0x0A0B, "ok"));
    }

    #[test]
    fn msg_layout() {
        let msg = Message::Msg { display_name: "Al".to_string(), content: "hi".to_string() };
        let bytes = encode(&Envelope::new(0x1234, msg)).unwrap();
        assert_eq!(bytes.as_ref(), &[0x04, 0x12, 0x34, b'A', b'l', 0, b'h', b'i', 0]);
    }

    #[test]
    fn auth_decodes_three_fields() {
        let bytes = b"\x02\x00\x05alice\x00Alice\x00pw\x00";
        let env = decode(bytes).unwrap();
        assert_eq!(env.id, 5);
        assert_eq!(
            env.message,
            Message::Auth {
                username: "alice".to_string(),
                display_name: "Alice".to_string(),
                secret: "pw".to_string(),
            }
        );
    }

    #[test]
    fn missing_terminator() {
        assert_eq!(
            decode(b"\x04\x00\x01Alice\x00hello"),
            Err(DecodeError::MissingTerminator { kind: MessageKind::Msg })
        );
    }

    #[test]
    fn empty_field() {
        assert_eq!(
            decode(b"\x03\x00\x01\x00Bob\x00"),
            Err(DecodeError::EmptyField { kind: MessageKind::Join })
        );
    }

    #[test]
    fn trailing_bytes() {
        assert_eq!(
            decode(b"\x04\x00\x01Al\x00hi\x00junk"),
            Err(DecodeError::TrailingBytes { kind: MessageKind::Msg })
        );
        assert_eq!(
            decode(b"\xFF\x00\x01\x00"),
            Err(DecodeError::TrailingBytes { kind: MessageKind::Bye })
        );
    }

    #[test]
    fn header_errors() {
        assert_eq!(decode(b"\x04\x00"), Err(DecodeError::Truncated { len: 2 }));
        assert_eq!(decode(b"\x10\x00\x01"), Err(DecodeError::UnknownTag(0x10)));
        assert_eq!(header(b"\x10\x00\x01"), Ok((0x10, 1)));
    }

    #[test]
    fn reply_with_bad_result_byte() {
        assert!(matches!(
            decode(b"\x01\x00\x01\x07\x00\x00ok\x00"),
            Err(DecodeError::Malformed { kind: MessageKind::Reply, .. })
        ));
    }

    #[test]
    fn encode_rejects_nul_in_field() {
        let msg = Message::Msg { display_name: "Al".to_string(), content: "a\0b".to_string() };
        assert!(matches!(encode(&Envelope::new(0, msg)), Err(EncodeError::Delimiter { .. })));
    }

    #[test]
    fn join_needs_display_name_on_the_wire() {
        let join = Message::Join { channel_id: "general".to_string(), display_name: None };
        assert!(matches!(
            encode(&Envelope::new(0, join)),
            Err(EncodeError::MissingField { kind: MessageKind::Join, .. })
        ));
    }
}
