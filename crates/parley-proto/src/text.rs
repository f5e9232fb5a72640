//! Line-oriented text codec (TCP transport).
//!
//! ```text
//! AUTH <username> AS <displayName> USING <secret>
//! JOIN <channelId> [AS <displayName>]
//! MSG FROM <displayName> IS <content>
//! ERR FROM <displayName> IS <content>
//! REPLY OK|NOK IS <content>
//! BYE
//! ```
//!
//! The kind is chosen by the first word of the line, matched ASCII
//! case-insensitively. Only the position of the keyword matters: a chat body
//! that happens to contain `AUTH` is still a MSG. Keywords inside the line
//! (`AS`, `USING`, `FROM`, `IS`) are matched case-insensitively as well.
//!
//! Decoding checks structure only, see [`crate::grammar`] for field rules.

use crate::{DecodeError, EncodeError, Message, MessageKind};

/// Longest accepted line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 65_535;

/// Line terminator appended on output.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Classify a line by its leading keyword.
pub fn classify(line: &str) -> Option<MessageKind> {
    let keyword = line.split_ascii_whitespace().next()?;
    [
        ("AUTH", MessageKind::Auth),
        ("JOIN", MessageKind::Join),
        ("MSG", MessageKind::Msg),
        ("ERR", MessageKind::Err),
        ("BYE", MessageKind::Bye),
        ("REPLY", MessageKind::Reply),
    ]
    .into_iter()
    .find(|(word, _)| keyword.eq_ignore_ascii_case(word))
    .map(|(_, kind)| kind)
}

/// Decode one line.
///
/// `line` excludes the `\n` terminator; a single trailing `\r` is stripped.
pub fn decode(line: &[u8]) -> Result<Message, DecodeError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.len() > MAX_LINE_LEN {
        return Err(DecodeError::LineTooLong { max: MAX_LINE_LEN });
    }
    let line = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidUtf8 { kind: None })?;

    match classify(line).ok_or(DecodeError::UnknownKind)? {
        MessageKind::Auth => decode_auth(line),
        MessageKind::Join => decode_join(line),
        MessageKind::Msg => decode_from(line, MessageKind::Msg).map(|(display_name, content)| {
            Message::Msg { display_name, content }
        }),
        MessageKind::Err => decode_from(line, MessageKind::Err).map(|(display_name, content)| {
            Message::Err { display_name, content }
        }),
        MessageKind::Reply => decode_reply(line),
        MessageKind::Bye => {
            if line.eq_ignore_ascii_case("BYE") {
                Ok(Message::Bye)
            } else {
                Err(DecodeError::Malformed { kind: MessageKind::Bye, reason: "BYE takes no fields" })
            }
        },
        MessageKind::Confirm => Err(DecodeError::UnknownKind),
    }
}

/// `AUTH <username> AS <displayName> USING <secret>`
fn decode_auth(line: &str) -> Result<Message, DecodeError> {
    let malformed = |reason| DecodeError::Malformed { kind: MessageKind::Auth, reason };

    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    let [_, username, as_kw, display_name, using_kw, secret] = tokens.as_slice() else {
        return Err(malformed("expected six tokens"));
    };
    if !as_kw.eq_ignore_ascii_case("AS") {
        return Err(malformed("expected AS"));
    }
    if !using_kw.eq_ignore_ascii_case("USING") {
        return Err(malformed("expected USING"));
    }

    Ok(Message::Auth {
        username: (*username).to_string(),
        display_name: (*display_name).to_string(),
        secret: (*secret).to_string(),
    })
}

/// `JOIN <channelId> [AS <displayName>]`
fn decode_join(line: &str) -> Result<Message, DecodeError> {
    let malformed = |reason| DecodeError::Malformed { kind: MessageKind::Join, reason };

    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    match tokens.as_slice() {
        [_, channel_id] => {
            Ok(Message::Join { channel_id: (*channel_id).to_string(), display_name: None })
        },
        [_, channel_id, as_kw, display_name] if as_kw.eq_ignore_ascii_case("AS") => {
            Ok(Message::Join {
                channel_id: (*channel_id).to_string(),
                display_name: Some((*display_name).to_string()),
            })
        },
        [_] => Err(malformed("missing channel id")),
        _ => Err(malformed("expected JOIN <channel> [AS <display name>]")),
    }
}

/// Strip `keyword` from the front of `s`, ignoring ASCII case.
fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &s[keyword.len()..])
}

/// `MSG FROM <displayName> IS <content>` and the ERR equivalent.
fn decode_from(line: &str, kind: MessageKind) -> Result<(String, String), DecodeError> {
    let malformed = |reason| DecodeError::Malformed { kind, reason };

    let rest = strip_keyword(line, kind.name())
        .and_then(|rest| strip_keyword(rest, " FROM "))
        .ok_or_else(|| malformed("expected FROM"))?;

    let (display_name, tail) = rest.split_once(' ').ok_or_else(|| malformed("expected IS"))?;
    let content = strip_keyword(tail, "IS ").ok_or_else(|| malformed("expected IS"))?;

    Ok((display_name.to_string(), content.to_string()))
}

/// `REPLY OK|NOK IS <content>`
fn decode_reply(line: &str) -> Result<Message, DecodeError> {
    let malformed = |reason| DecodeError::Malformed { kind: MessageKind::Reply, reason };

    let rest = strip_keyword(line, "REPLY ").ok_or_else(|| malformed("expected status"))?;
    let (status, tail) = rest.split_once(' ').ok_or_else(|| malformed("expected IS"))?;
    let success = if status.eq_ignore_ascii_case("OK") {
        true
    } else if status.eq_ignore_ascii_case("NOK") {
        false
    } else {
        return Err(malformed("status must be OK or NOK"));
    };
    let content = strip_keyword(tail, "IS ").ok_or_else(|| malformed("expected IS"))?;

    Ok(Message::Reply { success, ref_id: 0, content: content.to_string() })
}

fn field<'a>(kind: MessageKind, name: &'static str, value: &'a str) -> Result<&'a str, EncodeError> {
    if value.contains(['\r', '\n']) {
        Err(EncodeError::Delimiter { kind, field: name })
    } else {
        Ok(value)
    }
}

/// Encode `message` as one line, terminator included.
///
/// Fields containing CR or LF are refused rather than split across lines;
/// CONFIRM has no text form.
pub fn encode(message: &Message) -> Result<String, EncodeError> {
    let kind = message.kind();
    let body = match message {
        Message::Confirm { .. } => return Err(EncodeError::NoTextForm(kind)),
        Message::Reply { success, content, .. } => {
            let status = if *success { "OK" } else { "NOK" };
            format!("REPLY {status} IS {}", field(kind, "content", content)?)
        },
        Message::Auth { username, display_name, secret } => format!(
            "AUTH {} AS {} USING {}",
            field(kind, "username", username)?,
            field(kind, "display name", display_name)?,
            field(kind, "secret", secret)?
        ),
        Message::Join { channel_id, display_name: Some(display_name) } => format!(
            "JOIN {} AS {}",
            field(kind, "channel id", channel_id)?,
            field(kind, "display name", display_name)?
        ),
        Message::Join { channel_id, display_name: None } => {
            format!("JOIN {}", field(kind, "channel id", channel_id)?)
        },
        Message::Msg { display_name, content } | Message::Err { display_name, content } => {
            format!(
                "{} FROM {} IS {}",
                kind.name(),
                field(kind, "display name", display_name)?,
                field(kind, "content", content)?
            )
        },
        Message::Bye => "BYE".to_string(),
    };

    Ok(body + LINE_TERMINATOR)
}
