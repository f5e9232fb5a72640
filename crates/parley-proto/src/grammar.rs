//! Field grammar.
//!
//! | Field        | Pattern              |
//! |--------------|----------------------|
//! | username     | `[A-Za-z0-9-]+`      |
//! | channel id   | `[A-Za-z0-9-]+`      |
//! | secret       | `[A-Za-z0-9-]{1,120}`|
//! | display name | `[!-~]{1,20}`        |
//! | content      | `[\r\n -~]{1,1400}`  |

use crate::{GrammarError, Message};

/// Maximum display name length.
pub const MAX_DISPLAY_NAME_LEN: usize = 20;

/// Maximum secret length.
pub const MAX_SECRET_LEN: usize = 120;

/// Maximum content length.
pub const MAX_CONTENT_LEN: usize = 1400;

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

/// `[A-Za-z0-9-]+`
pub fn is_username(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_id_byte)
}

/// `[A-Za-z0-9-]+`
pub fn is_channel_id(s: &str) -> bool {
    is_username(s)
}

/// `[A-Za-z0-9-]{1,120}`
pub fn is_secret(s: &str) -> bool {
    s.len() <= MAX_SECRET_LEN && is_username(s)
}

/// `[!-~]{1,20}`
pub fn is_display_name(s: &str) -> bool {
    (1..=MAX_DISPLAY_NAME_LEN).contains(&s.len()) && s.bytes().all(|b| (b'!'..=b'~').contains(&b))
}

/// `[\r\n -~]{1,1400}`
pub fn is_content(s: &str) -> bool {
    (1..=MAX_CONTENT_LEN).contains(&s.len())
        && s.bytes().all(|b| matches!(b, b'\r' | b'\n' | b' '..=b'~'))
}

fn check(ok: bool, err: GrammarError) -> Result<(), GrammarError> {
    if ok { Ok(()) } else { Err(err) }
}

/// Validate every field of `message` against its pattern.
///
/// CONFIRM and BYE carry no fields and always pass.
pub fn validate(message: &Message) -> Result<(), GrammarError> {
    match message {
        Message::Confirm { .. } | Message::Bye => Ok(()),
        Message::Reply { content, .. } => check(is_content(content), GrammarError::Content),
        Message::Auth { username, display_name, secret } => {
            check(is_username(username), GrammarError::Username)?;
            check(is_display_name(display_name), GrammarError::DisplayName)?;
            check(is_secret(secret), GrammarError::Secret)
        },
        Message::Join { channel_id, display_name } => {
            check(is_channel_id(channel_id), GrammarError::ChannelId)?;
            match display_name {
                Some(name) => check(is_display_name(name), GrammarError::DisplayName),
                None => Ok(()),
            }
        },
        Message::Msg { display_name, content } | Message::Err { display_name, content } => {
            check(is_display_name(display_name), GrammarError::DisplayName)?;
            check(is_content(content), GrammarError::Content)
        },
    }
}
