//! Fuzz target for [`Connection`] state machine
//!
//! Prevent relaying or joining without authentication.
//!
//! # Invariants
//!
//! - No transition FROM `Terminated` (absorbing state)
//! - Broadcast ONLY while authenticated, and only to the current channel
//! - `Close` is always the last action, and only on the way to `Terminated`
//! - At most one ERR per connection
//! - Registry never lists a terminated participant
//! - NEVER panic on unexpected kinds or malformed fields

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_core::{ChannelRegistry, Connection, ConnectionAction, ConnectionState, TransportKind};
use parley_proto::{DecodeError, Envelope, Message, text};

#[derive(Debug, Clone, Arbitrary)]
enum FuzzedMessage {
    Confirm(u16),
    Reply(bool, String),
    Auth(String, String, String),
    Join(String, Option<String>),
    Msg(String, String),
    Err(String, String),
    Bye,
    /// Raw line through the text decoder, malformed or not
    Line(Vec<u8>),
}

#[derive(Debug, Clone, Arbitrary)]
enum Event {
    Receive { id: u16, message: FuzzedMessage },
    Malformed { id: u16 },
    PeerClosed,
}

fuzz_target!(|events: Vec<Event>| {
    let registry = ChannelRegistry::new();
    let addr = "127.0.0.1:4567".parse().unwrap();
    let (participant, _inbox) = registry.admit(addr, TransportKind::Binary);
    let mut conn = Connection::new(participant, registry.clone());
    let mut errors_sent = 0;

    for event in events {
        let before = conn.state().clone();

        let actions = match event {
            Event::Receive { id, message } => match to_message(message) {
                Ok(message) => conn.handle(Envelope::new(id, message)),
                Err(err) => conn.handle_malformed(id, err),
            },
            Event::Malformed { id } => conn.handle_malformed(id, DecodeError::UnknownKind),
            Event::PeerClosed => conn.teardown(parley_core::CloseReason::PeerClosed),
        };

        if before == ConnectionState::Terminated {
            assert!(actions.is_empty(), "actions after termination: {actions:?}");
        }

        let last = actions.len().saturating_sub(1);
        for (i, action) in actions.iter().enumerate() {
            match action {
                ConnectionAction::Send(Message::Err { .. }) => errors_sent += 1,
                ConnectionAction::Send(_) => {},
                ConnectionAction::Broadcast { channel_id, .. } => {
                    assert!(!matches!(before, ConnectionState::Terminated));
                    if !conn.is_terminated() {
                        assert!(matches!(
                            conn.state(),
                            ConnectionState::Authenticated { .. }
                        ));
                    }
                    assert_ne!(channel_id, "Unknown");
                },
                ConnectionAction::Close(_) => {
                    assert_eq!(i, last);
                    assert!(conn.is_terminated());
                },
            }
        }
        assert!(errors_sent <= 1);

        if conn.is_terminated() {
            assert_eq!(registry.participant_count(), 0);
        }
    }
});

fn to_message(fuzzed: FuzzedMessage) -> Result<Message, DecodeError> {
    Ok(match fuzzed {
        FuzzedMessage::Confirm(ref_id) => Message::Confirm { ref_id },
        FuzzedMessage::Reply(success, content) => Message::reply(success, 0, content),
        FuzzedMessage::Auth(username, display_name, secret) => {
            Message::Auth { username, display_name, secret }
        },
        FuzzedMessage::Join(channel_id, display_name) => Message::Join { channel_id, display_name },
        FuzzedMessage::Msg(display_name, content) => Message::Msg { display_name, content },
        FuzzedMessage::Err(display_name, content) => Message::Err { display_name, content },
        FuzzedMessage::Bye => Message::Bye,
        FuzzedMessage::Line(bytes) => return text::decode(&bytes),
    })
}
