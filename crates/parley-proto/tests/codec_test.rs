//! Codec property tests
//!
//! Both transports must carry AUTH, JOIN and MSG without losing any field,
//! and neither decoder may panic on arbitrary input.

use parley_proto::{Envelope, Message, MessageKind, binary, grammar, text};
use proptest::prelude::*;

fn username() -> impl Strategy<Value = String> {
    "[A-Za-z0-9-]{1,32}"
}

fn display_name() -> impl Strategy<Value = String> {
    "[!-~]{1,20}"
}

fn secret() -> impl Strategy<Value = String> {
    "[A-Za-z0-9-]{1,120}"
}

/// Content without line breaks, which the text transport cannot carry.
fn line_content() -> impl Strategy<Value = String> {
    "[ -~]{1,200}"
}

fn content() -> impl Strategy<Value = String> {
    "[\r\n -~]{1,200}"
}

fn auth() -> impl Strategy<Value = Message> {
    (username(), display_name(), secret()).prop_map(|(username, display_name, secret)| {
        Message::Auth { username, display_name, secret }
    })
}

fn join() -> impl Strategy<Value = Message> {
    (username(), display_name()).prop_map(|(channel_id, display_name)| Message::Join {
        channel_id,
        display_name: Some(display_name),
    })
}

proptest! {
    #[test]
    fn text_round_trip(
        message in prop_oneof![
            auth(),
            join(),
            username().prop_map(|channel_id| Message::Join { channel_id, display_name: None }),
            (display_name(), line_content())
                .prop_map(|(display_name, content)| Message::Msg { display_name, content }),
        ]
    ) {
        let line = text::encode(&message).unwrap();
        prop_assert!(line.ends_with("\r\n"));

        let body = line.strip_suffix('\n').unwrap();
        let decoded = text::decode(body.as_bytes()).unwrap();
        prop_assert_eq!(&decoded, &message);
        prop_assert_eq!(grammar::validate(&decoded), Ok(()));
    }

    #[test]
    fn binary_round_trip(
        id in any::<u16>(),
        message in prop_oneof![
            auth(),
            join(),
            (display_name(), content())
                .prop_map(|(display_name, content)| Message::Msg { display_name, content }),
        ]
    ) {
        let envelope = Envelope::new(id, message);
        let bytes = binary::encode(&envelope).unwrap();
        prop_assert_eq!(bytes[0], envelope.message.kind().tag());
        prop_assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), id);

        let decoded = binary::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn binary_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = binary::decode(&bytes);
    }

    #[test]
    fn text_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = text::decode(&bytes);
    }

    #[test]
    fn msg_body_never_changes_kind(body in line_content()) {
        let line = format!("MSG FROM Alice IS {body}");
        let decoded = text::decode(line.as_bytes()).unwrap();
        prop_assert_eq!(decoded.kind(), MessageKind::Msg);
    }
}

#[test]
fn truncated_binary_auth_keeps_its_kind() {
    let bytes = binary::encode(&Envelope::new(
        3,
        Message::Auth {
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            secret: "pw".to_string(),
        },
    ))
    .unwrap();

    for cut in binary::HEADER_LEN..bytes.len() {
        let err = binary::decode(&bytes[..cut]).unwrap_err();
        assert_eq!(err.kind(), Some(MessageKind::Auth), "cut at {cut}");
    }
}
