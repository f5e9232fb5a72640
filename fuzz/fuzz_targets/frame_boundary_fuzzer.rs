//! Fuzz target for both wire codecs
//!
//! # Invariants
//!
//! - NEVER panic on arbitrary input, text or binary
//! - Whatever decodes and re-encodes decodes again to the same message
//! - A decode error never reports a kind the header did not name

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::{Envelope, MessageKind, binary, text};

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = binary::decode(data) {
        if let Ok(frame) = binary::encode(&envelope) {
            assert_eq!(binary::decode(&frame).unwrap(), envelope);
        }
    } else if let (Ok((tag, _)), Err(err)) = (binary::header(data), binary::decode(data)) {
        if let Some(kind) = err.kind() {
            assert_eq!(MessageKind::from_tag(tag), Some(kind));
        }
    }

    if let Ok(message) = text::decode(data) {
        if let Ok(line) = text::encode(&message) {
            let body = line.strip_suffix("\r\n").unwrap();
            assert_eq!(text::decode(body.as_bytes()).unwrap(), message);
        }
        // the same message also survives the binary form
        if let Ok(frame) = binary::encode(&Envelope::new(0, message.clone())) {
            assert_eq!(binary::decode(&frame).unwrap().message, message);
        }
    }
});
