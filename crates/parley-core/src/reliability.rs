//! Reliability bookkeeping for the binary transport.
//!
//! The binary transport runs over datagrams, so it layers at-least-once
//! delivery on top: every outbound message gets an identifier, the peer
//! confirms it, and unconfirmed messages are retransmitted on a fixed
//! schedule. Inbound identifiers are confirmed on receipt and a repeat of the
//! most recently processed identifier is dropped.
//!
//! This module holds the state only. Timers and sockets live in the server.

use std::time::Duration;

use parley_proto::MessageId;

/// Default wait for a confirmation before retransmitting.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of retransmissions after the first attempt.
pub const DEFAULT_MAX_RETRANSMISSIONS: u8 = 3;

/// Server-wide retransmission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// How long to wait for a confirmation per attempt
    pub confirmation_timeout: Duration,
    /// Retransmissions allowed after the first send
    pub max_retransmissions: u8,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            max_retransmissions: DEFAULT_MAX_RETRANSMISSIONS,
        }
    }
}

impl ReliabilityConfig {
    /// Total transmissions of one message, first send included.
    pub fn attempts(&self) -> u32 {
        1 + u32::from(self.max_retransmissions)
    }
}

/// Allocates outbound message identifiers.
///
/// Starts at `0` and wraps after `u16::MAX`.
#[derive(Debug, Clone, Default)]
pub struct OutboundIds {
    next: MessageId,
}

impl OutboundIds {
    /// Start at `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next identifier.
    pub fn allocate(&mut self) -> MessageId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Drops repeats of the most recently processed inbound identifier.
#[derive(Debug, Clone, Default)]
pub struct DuplicateFilter {
    last: Option<MessageId>,
}

impl DuplicateFilter {
    /// Nothing seen yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` and report whether it should be processed.
    ///
    /// Only the previous identifier is remembered, matching a peer that
    /// retransmits one message until it is confirmed.
    pub fn accept(&mut self, id: MessageId) -> bool {
        if self.last == Some(id) {
            return false;
        }
        self.last = Some(id);
        true
    }
}

/// What to do when a confirmation wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the identical frame again
    Retransmit,
    /// Every attempt went unconfirmed
    GiveUp,
}

/// One message awaiting its confirmation.
#[derive(Debug, Clone)]
pub struct Outstanding {
    id: MessageId,
    sent: u32,
    limit: u32,
}

impl Outstanding {
    /// Track `id`, which has just been sent for the first time.
    pub fn new(id: MessageId, config: &ReliabilityConfig) -> Self {
        Self { id, sent: 1, limit: config.attempts() }
    }

    /// Identifier awaiting confirmation.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Transmissions so far, first send included.
    pub fn transmissions(&self) -> u32 {
        self.sent
    }

    /// Whether a CONFIRM for `ref_id` settles this message.
    pub fn is_confirmed_by(&self, ref_id: MessageId) -> bool {
        self.id == ref_id
    }

    /// The confirmation wait for the latest transmission expired.
    pub fn on_timeout(&mut self) -> RetryDecision {
        if self.sent < self.limit {
            self.sent += 1;
            RetryDecision::Retransmit
        } else {
            RetryDecision::GiveUp
        }
    }
}
