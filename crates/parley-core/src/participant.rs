//! Connected clients.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use parley_proto::{Message, UNASSIGNED_CHANNEL};
use tokio::sync::mpsc;

/// Server-local participant identifier.
pub type ParticipantId = u64;

/// Which transport a participant is connected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Line-oriented text over TCP
    Text,
    /// Framed binary over UDP
    Binary,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("tcp"),
            Self::Binary => f.write_str("udp"),
        }
    }
}

/// Mutable identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Login name, empty until AUTH succeeds
    pub username: String,
    /// Name used in announcements
    pub display_name: String,
    /// Whether AUTH has succeeded
    pub authenticated: bool,
    /// Channel the participant currently sits in
    pub channel_id: String,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            username: String::new(),
            display_name: String::new(),
            authenticated: false,
            channel_id: UNASSIGNED_CHANNEL.to_string(),
        }
    }
}

/// One connected client.
///
/// Shared between its own session task and the [`ChannelRegistry`], which
/// hands out clones of the `Arc` when it computes broadcast recipients.
/// Deliveries go through an unbounded outbox drained by the session task, so
/// the session stays the only writer to the peer.
///
/// [`ChannelRegistry`]: crate::ChannelRegistry
pub struct Participant {
    id: ParticipantId,
    peer: SocketAddr,
    transport: TransportKind,
    profile: Mutex<Profile>,
    active: AtomicBool,
    outbox: mpsc::UnboundedSender<Message>,
}

impl Participant {
    /// Create a participant and the receiving end of its outbox.
    pub fn new(
        id: ParticipantId,
        peer: SocketAddr,
        transport: TransportKind,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let participant = Self {
            id,
            peer,
            transport,
            profile: Mutex::new(Profile::default()),
            active: AtomicBool::new(true),
            outbox,
        };
        (participant, inbox)
    }

    /// Server-local identifier.
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Remote endpoint.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Transport the participant is connected over.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    // No invariant spans a panic while the guard is held.
    pub(crate) fn profile_mut(&self) -> MutexGuard<'_, Profile> {
        self.profile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current profile.
    pub fn profile(&self) -> Profile {
        self.profile_mut().clone()
    }

    /// Current display name.
    pub fn display_name(&self) -> String {
        self.profile_mut().display_name.clone()
    }

    /// Replace the display name.
    pub fn set_display_name(&self, display_name: &str) {
        display_name.clone_into(&mut self.profile_mut().display_name);
    }

    /// Whether the participant has authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.profile_mut().authenticated
    }

    /// Channel the participant currently sits in.
    pub fn channel_id(&self) -> String {
        self.profile_mut().channel_id.clone()
    }

    /// Whether the peer is still considered reachable.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the peer unreachable.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Queue `message` for the session task.
    ///
    /// Returns `false` if the session has already gone away.
    pub fn deliver(&self, message: Message) -> bool {
        self.outbox.send(message).is_ok()
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .field("profile", &self.profile())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant() -> (Participant, mpsc::UnboundedReceiver<Message>) {
        Participant::new(1, "127.0.0.1:4000".parse().unwrap(), TransportKind::Text)
    }

    #[test]
    fn starts_unassigned_and_active() {
        let (p, _inbox) = participant();
        assert_eq!(p.channel_id(), "Unknown");
        assert!(!p.is_authenticated());
        assert!(p.is_active());
    }

    #[test]
    fn deliver_reaches_outbox() {
        let (p, mut inbox) = participant();
        assert!(p.deliver(Message::Bye));
        assert_eq!(inbox.try_recv().unwrap(), Message::Bye);
    }

    #[test]
    fn deliver_after_session_gone() {
        let (p, inbox) = participant();
        drop(inbox);
        assert!(!p.deliver(Message::Bye));
    }

    #[test]
    fn mark_inactive() {
        let (p, _inbox) = participant();
        p.mark_inactive();
        assert!(!p.is_active());
    }
}
