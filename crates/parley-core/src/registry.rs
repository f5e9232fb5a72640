//! Channel Registry
//!
//! The only cross-connection mutable state: which participants sit in which
//! channel.
//!
//! ## Locking
//!
//! One reader/writer lock guards the whole map. Membership changes take the
//! write lock; broadcast takes the read lock just long enough to copy the
//! recipient handles and enqueues outside it, so a slow peer never holds the
//! lock. Lock order is registry, then a participant's profile.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use parley_proto::{Message, UNASSIGNED_CHANNEL};
use tokio::sync::mpsc;

use crate::{Participant, ParticipantId, TransportKind};

type Channels = HashMap<String, Vec<Arc<Participant>>>;

/// Another authenticated participant already uses the username.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("username {0} is already connected")]
pub struct DuplicateUsername(pub String);

#[derive(Default)]
struct Inner {
    channels: RwLock<Channels>,
    next_id: AtomicU64,
}

/// Concurrency-safe map from channel id to members.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is recovered: every critical section leaves the map consistent.
    fn read(&self) -> RwLockReadGuard<'_, Channels> {
        self.inner.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Channels> {
        self.inner.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a participant for a newly observed peer and park it in the
    /// placeholder channel.
    pub fn admit(
        &self,
        peer: SocketAddr,
        transport: TransportKind,
    ) -> (Arc<Participant>, mpsc::UnboundedReceiver<Message>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (participant, inbox) = Participant::new(id, peer, transport);
        let participant = Arc::new(participant);

        place(&mut self.write(), &participant, UNASSIGNED_CHANNEL);
        tracing::debug!(participant = id, %peer, %transport, "participant admitted");

        (participant, inbox)
    }

    /// Move `participant` into `channel_id`, leaving whatever channel it was
    /// in. The channel is created if absent.
    pub fn add_or_move(&self, participant: &Arc<Participant>, channel_id: &str) {
        place(&mut self.write(), participant, channel_id);
    }

    /// Claim `username` for `participant` and move it into `channel_id`.
    ///
    /// The uniqueness check, the profile update and the move happen under a
    /// single write lock, so two connections racing for the same username
    /// cannot both win.
    pub fn authenticate(
        &self,
        participant: &Arc<Participant>,
        username: &str,
        display_name: &str,
        channel_id: &str,
    ) -> Result<(), DuplicateUsername> {
        let mut channels = self.write();
        if username_taken(&channels, username, Some(participant.id())) {
            return Err(DuplicateUsername(username.to_string()));
        }

        {
            let mut profile = participant.profile_mut();
            username.clone_into(&mut profile.username);
            display_name.clone_into(&mut profile.display_name);
            profile.authenticated = true;
        }
        place(&mut channels, participant, channel_id);
        Ok(())
    }

    /// Remove `participant` from its channel.
    ///
    /// Returns the channel it was removed from, or `None` if it was not
    /// registered. Safe to call repeatedly.
    pub fn remove(&self, participant: &Participant) -> Option<String> {
        let mut channels = self.write();
        let channel_id = participant.channel_id();
        detach(&mut channels, participant.id(), &channel_id).then_some(channel_id)
    }

    /// Whether any channel holds an authenticated participant named
    /// `username`.
    pub fn exists_authenticated_username(&self, username: &str) -> bool {
        username_taken(&self.read(), username, None)
    }

    /// Deliver `message` to every authenticated member of `channel_id` except
    /// `sender`.
    ///
    /// The placeholder channel is never a target. A recipient whose session
    /// is gone is skipped without affecting the others. Returns the number of
    /// recipients the message was queued for.
    pub fn broadcast(
        &self,
        message: &Message,
        sender: Option<ParticipantId>,
        channel_id: &str,
    ) -> usize {
        if channel_id == UNASSIGNED_CHANNEL {
            return 0;
        }

        let recipients: Vec<Arc<Participant>> = self
            .read()
            .get(channel_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|p| Some(p.id()) != sender && p.is_authenticated())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for recipient in recipients {
            if recipient.deliver(message.clone()) {
                delivered += 1;
            } else {
                tracing::debug!(participant = recipient.id(), "recipient gone, skipping delivery");
            }
        }
        delivered
    }

    /// Identifiers of the members of `channel_id`, in insertion order.
    pub fn members(&self, channel_id: &str) -> Vec<ParticipantId> {
        self.read()
            .get(channel_id)
            .map(|members| members.iter().map(|p| p.id()).collect())
            .unwrap_or_default()
    }

    /// Number of registered participants across all channels.
    pub fn participant_count(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }
}

fn username_taken(channels: &Channels, username: &str, except: Option<ParticipantId>) -> bool {
    channels.values().flatten().any(|p| {
        if Some(p.id()) == except {
            return false;
        }
        let profile = p.profile_mut();
        profile.authenticated && profile.username == username
    })
}

fn place(channels: &mut Channels, participant: &Arc<Participant>, channel_id: &str) {
    let mut profile = participant.profile_mut();
    detach(channels, participant.id(), &profile.channel_id);
    channel_id.clone_into(&mut profile.channel_id);
    channels.entry(channel_id.to_string()).or_default().push(Arc::clone(participant));
}

fn detach(channels: &mut Channels, id: ParticipantId, channel_id: &str) -> bool {
    let Some(members) = channels.get_mut(channel_id) else {
        return false;
    };
    let before = members.len();
    members.retain(|p| p.id() != id);
    let removed = members.len() != before;
    if members.is_empty() {
        channels.remove(channel_id);
    }
    removed
}
