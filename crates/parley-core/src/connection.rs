//! Connection State Machine
//!
//! Per-connection authority over what a peer may do next.
//!
//! ## States
//!
//! ```text
//! Unauthenticated ──AUTH ok──▶ Authenticated(channel) ──BYE/ERR/violation──▶ Terminated
//!        │                          │  ▲
//!        │                          └──┘ JOIN ok (move channel)
//!        └──────────BYE/ERR/violation──────────────────────────────────────▶ Terminated
//! ```
//!
//! `Terminated` is absorbing: once there, every input produces no actions.
//!
//! ## Actions
//!
//! The machine mutates the registry itself (membership is in-memory) and
//! returns the I/O it wants performed as [`ConnectionAction`]s. The driver
//! must execute them in order: on a successful AUTH or JOIN the reply to the
//! actor comes before any announcement to the rest of the channel.

use std::{fmt, sync::Arc};

use parley_proto::{
    DEFAULT_CHANNEL, DecodeError, Envelope, Message, MessageId, MessageKind, UNASSIGNED_CHANNEL,
    grammar,
};

use crate::{ChannelRegistry, ConnectionError, Participant};

/// Texts the server sends on its own behalf.
pub mod texts {
    /// Positive reply to AUTH.
    pub const AUTH_OK: &str = "Authenticated successfully";
    /// Negative reply to a malformed AUTH.
    pub const AUTH_INVALID: &str = "Invalid auth format";
    /// Negative reply to AUTH with a username already in use.
    pub const AUTH_DUPLICATE: &str = "User already connected";
    /// Negative reply to a malformed JOIN.
    pub const JOIN_INVALID: &str = "Invalid join format";
    /// Content of the ERR sent before tearing down a connection.
    pub const PROTOCOL_ERROR: &str = "Invalid message format";

    /// Positive reply to JOIN.
    pub fn join_ok(channel_id: &str) -> String {
        format!("Joined {channel_id}")
    }

    /// Announcement of a participant entering a channel.
    pub fn joined(display_name: &str, channel_id: &str) -> String {
        format!("{display_name} has joined {channel_id}")
    }

    /// Announcement of a participant leaving a channel.
    pub fn left(display_name: &str, channel_id: &str) -> String {
        format!("{display_name} has left {channel_id}")
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, AUTH not yet accepted
    Unauthenticated,
    /// AUTH accepted; member of `channel_id`
    Authenticated {
        /// Current channel
        channel_id: String,
    },
    /// Torn down
    Terminated,
}

impl ConnectionState {
    fn describe(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated { .. } => "authenticated",
            Self::Terminated => "terminated",
        }
    }
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer sent BYE
    PeerBye,
    /// Peer closed the stream
    PeerClosed,
    /// Server is shutting down
    Shutdown,
    /// Connection failed
    Failed(ConnectionError),
}

impl CloseReason {
    /// Whether teardown should try to send the peer a BYE.
    pub fn sends_farewell(&self) -> bool {
        match self {
            Self::PeerBye | Self::PeerClosed => false,
            Self::Shutdown => true,
            Self::Failed(err) => err.peer_reachable(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerBye => f.write_str("peer said goodbye"),
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Shutdown => f.write_str("server shutting down"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// I/O requested by the state machine.
#[derive(Debug)]
pub enum ConnectionAction {
    /// Send a message to this connection's peer
    Send(Message),

    /// Deliver a message to the other authenticated members of a channel
    Broadcast {
        /// Target channel
        channel_id: String,
        /// Message to deliver
        message: Message,
    },

    /// Close the transport; always the last action of a teardown
    Close(CloseReason),
}

/// Per-connection protocol state machine.
pub struct Connection {
    participant: Arc<Participant>,
    registry: ChannelRegistry,
    state: ConnectionState,
}

impl Connection {
    /// Bind a state machine to a participant already admitted to `registry`.
    pub fn new(participant: Arc<Participant>, registry: ChannelRegistry) -> Self {
        Self { participant, registry, state: ConnectionState::Unauthenticated }
    }

    /// Participant this connection drives.
    pub fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Whether the connection has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.state == ConnectionState::Terminated
    }

    /// Process one decoded message from the peer.
    ///
    /// `envelope.id` is echoed as the referenced identifier of any reply.
    pub fn handle(&mut self, envelope: Envelope) -> Vec<ConnectionAction> {
        let Envelope { id, message } = envelope;
        let verdict = grammar::validate(&message);

        match (self.state.clone(), message) {
            (ConnectionState::Terminated, _) | (_, Message::Confirm { .. }) => Vec::new(),
            (ConnectionState::Unauthenticated, Message::Auth { username, display_name, .. }) => {
                if let Err(err) = verdict {
                    tracing::debug!(participant = self.participant.id(), %err, "invalid AUTH");
                    return vec![self.reply(false, id, texts::AUTH_INVALID)];
                }
                self.authenticate(id, &username, &display_name)
            },
            (
                ConnectionState::Authenticated { channel_id: old },
                Message::Join { channel_id, display_name },
            ) => {
                if let Err(err) = verdict {
                    tracing::debug!(participant = self.participant.id(), %err, "invalid JOIN");
                    return vec![self.reply(false, id, texts::JOIN_INVALID)];
                }
                if channel_id == UNASSIGNED_CHANNEL {
                    return vec![self.reply(false, id, texts::JOIN_INVALID)];
                }
                self.join(id, &old, channel_id, display_name.as_deref())
            },
            (ConnectionState::Authenticated { channel_id }, Message::Msg { display_name, content }) => {
                if let Err(err) = verdict {
                    return self.protocol_error((MessageKind::Msg, err).into());
                }
                self.participant.set_display_name(&display_name);
                vec![ConnectionAction::Broadcast {
                    channel_id,
                    message: Message::Msg { display_name, content },
                }]
            },
            (_, Message::Err { display_name, content }) => {
                if let Err(err) = verdict {
                    return self.protocol_error((MessageKind::Err, err).into());
                }
                self.participant.set_display_name(&display_name);
                self.teardown(CloseReason::Failed(ConnectionError::PeerReportedError {
                    display_name,
                    content,
                }))
            },
            (_, Message::Bye) => self.teardown(CloseReason::PeerBye),
            (state, message) => {
                self.protocol_error(ConnectionError::unexpected(message.kind(), state.describe()))
            },
        }
    }

    /// Process a frame that failed to decode.
    ///
    /// A malformed AUTH (before authentication) or JOIN (after) is answered
    /// with a negative reply; anything else is a protocol violation.
    pub fn handle_malformed(&mut self, id: MessageId, err: DecodeError) -> Vec<ConnectionAction> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::debug!(participant = self.participant.id(), %err, "undecodable frame");

        match (&self.state, err.kind()) {
            (ConnectionState::Unauthenticated, Some(MessageKind::Auth)) => {
                vec![self.reply(false, id, texts::AUTH_INVALID)]
            },
            (ConnectionState::Authenticated { .. }, Some(MessageKind::Join)) => {
                vec![self.reply(false, id, texts::JOIN_INVALID)]
            },
            _ => self.protocol_error(err.into()),
        }
    }

    /// Tear the connection down.
    ///
    /// Removes the participant from its channel, sends a best-effort BYE
    /// where the peer can still hear it, announces the departure and closes.
    /// Calling it again is a no-op.
    pub fn teardown(&mut self, reason: CloseReason) -> Vec<ConnectionAction> {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Terminated);
        if previous == ConnectionState::Terminated {
            return Vec::new();
        }

        self.registry.remove(&self.participant);
        self.participant.profile_mut().authenticated = false;
        if matches!(reason, CloseReason::Failed(ConnectionError::ReliabilityExhausted { .. })) {
            self.participant.mark_inactive();
        }
        tracing::debug!(
            participant = self.participant.id(),
            peer = %self.participant.peer(),
            %reason,
            "connection torn down"
        );

        let mut actions = Vec::with_capacity(3);
        if reason.sends_farewell() {
            actions.push(ConnectionAction::Send(Message::Bye));
        }
        if let ConnectionState::Authenticated { channel_id } = previous {
            let left = texts::left(&self.participant.display_name(), &channel_id);
            actions.push(ConnectionAction::Broadcast {
                channel_id,
                message: Message::announcement(left),
            });
        }
        actions.push(ConnectionAction::Close(reason));
        actions
    }

    fn reply(&self, success: bool, ref_id: MessageId, content: &str) -> ConnectionAction {
        ConnectionAction::Send(Message::reply(success, ref_id, content))
    }

    fn authenticate(
        &mut self,
        ref_id: MessageId,
        username: &str,
        display_name: &str,
    ) -> Vec<ConnectionAction> {
        if let Err(err) =
            self.registry.authenticate(&self.participant, username, display_name, DEFAULT_CHANNEL)
        {
            let err = ConnectionError::from(err);
            tracing::info!(participant = self.participant.id(), %err, "authentication rejected");
            return vec![self.reply(false, ref_id, texts::AUTH_DUPLICATE)];
        }

        self.state = ConnectionState::Authenticated { channel_id: DEFAULT_CHANNEL.to_string() };
        tracing::debug!(participant = self.participant.id(), username, "authenticated");

        let joined = texts::joined(display_name, DEFAULT_CHANNEL);
        vec![
            self.reply(true, ref_id, texts::AUTH_OK),
            ConnectionAction::Send(Message::announcement(joined.clone())),
            ConnectionAction::Broadcast {
                channel_id: DEFAULT_CHANNEL.to_string(),
                message: Message::announcement(joined),
            },
        ]
    }

    fn join(
        &mut self,
        ref_id: MessageId,
        old: &str,
        channel_id: String,
        display_name: Option<&str>,
    ) -> Vec<ConnectionAction> {
        if let Some(name) = display_name {
            self.participant.set_display_name(name);
        }
        let name = self.participant.display_name();

        self.registry.add_or_move(&self.participant, &channel_id);
        self.state = ConnectionState::Authenticated { channel_id: channel_id.clone() };
        tracing::debug!(participant = self.participant.id(), from = old, to = %channel_id, "joined");

        let joined = texts::joined(&name, &channel_id);
        vec![
            self.reply(true, ref_id, &texts::join_ok(&channel_id)),
            ConnectionAction::Send(Message::announcement(joined.clone())),
            ConnectionAction::Broadcast {
                channel_id: old.to_string(),
                message: Message::announcement(texts::left(&name, old)),
            },
            ConnectionAction::Broadcast { channel_id, message: Message::announcement(joined) },
        ]
    }

    fn protocol_error(&mut self, err: ConnectionError) -> Vec<ConnectionAction> {
        let mut actions = vec![ConnectionAction::Send(Message::server_error(texts::PROTOCOL_ERROR))];
        actions.extend(self.teardown(CloseReason::Failed(err)));
        actions
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("participant", &self.participant.id())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::TransportKind;

    fn connect(
        registry: &ChannelRegistry,
    ) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (participant, inbox) =
            registry.admit("127.0.0.1:5000".parse().unwrap(), TransportKind::Text);
        (Connection::new(participant, registry.clone()), inbox)
    }

    fn auth(username: &str) -> Envelope {
        Envelope::new(
            1,
            Message::Auth {
                username: username.to_string(),
                display_name: username.to_uppercase(),
                secret: "secret".to_string(),
            },
        )
    }

    fn sent(actions: &[ConnectionAction]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn auth_success_orders_reply_notice_broadcast() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);

        let actions = conn.handle(auth("alice"));

        assert!(matches!(
            &actions[0],
            ConnectionAction::Send(Message::Reply { success: true, ref_id: 1, content })
                if content == texts::AUTH_OK
        ));
        assert!(matches!(
            &actions[1],
            ConnectionAction::Send(m) if *m == Message::announcement("ALICE has joined default")
        ));
        assert!(matches!(
            &actions[2],
            ConnectionAction::Broadcast { channel_id, message }
                if channel_id == "default" && *message == Message::announcement("ALICE has joined default")
        ));
        assert_eq!(
            conn.state(),
            &ConnectionState::Authenticated { channel_id: "default".to_string() }
        );
    }

    #[test]
    fn invalid_auth_gets_nok_and_stays_unauthenticated() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);

        let actions = conn.handle(Envelope::new(
            4,
            Message::Auth {
                username: "bad name".to_string(),
                display_name: "X".to_string(),
                secret: "s".to_string(),
            },
        ));

        assert_eq!(sent(&actions), vec![&Message::reply(false, 4, texts::AUTH_INVALID)]);
        assert_eq!(conn.state(), &ConnectionState::Unauthenticated);
    }

    #[test]
    fn malformed_auth_frame_gets_nok() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);

        let actions = conn.handle_malformed(
            2,
            DecodeError::Malformed { kind: MessageKind::Auth, reason: "expected six tokens" },
        );

        assert_eq!(sent(&actions), vec![&Message::reply(false, 2, texts::AUTH_INVALID)]);
        assert!(!conn.is_terminated());
    }

    #[test]
    fn auth_twice_is_protocol_error() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(auth("alice"));

        assert_eq!(sent(&actions)[0], &Message::server_error(texts::PROTOCOL_ERROR));
        assert!(conn.is_terminated());
        assert!(!registry.exists_authenticated_username("alice"));
    }

    #[test]
    fn msg_before_auth_is_protocol_error() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);

        let actions = conn.handle(Envelope::new(
            0,
            Message::Msg { display_name: "A".to_string(), content: "hi".to_string() },
        ));

        assert_eq!(
            sent(&actions),
            vec![&Message::server_error(texts::PROTOCOL_ERROR), &Message::Bye]
        );
        assert!(matches!(actions.last(), Some(ConnectionAction::Close(CloseReason::Failed(_)))));
    }

    #[test]
    fn invalid_msg_sends_one_err_then_tears_down() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(Envelope::new(
            2,
            Message::Msg { display_name: "ALICE".to_string(), content: String::new() },
        ));

        let errs = sent(&actions).into_iter().filter(|m| m.kind() == MessageKind::Err).count();
        assert_eq!(errs, 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::Broadcast { message, .. }
                if *message == Message::announcement("ALICE has left default")
        )));
        let relayed = actions.iter().any(|a| {
            matches!(a, ConnectionAction::Broadcast { message: Message::Msg { display_name, .. }, .. }
                if display_name == "ALICE")
        });
        assert!(!relayed);
        assert!(conn.is_terminated());
    }

    #[test]
    fn valid_msg_broadcasts_and_updates_display_name() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let msg = Message::Msg { display_name: "Al".to_string(), content: "hello".to_string() };
        let actions = conn.handle(Envelope::new(3, msg.clone()));

        assert!(matches!(
            actions.as_slice(),
            [ConnectionAction::Broadcast { channel_id, message }]
                if channel_id == "default" && *message == msg
        ));
        assert_eq!(conn.participant().display_name(), "Al");
    }

    #[test]
    fn join_moves_and_announces() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(Envelope::new(
            5,
            Message::Join { channel_id: "general".to_string(), display_name: Some("Al".to_string()) },
        ));

        assert_eq!(
            sent(&actions),
            vec![
                &Message::reply(true, 5, "Joined general"),
                &Message::announcement("Al has joined general"),
            ]
        );
        let broadcasts: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Broadcast { channel_id, message } => Some((channel_id.as_str(), message)),
                _ => None,
            })
            .collect();
        assert_eq!(
            broadcasts,
            vec![
                ("default", &Message::announcement("Al has left default")),
                ("general", &Message::announcement("Al has joined general")),
            ]
        );
        assert_eq!(registry.members("general"), vec![conn.participant().id()]);
        assert!(registry.members("default").is_empty());
    }

    #[test]
    fn join_without_display_name_keeps_current() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        conn.handle(Envelope::new(
            5,
            Message::Join { channel_id: "general".to_string(), display_name: None },
        ));
        assert_eq!(conn.participant().display_name(), "ALICE");
    }

    #[test]
    fn join_placeholder_channel_is_rejected() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(Envelope::new(
            6,
            Message::Join { channel_id: "Unknown".to_string(), display_name: None },
        ));

        assert_eq!(sent(&actions), vec![&Message::reply(false, 6, texts::JOIN_INVALID)]);
        assert_eq!(
            conn.state(),
            &ConnectionState::Authenticated { channel_id: "default".to_string() }
        );
    }

    #[test]
    fn bye_tears_down_without_farewell() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(Envelope::new(9, Message::Bye));

        assert!(sent(&actions).is_empty());
        assert!(matches!(actions.last(), Some(ConnectionAction::Close(CloseReason::PeerBye))));
        assert_eq!(registry.participant_count(), 0);
    }

    #[test]
    fn peer_err_tears_down_without_err_reply() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.handle(Envelope::new(
            9,
            Message::Err { display_name: "ALICE".to_string(), content: "oops".to_string() },
        ));

        assert_eq!(sent(&actions), vec![&Message::Bye]);
        assert!(matches!(
            actions.last(),
            Some(ConnectionAction::Close(CloseReason::Failed(ConnectionError::PeerReportedError { .. })))
        ));
    }

    #[test]
    fn terminated_is_absorbing() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(Envelope::new(0, Message::Bye));

        assert!(conn.handle(auth("alice")).is_empty());
        assert!(conn.teardown(CloseReason::Shutdown).is_empty());
        assert!(conn.handle_malformed(0, DecodeError::UnknownKind).is_empty());
    }

    #[test]
    fn reliability_exhaustion_marks_inactive_and_skips_farewell() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);
        conn.handle(auth("alice"));

        let actions = conn.teardown(CloseReason::Failed(ConnectionError::ReliabilityExhausted {
            id: 3,
            attempts: 4,
        }));

        assert!(sent(&actions).is_empty());
        assert!(!conn.participant().is_active());
    }

    #[test]
    fn confirm_changes_nothing() {
        let registry = ChannelRegistry::new();
        let (mut conn, _inbox) = connect(&registry);

        assert!(conn.handle(Envelope::confirm(3)).is_empty());
        assert_eq!(conn.state(), &ConnectionState::Unauthenticated);
    }
}
