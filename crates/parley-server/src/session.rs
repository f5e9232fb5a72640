//! Per-connection session driver.
//!
//! Owns one [`Connection`] and its [`Transport`] and runs until the
//! connection terminates. Three event sources are raced:
//!
//! - shutdown signal: teardown as for any other termination
//! - participant outbox: broadcasts from other sessions, sent to the peer
//! - transport: messages from the peer, fed to the state machine
//!
//! Actions are executed strictly in order, which is what puts a reply ahead
//! of the announcements that follow it.
//!
//! Sends race the shutdown signal too: a UDP send waiting on its confirmation
//! or a TCP write to a peer that stopped reading is abandoned on shutdown, and
//! the farewell that follows gets [`FAREWELL_GRACE`] at most.

use std::{collections::VecDeque, time::Duration};

use parley_core::{
    ChannelRegistry, CloseReason, Connection, ConnectionAction, Transport, TransportError,
};
use parley_proto::{Envelope, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Longest a send may take once shutdown has begun.
const FAREWELL_GRACE: Duration = Duration::from_millis(500);

/// Drives one connection to completion.
pub(crate) struct Session<T> {
    connection: Connection,
    transport: T,
    inbox: mpsc::UnboundedReceiver<Message>,
    registry: ChannelRegistry,
    shutdown: CancellationToken,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        connection: Connection,
        transport: T,
        inbox: mpsc::UnboundedReceiver<Message>,
        registry: ChannelRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self { connection, transport, inbox, registry, shutdown }
    }

    /// Run until the connection terminates.
    pub(crate) async fn run(mut self) {
        let participant = self.connection.participant().id();
        tracing::debug!(participant, peer = %self.transport.peer(), "session started");

        loop {
            let actions = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => self.connection.teardown(CloseReason::Shutdown),
                Some(message) = self.inbox.recv() => vec![ConnectionAction::Send(message)],
                received = self.transport.receive() => self.on_received(received),
            };

            if !self.execute(actions).await {
                break;
            }
        }

        tracing::debug!(participant, "session finished");
    }

    fn on_received(
        &mut self,
        received: Result<Option<Envelope>, TransportError>,
    ) -> Vec<ConnectionAction> {
        match received {
            Ok(Some(envelope)) => self.connection.handle(envelope),
            Ok(None) => self.connection.teardown(CloseReason::PeerClosed),
            Err(TransportError::Decode { id, source }) => {
                self.connection.handle_malformed(id, source)
            },
            Err(err) => self.connection.teardown(CloseReason::Failed(err.into())),
        }
    }

    /// Execute `actions` in order. Returns `false` once the transport has
    /// been closed.
    async fn execute(&mut self, actions: Vec<ConnectionAction>) -> bool {
        let sender = self.connection.participant().id();
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                ConnectionAction::Send(message) => match self.deliver(&message).await {
                    Some(Ok(())) => {},
                    Some(Err(TransportError::Encode(err))) => {
                        tracing::warn!(participant = sender, %err, "dropping unencodable message");
                    },
                    Some(Err(err)) if self.connection.is_terminated() => {
                        if matches!(err, TransportError::Unconfirmed { .. }) {
                            self.connection.participant().mark_inactive();
                        }
                        tracing::debug!(participant = sender, %err, "send failed during teardown");
                    },
                    // The rest of the batch assumed a live peer.
                    Some(Err(err)) => {
                        queue = self.connection.teardown(CloseReason::Failed(err.into())).into();
                    },
                    None if self.connection.is_terminated() => {
                        tracing::debug!(participant = sender, "farewell abandoned");
                    },
                    None => queue = self.connection.teardown(CloseReason::Shutdown).into(),
                },
                ConnectionAction::Broadcast { channel_id, message } => {
                    let delivered = self.registry.broadcast(&message, Some(sender), &channel_id);
                    tracing::trace!(participant = sender, channel = %channel_id, delivered, "broadcast");
                },
                ConnectionAction::Close(reason) => {
                    self.transport.close().await;
                    tracing::info!("Connection {} closed: {}", self.transport.peer(), reason);
                    return false;
                },
            }
        }

        !self.connection.is_terminated()
    }

    /// Send `message`, unless shutdown gets there first (`None`).
    async fn deliver(&mut self, message: &Message) -> Option<Result<(), TransportError>> {
        if self.shutdown.is_cancelled() {
            return tokio::time::timeout(FAREWELL_GRACE, self.transport.send(message)).await.ok();
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            sent = self.transport.send(message) => Some(sent),
        }
    }
}
