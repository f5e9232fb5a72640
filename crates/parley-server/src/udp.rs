//! Binary transport over UDP.
//!
//! ## Rendezvous
//!
//! Clients open a conversation on the server's well-known port. For every new
//! client endpoint the rendezvous loop binds a fresh socket on an ephemeral
//! port and hands it, with the first datagram, to a new session. Everything
//! the server sends from then on (starting with the CONFIRM of that first
//! datagram) leaves from the new port, which is how the client learns it.
//!
//! Datagrams that keep arriving on the well-known port from a known endpoint
//! (say a retransmitted AUTH whose CONFIRM was lost) are forwarded to the
//! existing session rather than starting a second one.
//!
//! ## Reliability
//!
//! - every inbound non-CONFIRM datagram is confirmed before the session sees
//!   it; confirmations are queued and flushed ahead of the next delivery
//! - a repeat of the last processed identifier is confirmed and dropped
//! - every outbound message waits for its CONFIRM and is retransmitted
//!   unchanged on timeout, up to the configured count
//! - datagrams arriving while a send waits are confirmed and queued

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
};

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::{
    ChannelRegistry, Connection, Transport, TransportError, TransportKind,
    reliability::{DuplicateFilter, OutboundIds, Outstanding, ReliabilityConfig, RetryDecision},
};
use parley_proto::{Envelope, Message, MessageId, MessageKind, binary};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{ServerError, session::Session};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_535;

/// What an inbound datagram turned out to be.
#[derive(Debug)]
enum Inbound {
    /// Confirmation of one of our messages
    Confirm(MessageId),
    /// Something for the session: a message, or a decode failure
    Deliver(Result<Envelope, TransportError>),
    /// Nothing to do (no header, or a duplicate)
    Ignore,
}

/// One client speaking the binary protocol on its own socket.
#[derive(Debug)]
pub struct FramedBinaryTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    config: ReliabilityConfig,
    forwarded: mpsc::UnboundedReceiver<Bytes>,
    ids: OutboundIds,
    duplicates: DuplicateFilter,
    /// Identifiers still owed a CONFIRM, oldest first
    confirms: VecDeque<MessageId>,
    queued: VecDeque<Result<Envelope, TransportError>>,
    buf: Vec<u8>,
}

impl FramedBinaryTransport {
    /// Talk to `peer` over `socket`.
    ///
    /// `forwarded` carries datagrams from `peer` that arrived elsewhere,
    /// i.e. on the rendezvous socket.
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        config: ReliabilityConfig,
        forwarded: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            socket,
            peer,
            config,
            forwarded,
            ids: OutboundIds::new(),
            duplicates: DuplicateFilter::new(),
            confirms: VecDeque::new(),
            queued: VecDeque::new(),
            buf: vec![0; MAX_DATAGRAM],
        }
    }

    /// Local address of the per-client socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Next datagram from the peer, from either source. Cancel-safe.
    async fn next_datagram(&mut self) -> Result<Bytes, TransportError> {
        loop {
            tokio::select! {
                Some(datagram) = self.forwarded.recv() => return Ok(datagram),
                received = self.socket.recv_from(&mut self.buf) => {
                    let (len, from) = received?;
                    if from == self.peer {
                        return Ok(Bytes::copy_from_slice(&self.buf[..len]));
                    }
                    tracing::debug!(%from, peer = %self.peer, "ignoring datagram from foreign endpoint");
                },
            }
        }
    }

    /// Owe a confirmation, deduplicate and decode one datagram. Never awaits.
    fn accept(&mut self, datagram: &[u8]) -> Inbound {
        let Ok((tag, id)) = binary::header(datagram) else {
            tracing::debug!(peer = %self.peer, len = datagram.len(), "datagram shorter than header");
            return Inbound::Ignore;
        };

        if tag == MessageKind::Confirm.tag() {
            return match binary::decode(datagram) {
                Ok(_) => {
                    tracing::info!("RECV {} | CONFIRM {}", self.peer, id);
                    Inbound::Confirm(id)
                },
                Err(err) => {
                    tracing::debug!(peer = %self.peer, %err, "malformed confirm");
                    Inbound::Ignore
                },
            };
        }

        self.confirms.push_back(id);
        if !self.duplicates.accept(id) {
            tracing::debug!(peer = %self.peer, id, "duplicate datagram");
            return Inbound::Ignore;
        }

        match binary::decode(datagram) {
            Ok(envelope) => {
                tracing::info!("RECV {} | {}", self.peer, envelope.message.kind());
                Inbound::Deliver(Ok(envelope))
            },
            Err(source) => {
                tracing::info!("RECV {} | malformed", self.peer);
                Inbound::Deliver(Err(TransportError::Decode { id, source }))
            },
        }
    }

    /// Send every owed CONFIRM.
    ///
    /// An identifier leaves the queue only once its datagram is out, so an
    /// interrupted flush resumes where it stopped.
    async fn flush_confirms(&mut self) {
        while let Some(&id) = self.confirms.front() {
            match binary::encode(&Envelope::confirm(id)) {
                Ok(frame) => match self.socket.send_to(&frame, self.peer).await {
                    Ok(_) => tracing::info!("SENT {} | CONFIRM {}", self.peer, id),
                    // The peer retransmits and gets another chance.
                    Err(err) => tracing::debug!(peer = %self.peer, %err, "confirm not sent"),
                },
                Err(err) => tracing::warn!(%err, "failed to encode confirm"),
            }
            self.confirms.pop_front();
        }
    }

    /// Wait until `deadline` for the CONFIRM of `outstanding`.
    async fn await_confirmation(
        &mut self,
        outstanding: &Outstanding,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        loop {
            self.flush_confirms().await;
            let Ok(datagram) = tokio::time::timeout_at(deadline, self.next_datagram()).await else {
                return Ok(false);
            };

            match self.accept(&datagram?) {
                Inbound::Confirm(ref_id) if outstanding.is_confirmed_by(ref_id) => return Ok(true),
                Inbound::Confirm(ref_id) => {
                    tracing::debug!(peer = %self.peer, ref_id, "confirm for unknown message");
                },
                Inbound::Deliver(inbound) => self.queued.push_back(inbound),
                Inbound::Ignore => {},
            }
        }
    }
}

#[async_trait]
impl Transport for FramedBinaryTransport {
    async fn receive(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            self.flush_confirms().await;
            if let Some(queued) = self.queued.pop_front() {
                return queued.map(Some);
            }

            let datagram = self.next_datagram().await?;
            match self.accept(&datagram) {
                Inbound::Deliver(inbound) => self.queued.push_back(inbound),
                Inbound::Confirm(ref_id) => {
                    tracing::debug!(peer = %self.peer, ref_id, "confirm with nothing outstanding");
                },
                Inbound::Ignore => {},
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let id = self.ids.allocate();
        let frame = binary::encode(&Envelope::new(id, message.clone()))?;
        let mut outstanding = Outstanding::new(id, &self.config);

        self.flush_confirms().await;
        self.socket.send_to(&frame, self.peer).await?;
        tracing::info!("SENT {} | {} {}", self.peer, message.kind(), id);

        loop {
            let deadline = Instant::now() + self.config.confirmation_timeout;
            if self.await_confirmation(&outstanding, deadline).await? {
                return Ok(());
            }

            match outstanding.on_timeout() {
                RetryDecision::Retransmit => {
                    tracing::debug!(
                        peer = %self.peer,
                        id,
                        attempt = outstanding.transmissions(),
                        "retransmitting"
                    );
                    self.socket.send_to(&frame, self.peer).await?;
                },
                RetryDecision::GiveUp => {
                    tracing::warn!(peer = %self.peer, id, "no confirmation, giving up");
                    return Err(TransportError::Unconfirmed {
                        id,
                        attempts: outstanding.transmissions(),
                    });
                },
            }
        }
    }

    async fn close(&mut self) {
        self.flush_confirms().await;
        self.forwarded.close();
        self.queued.clear();
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Whether a datagram from an unknown endpoint is worth a session.
///
/// Without a header there is no identifier to confirm, and a CONFIRM answers
/// nothing we sent. Anything else gets a session, even if it then fails to
/// decode, so the peer hears why.
fn opens_session(datagram: &[u8]) -> bool {
    binary::header(datagram).is_ok_and(|(tag, _)| tag != MessageKind::Confirm.tag())
}

/// Receive first contacts on the well-known port until shutdown.
pub(crate) async fn rendezvous_loop(
    socket: UdpSocket,
    bind_ip: IpAddr,
    config: ReliabilityConfig,
    registry: ChannelRegistry,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) -> Result<(), ServerError> {
    let mut sessions: HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                tracing::debug!("Rendezvous receive error: {}", e);
                continue;
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        let datagram = match sessions.get(&peer) {
            Some(forward) => match forward.send(datagram) {
                Ok(()) => continue,
                Err(mpsc::error::SendError(datagram)) => datagram,
            },
            None => datagram,
        };

        if !opens_session(&datagram) {
            tracing::debug!(%peer, len = datagram.len(), "ignoring first contact without a message");
            continue;
        }

        let client_socket = match UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await {
            Ok(client_socket) => client_socket,
            Err(e) => {
                tracing::error!("Failed to bind client socket for {}: {}", peer, e);
                continue;
            },
        };
        if let Ok(local) = client_socket.local_addr() {
            tracing::debug!(%peer, %local, "relocated UDP client");
        }

        let (forward, forwarded) = mpsc::unbounded_channel();
        if forward.send(datagram).is_err() {
            continue;
        }
        sessions.retain(|_, forward| !forward.is_closed());
        sessions.insert(peer, forward);

        let (participant, inbox) = registry.admit(peer, TransportKind::Binary);
        let session = Session::new(
            Connection::new(participant, registry.clone()),
            FramedBinaryTransport::new(client_socket, peer, config, forwarded),
            inbox,
            registry.clone(),
            shutdown.clone(),
        );
        tracker.spawn(session.run());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn pair(config: ReliabilityConfig) -> (FramedBinaryTransport, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        let (_forward, forwarded) = mpsc::unbounded_channel();
        let transport =
            FramedBinaryTransport::new(server, client.local_addr().unwrap(), config, forwarded);
        (transport, client)
    }

    fn fast() -> ReliabilityConfig {
        ReliabilityConfig { confirmation_timeout: Duration::from_millis(50), max_retransmissions: 2 }
    }

    async fn recv(client: &UdpSocket) -> Envelope {
        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        binary::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn receive_confirms_before_delivering() {
        let (mut transport, client) = pair(fast()).await;
        let auth = binary::encode(&Envelope::new(
            7,
            Message::Auth {
                username: "alice".to_string(),
                display_name: "Alice".to_string(),
                secret: "pw".to_string(),
            },
        ))
        .unwrap();
        client.send(&auth).await.unwrap();

        let envelope = transport.receive().await.unwrap().unwrap();
        assert_eq!(envelope.id, 7);
        assert_eq!(recv(&client).await, Envelope::confirm(7));
    }

    #[tokio::test]
    async fn duplicate_is_confirmed_but_delivered_once() {
        let (mut transport, client) = pair(fast()).await;
        let bye = binary::encode(&Envelope::new(3, Message::Bye)).unwrap();
        let msg = binary::encode(&Envelope::new(
            4,
            Message::Msg { display_name: "A".to_string(), content: "x".to_string() },
        ))
        .unwrap();
        client.send(&bye).await.unwrap();
        client.send(&bye).await.unwrap();
        client.send(&msg).await.unwrap();

        assert_eq!(transport.receive().await.unwrap().unwrap().id, 3);
        assert_eq!(transport.receive().await.unwrap().unwrap().id, 4);
        assert_eq!(recv(&client).await, Envelope::confirm(3));
        assert_eq!(recv(&client).await, Envelope::confirm(3));
        assert_eq!(recv(&client).await, Envelope::confirm(4));
    }

    #[tokio::test]
    async fn send_gives_up_after_all_attempts() {
        let (mut transport, client) = pair(fast()).await;

        let err = transport.send(&Message::Bye).await.unwrap_err();
        assert!(matches!(err, TransportError::Unconfirmed { id: 0, attempts: 3 }));

        for _ in 0..3 {
            assert_eq!(recv(&client).await, Envelope::new(0, Message::Bye));
        }
    }

    #[tokio::test]
    async fn send_returns_once_confirmed() {
        let (mut transport, client) = pair(fast()).await;
        let responder = tokio::spawn(async move {
            let frame = recv(&client).await;
            let confirm = binary::encode(&Envelope::confirm(frame.id)).unwrap();
            client.send(&confirm).await.unwrap();
            frame
        });

        transport.send(&Message::announcement("hi")).await.unwrap();
        let frame = responder.await.unwrap();
        assert_eq!(frame.id, 0);
        assert_eq!(frame.message, Message::announcement("hi"));
    }

    #[tokio::test]
    async fn forwarded_first_datagram_is_confirmed_from_fresh_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (forward, forwarded) = mpsc::unbounded_channel();
        let mut transport =
            FramedBinaryTransport::new(server, client.local_addr().unwrap(), fast(), forwarded);

        let auth = Envelope::new(
            0,
            Message::Auth {
                username: "alice".to_string(),
                display_name: "Alice".to_string(),
                secret: "pw".to_string(),
            },
        );
        forward.send(binary::encode(&auth).unwrap()).unwrap();
        assert_eq!(transport.receive().await.unwrap().unwrap(), auth);

        // the first thing the client hears is the CONFIRM, from the new socket
        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(binary::decode(&buf[..len]).unwrap(), Envelope::confirm(0));
    }

    #[tokio::test]
    async fn lost_confirmations_are_retransmitted_until_one_arrives() {
        let config = ReliabilityConfig {
            confirmation_timeout: Duration::from_millis(50),
            max_retransmissions: 3,
        };
        let (mut transport, client) = pair(config).await;
        let lost = 2;
        let responder = tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..=lost {
                frames.push(recv(&client).await);
            }
            let confirm = binary::encode(&Envelope::confirm(frames[0].id)).unwrap();
            client.send(&confirm).await.unwrap();

            let mut buf = [0u8; 64];
            let extra =
                tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
            (frames, extra.is_err())
        });

        transport.send(&Message::announcement("hi")).await.unwrap();
        let (frames, quiet_afterwards) = responder.await.unwrap();
        assert_eq!(frames.len(), lost + 1);
        assert!(frames.iter().all(|f| *f == Envelope::new(0, Message::announcement("hi"))));
        assert!(quiet_afterwards);
    }

    #[test]
    fn only_real_messages_open_sessions() {
        let auth = binary::encode(&Envelope::new(0, Message::Bye)).unwrap();
        let confirm = binary::encode(&Envelope::confirm(0)).unwrap();

        assert!(opens_session(&auth));
        // unknown kinds still get a session, which answers with ERR
        assert!(opens_session(&[0x42, 0, 0]));
        assert!(!opens_session(&confirm));
        assert!(!opens_session(&[0x02, 0]));
        assert!(!opens_session(&[]));
    }

    #[tokio::test]
    async fn short_datagram_is_ignored() {
        let (mut transport, client) = pair(fast()).await;
        client.send(&[0x04]).await.unwrap();
        client.send(&binary::encode(&Envelope::new(1, Message::Bye)).unwrap()).await.unwrap();

        assert_eq!(transport.receive().await.unwrap().unwrap().message, Message::Bye);
    }
}
