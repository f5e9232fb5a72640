//! Text transport over TCP.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::BytesMut;
use parley_core::{ChannelRegistry, Connection, Transport, TransportError, TransportKind};
use parley_proto::{DecodeError, Envelope, Message, text};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{ServerError, session::Session};

/// Read chunk reserved ahead of each socket read.
const READ_CHUNK: usize = 4096;

/// One client speaking the line protocol.
///
/// Bytes are accumulated in an owned buffer until a `\n` shows up, so an
/// interrupted [`receive`](Transport::receive) loses nothing.
#[derive(Debug)]
pub struct TextLineTransport {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
}

impl TextLineTransport {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer, buffer: BytesMut::with_capacity(READ_CHUNK) }
    }

    /// Split the next complete line off the buffer, terminator removed.
    fn next_line(&mut self) -> Option<BytesMut> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(end + 1);
        line.truncate(end);
        Some(line)
    }
}

#[async_trait]
impl Transport for TextLineTransport {
    async fn receive(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            if let Some(line) = self.next_line() {
                let message = text::decode(&line).map_err(|source| {
                    tracing::info!("RECV {} | malformed", self.peer);
                    TransportError::Decode { id: 0, source }
                })?;
                tracing::info!("RECV {} | {}", self.peer, message.kind());
                return Ok(Some(Envelope::new(0, message)));
            }

            // Allow for the optional `\r` before the terminator.
            if self.buffer.len() > text::MAX_LINE_LEN + 1 {
                self.buffer.clear();
                return Err(TransportError::Decode {
                    id: 0,
                    source: DecodeError::LineTooLong { max: text::MAX_LINE_LEN },
                });
            }

            self.buffer.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(peer = %self.peer, "discarding unterminated trailing line");
                }
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let line = text::encode(message)?;
        self.stream.write_all(line.as_bytes()).await?;
        tracing::info!("SENT {} | {}", self.peer, message.kind());
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(peer = %self.peer, %err, "shutdown failed");
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Accept TCP clients until shutdown, one session task each.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    registry: ChannelRegistry,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) -> Result<(), ServerError> {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted TCP connection");
                let (participant, inbox) = registry.admit(peer, TransportKind::Text);
                let session = Session::new(
                    Connection::new(participant, registry.clone()),
                    TextLineTransport::new(stream, peer),
                    inbox,
                    registry.clone(),
                    shutdown.clone(),
                );
                tracker.spawn(session.run());
            },
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            },
        }
    }
}
