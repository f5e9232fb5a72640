//! Parley chat relay server.
//!
//! Runs two transports side by side on the same port number, both feeding one
//! shared [`ChannelRegistry`]:
//!
//! - text lines over TCP ([`TextLineTransport`])
//! - binary datagrams over UDP with confirmations and retransmission
//!   ([`FramedBinaryTransport`])
//!
//! ## Architecture
//!
//! ```text
//! parley-server
//!   ├─ accept loop        (TCP listener, one session per stream)
//!   ├─ rendezvous loop    (UDP well-known port, one session per endpoint)
//!   └─ Session<T>         (drives a parley_core::Connection over T)
//! ```
//!
//! Every session is tracked, so [`Server::run`] returns only after all
//! clients have been told goodbye.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod session;
mod tcp;
mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub use error::ServerError;
use parley_core::{ChannelRegistry, reliability::ReliabilityConfig};
pub use tcp::TextLineTransport;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
pub use udp::FramedBinaryTransport;

/// Default port for both transports.
pub const DEFAULT_PORT: u16 = 4567;

/// Server configuration for the production runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRuntimeConfig {
    /// Address both listeners bind to
    pub listen_ip: IpAddr,
    /// Port both listeners bind to (0 picks one, handy in tests)
    pub listen_port: u16,
    /// UDP confirmation timeout and retry count
    pub reliability: ReliabilityConfig,
}

impl ServerRuntimeConfig {
    /// Socket address derived from ip and port.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            reliability: ReliabilityConfig::default(),
        }
    }
}

/// Bound but not yet running relay server.
pub struct Server {
    tcp: TcpListener,
    udp: UdpSocket,
    registry: ChannelRegistry,
    config: ServerRuntimeConfig,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind both listeners.
    ///
    /// With `listen_port` 0 the TCP listener picks a port and UDP binds the
    /// same number, so clients still find both transports on one port.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        if config.reliability.confirmation_timeout.is_zero() {
            return Err(ServerError::Config("confirmation timeout must be non-zero".to_string()));
        }

        let tcp = TcpListener::bind(config.listen_addr()).await?;
        let port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind(SocketAddr::new(config.listen_ip, port)).await?;

        Ok(Self {
            tcp,
            udp,
            registry: ChannelRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Local address of the TCP listener.
    pub fn tcp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Local address of the UDP rendezvous socket.
    pub fn udp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.udp.local_addr()?)
    }

    /// Registry shared by every session.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Token that stops the server when cancelled.
    ///
    /// Cancelling makes every session send its farewell and close, after
    /// which [`run`](Self::run) returns.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self { tcp, udp, registry, config, shutdown } = self;
        let tracker = TaskTracker::new();

        let result = tokio::try_join!(
            tcp::accept_loop(tcp, registry.clone(), shutdown.clone(), tracker.clone()),
            udp::rendezvous_loop(
                udp,
                config.listen_ip,
                config.reliability,
                registry,
                shutdown.clone(),
                tracker.clone(),
            ),
        );
        if result.is_err() {
            // Take the surviving loop and its sessions down with us.
            shutdown.cancel();
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("All sessions finished");

        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn both_transports_share_one_port() {
        let config = ServerRuntimeConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            ..Default::default()
        };
        let server = Server::bind(config).await.unwrap();
        assert_eq!(server.tcp_addr().unwrap().port(), server.udp_addr().unwrap().port());
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let config = ServerRuntimeConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            reliability: ReliabilityConfig {
                confirmation_timeout: Duration::ZERO,
                max_retransmissions: 3,
            },
        };
        assert!(matches!(Server::bind(config).await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn run_returns_after_shutdown() {
        let config = ServerRuntimeConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            ..Default::default()
        };
        let server = Server::bind(config).await.unwrap();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn default_listens_everywhere_on_4567() {
        let config = ServerRuntimeConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:4567".parse().unwrap());
    }
}
