//! # Shroud Client
//!
//! Client library for shroud rendezvous servers.
//!
//! ## Features
//!
//! - PSK hello with retransmission and a doubling reply timeout
//! - Size-normalized, jittered, cover-padded session traffic
//! - Port hopping that keeps the session alive across hops
//! - Optional SOCKS5 routing
//!
//! ## Quick Start
//!
//! ```ignore
//! use shroud_client::{ClientConfig, ClientError, ShroudClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ClientError> {
//!     let config = ClientConfig::builder()
//!         .server_address("shroud.example.com:5684")
//!         .psk("client-1a2b", "00112233445566778899aabbccddeeff")
//!         .build()?;
//!
//!     let client = ShroudClient::connect(config).await?;
//!     client.send(b"Hello, shroud!".to_vec()).await?;
//!     let echoed = client.recv().await;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod errors;

pub use config::*;
pub use connection::*;
pub use errors::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::ShroudClient;
}

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use shroud_protocol::{ClientHandshake, Role, SessionId, SessionStatus};
use shroud_session::{
    ContinuityManager, DatagramTransport, EventSink, SessionHandle, SessionParams, SessionSnapshot,
    SocksTransport, UdpTransport,
};
use shroud_timing::DummyRate;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A connected shroud client owning one session
pub struct ShroudClient {
    config: ClientConfig,
    info: ConnectionInfo,
    manager: ContinuityManager,
    id: SessionId,
    handle: Mutex<SessionHandle>,
}

impl ShroudClient {
    /// Connect over UDP, or through the SOCKS5 proxy when enabled
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;

        let bind_ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| ClientError::InvalidAddress(config.bind_address.clone()))?;
        let transport: Arc<dyn DatagramTransport> = if config.socks_enabled {
            let proxy = config.resolve_socks_proxy()?;
            info!(proxy = %proxy, "Routing through SOCKS5 proxy");
            Arc::new(
                SocksTransport::new(proxy)
                    .with_timeout(Duration::from_secs(config.handshake_timeout_secs)),
            )
        } else {
            Arc::new(UdpTransport::new(bind_ip))
        };

        Self::connect_with(config, transport, EventSink::disabled()).await
    }

    /// Connect over `transport`, reporting to `events`
    pub async fn connect_with(
        config: ClientConfig,
        transport: Arc<dyn DatagramTransport>,
        events: EventSink,
    ) -> ClientResult<Self> {
        config.validate()?;
        let server = config.resolve_server_address()?;
        let mut handshake = ClientHandshake::new(config.credentials()?)?;
        let mut retry = HandshakeRetry::new(
            config.handshake_attempts,
            Duration::from_secs(config.handshake_timeout_secs),
        );

        debug!(server = %server, transport = transport.name(), "Connecting");
        let (outcome, epoch) = {
            let socket = transport.bind(0).await?;
            perform_handshake(socket.as_ref(), server, &mut handshake, &mut retry).await?
        };

        let manager =
            ContinuityManager::with_events(config.session.clone(), transport.clone(), events)?;
        let params = SessionParams::from_handshake(outcome, Role::Client, server.ip(), epoch);
        let handle = manager.open_session(params).await?;
        let id = handle.id();

        info!(
            session = %id,
            server = %server,
            attempts = retry.current_attempt(),
            "Connected to shroud server"
        );

        Ok(Self {
            info: ConnectionInfo {
                server_addr: server,
                connected_at: epoch,
                handshake_attempts: retry.current_attempt(),
                transport: transport.name(),
            },
            config,
            manager,
            id,
            handle: Mutex::new(handle),
        })
    }

    /// Get the session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get connection facts
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Get the server rendezvous address
    pub fn server_addr(&self) -> SocketAddr {
        self.info.server_addr
    }

    /// Get the session manager
    pub fn manager(&self) -> &ContinuityManager {
        &self.manager
    }

    /// Queue a payload for obfuscated transmission
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> ClientResult<()> {
        Ok(self.manager.send(self.id, payload).await?)
    }

    /// Next payload from the server; `None` once the session is gone
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.handle.lock().await.recv().await
    }

    /// Next payload if one is ready
    pub async fn try_recv(&self) -> Option<Vec<u8>> {
        self.handle.lock().await.try_recv()
    }

    /// Get session status
    pub async fn status(&self) -> ClientResult<SessionStatus> {
        Ok(self.manager.status(self.id).await?)
    }

    /// Get the latest session snapshot
    pub async fn snapshot(&self) -> ClientResult<SessionSnapshot> {
        Ok(self.manager.snapshot(self.id).await?)
    }

    /// Change the cover traffic rate
    pub async fn set_dummy_rate(&self, rate: DummyRate) -> ClientResult<()> {
        Ok(self.manager.set_dummy_rate(self.id, rate).await?)
    }

    /// Close the session, telling the server best-effort
    pub async fn close(&self) -> ClientResult<()> {
        self.manager.close(self.id).await?;
        info!(session = %self.id, "Disconnected from shroud server");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_server::{RendezvousServer, ServerConfig};
    use shroud_session::{MemoryNetwork, SessionConfig, SessionError};
    use std::net::Ipv4Addr;

    const KEY: &str = "00112233445566778899aabbccddeeff";
    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn session(hopping: bool) -> SessionConfig {
        SessionConfig::builder()
            .dummy_rate(0, 0)
            .randomized(10, 50, shroud_session::DelayDistributionKind::Uniform)
            .hopping(hopping)
            .hop_interval(5, 1)
            .overlap(2000, 1000)
            .build()
            .unwrap()
    }

    fn start_server(net: &MemoryNetwork, hopping: bool) -> Arc<RendezvousServer> {
        let config = ServerConfig::builder()
            .bind_address("10.0.0.1")
            .psk("client-01ab", KEY)
            .session(session(hopping))
            .build()
            .unwrap();
        let transport = Arc::new(net.host(SERVER));
        let server = Arc::new(
            RendezvousServer::with_transport(config, transport, EventSink::disabled()).unwrap(),
        );

        tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });
        tokio::spawn({
            let server = server.clone();
            async move {
                while let Some(mut handle) = server.accept().await {
                    let manager = server.manager().clone();
                    tokio::spawn(async move {
                        while let Some(payload) = handle.recv().await {
                            let _ = manager.send(handle.id(), payload).await;
                        }
                    });
                }
            }
        });
        server
    }

    fn client_config(hopping: bool) -> ClientConfig {
        ClientConfig::builder()
            .server_address("10.0.0.1:5684")
            .psk("client-01ab", KEY)
            .handshake_timeout(1)
            .session(session(hopping))
            .build()
            .unwrap()
    }

    async fn connect(net: &MemoryNetwork, config: ClientConfig) -> ClientResult<ShroudClient> {
        ShroudClient::connect_with(config, Arc::new(net.host(CLIENT)), EventSink::disabled()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_echo() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 0.0, 7);
        let server = start_server(&net, false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = connect(&net, client_config(false)).await.unwrap();
        assert_eq!(client.info().handshake_attempts, 1);
        assert_eq!(client.info().transport, "memory");
        assert_eq!(client.status().await.unwrap(), SessionStatus::Active);
        assert_eq!(server.stats().await.active_sessions, 1);

        for i in 0..10u8 {
            client.send(vec![i; 40 + i as usize]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(client.recv().await.unwrap(), vec![i; 40 + i as usize]);
        }
        assert!(client.try_recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_survives_hops() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 0.0, 7);
        let _server = start_server(&net, true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = connect(&net, client_config(true)).await.unwrap();
        for round in 0..6u8 {
            client.send(vec![round; 100]).await.unwrap();
            assert_eq!(client.recv().await.unwrap(), vec![round; 100]);
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        let snapshot = client.snapshot().await.unwrap();
        assert!(snapshot.hop >= 2);
        assert_eq!(snapshot.status, SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_through_loss() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 1.0, 7);
        let server = start_server(&net, false);

        tokio::spawn({
            let net = net.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                net.set_loss(0.0);
            }
        });

        // Attempts at 0s and 1s are lost, the one at 3s gets through
        let client = connect(&net, client_config(false)).await.unwrap();
        assert_eq!(client.info().handshake_attempts, 3);
        assert_eq!(server.stats().await.sessions_established, 1);

        client.send(b"after loss".to_vec()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"after loss");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_key_times_out() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 0.0, 7);
        let server = start_server(&net, false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let config = ClientConfig {
            psk_key: "ffeeddccbbaa99887766554433221100".into(),
            handshake_attempts: 2,
            ..client_config(false)
        };
        assert!(matches!(
            connect(&net, config).await,
            Err(ClientError::HandshakeTimeout { attempts: 2 })
        ));
        assert_eq!(server.stats().await.active_sessions, 0);
        assert!(server.stats().await.hellos_rejected >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_tears_down_both_ends() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 0.0, 7);
        let server = start_server(&net, false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let client = connect(&net, client_config(false)).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.status().await.unwrap(), SessionStatus::Closed);
        assert!(client.recv().await.is_none());
        assert!(matches!(
            client.send(b"late".to_vec()).await,
            Err(ClientError::Session(SessionError::SessionClosed))
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.stats().await.active_sessions, 0);
    }
}
