//! # Shroud Server
//!
//! Rendezvous server hosting shroud sessions.
//!
//! A client's PSK hello arrives on the fixed rendezvous port; the reply
//! dictates the hop parameters and from then on the session lives on
//! hopped port pairs managed by a [`ContinuityManager`].
//!
//! ```text
//!   ClientHello ──► rendezvous port ──► ServerHandshake ──► open_session
//!                         │                                    │
//!                         └──── ServerHello ◄──────────────────┘
//!                                               SessionHandle ──► accept()
//! ```

pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::{RendezvousServer, ServerStats};
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shroud_protocol::{
    hello_type, ClientHello, HelloType, Role, ServerHandshake, MAX_DATAGRAM_SIZE,
};
use shroud_session::{
    ContinuityManager, DatagramTransport, EventSink, SessionHandle, SessionParams, UdpTransport,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rendezvous server
pub struct RendezvousServer {
    config: ServerConfig,
    transport: Arc<dyn DatagramTransport>,
    manager: ContinuityManager,
    handshake: Mutex<ServerHandshake>,
    accepted_tx: mpsc::UnboundedSender<SessionHandle>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<SessionHandle>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    established: AtomicU64,
    rejected: AtomicU64,
}

impl RendezvousServer {
    /// Create a server on plain UDP
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let transport = Arc::new(UdpTransport::new(config.bind_ip()?));
        Self::with_transport(config, transport, EventSink::disabled())
    }

    /// Create a server on `transport`, reporting to `events`
    pub fn with_transport(
        config: ServerConfig,
        transport: Arc<dyn DatagramTransport>,
        events: EventSink,
    ) -> ServerResult<Self> {
        config.validate()?;

        let handshake = ServerHandshake::new(
            config.credentials()?,
            config.session.hop_parameters()?,
            config.max_time_drift_secs,
            Duration::from_secs(config.handshake_timeout_secs),
        )?;
        let manager =
            ContinuityManager::with_events(config.session.clone(), transport.clone(), events)?;
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            transport,
            manager,
            handshake: Mutex::new(handshake),
            accepted_tx,
            accepted_rx: Mutex::new(accepted_rx),
            running: AtomicBool::new(false),
            shutdown,
            established: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the session manager
    pub fn manager(&self) -> &ContinuityManager {
        &self.manager
    }

    /// Check if server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next newly established session
    pub async fn accept(&self) -> Option<SessionHandle> {
        self.accepted_rx.lock().await.recv().await
    }

    /// Serve the rendezvous port until [`RendezvousServer::shutdown`]
    pub async fn run(&self) -> ServerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.serve().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve(&self) -> ServerResult<()> {
        let addr = self.config.socket_addr()?;
        let socket = self
            .transport
            .bind(addr.port())
            .await
            .map_err(|e| ServerError::BindFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        info!(
            address = %addr,
            transport = self.transport.name(),
            "Rendezvous port listening"
        );

        let mut stop = self.shutdown.subscribe();
        if *stop.borrow_and_update() {
            return Ok(());
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(error = %e, "Rendezvous receive failed");
                            continue;
                        }
                    };
                    match self.handle_hello(&buf[..len], from).await {
                        Ok(reply) => {
                            if let Err(e) = socket.send_to(&reply, from).await {
                                warn!(peer = %from, error = %e, "Failed to send ServerHello");
                            }
                        }
                        Err(e) => {
                            self.rejected.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %from, error = %e, "Rejected hello");
                        }
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Rendezvous port closed");
        Ok(())
    }

    /// Answer one rendezvous datagram, opening a session for a new hello
    pub async fn handle_hello(&self, data: &[u8], from: SocketAddr) -> ServerResult<Vec<u8>> {
        if hello_type(data) != Some(HelloType::ClientHello) {
            return Err(ServerError::UnexpectedMessage);
        }
        let hello = ClientHello::from_bytes(data)?;

        let now = Instant::now();
        let mut handshake = self.handshake.lock().await;
        let accept = handshake.accept(&hello, now)?;
        if accept.replayed {
            return Ok(accept.reply);
        }

        // A refused hello must not stay answerable from the cache
        let max = self.config.max_sessions;
        if self.manager.session_count().await >= max {
            handshake.forget(&hello.client_nonce);
            warn!(peer = %from, max, "Session limit reached, refusing hello");
            return Err(ServerError::SessionLimitReached { max });
        }

        let params = SessionParams::from_handshake(accept.outcome, Role::Server, from.ip(), now);
        let handle = match self.manager.open_session(params).await {
            Ok(handle) => handle,
            Err(e) => {
                handshake.forget(&hello.client_nonce);
                return Err(e.into());
            }
        };
        drop(handshake);

        self.established.fetch_add(1, Ordering::Relaxed);
        info!(
            session = %handle.id(),
            peer = %from,
            identity = %hello.identity,
            "Session established"
        );
        if self.accepted_tx.send(handle).is_err() {
            debug!("No acceptor for new session");
        }
        Ok(accept.reply)
    }

    /// Stop serving and close every session
    pub async fn shutdown(&self) {
        info!("Stopping shroud server");
        self.shutdown.send_replace(true);
        self.manager.shutdown().await;
    }

    /// Get server statistics
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.manager.session_count().await,
            sessions_established: self.established.load(Ordering::Relaxed),
            hellos_rejected: self.rejected.load(Ordering::Relaxed),
            bound_ports: self.manager.bound_ports().await.len(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Live sessions
    pub active_sessions: usize,
    /// Sessions opened since start
    pub sessions_established: u64,
    /// Hellos refused
    pub hellos_rejected: u64,
    /// Hop ports currently bound
    pub bound_ports: usize,
}
