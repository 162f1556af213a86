//! Datagram transports
//!
//! The socket abstraction the session runtime talks to. Scheduler and hop
//! logic never see which transport is underneath, so routing through a
//! proxy or a simulated network is a constructor argument.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::errors::{SessionError, SessionResult};

/// Socket buffer size
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// A bound datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Send a datagram
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive a datagram
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local port
    fn local_port(&self) -> u16;
}

/// Something that can bind datagram sockets
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Bind a socket on `port`
    async fn bind(&self, port: u16) -> SessionResult<Arc<dyn DatagramSocket>>;

    /// Transport name for logging
    fn name(&self) -> &'static str;
}

/// Plain UDP
#[derive(Debug, Clone)]
pub struct UdpTransport {
    bind_ip: IpAddr,
}

impl UdpTransport {
    /// Bind sockets on `bind_ip`
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    /// Bind sockets on all interfaces
    pub fn any() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Create a tokio UDP socket with tuned buffers
    pub fn bind_socket(addr: SocketAddr) -> SessionResult<UdpSocket> {
        let bind_failed = |e: io::Error| SessionError::BindFailed {
            port: addr.port(),
            reason: e.to_string(),
        };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_failed)?;

        socket.set_reuse_address(true).ok();
        socket.set_nonblocking(true).map_err(bind_failed)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE).ok();
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE).ok();
        socket.bind(&addr.into()).map_err(bind_failed)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::any()
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn bind(&self, port: u16) -> SessionResult<Arc<dyn DatagramSocket>> {
        let socket = Self::bind_socket(SocketAddr::new(self.bind_ip, port))?;
        let port = socket.local_addr()?.port();
        Ok(Arc::new(UdpDatagramSocket { socket, port }))
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// UDP socket behind [`UdpTransport`]
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    port: u16,
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}
