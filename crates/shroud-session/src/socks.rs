//! SOCKS5 transport
//!
//! Routes every hop socket through a local SOCKS5 proxy using UDP
//! ASSOCIATE (RFC 1928 section 7). Each bound socket holds its own TCP
//! control connection; the association lives as long as it does.
//!
//! UDP request header:
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::errors::{SessionError, SessionResult};
use crate::transport::{DatagramSocket, DatagramTransport, UdpTransport};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const RESERVED: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Default local proxy endpoint
pub const DEFAULT_SOCKS_PROXY: &str = "127.0.0.1:9050";

/// SOCKS5 UDP ASSOCIATE transport
#[derive(Debug, Clone)]
pub struct SocksTransport {
    proxy: SocketAddr,
    timeout: Duration,
}

impl SocksTransport {
    /// Create a transport using the proxy at `proxy`
    pub fn new(proxy: SocketAddr) -> Self {
        Self {
            proxy,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set negotiation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the proxy address
    pub fn proxy(&self) -> SocketAddr {
        self.proxy
    }

    async fn associate(&self, local_port: u16) -> SessionResult<(TcpStream, SocketAddr)> {
        let mut stream = TcpStream::connect(self.proxy).await?;

        // Greeting: VER | NMETHODS | METHODS
        stream
            .write_all(&[SOCKS5_VERSION, 0x01, AUTH_NO_AUTH])
            .await?;
        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[0] != SOCKS5_VERSION {
            return Err(SessionError::Proxy(format!(
                "invalid SOCKS version: {}",
                response[0]
            )));
        }
        if response[1] != AUTH_NO_AUTH {
            return Err(SessionError::Proxy(
                "proxy requires authentication".into(),
            ));
        }

        // UDP ASSOCIATE with the address we will send from
        let mut request = vec![SOCKS5_VERSION, CMD_UDP_ASSOCIATE, RESERVED];
        encode_address(
            &mut request,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port),
        );
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(SessionError::Proxy(format!(
                "invalid SOCKS version in reply: {}",
                head[0]
            )));
        }
        if head[1] != REPLY_SUCCEEDED {
            return Err(SessionError::Proxy(reply_message(head[1]).into()));
        }

        let ip = match head[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            ATYP_DOMAIN => {
                return Err(SessionError::Proxy(
                    "domain relay addresses are not supported".into(),
                ));
            }
            other => {
                return Err(SessionError::Proxy(format!(
                    "unsupported relay address type: {}",
                    other
                )));
            }
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;

        // A relay on the unspecified address lives on the proxy host
        let ip = if ip.is_unspecified() { self.proxy.ip() } else { ip };
        Ok((stream, SocketAddr::new(ip, u16::from_be_bytes(port))))
    }
}

#[async_trait]
impl DatagramTransport for SocksTransport {
    async fn bind(&self, port: u16) -> SessionResult<Arc<dyn DatagramSocket>> {
        let socket = UdpTransport::bind_socket(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
        ))?;
        let local_port = socket.local_addr()?.port();

        let (control, relay) = tokio::time::timeout(self.timeout, self.associate(local_port))
            .await
            .map_err(|_| SessionError::Proxy("UDP ASSOCIATE timed out".into()))??;

        debug!(port = local_port, relay = %relay, "SOCKS5 association established");
        Ok(Arc::new(SocksDatagramSocket {
            socket,
            relay,
            port: local_port,
            _control: control,
        }))
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

/// Socket relaying through a SOCKS5 association
#[derive(Debug)]
pub struct SocksDatagramSocket {
    socket: UdpSocket,
    relay: SocketAddr,
    port: u16,
    _control: TcpStream,
}

#[async_trait]
impl DatagramSocket for SocksDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut packet = encode_udp_header(target);
        let header_len = packet.len();
        packet.extend_from_slice(buf);
        let sent = self.socket.send_to(&packet, self.relay).await?;
        Ok(sent.saturating_sub(header_len))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut packet = vec![0u8; buf.len() + 22];
        loop {
            let (n, from) = self.socket.recv_from(&mut packet).await?;
            if from != self.relay {
                trace!(from = %from, "Ignoring datagram from outside the relay");
                continue;
            }
            match decode_udp_header(&packet[..n]) {
                Some((source, offset)) => {
                    let len = (n - offset).min(buf.len());
                    buf[..len].copy_from_slice(&packet[offset..offset + len]);
                    return Ok((len, source));
                }
                None => trace!("Dropping malformed or fragmented relay datagram"),
            }
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

fn encode_address(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Build the UDP request header for `target`
pub fn encode_udp_header(target: SocketAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(22);
    header.extend_from_slice(&[RESERVED, RESERVED, 0x00]);
    encode_address(&mut header, target);
    header
}

/// Parse a relayed UDP header, returning the source and payload offset.
///
/// Fragmented datagrams and domain-name sources are rejected.
pub fn decode_udp_header(packet: &[u8]) -> Option<(SocketAddr, usize)> {
    if packet.len() < 4 || packet[2] != 0x00 {
        return None;
    }
    let (ip, offset) = match packet[3] {
        ATYP_IPV4 if packet.len() >= 10 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[4..8]);
            (IpAddr::V4(Ipv4Addr::from(octets)), 8)
        }
        ATYP_IPV6 if packet.len() >= 22 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            (IpAddr::V6(Ipv6Addr::from(octets)), 20)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    Some((SocketAddr::new(ip, port), offset + 2))
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_udp_header() {
        let target: SocketAddr = "10.0.0.1:20001".parse().unwrap();
        let header = encode_udp_header(target);
        assert_eq!(header, vec![0, 0, 0, ATYP_IPV4, 10, 0, 0, 1, 0x4E, 0x21]);

        let mut packet = header.clone();
        packet.extend_from_slice(b"payload");
        let (source, offset) = decode_udp_header(&packet).unwrap();
        assert_eq!(source, target);
        assert_eq!(&packet[offset..], b"payload");

        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        let header = encode_udp_header(v6);
        assert_eq!(decode_udp_header(&header), Some((v6, 22)));
    }

    #[test]
    fn test_rejects_fragments_and_truncation() {
        let mut packet = encode_udp_header("10.0.0.1:1".parse().unwrap());
        packet[2] = 1;
        assert!(decode_udp_header(&packet).is_none());
        assert!(decode_udp_header(&[0, 0, 0, ATYP_IPV4, 10]).is_none());
        assert!(decode_udp_header(&[0, 0, 0, 0x03, 3, b'a', b'b', b'c', 0, 80]).is_none());
    }

    /// Minimal proxy: accept one association, relay one datagram each way
    async fn fake_proxy() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], CMD_UDP_ASSOCIATE);

            let mut reply = vec![SOCKS5_VERSION, REPLY_SUCCEEDED, RESERVED];
            encode_address(&mut reply, relay_addr);
            stream.write_all(&reply).await.unwrap();

            let mut buf = [0u8; 256];
            let (n, client) = relay.recv_from(&mut buf).await.unwrap();
            let (target, offset) = decode_udp_header(&buf[..n]).unwrap();
            assert_eq!(&buf[offset..n], b"hello");

            let mut back = encode_udp_header(target);
            back.extend_from_slice(b"world");
            relay.send_to(&back, client).await.unwrap();

            // Keep the control connection open until the client is done
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        (addr, task)
    }

    #[tokio::test]
    async fn test_associate_and_relay() {
        let (proxy, task) = fake_proxy().await;
        let transport = SocksTransport::new(proxy).with_timeout(Duration::from_secs(5));
        let socket = transport.bind(0).await.unwrap();

        let target: SocketAddr = "192.0.2.10:31000".parse().unwrap();
        assert_eq!(socket.send_to(b"hello", target).await.unwrap(), 5);

        let mut buf = [0u8; 64];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(from, target);

        drop(socket);
        task.await.unwrap();
    }
}
