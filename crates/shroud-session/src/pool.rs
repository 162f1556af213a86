//! Socket pool
//!
//! Hop ports are drawn independently per session, so two sessions on one
//! server may land on the same local port. The pool keeps one socket per
//! port, counts its users, and runs one reader per socket that forwards
//! every datagram to the manager's demultiplexer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use shroud_protocol::MAX_DATAGRAM_SIZE;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::SessionResult;
use crate::transport::{DatagramSocket, DatagramTransport};

/// A datagram as it came off a pooled socket
#[derive(Debug, Clone)]
pub struct RawDatagram {
    /// Datagram bytes
    pub bytes: Vec<u8>,
    /// Local port it arrived on
    pub local_port: u16,
    /// Sender
    pub from: SocketAddr,
    /// Arrival time
    pub arrived: Instant,
}

struct Slot {
    socket: Arc<dyn DatagramSocket>,
    refs: usize,
    reader: JoinHandle<()>,
}

/// Ref-counted sockets keyed by local port
pub struct SocketPool {
    transport: Arc<dyn DatagramTransport>,
    slots: Mutex<HashMap<u16, Slot>>,
    inbound: mpsc::Sender<RawDatagram>,
}

impl SocketPool {
    /// Create a pool forwarding datagrams to `inbound`
    pub fn new(transport: Arc<dyn DatagramTransport>, inbound: mpsc::Sender<RawDatagram>) -> Self {
        Self {
            transport,
            slots: Mutex::new(HashMap::new()),
            inbound,
        }
    }

    /// Get the transport name
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Take a reference to the socket on `port`, binding it if needed
    pub async fn acquire(&self, port: u16) -> SessionResult<Arc<dyn DatagramSocket>> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&port) {
            slot.refs += 1;
            return Ok(slot.socket.clone());
        }

        let socket = self.transport.bind(port).await?;
        let reader = tokio::spawn(read_loop(socket.clone(), self.inbound.clone()));
        debug!(port, transport = self.transport.name(), "Bound hop socket");

        slots.insert(
            port,
            Slot {
                socket: socket.clone(),
                refs: 1,
                reader,
            },
        );
        Ok(socket)
    }

    /// Drop a reference; the socket closes with its last user
    pub async fn release(&self, port: u16) {
        let mut slots = self.slots.lock().await;
        let remove = match slots.get_mut(&port) {
            Some(slot) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0
            }
            None => false,
        };
        if remove {
            if let Some(slot) = slots.remove(&port) {
                slot.reader.abort();
                debug!(port, "Released hop socket");
            }
        }
    }

    /// Socket bound on `port`
    pub async fn socket(&self, port: u16) -> Option<Arc<dyn DatagramSocket>> {
        self.slots.lock().await.get(&port).map(|slot| slot.socket.clone())
    }

    /// Users of `port`
    pub async fn refs(&self, port: u16) -> usize {
        self.slots.lock().await.get(&port).map_or(0, |slot| slot.refs)
    }

    /// Every bound port
    pub async fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.slots.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Close every socket
    pub async fn shutdown(&self) {
        for (port, slot) in self.slots.lock().await.drain() {
            slot.reader.abort();
            trace!(port, "Closed hop socket");
        }
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            slot.reader.abort();
        }
    }
}

async fn read_loop(socket: Arc<dyn DatagramSocket>, inbound: mpsc::Sender<RawDatagram>) {
    let local_port = socket.local_port();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let datagram = RawDatagram {
                    bytes: buf[..n].to_vec(),
                    local_port,
                    from,
                    arrived: Instant::now(),
                };
                if inbound.send(datagram).await.is_err() {
                    return;
                }
            }
            // ICMP errors from earlier sends surface here on some platforms
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                trace!(port = local_port, error = %e, "Ignoring transient receive error");
            }
            Err(e) => {
                warn!(port = local_port, error = %e, "Hop socket receive failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcounted_sockets() {
        let net = MemoryNetwork::new(Duration::from_millis(5), 0.0, 3);
        let (tx, mut rx) = mpsc::channel(16);
        let pool = SocketPool::new(Arc::new(net.host(ip(1))), tx);

        pool.acquire(21_000).await.unwrap();
        pool.acquire(21_000).await.unwrap();
        assert_eq!(pool.refs(21_000).await, 2);
        assert_eq!(pool.bound_ports().await, vec![21_000]);

        let peer = net.host(ip(2)).bind(40_000).await.unwrap();
        peer.send_to(b"datagram", SocketAddr::new(ip(1), 21_000))
            .await
            .unwrap();
        let raw = rx.recv().await.unwrap();
        assert_eq!(raw.bytes, b"datagram");
        assert_eq!(raw.local_port, 21_000);
        assert_eq!(raw.from, SocketAddr::new(ip(2), 40_000));

        pool.release(21_000).await;
        assert_eq!(pool.refs(21_000).await, 1);
        pool.release(21_000).await;
        assert_eq!(pool.refs(21_000).await, 0);
        assert!(pool.socket(21_000).await.is_none());

        // Give the aborted reader a chance to drop its socket
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(net.bound().is_empty());
    }

    #[tokio::test]
    async fn test_release_unknown_port() {
        let net = MemoryNetwork::new(Duration::ZERO, 0.0, 3);
        let (tx, _rx) = mpsc::channel(1);
        let pool = SocketPool::new(Arc::new(net.host(ip(1))), tx);
        pool.release(9_999).await;
        assert!(pool.bound_ports().await.is_empty());
    }
}
