//! Simulated network
//!
//! In-process datagram network with fixed one-way latency and seeded
//! random loss. Every datagram put on the wire is logged so tests can
//! check what an on-path observer would see.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::{SessionError, SessionResult};
use crate::transport::{DatagramSocket, DatagramTransport};

const EPHEMERAL_START: u16 = 49_152;

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One datagram as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRecord {
    /// Sender
    pub from: SocketAddr,
    /// Destination
    pub to: SocketAddr,
    /// Datagram length
    pub len: usize,
    /// Send time
    pub at: Instant,
    /// Lost in transit
    pub dropped: bool,
}

struct NetworkInner {
    latency: Duration,
    loss: Mutex<f64>,
    rng: Mutex<StdRng>,
    sockets: Mutex<HashMap<SocketAddr, Inbox>>,
    wire: Mutex<Vec<WireRecord>>,
}

/// Simulated datagram network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create a network with one-way `latency` and `loss` probability
    pub fn new(latency: Duration, loss: f64, seed: u64) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                latency,
                loss: Mutex::new(loss.clamp(0.0, 1.0)),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                sockets: Mutex::new(HashMap::new()),
                wire: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Transport binding sockets on host `ip`
    pub fn host(&self, ip: IpAddr) -> MemoryTransport {
        MemoryTransport {
            net: self.inner.clone(),
            ip,
        }
    }

    /// Change the loss probability
    pub fn set_loss(&self, loss: f64) {
        *lock(&self.inner.loss) = loss.clamp(0.0, 1.0);
    }

    /// Every datagram sent so far
    pub fn wire_log(&self) -> Vec<WireRecord> {
        lock(&self.inner.wire).clone()
    }

    /// Forget logged datagrams
    pub fn clear_wire_log(&self) {
        lock(&self.inner.wire).clear();
    }

    /// Currently bound addresses
    pub fn bound(&self) -> Vec<SocketAddr> {
        lock(&self.inner.sockets).keys().copied().collect()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("latency", &self.inner.latency)
            .field("loss", &*lock(&self.inner.loss))
            .finish_non_exhaustive()
    }
}

impl NetworkInner {
    fn transmit(self: &Arc<Self>, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        let dropped = {
            let loss = *lock(&self.loss);
            loss > 0.0 && lock(&self.rng).gen::<f64>() < loss
        };
        lock(&self.wire).push(WireRecord {
            from,
            to,
            len: bytes.len(),
            at: Instant::now(),
            dropped,
        });
        if dropped {
            return;
        }

        // Resolve the destination on arrival, like a real network would
        let net = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(net.latency).await;
            let inbox = lock(&net.sockets).get(&to).cloned();
            if let Some(inbox) = inbox {
                let _ = inbox.send((bytes, from));
            }
        });
    }
}

/// Per-host transport on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    net: Arc<NetworkInner>,
    ip: IpAddr,
}

impl MemoryTransport {
    /// Host address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn bind(&self, port: u16) -> SessionResult<Arc<dyn DatagramSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sockets = lock(&self.net.sockets);

        let port = if port == 0 {
            (EPHEMERAL_START..=u16::MAX)
                .find(|p| !sockets.contains_key(&SocketAddr::new(self.ip, *p)))
                .ok_or_else(|| SessionError::BindFailed {
                    port: 0,
                    reason: "no free ephemeral port".into(),
                })?
        } else {
            port
        };

        let addr = SocketAddr::new(self.ip, port);
        if sockets.contains_key(&addr) {
            return Err(SessionError::BindFailed {
                port,
                reason: "address in use".into(),
            });
        }
        sockets.insert(addr, tx);

        Ok(Arc::new(MemorySocket {
            net: self.net.clone(),
            addr,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Socket on a [`MemoryNetwork`]
pub struct MemorySocket {
    net: Arc<NetworkInner>,
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.net.transmit(self.addr, target, buf.to_vec());
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((bytes, from)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "memory socket closed",
            )),
        }
    }

    fn local_port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        lock(&self.net.sockets).remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_with_latency() {
        let net = MemoryNetwork::new(Duration::from_millis(200), 0.0, 1);
        let a = net.host(ip(1)).bind(20_000).await.unwrap();
        let b = net.host(ip(2)).bind(30_000).await.unwrap();

        let start = Instant::now();
        a.send_to(b"ping", SocketAddr::new(ip(2), 30_000)).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, SocketAddr::new(ip(1), 20_000));
        assert!(start.elapsed() >= Duration::from_millis(200));

        let log = net.wire_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].len, 4);
        assert!(!log[0].dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 1.0, 1);
        let a = net.host(ip(1)).bind(20_000).await.unwrap();
        let b = net.host(ip(2)).bind(30_000).await.unwrap();

        for _ in 0..5 {
            a.send_to(b"x", SocketAddr::new(ip(2), 30_000)).await.unwrap();
        }
        let mut buf = [0u8; 4];
        let recv = tokio::time::timeout(Duration::from_secs(1), b.recv_from(&mut buf)).await;
        assert!(recv.is_err());
        assert!(net.wire_log().iter().all(|r| r.dropped));
    }

    #[tokio::test]
    async fn test_bind_rules() {
        let net = MemoryNetwork::new(Duration::ZERO, 0.0, 1);
        let host = net.host(ip(1));
        let first = host.bind(25_000).await.unwrap();
        assert!(host.bind(25_000).await.is_err());
        // Same port on another host is fine
        assert!(net.host(ip(2)).bind(25_000).await.is_ok());

        let ephemeral = host.bind(0).await.unwrap();
        assert!(ephemeral.local_port() >= EPHEMERAL_START);

        drop(first);
        assert!(host.bind(25_000).await.is_ok());
    }
}
