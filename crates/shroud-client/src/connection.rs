//! Connection Management
//!
//! Hello retransmission and the rendezvous exchange that precedes a session.

use std::net::SocketAddr;
use std::time::Duration;

use shroud_protocol::{
    hello_type, ClientHandshake, HandshakeOutcome, HelloType, ServerHello, MAX_DATAGRAM_SIZE,
};
use shroud_session::DatagramSocket;
use shroud_timing::Backoff;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::errors::{ClientError, ClientResult};

/// Facts about an established connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Server rendezvous address
    pub server_addr: SocketAddr,
    /// When the ServerHello was accepted; the session's hop epoch
    pub connected_at: Instant,
    /// Hellos sent before a reply arrived
    pub handshake_attempts: u32,
    /// Transport the session runs on
    pub transport: &'static str,
}

impl ConnectionInfo {
    /// Get connection duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Hello retransmission with a doubling reply timeout
#[derive(Debug, Clone)]
pub struct HandshakeRetry {
    max_attempts: u32,
    current_attempt: u32,
    backoff: Backoff,
}

impl HandshakeRetry {
    /// Create a retry budget of `max_attempts`, waiting `timeout` for the first reply
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            current_attempt: 0,
            backoff: Backoff::new(timeout, timeout.saturating_mul(8)),
        }
    }

    /// Reply timeout for the next attempt, `None` once the budget is spent
    pub fn next_timeout(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        self.current_attempt += 1;
        Some(self.backoff.backoff())
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.current_attempt < self.max_attempts
    }

    /// Get current attempt number
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.current_attempt)
    }

    /// Reset the budget
    pub fn reset(&mut self) {
        self.current_attempt = 0;
        self.backoff.reset();
    }
}

/// Run the hello exchange against `server` over `socket`.
///
/// The same hello is retransmitted on every attempt, so the server answers
/// retries from its cache instead of opening a second session. Datagrams from
/// other sources, other message types and replies that fail to open are
/// ignored until the attempt times out.
pub async fn perform_handshake(
    socket: &dyn DatagramSocket,
    server: SocketAddr,
    handshake: &mut ClientHandshake,
    retry: &mut HandshakeRetry,
) -> ClientResult<(HandshakeOutcome, Instant)> {
    let hello = handshake.hello().to_bytes();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while let Some(timeout) = retry.next_timeout() {
        socket.send_to(&hello, server).await?;
        debug!(
            server = %server,
            attempt = retry.current_attempt(),
            "Sent ClientHello, waiting for ServerHello"
        );

        let deadline = Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let received = match received {
                Ok(received) => received?,
                Err(_) => break,
            };
            let (len, from) = received;
            if from != server || hello_type(&buf[..len]) != Some(HelloType::ServerHello) {
                trace!(from = %from, len, "Ignoring stray datagram during handshake");
                continue;
            }

            let reply = match ServerHello::from_bytes(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(error = %e, "Malformed ServerHello");
                    continue;
                }
            };
            match handshake.complete(&reply) {
                Ok(outcome) => return Ok((outcome, Instant::now())),
                Err(e) => debug!(error = %e, "ServerHello rejected"),
            }
        }
    }

    Err(ClientError::HandshakeTimeout {
        attempts: retry.current_attempt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_crypto::PskCredentials;
    use shroud_session::{DatagramTransport, MemoryNetwork};
    use std::net::{IpAddr, Ipv4Addr};

    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn test_handshake_retry() {
        let mut retry = HandshakeRetry::new(3, Duration::from_secs(1));
        assert_eq!(retry.remaining_attempts(), 3);

        let first = retry.next_timeout().unwrap();
        assert_eq!(retry.current_attempt(), 1);
        let second = retry.next_timeout().unwrap();
        assert!(second > first);
        assert!(retry.next_timeout().is_some());

        assert!(!retry.should_retry());
        assert!(retry.next_timeout().is_none());

        retry.reset();
        assert_eq!(retry.next_timeout(), Some(first));
    }

    #[test]
    fn test_timeout_is_capped() {
        let mut retry = HandshakeRetry::new(10, Duration::from_secs(1));
        let last = std::iter::from_fn(|| retry.next_timeout()).last().unwrap();
        assert_eq!(last, Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let net = MemoryNetwork::new(Duration::from_millis(10), 0.0, 1);
        let socket = net.host(CLIENT).bind(0).await.unwrap();
        let mut handshake = ClientHandshake::new(PskCredentials::generate().unwrap()).unwrap();
        let mut retry = HandshakeRetry::new(3, Duration::from_secs(1));

        let start = Instant::now();
        let result = perform_handshake(
            socket.as_ref(),
            SocketAddr::new(SERVER, 5684),
            &mut handshake,
            &mut retry,
        )
        .await;

        assert!(matches!(result, Err(ClientError::HandshakeTimeout { attempts: 3 })));
        // 1s + 2s + 4s
        assert!(start.elapsed() >= Duration::from_secs(7));
        let hellos = net.wire_log().iter().filter(|r| r.from.ip() == CLIENT).count();
        assert_eq!(hellos, 3);
    }
}
