//! PSK hello exchange
//!
//! One round trip on the rendezvous port establishes a session:
//!
//! ```text
//! ClientHello: type | version | id_len | identity | client_nonce(32) | timestamp | proof(32)
//! ServerHello: type | version | server_nonce(32) | sealed(session_id | server_nonce | hop params)
//! ```
//!
//! The proof is a BLAKE3 keyed hash under a key derived from the PSK; the
//! ServerHello payload is sealed under a key derived from the PSK and the
//! client nonce. Session keys and the hop seed come from HKDF over the PSK
//! and both nonces.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use shroud_crypto::prelude::*;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::*;
use crate::errors::{ProtocolError, ProtocolResult};
use crate::hopping::{HopParameters, PortRange};
use crate::session::SessionId;

const PROOF_CONTEXT: &str = "shroud v1 client hello proof";
const PROOF_SIZE: usize = HASH_SIZE;
const ACCEPT_PAYLOAD_LEN: usize = SESSION_ID_SIZE + HANDSHAKE_NONCE_SIZE + 1 + 4 + 4 + 2 + 2;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_nonce() -> ProtocolResult<[u8; HANDSHAKE_NONCE_SIZE]> {
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    rand::thread_rng()
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::RngError)?;
    Ok(nonce)
}

fn take<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Peek at the message type of a rendezvous datagram
pub fn hello_type(data: &[u8]) -> Option<HelloType> {
    data.first().copied().and_then(HelloType::from_u8)
}

/// Handshake initiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Protocol version
    pub version: u16,
    /// PSK identity
    pub identity: String,
    /// Fresh client nonce
    pub client_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Possession proof for the PSK
    pub proof: [u8; PROOF_SIZE],
}

impl ClientHello {
    /// Create a new ClientHello for `creds`
    pub fn new(creds: &PskCredentials) -> ProtocolResult<Self> {
        let client_nonce = random_nonce()?;
        let timestamp = unix_now();
        let proof = Self::compute_proof(creds.key(), creds.identity(), &client_nonce, timestamp);

        Ok(Self {
            version: PROTOCOL_VERSION,
            identity: creds.identity().to_string(),
            client_nonce,
            timestamp,
            proof,
        })
    }

    fn compute_proof(
        psk: &[u8],
        identity: &str,
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        timestamp: u64,
    ) -> [u8; PROOF_SIZE] {
        let key = ShroudHash::derive_key(PROOF_CONTEXT, psk);
        ShroudHash::keyed_hash_many(
            &key,
            &[identity.as_bytes(), nonce, &timestamp.to_le_bytes()],
        )
    }

    /// Check the possession proof against `creds`
    pub fn verify_proof(&self, creds: &PskCredentials) -> bool {
        let key = ShroudHash::derive_key(PROOF_CONTEXT, creds.key());
        ShroudHash::verify_keyed(
            &key,
            &[
                self.identity.as_bytes(),
                &self.client_nonce,
                &self.timestamp.to_le_bytes(),
            ],
            &self.proof,
        )
    }

    /// Verify timestamp is within acceptable range
    pub fn verify_timestamp(&self, max_drift_secs: u64) -> bool {
        unix_now().abs_diff(self.timestamp) <= max_drift_secs
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(4 + self.identity.len() + HANDSHAKE_NONCE_SIZE + 8 + PROOF_SIZE);
        buf.push(HelloType::ClientHello.to_u8());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.identity.len() as u8);
        buf.extend_from_slice(self.identity.as_bytes());
        buf.extend_from_slice(&self.client_nonce);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.proof);
        buf
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        if hello_type(data) != Some(HelloType::ClientHello) {
            return Err(ProtocolError::HandshakeFailed("not a ClientHello".into()));
        }
        if data.len() < 4 {
            return Err(ProtocolError::PacketTooSmall { got: data.len(), min: 4 });
        }

        let version = u16::from_le_bytes([data[1], data[2]]);
        let id_len = data[3] as usize;
        let min = 4 + id_len + HANDSHAKE_NONCE_SIZE + 8 + PROOF_SIZE;
        if data.len() < min {
            return Err(ProtocolError::PacketTooSmall { got: data.len(), min });
        }

        let identity = std::str::from_utf8(&data[4..4 + id_len])
            .map_err(|_| ProtocolError::HandshakeFailed("identity is not UTF-8".into()))?
            .to_string();
        let mut at = 4 + id_len;
        let client_nonce = take::<HANDSHAKE_NONCE_SIZE>(data, at);
        at += HANDSHAKE_NONCE_SIZE;
        let timestamp = u64::from_le_bytes(take::<8>(data, at));
        at += 8;
        let proof = take::<PROOF_SIZE>(data, at);

        Ok(Self {
            version,
            identity,
            client_nonce,
            timestamp,
            proof,
        })
    }
}

/// What the server tells the client inside the sealed ServerHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAccept {
    /// Session identifier
    pub session_id: SessionId,
    /// Server nonce (must match the cleartext copy)
    pub server_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    /// Hop parameters the client must adopt
    pub params: HopParameters,
}

impl HelloAccept {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ACCEPT_PAYLOAD_LEN);
        buf.extend_from_slice(self.session_id.as_bytes());
        buf.extend_from_slice(&self.server_nonce);
        buf.push(self.params.enabled as u8);
        buf.extend_from_slice(&(self.params.interval.as_millis() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.params.jitter.as_millis() as u32).to_le_bytes());
        buf.extend_from_slice(&self.params.ports.min.to_le_bytes());
        buf.extend_from_slice(&self.params.ports.max.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() != ACCEPT_PAYLOAD_LEN {
            return Err(ProtocolError::HandshakeFailed(format!(
                "accept payload is {} bytes, expected {}",
                data.len(),
                ACCEPT_PAYLOAD_LEN
            )));
        }
        let session_id = SessionId::from_slice(&data[..SESSION_ID_SIZE])?;
        let mut at = SESSION_ID_SIZE;
        let server_nonce = take::<HANDSHAKE_NONCE_SIZE>(data, at);
        at += HANDSHAKE_NONCE_SIZE;
        let enabled = data[at] != 0;
        at += 1;
        let interval = u32::from_le_bytes(take::<4>(data, at));
        at += 4;
        let jitter = u32::from_le_bytes(take::<4>(data, at));
        at += 4;
        let port_min = u16::from_le_bytes(take::<2>(data, at));
        at += 2;
        let port_max = u16::from_le_bytes(take::<2>(data, at));

        let params = HopParameters {
            enabled,
            interval: Duration::from_millis(interval as u64),
            jitter: Duration::from_millis(jitter as u64),
            ports: PortRange::new(port_min, port_max)?,
        };
        params.validate()?;

        Ok(Self {
            session_id,
            server_nonce,
            params,
        })
    }
}

/// Handshake response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Protocol version
    pub version: u16,
    /// Fresh server nonce
    pub server_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    /// Sealed [`HelloAccept`]
    pub sealed: Vec<u8>,
}

impl ServerHello {
    /// Seal an accept for the client that sent `client_nonce`
    pub fn seal(
        creds: &PskCredentials,
        client_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        accept: &HelloAccept,
    ) -> ProtocolResult<Self> {
        let key = ShroudKdf::hello_key(creds.key(), client_nonce)?;
        let sealed = RecordCipher::new(&key).seal(&accept.to_bytes())?;

        Ok(Self {
            version: PROTOCOL_VERSION,
            server_nonce: accept.server_nonce,
            sealed,
        })
    }

    /// Open the sealed accept
    pub fn open(
        &self,
        creds: &PskCredentials,
        client_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    ) -> ProtocolResult<HelloAccept> {
        let key = ShroudKdf::hello_key(creds.key(), client_nonce)?;
        let payload = RecordCipher::new(&key).open(&self.sealed)?;
        let accept = HelloAccept::from_bytes(&payload)?;

        if !constant_time_eq(&accept.server_nonce, &self.server_nonce) {
            return Err(ProtocolError::HandshakeFailed("server nonce mismatch".into()));
        }
        Ok(accept)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + HANDSHAKE_NONCE_SIZE + self.sealed.len());
        buf.push(HelloType::ServerHello.to_u8());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.server_nonce);
        buf.extend_from_slice(&self.sealed);
        buf
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        if hello_type(data) != Some(HelloType::ServerHello) {
            return Err(ProtocolError::HandshakeFailed("not a ServerHello".into()));
        }
        let min = 3 + HANDSHAKE_NONCE_SIZE + SEAL_OVERHEAD;
        if data.len() < min {
            return Err(ProtocolError::PacketTooSmall { got: data.len(), min });
        }

        Ok(Self {
            version: u16::from_le_bytes([data[1], data[2]]),
            server_nonce: take::<HANDSHAKE_NONCE_SIZE>(data, 3),
            sealed: data[3 + HANDSHAKE_NONCE_SIZE..].to_vec(),
        })
    }
}

/// Result of a completed handshake, identical on both ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Session identifier
    pub session_id: SessionId,
    /// Record keys and hop seed
    pub keys: SessionKeys,
    /// Agreed hop parameters
    pub params: HopParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    HelloSent,
    Complete,
}

/// Client-side handshake state machine
pub struct ClientHandshake {
    creds: PskCredentials,
    hello: ClientHello,
    state: HandshakeState,
}

impl ClientHandshake {
    /// Create a handshake with a fresh ClientHello
    pub fn new(creds: PskCredentials) -> ProtocolResult<Self> {
        let hello = ClientHello::new(&creds)?;
        Ok(Self {
            creds,
            hello,
            state: HandshakeState::HelloSent,
        })
    }

    /// Get the hello to (re)send; retries reuse the same nonce
    pub fn hello(&self) -> &ClientHello {
        &self.hello
    }

    /// Get current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Process ServerHello and derive the session
    pub fn complete(&mut self, reply: &ServerHello) -> ProtocolResult<HandshakeOutcome> {
        if reply.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: reply.version,
            });
        }

        let accept = reply.open(&self.creds, &self.hello.client_nonce)?;
        let keys = SessionKeys::derive(
            self.creds.key(),
            &self.hello.client_nonce,
            &accept.server_nonce,
        )?;

        self.state = HandshakeState::Complete;
        Ok(HandshakeOutcome {
            session_id: accept.session_id,
            keys,
            params: accept.params,
        })
    }
}

/// Server's answer to one ClientHello
#[derive(Debug, Clone)]
pub struct ServerAccept {
    /// Bytes to send back
    pub reply: Vec<u8>,
    /// Session to create
    pub outcome: HandshakeOutcome,
    /// True when this hello was already answered; no new session is needed
    pub replayed: bool,
}

struct CachedAccept {
    identity: String,
    reply: Vec<u8>,
    outcome: HandshakeOutcome,
    at: Instant,
}

/// Server-side handshake handler
pub struct ServerHandshake {
    credentials: HashMap<String, PskCredentials>,
    params: HopParameters,
    max_time_drift: u64,
    cache_ttl: Duration,
    cache: HashMap<[u8; HANDSHAKE_NONCE_SIZE], CachedAccept>,
}

impl ServerHandshake {
    /// Create a handler accepting `credentials`
    pub fn new(
        credentials: impl IntoIterator<Item = PskCredentials>,
        params: HopParameters,
        max_time_drift: u64,
        cache_ttl: Duration,
    ) -> ProtocolResult<Self> {
        params.validate()?;
        Ok(Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.identity().to_string(), c))
                .collect(),
            params,
            max_time_drift,
            cache_ttl,
            cache: HashMap::new(),
        })
    }

    /// Number of answers held for retransmitted hellos
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Drop the cached answer for a hello the caller could not honour, so a
    /// retransmission is evaluated again instead of replayed
    pub fn forget(&mut self, client_nonce: &[u8; HANDSHAKE_NONCE_SIZE]) -> bool {
        self.cache.remove(client_nonce).is_some()
    }

    /// Process a ClientHello
    pub fn accept(&mut self, hello: &ClientHello, now: Instant) -> ProtocolResult<ServerAccept> {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, c| now.duration_since(c.at) < ttl);

        if let Some(cached) = self.cache.get(&hello.client_nonce) {
            if cached.identity == hello.identity {
                debug!(
                    identity = %hello.identity,
                    "Answering retransmitted ClientHello from cache"
                );
                return Ok(ServerAccept {
                    reply: cached.reply.clone(),
                    outcome: cached.outcome.clone(),
                    replayed: true,
                });
            }
        }

        if hello.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: hello.version,
            });
        }

        let creds = self
            .credentials
            .get(&hello.identity)
            .ok_or_else(|| ProtocolError::UnknownIdentity(hello.identity.clone()))?;

        if !hello.verify_proof(creds) {
            return Err(ProtocolError::HandshakeFailed("invalid PSK proof".into()));
        }
        if !hello.verify_timestamp(self.max_time_drift) {
            return Err(ProtocolError::HandshakeFailed(
                "Timestamp outside acceptable range".into(),
            ));
        }

        let accept = HelloAccept {
            session_id: SessionId::generate(),
            server_nonce: random_nonce()?,
            params: self.params,
        };
        let reply = ServerHello::seal(creds, &hello.client_nonce, &accept)?.to_bytes();
        let keys = SessionKeys::derive(creds.key(), &hello.client_nonce, &accept.server_nonce)?;
        let outcome = HandshakeOutcome {
            session_id: accept.session_id,
            keys,
            params: self.params,
        };

        self.cache.insert(
            hello.client_nonce,
            CachedAccept {
                identity: hello.identity.clone(),
                reply: reply.clone(),
                outcome: outcome.clone(),
                at: now,
            },
        );

        Ok(ServerAccept {
            reply,
            outcome,
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> PskCredentials {
        PskCredentials::from_hex("client-1a2b", "00112233445566778899aabbccddeeff").unwrap()
    }

    fn params() -> HopParameters {
        HopParameters {
            enabled: true,
            interval: Duration::from_secs(45),
            jitter: Duration::from_secs(10),
            ports: PortRange::new(30_000, 40_000).unwrap(),
        }
    }

    fn server() -> ServerHandshake {
        ServerHandshake::new(vec![creds()], params(), 60, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let hello = ClientHello::new(&creds()).unwrap();
        let recovered = ClientHello::from_bytes(&hello.to_bytes()).unwrap();
        assert_eq!(hello, recovered);
        assert!(recovered.verify_proof(&creds()));
    }

    #[test]
    fn test_full_handshake() {
        let mut client = ClientHandshake::new(creds()).unwrap();
        let hello = ClientHello::from_bytes(&client.hello().to_bytes()).unwrap();

        let accepted = server().accept(&hello, Instant::now()).unwrap();
        assert!(!accepted.replayed);

        let reply = ServerHello::from_bytes(&accepted.reply).unwrap();
        let outcome = client.complete(&reply).unwrap();

        assert_eq!(client.state(), HandshakeState::Complete);
        assert_eq!(outcome, accepted.outcome);
        assert_eq!(outcome.params, params());
    }

    #[test]
    fn test_retransmitted_hello_is_idempotent() {
        let mut server = server();
        let hello = ClientHello::new(&creds()).unwrap();
        let now = Instant::now();

        let first = server.accept(&hello, now).unwrap();
        let second = server.accept(&hello, now + Duration::from_secs(1)).unwrap();

        assert!(second.replayed);
        assert_eq!(first.reply, second.reply);
        assert_eq!(first.outcome.session_id, second.outcome.session_id);
        assert_eq!(server.cached_count(), 1);

        let third = server.accept(&hello, now + Duration::from_secs(11)).unwrap();
        assert!(!third.replayed);
        assert_ne!(third.outcome.session_id, first.outcome.session_id);
    }

    #[test]
    fn test_forgotten_hello_is_evaluated_again() {
        let mut server = server();
        let hello = ClientHello::new(&creds()).unwrap();
        let now = Instant::now();

        let first = server.accept(&hello, now).unwrap();
        assert!(server.forget(&hello.client_nonce));
        assert!(!server.forget(&hello.client_nonce));
        assert_eq!(server.cached_count(), 0);

        let again = server.accept(&hello, now + Duration::from_secs(1)).unwrap();
        assert!(!again.replayed);
        assert_ne!(again.outcome.session_id, first.outcome.session_id);
    }

    #[test]
    fn test_unknown_identity() {
        let stranger =
            PskCredentials::from_hex("stranger", "ffeeddccbbaa99887766554433221100").unwrap();
        let hello = ClientHello::new(&stranger).unwrap();
        assert!(matches!(
            server().accept(&hello, Instant::now()),
            Err(ProtocolError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let impostor =
            PskCredentials::from_hex("client-1a2b", "ffeeddccbbaa99887766554433221100").unwrap();
        let hello = ClientHello::new(&impostor).unwrap();
        assert!(matches!(
            server().accept(&hello, Instant::now()),
            Err(ProtocolError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let mut hello = ClientHello::new(&creds()).unwrap();
        hello.timestamp -= 120;
        assert!(!hello.verify_timestamp(60));
        assert!(server().accept(&hello, Instant::now()).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let mut hello = ClientHello::new(&creds()).unwrap();
        hello.version = 0xFFFF;
        assert!(matches!(
            server().accept(&hello, Instant::now()),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_server_hello() {
        let mut client = ClientHandshake::new(creds()).unwrap();
        let accepted = server().accept(client.hello(), Instant::now()).unwrap();

        let mut reply = ServerHello::from_bytes(&accepted.reply).unwrap();
        reply.server_nonce[0] ^= 0x01;
        assert!(client.complete(&reply).is_err());
    }

    #[test]
    fn test_hello_type_peek() {
        let hello = ClientHello::new(&creds()).unwrap().to_bytes();
        assert_eq!(hello_type(&hello), Some(HelloType::ClientHello));
        assert_eq!(hello_type(&[]), None);
        assert!(ServerHello::from_bytes(&hello).is_err());
    }
}
