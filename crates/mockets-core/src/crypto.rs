//! Cryptographic primitives for Mockets.
//!
//! Provides three things:
//!   1. SecureEndpoint: a Noise_XX state machine over in-memory buffers that
//!      secures a datagram transport (handshake step, seal, open)
//!   2. Session: the explicit-nonce record layer used once the handshake is over
//!   3. Resume tokens: credentials sealed to a peer's static key (Noise_N)
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise state machines using those keys.
//!
//! All key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::path::{Path, PathBuf};

use rand::RngCore;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::HANDSHAKE_BUFFER_SIZE;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// Pattern of the transport handshake.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Size of the client's first handshake flight: one ephemeral X25519 key,
/// no payload.
pub const FIRST_FLIGHT_SIZE: usize = 32;

/// One-way pattern used to seal resume tokens to a known static key.
const SEALING_PATTERN: &str = "Noise_N_25519_ChaChaPoly_BLAKE2s";

/// An endpoint's long-term static X25519 keypair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Read the 32-byte private key at `path`, or generate one and store it
    /// there (mode 0600) when the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| CryptoError::Io(path.to_path_buf(), e))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::BadKeyLength(bytes.len()))?;
            return Ok(Self::from_private(private));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
        }
        std::fs::write(path, &*keypair.private)
            .map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
        }
        tracing::debug!(path = %path.display(), "generated new keypair");
        Ok(keypair)
    }
}

// ── Secure Endpoint ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Speaks first.
    Client,
    Server,
}

enum EndpointState {
    Handshaking(Box<HandshakeState>),
    Established(Session),
    /// Left behind by a failed transition; only `reset` recovers.
    Broken,
}

/// Handshake plus record layer over opaque in-memory buffers.
///
/// The caller moves bytes between the endpoint and a datagram transport:
/// `handshake_step` consumes one inbound handshake message and yields the
/// next outbound flight, `prepare_for_sending` / `recover_data` seal and open
/// application records once `is_handshake_over` holds.
pub struct SecureEndpoint {
    role: Role,
    keypair: Keypair,
    state: EndpointState,
    remote_static: Option<[u8; 32]>,
}

impl SecureEndpoint {
    pub fn new(role: Role, keypair: &Keypair) -> Result<Self, CryptoError> {
        Ok(Self {
            role,
            keypair: keypair.clone(),
            state: EndpointState::Handshaking(Box::new(build_handshake(role, keypair)?)),
            remote_static: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public
    }

    pub fn is_handshake_over(&self) -> bool {
        matches!(self.state, EndpointState::Established(_))
    }

    /// Peer's static key, known once the handshake is over.
    pub fn remote_public_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn session_id(&self) -> Option<[u8; 32]> {
        match &self.state {
            EndpointState::Established(s) => Some(s.session_id),
            _ => None,
        }
    }

    /// Drop all handshake and session state and start over with the same
    /// keypair and role.
    pub fn reset(&mut self) -> Result<(), CryptoError> {
        self.state = EndpointState::Handshaking(Box::new(build_handshake(self.role, &self.keypair)?));
        self.remote_static = None;
        Ok(())
    }

    /// Advance the handshake with one inbound message (empty to start as the
    /// client). Returns the outbound flight, if one is due.
    pub fn handshake_step(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, CryptoError> {
        let hs = match &mut self.state {
            EndpointState::Handshaking(hs) => hs,
            EndpointState::Established(_) => return Ok(None),
            EndpointState::Broken => return Err(CryptoError::HandshakeIncomplete),
        };

        if !input.is_empty() {
            if hs.is_my_turn() {
                return Err(CryptoError::UnexpectedHandshakeMessage);
            }
            let mut payload = vec![0u8; input.len()];
            hs.read_message(input, &mut payload)?;
        } else if !hs.is_my_turn() {
            return Ok(None);
        }

        let mut output = None;
        if !hs.is_handshake_finished() && hs.is_my_turn() {
            let mut msg = vec![0u8; HANDSHAKE_BUFFER_SIZE];
            let len = hs.write_message(&[], &mut msg)?;
            msg.truncate(len);
            output = Some(msg);
        }

        if hs.is_handshake_finished() {
            self.finish_handshake()?;
        }
        Ok(output)
    }

    fn finish_handshake(&mut self) -> Result<(), CryptoError> {
        let EndpointState::Handshaking(boxed) =
            std::mem::replace(&mut self.state, EndpointState::Broken)
        else {
            return Err(CryptoError::HandshakeIncomplete);
        };
        let hs = *boxed;
        let mut session_id = [0u8; 32];
        let hash = hs.get_handshake_hash();
        let n = hash.len().min(32);
        session_id[..n].copy_from_slice(&hash[..n]);
        self.remote_static = hs.get_remote_static().and_then(|k| k.try_into().ok());

        let transport = hs.into_stateless_transport_mode()?;
        self.state = EndpointState::Established(Session {
            session_id,
            transport,
            send_nonce: 0,
            recv_window: ReplayWindow::new(),
        });
        tracing::debug!(
            role = ?self.role,
            session_id = hex::encode(&session_id[..4]),
            "secure handshake complete"
        );
        Ok(())
    }

    /// Seal one application record.
    pub fn prepare_for_sending(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let EndpointState::Established(session) = &mut self.state else {
            return Err(CryptoError::HandshakeIncomplete);
        };
        let mut out = Vec::with_capacity(plaintext.len() + RECORD_OVERHEAD);
        session.encrypt(plaintext, &mut out)?;
        Ok(out)
    }

    /// Open one application record.
    pub fn recover_data(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let EndpointState::Established(session) = &mut self.state else {
            return Err(CryptoError::HandshakeIncomplete);
        };
        let mut out = Vec::with_capacity(record.len());
        session.decrypt(record, &mut out)?;
        Ok(out)
    }
}

fn build_handshake(role: Role, keypair: &Keypair) -> Result<HandshakeState, CryptoError> {
    let builder = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
        .local_private_key(&*keypair.private);
    let state = match role {
        Role::Client => builder.build_initiator()?,
        Role::Server => builder.build_responder()?,
    };
    Ok(state)
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen nonce and a bitmap of the last 2048 nonces.
/// Rejects duplicates and nonces that fall behind the window.
const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>, // 2048 bits = 32 u64s
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the nonce is acceptable (not replayed, not too old).
    pub fn check(&self, nonce: u64) -> bool {
        if nonce.saturating_add(WINDOW_SIZE) < self.highest {
            return false;
        }
        if nonce > self.highest {
            return true;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return false;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a nonce as seen. Call after successful decrypt.
    pub fn mark(&mut self, nonce: u64) {
        if nonce > self.highest {
            let shift = nonce - self.highest;
            self.shift_window(shift);
            self.highest = nonce;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] >> bit_shift) | (self.bitmap[i - 1] << (64 - bit_shift));
            }
            self.bitmap[0] >>= bit_shift;
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Bytes a sealed record adds to its plaintext: 8-byte nonce + 16-byte MAC.
pub const RECORD_OVERHEAD: usize = 8 + 16;

/// An established record layer.
///
/// Uses StatelessTransportState with explicit nonces, so datagrams may be
/// lost, reordered, or retransmitted.
///
/// Wire format per record:
///   [u64 nonce LE (8 bytes)] [Noise ciphertext (payload + 16-byte MAC)]
pub struct Session {
    pub session_id: [u8; 32],
    transport: StatelessTransportState,
    send_nonce: u64,
    recv_window: ReplayWindow,
}

impl Session {
    /// Encrypt plaintext into `out`. Prepends an 8-byte LE nonce and appends
    /// a 16-byte Poly1305 MAC.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.send_nonce;
        self.send_nonce += 1;

        out.clear();
        out.extend_from_slice(&nonce.to_le_bytes());

        let offset = 8;
        out.resize(offset + plaintext.len() + 16, 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, &mut out[offset..])?;
        out.truncate(offset + written);
        Ok(())
    }

    /// Decrypt a record into `out`. Checks the replay window and verifies
    /// the MAC.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < RECORD_OVERHEAD {
            return Err(CryptoError::TooShort);
        }

        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&ciphertext[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        if !self.recv_window.check(nonce) {
            return Err(CryptoError::Replay);
        }

        out.resize(ciphertext.len() - 8, 0);
        let written = self.transport.read_message(nonce, &ciphertext[8..], out)?;
        out.truncate(written);

        self.recv_window.mark(nonce);
        Ok(())
    }
}

// ── Resume Tokens ─────────────────────────────────────────────────────────────

/// Secret and connection id handed to a client so it can later prove it
/// owned a connection.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ResumeCredentials {
    pub secret: [u8; 32],
    pub connection_uuid: [u8; 16],
}

impl ResumeCredentials {
    pub const SIZE: usize = 48;

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = [0u8; 32];
        let mut connection_uuid = [0u8; 16];
        rng.fill_bytes(&mut secret);
        rng.fill_bytes(&mut connection_uuid);
        // RFC 4122 version 4 / variant bits
        connection_uuid[6] = (connection_uuid[6] & 0x0F) | 0x40;
        connection_uuid[8] = (connection_uuid[8] & 0x3F) | 0x80;
        Self {
            secret,
            connection_uuid,
        }
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; Self::SIZE]> {
        let mut out = Zeroizing::new([0u8; Self::SIZE]);
        out[..32].copy_from_slice(&self.secret);
        out[32..].copy_from_slice(&self.connection_uuid);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SIZE {
            return Err(CryptoError::BadResumeToken);
        }
        let mut secret = [0u8; 32];
        let mut connection_uuid = [0u8; 16];
        secret.copy_from_slice(&bytes[..32]);
        connection_uuid.copy_from_slice(&bytes[32..]);
        Ok(Self {
            secret,
            connection_uuid,
        })
    }

    /// Seal to `peer_public`. Only the holder of the matching private key
    /// can open the result.
    pub fn seal(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if peer_public.len() != 32 {
            return Err(CryptoError::BadKeyLength(peer_public.len()));
        }
        let mut hs = Builder::new(SEALING_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .remote_public_key(peer_public)
            .build_initiator()?;
        let mut out = vec![0u8; 32 + Self::SIZE + 16];
        let len = hs.write_message(&*self.to_bytes(), &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    pub fn open(keypair: &Keypair, token: &[u8]) -> Result<Self, CryptoError> {
        let mut hs = Builder::new(SEALING_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()?;
        let mut plain = Zeroizing::new(vec![0u8; token.len()]);
        let len = hs
            .read_message(token, &mut plain)
            .map_err(|_| CryptoError::BadResumeToken)?;
        Self::from_bytes(&plain[..len])
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("ciphertext too short (need at least 24 bytes: 8 nonce + 16 MAC)")]
    TooShort,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("secure handshake is not complete")]
    HandshakeIncomplete,

    #[error("handshake message arrived while it was our turn to send")]
    UnexpectedHandshakeMessage,

    #[error("expected a 32-byte key, got {0} bytes")]
    BadKeyLength(usize),

    #[error("resume token cannot be opened")]
    BadResumeToken,

    #[error("keypair file {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a complete handshake by shuttling flights between two endpoints.
    fn established_pair() -> (SecureEndpoint, SecureEndpoint) {
        let mut client = SecureEndpoint::new(Role::Client, &Keypair::generate()).unwrap();
        let mut server = SecureEndpoint::new(Role::Server, &Keypair::generate()).unwrap();

        let msg1 = client.handshake_step(&[]).unwrap().expect("client speaks first");
        let msg2 = server.handshake_step(&msg1).unwrap().expect("server answers");
        let msg3 = client.handshake_step(&msg2).unwrap().expect("client final flight");
        assert!(client.is_handshake_over());
        assert!(server.handshake_step(&msg3).unwrap().is_none());
        assert!(server.is_handshake_over());
        (client, server)
    }

    // ── Keypair ───────────────────────────────────────────────────────────────

    #[test]
    fn keypair_roundtrip_via_private_bytes() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::from_private(*kp1.private_bytes());
        assert_eq!(kp1.public, kp2.public);
    }

    #[test]
    fn keypair_file_is_created_then_reused() {
        let dir = std::env::temp_dir().join(format!("mockets-keypair-test-{}", std::process::id()));
        let path = dir.join("keypair");
        let kp1 = Keypair::load_or_generate(&path).unwrap();
        let kp2 = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(kp1.public, kp2.public);
        let _ = std::fs::remove_dir_all(&dir);
    }

    // ── Secure Endpoint ───────────────────────────────────────────────────────

    #[test]
    fn server_waits_for_input() {
        let mut server = SecureEndpoint::new(Role::Server, &Keypair::generate()).unwrap();
        assert!(server.handshake_step(&[]).unwrap().is_none());
        assert!(!server.is_handshake_over());
    }

    #[test]
    fn first_flight_is_a_bare_ephemeral_key() {
        let mut client = SecureEndpoint::new(Role::Client, &Keypair::generate()).unwrap();
        let msg1 = client.handshake_step(&[]).unwrap().unwrap();
        assert_eq!(msg1.len(), FIRST_FLIGHT_SIZE);
    }

    #[test]
    fn handshake_completes_on_both_sides() {
        let (client, server) = established_pair();
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.remote_public_key(), Some(server.public_key()));
        assert_eq!(server.remote_public_key(), Some(client.public_key()));
    }

    #[test]
    fn records_flow_both_directions() {
        let (mut client, mut server) = established_pair();
        let sealed = client.prepare_for_sending(&[7u8; 100]).unwrap();
        assert_eq!(sealed.len(), 100 + RECORD_OVERHEAD);
        assert_eq!(server.recover_data(&sealed).unwrap(), vec![7u8; 100]);

        let back = server.prepare_for_sending(b"pong").unwrap();
        assert_eq!(client.recover_data(&back).unwrap(), b"pong");
    }

    #[test]
    fn sealing_before_handshake_fails() {
        let mut client = SecureEndpoint::new(Role::Client, &Keypair::generate()).unwrap();
        assert!(matches!(
            client.prepare_for_sending(b"early"),
            Err(CryptoError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn garbage_handshake_input_errors_and_reset_recovers() {
        let mut server = SecureEndpoint::new(Role::Server, &Keypair::generate()).unwrap();
        let mut client = SecureEndpoint::new(Role::Client, &Keypair::generate()).unwrap();
        let msg1 = client.handshake_step(&[]).unwrap().unwrap();
        let msg2 = server.handshake_step(&msg1).unwrap().unwrap();

        // a second copy of msg1 arrives while the server expects msg3
        assert!(server.handshake_step(&msg1).is_err());
        server.reset().unwrap();
        let msg2_again = server.handshake_step(&msg1).unwrap().unwrap();
        assert_ne!(msg2, msg2_again);
    }

    #[test]
    fn tampered_record_is_rejected() {
        let (mut client, mut server) = established_pair();
        let mut sealed = client.prepare_for_sending(b"important data").unwrap();
        sealed[12] ^= 0xFF;
        assert!(server.recover_data(&sealed).is_err());
    }

    #[test]
    fn replayed_record_is_rejected() {
        let (mut client, mut server) = established_pair();
        let sealed = client.prepare_for_sending(b"once only").unwrap();
        server.recover_data(&sealed).unwrap();
        assert!(matches!(server.recover_data(&sealed), Err(CryptoError::Replay)));
    }

    #[test]
    fn out_of_order_records() {
        let (mut client, mut server) = established_pair();
        let r0 = client.prepare_for_sending(b"msg0").unwrap();
        let r1 = client.prepare_for_sending(b"msg1").unwrap();
        let r2 = client.prepare_for_sending(b"msg2").unwrap();
        assert_eq!(server.recover_data(&r2).unwrap(), b"msg2");
        assert_eq!(server.recover_data(&r0).unwrap(), b"msg0");
        assert_eq!(server.recover_data(&r1).unwrap(), b"msg1");
    }

    #[test]
    fn too_short_record_rejected() {
        let (_, mut server) = established_pair();
        assert!(matches!(server.recover_data(&[0u8; 20]), Err(CryptoError::TooShort)));
    }

    // ── ReplayWindow ─────────────────────────────────────────────────────────

    #[test]
    fn replay_window_accepts_sequential_nonces() {
        let mut w = ReplayWindow::new();
        for i in 0..100 {
            assert!(w.check(i), "nonce {i} should be accepted");
            w.mark(i);
        }
    }

    #[test]
    fn replay_window_rejects_too_old() {
        let mut w = ReplayWindow::new();
        w.mark(WINDOW_SIZE + 100);
        assert!(!w.check(0));
    }

    #[test]
    fn replay_window_advancement() {
        let mut w = ReplayWindow::new();
        for i in 0..10 {
            w.mark(i);
        }
        w.mark(5000);
        assert!(!w.check(0));
        assert!(w.check(4999));
    }

    // ── Resume Tokens ─────────────────────────────────────────────────────────

    #[test]
    fn resume_token_opens_with_matching_key() {
        let client = Keypair::generate();
        let creds = ResumeCredentials::generate();
        let token = creds.seal(&client.public).unwrap();
        assert_eq!(token.len(), 32 + ResumeCredentials::SIZE + 16);

        let opened = ResumeCredentials::open(&client, &token).unwrap();
        assert_eq!(opened.secret, creds.secret);
        assert_eq!(opened.connection_uuid, creds.connection_uuid);
        assert_eq!(opened.connection_uuid[6] >> 4, 4);
    }

    #[test]
    fn resume_token_rejects_other_key() {
        let creds = ResumeCredentials::generate();
        let token = creds.seal(&Keypair::generate().public).unwrap();
        assert!(matches!(
            ResumeCredentials::open(&Keypair::generate(), &token),
            Err(CryptoError::BadResumeToken)
        ));
    }

    #[test]
    fn sealing_needs_a_32_byte_key() {
        let creds = ResumeCredentials::generate();
        assert!(matches!(creds.seal(&[1u8; 31]), Err(CryptoError::BadKeyLength(31))));
    }
}
