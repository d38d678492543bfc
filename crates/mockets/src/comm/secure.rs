//! Secure transport decorator.
//!
//! Wraps another [`CommInterface`] and runs a [`SecureEndpoint`] over it. The
//! endpoint never sees a socket: its handshake flights and sealed records are
//! plain buffers this module moves through the inner transport.
//!
//! A client starts the handshake from `send_to`; a server answers handshake
//! flights as they show up in `receive`. One peer is served at a time. Once
//! the handshake is over, `send_to` seals and `receive` opens application
//! datagrams transparently.
//!
//! An established server session is never torn down by a datagram it cannot
//! open. A fresh first flight starts a second handshake beside the session,
//! and the session is swapped only when that handshake completes.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use mockets_core::config::SecurityConfig;
use mockets_core::crypto::{Keypair, Role, SecureEndpoint, FIRST_FLIGHT_SIZE, RECORD_OVERHEAD};
use mockets_core::wire::HANDSHAKE_BUFFER_SIZE;

use super::{CommError, CommInterface};

/// Retry budget and record size limit of the secure channel.
#[derive(Debug, Clone, Copy)]
pub struct SecureSettings {
    /// Retransmissions of one handshake flight before giving up.
    pub attempts: u32,
    /// Receive timeout while a handshake is in flight.
    pub interval: Duration,
    /// Largest sealed record.
    pub mtu: usize,
}

impl From<&SecurityConfig> for SecureSettings {
    fn from(c: &SecurityConfig) -> Self {
        Self {
            attempts: c.handshake_attempts,
            interval: c.handshake_interval(),
            mtu: c.mtu,
        }
    }
}

enum HandshakeState {
    NotStarted,
    AwaitingPeer {
        peer: SocketAddr,
        last_sent: Option<Bytes>,
        retransmissions: u32,
    },
    Complete {
        peer: SocketAddr,
        /// Client only: resent when the server shows it never got it.
        final_flight: Option<Bytes>,
    },
}

/// Server side: a handshake running beside an established session.
struct PendingRestart {
    peer: SocketAddr,
    endpoint: SecureEndpoint,
}

struct Channel {
    endpoint: SecureEndpoint,
    handshake: HandshakeState,
    restart: Option<PendingRestart>,
}

pub struct SecureCommInterface {
    inner: Box<dyn CommInterface>,
    keypair: Keypair,
    role: Role,
    settings: SecureSettings,
    user_timeout: Mutex<Option<Duration>>,
    channel: Mutex<Channel>,
    /// Held by whichever thread is reading the inner transport.
    reader: Mutex<()>,
}

impl SecureCommInterface {
    pub fn new(
        inner: Box<dyn CommInterface>,
        role: Role,
        keypair: &Keypair,
        settings: SecureSettings,
    ) -> Result<Self, CommError> {
        Ok(Self {
            inner,
            keypair: keypair.clone(),
            role,
            settings,
            user_timeout: Mutex::new(None),
            channel: Mutex::new(Channel {
                endpoint: SecureEndpoint::new(role, keypair)?,
                handshake: HandshakeState::NotStarted,
                restart: None,
            }),
            reader: Mutex::new(()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Largest plaintext that fits one sealed record.
    pub fn max_payload(&self) -> usize {
        self.settings.mtu.saturating_sub(RECORD_OVERHEAD)
    }

    pub fn is_handshake_over(&self) -> bool {
        matches!(self.channel().handshake, HandshakeState::Complete { .. })
    }

    /// Peer of the completed handshake.
    pub fn secured_peer(&self) -> Option<SocketAddr> {
        match self.channel().handshake {
            HandshakeState::Complete { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub fn remote_public_key(&self) -> Option<[u8; 32]> {
        self.channel().endpoint.remote_public_key()
    }

    fn channel(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user_timeout(&self) -> Option<Duration> {
        *self.user_timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop all handshake state and go back to the configured user timeout.
    fn reset(&self, ch: &mut Channel) -> Result<(), CommError> {
        ch.endpoint.reset()?;
        ch.handshake = HandshakeState::NotStarted;
        ch.restart = None;
        self.inner.set_receive_timeout(self.user_timeout())
    }

    /// Client side: emit the first flight towards `peer`.
    fn start_handshake(&self, ch: &mut Channel, peer: SocketAddr) -> Result<(), CommError> {
        ch.endpoint.reset()?;
        let first = ch
            .endpoint
            .handshake_step(&[])
            .map_err(|source| CommError::HandshakeFailed { peer, source })?
            .map(Bytes::from);
        if let Some(flight) = &first {
            self.inner.send_to(peer, flight)?;
        }
        ch.handshake = HandshakeState::AwaitingPeer {
            peer,
            last_sent: first,
            retransmissions: 0,
        };
        self.inner.set_receive_timeout(Some(self.settings.interval))?;
        tracing::debug!(%peer, role = ?self.role, "secure handshake started");
        Ok(())
    }

    /// Feed one handshake flight to the endpoint and send whatever it answers.
    fn advance_handshake(
        &self,
        ch: &mut Channel,
        peer: SocketAddr,
        flight: &[u8],
    ) -> Result<(), CommError> {
        let output = ch
            .endpoint
            .handshake_step(flight)
            .map_err(|source| CommError::HandshakeFailed { peer, source })?
            .map(Bytes::from);
        if let Some(out) = &output {
            self.inner.send_to(peer, out)?;
        }

        if ch.endpoint.is_handshake_over() {
            ch.handshake = HandshakeState::Complete {
                peer,
                final_flight: output,
            };
            self.inner.set_receive_timeout(self.user_timeout())?;
            tracing::info!(%peer, role = ?self.role, "secure handshake complete");
        } else {
            ch.handshake = HandshakeState::AwaitingPeer {
                peer,
                last_sent: output,
                retransmissions: 0,
            };
            self.inner.set_receive_timeout(Some(self.settings.interval))?;
        }
        Ok(())
    }

    /// Server side: run `data` through a new responder. Returns the responder
    /// and its reply when `data` is a well-formed first flight.
    fn fresh_responder(&self, from: SocketAddr, data: &[u8]) -> Option<(SecureEndpoint, Option<Bytes>)> {
        if data.len() != FIRST_FLIGHT_SIZE {
            tracing::trace!(peer_addr = %from, len = data.len(), "not a first flight; dropped");
            return None;
        }
        let mut endpoint = match SecureEndpoint::new(Role::Server, &self.keypair) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create secure responder");
                return None;
            }
        };
        match endpoint.handshake_step(data) {
            Ok(reply) => Some((endpoint, reply.map(Bytes::from))),
            Err(e) => {
                tracing::debug!(peer_addr = %from, error = %e, "dropping invalid handshake flight");
                None
            }
        }
    }

    fn send_flight(&self, peer: SocketAddr, flight: Option<&Bytes>) -> bool {
        let Some(flight) = flight else {
            return true;
        };
        match self.inner.send_to(peer, flight) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to send handshake flight");
                false
            }
        }
    }

    /// Server side: a datagram that may open a handshake while no session is
    /// up. The current handshake state is replaced only if `data` is valid.
    fn accept_first_flight(&self, ch: &mut Channel, from: SocketAddr, data: &[u8]) {
        let Some((endpoint, reply)) = self.fresh_responder(from, data) else {
            return;
        };
        if !self.send_flight(from, reply.as_ref()) {
            return;
        }
        ch.endpoint = endpoint;
        ch.restart = None;
        ch.handshake = HandshakeState::AwaitingPeer {
            peer: from,
            last_sent: reply,
            retransmissions: 0,
        };
        if let Err(e) = self.inner.set_receive_timeout(Some(self.settings.interval)) {
            tracing::warn!(error = %e, "failed to arm handshake timeout");
        }
        tracing::debug!(peer_addr = %from, "secure handshake started");
    }

    /// Server side: a datagram the established session could not open. It
    /// either advances a handshake running beside the session or starts one;
    /// anything else is dropped. The session is replaced only once the side
    /// handshake completes.
    fn advance_restart(&self, ch: &mut Channel, from: SocketAddr, data: &[u8]) {
        if let Some(pending) = ch.restart.as_mut().filter(|r| r.peer == from) {
            match pending.endpoint.handshake_step(data) {
                Ok(reply) => {
                    let reply = reply.map(Bytes::from);
                    self.send_flight(from, reply.as_ref());
                    if pending.endpoint.is_handshake_over() {
                        if let Some(done) = ch.restart.take() {
                            ch.endpoint = done.endpoint;
                            ch.handshake = HandshakeState::Complete {
                                peer: from,
                                final_flight: None,
                            };
                            tracing::info!(peer_addr = %from, "secure session replaced by a new handshake");
                        }
                    }
                    return;
                }
                Err(e) => {
                    tracing::trace!(peer_addr = %from, error = %e, "flight rejected by pending handshake");
                }
            }
        }
        let Some((endpoint, reply)) = self.fresh_responder(from, data) else {
            return;
        };
        if self.send_flight(from, reply.as_ref()) {
            tracing::debug!(peer_addr = %from, "new handshake beside the established session");
            ch.restart = Some(PendingRestart {
                peer: from,
                endpoint,
            });
        }
    }

    /// Read one datagram from the inner transport and run it through the
    /// handshake or the record layer. Caller holds `reader`.
    fn pump_once(
        &self,
        buf: &mut [u8],
        scratch: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, CommError> {
        let received = self.inner.receive(scratch)?;
        let mut ch = self.channel();

        let Some((n, from)) = received else {
            return self.on_timeout(&mut ch).map(|()| None);
        };
        let data = &scratch[..n];

        match ch.handshake {
            HandshakeState::NotStarted => {
                if self.role == Role::Server {
                    self.accept_first_flight(&mut ch, from, data);
                } else {
                    tracing::trace!(peer_addr = %from, "datagram before handshake; dropped");
                }
                Ok(None)
            }
            HandshakeState::AwaitingPeer { peer, .. } => {
                if from != peer {
                    tracing::trace!(peer_addr = %from, %peer, "handshake in progress; dropped");
                    return Ok(None);
                }
                match self.advance_handshake(&mut ch, peer, data) {
                    Ok(()) => Ok(None),
                    Err(e) if self.role == Role::Server => {
                        // most often the client retransmitted its first flight
                        tracing::debug!(peer_addr = %from, error = %e, "restarting handshake");
                        self.accept_first_flight(&mut ch, from, data);
                        Ok(None)
                    }
                    Err(e) => {
                        tracing::warn!(peer_addr = %from, error = %e, "secure handshake aborted");
                        self.reset(&mut ch)?;
                        Err(e)
                    }
                }
            }
            HandshakeState::Complete { peer, .. } => {
                if from == peer {
                    let final_flight = match &ch.handshake {
                        HandshakeState::Complete { final_flight, .. } => final_flight.clone(),
                        _ => None,
                    };
                    match ch.endpoint.recover_data(data) {
                        Ok(plain) => {
                            let len = plain.len().min(buf.len());
                            buf[..len].copy_from_slice(&plain[..len]);
                            return Ok(Some((len, from)));
                        }
                        Err(e) if self.role == Role::Client => {
                            if let Some(flight) = final_flight {
                                tracing::debug!(peer_addr = %from, "peer still handshaking; resending final flight");
                                self.inner.send_to(peer, &flight)?;
                            } else {
                                tracing::warn!(peer_addr = %from, error = %e, "dropping undecryptable record");
                            }
                            return Ok(None);
                        }
                        Err(e) => {
                            tracing::trace!(peer_addr = %from, error = %e, "undecryptable record");
                        }
                    }
                }
                if self.role == Role::Server {
                    self.advance_restart(&mut ch, from, data);
                } else {
                    tracing::trace!(peer_addr = %from, %peer, "datagram from another host; dropped");
                }
                Ok(None)
            }
        }
    }

    fn on_timeout(&self, ch: &mut Channel) -> Result<(), CommError> {
        let HandshakeState::AwaitingPeer {
            peer,
            ref last_sent,
            ref mut retransmissions,
        } = ch.handshake
        else {
            return Ok(());
        };
        if *retransmissions >= self.settings.attempts {
            let attempts = *retransmissions;
            tracing::warn!(%peer, attempts, "secure handshake timed out");
            self.reset(ch)?;
            return Err(CommError::HandshakeTimedOut { peer, attempts });
        }
        *retransmissions += 1;
        if let Some(flight) = last_sent {
            tracing::trace!(%peer, attempt = *retransmissions, "resending handshake flight");
            self.inner.send_to(peer, flight)?;
        }
        Ok(())
    }

    /// Client side: block until the handshake with `peer` is over.
    fn handshake_with(&self, peer: SocketAddr) -> Result<(), CommError> {
        let mut scratch = vec![0u8; HANDSHAKE_BUFFER_SIZE];
        let mut sink = [0u8; 0];
        loop {
            {
                let mut ch = self.channel();
                match ch.handshake {
                    HandshakeState::Complete { peer: p, .. } if p == peer => return Ok(()),
                    HandshakeState::AwaitingPeer { peer: p, .. } if p == peer => {}
                    _ => self.start_handshake(&mut ch, peer)?,
                }
            }
            let _reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(self.channel().handshake, HandshakeState::Complete { peer: p, .. } if p == peer)
            {
                return Ok(());
            }
            self.pump_once(&mut sink, &mut scratch)?;
        }
    }
}

impl CommInterface for SecureCommInterface {
    fn bind(&self, addr: SocketAddr) -> Result<(), CommError> {
        self.inner.bind(addr)
    }

    fn local_addr(&self) -> Result<SocketAddr, CommError> {
        self.inner.local_addr()
    }

    fn close(&self) -> Result<(), CommError> {
        self.inner.close()
    }

    fn shutdown(&self, read: bool, write: bool) -> Result<(), CommError> {
        self.inner.shutdown(read, write)
    }

    /// Applied to the inner transport whenever no handshake is in flight.
    fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), CommError> {
        *self.user_timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        if matches!(self.channel().handshake, HandshakeState::AwaitingPeer { .. }) {
            return Ok(());
        }
        self.inner.set_receive_timeout(timeout)
    }

    fn set_receive_buffer_size(&self, bytes: usize) -> Result<(), CommError> {
        self.inner.set_receive_buffer_size(bytes)
    }

    fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize, CommError> {
        if buf.len() + RECORD_OVERHEAD > self.settings.mtu {
            return Err(CommError::MessageTooLarge {
                len: buf.len(),
                max: self.max_payload(),
            });
        }
        if self.role == Role::Client {
            self.handshake_with(addr)?;
        }

        let mut ch = self.channel();
        if !matches!(ch.handshake, HandshakeState::Complete { peer, .. } if peer == addr) {
            return Err(CommError::NotEstablished(addr));
        }
        let record = ch.endpoint.prepare_for_sending(buf)?;
        drop(ch);
        self.inner.send_to(addr, &record)?;
        Ok(buf.len())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, CommError> {
        let mut scratch = vec![0u8; HANDSHAKE_BUFFER_SIZE];
        let _reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        self.pump_once(buf, &mut scratch)
    }

    fn last_error(&self) -> Option<i32> {
        self.inner.last_error()
    }

    fn new_instance(&self) -> Result<Box<dyn CommInterface>, CommError> {
        let inner = self.inner.new_instance()?;
        Ok(Box::new(SecureCommInterface::new(
            inner,
            self.role,
            &self.keypair,
            self.settings,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MemoryCommInterface;
    use std::sync::Arc;
    use std::thread;

    fn settings() -> SecureSettings {
        SecureSettings {
            attempts: 20,
            interval: Duration::from_millis(30),
            mtu: 1400,
        }
    }

    fn bridged_pair() -> (Arc<SecureCommInterface>, Arc<SecureCommInterface>, SocketAddr, SocketAddr) {
        let a: SocketAddr = "10.1.0.1:5000".parse().unwrap();
        let z: SocketAddr = "10.1.0.2:6000".parse().unwrap();
        let (ca, cz) = MemoryCommInterface::pair(a, z);
        let client =
            SecureCommInterface::new(Box::new(ca), Role::Client, &Keypair::generate(), settings())
                .unwrap();
        let server =
            SecureCommInterface::new(Box::new(cz), Role::Server, &Keypair::generate(), settings())
                .unwrap();
        (Arc::new(client), Arc::new(server), a, z)
    }

    /// Server thread that receives until one application datagram arrives.
    fn serve_one(server: Arc<SecureCommInterface>) -> thread::JoinHandle<(Vec<u8>, SocketAddr)> {
        thread::spawn(move || {
            server.set_receive_timeout(Some(Duration::from_millis(50))).unwrap();
            let mut buf = [0u8; 2048];
            loop {
                if let Some((n, from)) = server.receive(&mut buf).unwrap() {
                    return (buf[..n].to_vec(), from);
                }
            }
        })
    }

    #[test]
    fn payload_survives_the_bridge() {
        let (client, server, a, z) = bridged_pair();
        let handle = serve_one(server.clone());

        let payload: Vec<u8> = (0..100u8).collect();
        assert_eq!(client.send_to(z, &payload).unwrap(), 100);
        let (got, from) = handle.join().unwrap();

        assert_eq!(got, payload);
        assert_eq!(from, a);
        assert!(client.is_handshake_over());
        assert!(server.is_handshake_over());
        assert_eq!(server.remote_public_key(), Some(client.keypair.public));
    }

    #[test]
    fn replies_flow_back_to_the_client() {
        let (client, server, a, z) = bridged_pair();
        let handle = serve_one(server.clone());
        client.send_to(z, b"ping").unwrap();
        handle.join().unwrap();

        server.send_to(a, b"pong").unwrap();
        client.set_receive_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = client.receive(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, z);
    }

    #[test]
    fn lost_first_flight_is_retransmitted() {
        let a: SocketAddr = "10.1.0.1:5000".parse().unwrap();
        let z: SocketAddr = "10.1.0.2:6000".parse().unwrap();
        let (ca, cz) = MemoryCommInterface::pair(a, z);
        ca.drop_next_outbound(1);
        let client = SecureCommInterface::new(Box::new(ca), Role::Client, &Keypair::generate(), settings()).unwrap();
        let server = Arc::new(
            SecureCommInterface::new(Box::new(cz), Role::Server, &Keypair::generate(), settings())
                .unwrap(),
        );
        let handle = serve_one(server);
        client.send_to(z, b"after loss").unwrap();
        assert_eq!(handle.join().unwrap().0, b"after loss");
    }

    #[test]
    fn handshake_gives_up_without_a_peer() {
        let a: SocketAddr = "10.1.0.1:5000".parse().unwrap();
        let z: SocketAddr = "10.1.0.2:6000".parse().unwrap();
        let (ca, _cz) = MemoryCommInterface::pair(a, z);
        let client = SecureCommInterface::new(
            Box::new(ca),
            Role::Client,
            &Keypair::generate(),
            SecureSettings {
                attempts: 3,
                interval: Duration::from_millis(5),
                mtu: 1400,
            },
        )
        .unwrap();
        assert!(matches!(
            client.send_to(z, b"nobody home"),
            Err(CommError::HandshakeTimedOut { attempts: 3, .. })
        ));
        assert!(!client.is_handshake_over());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (client, _server, _a, z) = bridged_pair();
        let big = vec![0u8; 1400];
        assert!(matches!(
            client.send_to(z, &big),
            Err(CommError::MessageTooLarge { max: 1376, .. })
        ));
    }

    #[test]
    fn server_cannot_send_before_handshake() {
        let (_client, server, a, _z) = bridged_pair();
        assert!(matches!(server.send_to(a, b"hi"), Err(CommError::NotEstablished(_))));
    }

    #[test]
    fn stray_datagrams_leave_the_session_alone() {
        let (client, server, a, z) = bridged_pair();
        let handle = serve_one(server.clone());
        client.send_to(z, b"before").unwrap();
        assert_eq!(handle.join().unwrap().0, b"before");
        let session_key = server.remote_public_key();

        // spoofed traffic from the peer's address: garbage, then something
        // shaped like a first flight that never completes
        client.inner.send_to(z, &[0xAA; 40]).unwrap();
        client.inner.send_to(z, &[0x55; FIRST_FLIGHT_SIZE]).unwrap();
        client.send_to(z, b"after").unwrap();

        let handle = serve_one(server.clone());
        let (got, from) = handle.join().unwrap();
        assert_eq!(got, b"after");
        assert_eq!(from, a);
        assert!(server.is_handshake_over());
        assert_eq!(server.remote_public_key(), session_key);
    }

    #[test]
    fn completed_rehandshake_replaces_the_session() {
        let (client, server, a, z) = bridged_pair();
        let handle = serve_one(server.clone());
        client.send_to(z, b"first life").unwrap();
        handle.join().unwrap();

        // the peer comes back at the same address with a new identity
        let reborn = Keypair::generate();
        let mut endpoint = SecureEndpoint::new(Role::Client, &reborn).unwrap();
        let handle = serve_one(server.clone());
        client.inner.set_receive_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut flight = [0u8; HANDSHAKE_BUFFER_SIZE];

        let msg1 = endpoint.handshake_step(&[]).unwrap().unwrap();
        client.inner.send_to(z, &msg1).unwrap();
        let (n, from) = client.inner.receive(&mut flight).unwrap().unwrap();
        assert_eq!(from, z);
        let msg3 = endpoint.handshake_step(&flight[..n]).unwrap().unwrap();
        assert!(endpoint.is_handshake_over());
        client.inner.send_to(z, &msg3).unwrap();
        let record = endpoint.prepare_for_sending(b"second life").unwrap();
        client.inner.send_to(z, &record).unwrap();

        let (got, from) = handle.join().unwrap();
        assert_eq!(got, b"second life");
        assert_eq!(from, a);
        assert_eq!(server.remote_public_key(), Some(reborn.public));
    }
}
