//! An established Mockets connection.
//!
//! Built from the parameters both sides agreed on during the handshake: each
//! side stamps its own validation tag on what it sends and numbers each
//! delivery class from its own initial TSN. A background pump reads the
//! transport, checks the peer's validation tag and feeds the delivery engine;
//! the application reads messages out of the engine.
//!
//! The send path fragments by MTU and can stamp delivery prerequisites. It
//! does not retransmit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mockets_core::config::MocketsConfig;
use mockets_core::crypto::{CryptoError, Keypair, ResumeCredentials, RECORD_OVERHEAD};
use mockets_core::packet::{FragmentPosition, SAck, SequencedTsns};
use mockets_core::queue::{Extract, QueuedItem, Wait};
use mockets_core::wire::{DATA_CHUNK_HEADER_SIZE, PACKET_HEADER_SIZE, PREREQUISITE_BLOCK_SIZE};
use mockets_core::{Chunk, DeliveryClass, EndpointParams, InitialTsns, Packet, PacketError};

use crate::comm::{CommError, CommInterface};
use crate::delivery::{ControlEvent, DataBuffer, DeliveryEngine, DeliverySettings, DeliveryStats};

/// Receive timeout of the pump, so delivery timeouts run and close is noticed.
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("{0:?} packets cannot carry application data")]
    InvalidClass(DeliveryClass),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Per-connection knobs derived from [`MocketsConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub mtu: usize,
    pub window_size: u32,
    pub delivery: DeliverySettings,
}

impl From<&MocketsConfig> for ConnectionSettings {
    fn from(c: &MocketsConfig) -> Self {
        let mut mtu = c.network.effective_mtu();
        if c.security.enabled {
            mtu = mtu.min(c.security.mtu.saturating_sub(RECORD_OVERHEAD));
        }
        Self {
            mtu,
            window_size: c.handshake.maximum_window_size,
            delivery: DeliverySettings::from(&c.delivery),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&MocketsConfig::default())
    }
}

// ── Send counters ─────────────────────────────────────────────────────────────

/// Next TSN / message id to use, per delivery class.
struct SendCounters(InitialTsns);

impl SendCounters {
    /// Reserve `n` consecutive numbers of `class`, returning the first.
    fn take(&mut self, class: DeliveryClass, n: u32) -> u32 {
        let counter = match class {
            DeliveryClass::Control => &mut self.0.control,
            DeliveryClass::ReliableSequenced => &mut self.0.reliable_sequenced,
            DeliveryClass::UnreliableSequenced => &mut self.0.unreliable_sequenced,
            DeliveryClass::ReliableUnsequenced => &mut self.0.reliable_unsequenced_id,
            DeliveryClass::UnreliableUnsequenced => &mut self.0.unreliable_unsequenced_id,
        };
        let first = *counter;
        *counter = counter.wrapping_add(n);
        first
    }

    fn sequenced(&self) -> SequencedTsns {
        SequencedTsns {
            control: self.0.control,
            reliable_sequenced: self.0.reliable_sequenced,
            unreliable_sequenced: self.0.unreliable_sequenced,
        }
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

struct Shared {
    comm: Arc<dyn CommInterface>,
    peer: SocketAddr,
    local: EndpointParams,
    remote: EndpointParams,
    settings: ConnectionSettings,
    counters: Mutex<SendCounters>,
    engine: DeliveryEngine,
    closed: AtomicBool,
}

pub struct Connection {
    shared: Arc<Shared>,
    resume_token: Option<Vec<u8>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedItem for Connection {
    fn item_size(&self) -> usize {
        0
    }
}

impl Connection {
    /// Start a connection over `comm`, already bound, talking to `peer`.
    pub(crate) fn establish(
        comm: Arc<dyn CommInterface>,
        peer: SocketAddr,
        local: EndpointParams,
        remote: EndpointParams,
        settings: ConnectionSettings,
        resume_token: Option<Vec<u8>>,
    ) -> Result<Self, ConnectionError> {
        comm.set_receive_timeout(Some(PUMP_POLL_INTERVAL))?;
        let shared = Arc::new(Shared {
            comm,
            peer,
            local,
            remote,
            settings,
            counters: Mutex::new(SendCounters(local.tsns)),
            engine: DeliveryEngine::new(&remote.tsns, settings.delivery),
            closed: AtomicBool::new(false),
        });

        let pump_shared = shared.clone();
        let pump = std::thread::Builder::new()
            .name(format!("mockets-pump-{peer}"))
            .spawn(move || pump_shared.run_pump())
            .map_err(CommError::from)?;

        tracing::info!(
            peer_addr = %peer,
            local_validation = local.validation,
            remote_validation = remote.validation,
            "connection established"
        );
        Ok(Self {
            shared,
            resume_token,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.shared.comm.local_addr()?)
    }

    /// Validation tag and initial TSNs this side sends with.
    pub fn local_params(&self) -> EndpointParams {
        self.shared.local
    }

    /// Validation tag and initial TSNs the peer sends with.
    pub fn remote_params(&self) -> EndpointParams {
        self.shared.remote
    }

    /// Sealed resume token issued by the server, if one was requested.
    pub fn resume_token(&self) -> Option<&[u8]> {
        self.resume_token.as_deref()
    }

    /// Open the resume token with the key it was sealed to.
    pub fn resume_credentials(&self, keypair: &Keypair) -> Option<Result<ResumeCredentials, CryptoError>> {
        self.resume_token
            .as_deref()
            .map(|token| ResumeCredentials::open(keypair, token))
    }

    pub fn mtu(&self) -> usize {
        self.shared.settings.mtu
    }

    /// Send one message with the given delivery class.
    pub fn send(&self, class: DeliveryClass, tag: u16, data: &[u8]) -> Result<(), ConnectionError> {
        self.shared.send_message(class, tag, data, false)
    }

    /// Send one message that the peer may deliver only after everything
    /// this side has sent so far on the other sequenced classes.
    pub fn send_ordered(&self, class: DeliveryClass, tag: u16, data: &[u8]) -> Result<(), ConnectionError> {
        self.shared.send_message(class, tag, data, true)
    }

    pub fn next_message_size(&self, wait: Wait) -> Extract<usize> {
        self.shared.engine.next_message_size(wait)
    }

    /// Copy the next message into `buf`, truncating what does not fit.
    pub fn receive(&self, buf: &mut [u8], wait: Wait) -> Extract<usize> {
        self.shared.engine.receive(buf, wait)
    }

    pub fn receive_vectored(&self, bufs: &mut [&mut [u8]], wait: Wait) -> Extract<usize> {
        self.shared.engine.receive_vectored(bufs, wait)
    }

    pub fn receive_message(&self, wait: Wait) -> Extract<DataBuffer> {
        self.shared.engine.receive_buffer(wait)
    }

    pub fn cumulative_size_of_available_messages(&self) -> usize {
        self.shared.engine.cumulative_size_of_available_messages()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.shared.engine.stats()
    }

    /// What this side would acknowledge right now.
    pub fn acknowledgement(&self) -> SAck {
        self.shared.engine.sack()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tell the peer we are going away and stop delivering. Messages already
    /// received stay readable.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.send_control(&Chunk::Shutdown) {
            tracing::debug!(peer_addr = %self.shared.peer, error = %e, "failed to send Shutdown");
        }
        self.shared.engine.close();
        tracing::debug!(peer_addr = %self.shared.peer, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
        let pump = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = pump {
            if handle.join().is_err() {
                tracing::warn!(peer_addr = %self.shared.peer, "receive pump panicked");
            }
        }
        if let Err(e) = self.shared.comm.close() {
            tracing::debug!(error = %e, "transport close failed");
        }
    }
}

impl Shared {
    fn counters(&self) -> MutexGuard<'_, SendCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_packet(&self, class: DeliveryClass, tsn: u32) -> Result<Packet<'static>, PacketError> {
        let mut p = Packet::new(self.settings.mtu)?;
        p.set_validation(self.local.validation)?;
        p.set_window_size(self.settings.window_size)?;
        p.set_delivery_class(class)?;
        p.set_sequence_num(tsn)?;
        Ok(p)
    }

    fn send_message(
        &self,
        class: DeliveryClass,
        tag: u16,
        data: &[u8],
        ordered: bool,
    ) -> Result<(), ConnectionError> {
        if class == DeliveryClass::Control {
            return Err(ConnectionError::InvalidClass(class));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        let ordered = ordered && class.is_sequenced();
        let overhead = PACKET_HEADER_SIZE
            + DATA_CHUNK_HEADER_SIZE
            + if ordered { PREREQUISITE_BLOCK_SIZE } else { 0 };
        let room = self.settings.mtu.saturating_sub(overhead).max(1);
        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(room).collect()
        };
        let count = pieces.len();

        // counters stay locked so the fragments get consecutive numbers
        let mut counters = self.counters();
        let prerequisites = counters.sequenced();
        let first = counters.take(class, count as u32);
        for (i, piece) in pieces.into_iter().enumerate() {
            let tsn = first.wrapping_add(i as u32);
            let mut p = self.new_packet(class, tsn)?;
            if count > 1 {
                p.set_fragment(Some(match i {
                    0 => FragmentPosition::First,
                    i if i + 1 == count => FragmentPosition::Last,
                    _ => FragmentPosition::Intermediate,
                }))?;
            }
            if ordered {
                p.allocate_delivery_prerequisites()?;
                p.set_delivery_prerequisites(&prerequisites)?;
            }
            p.add_data_chunk(tag, piece)?;
            self.comm.send_to(self.peer, p.as_bytes())?;
            tracing::trace!(peer_addr = %self.peer, tsn, ?class, len = piece.len(), "sent packet");
        }
        Ok(())
    }

    fn send_control(&self, chunk: &Chunk<'_>) -> Result<(), ConnectionError> {
        let mut counters = self.counters();
        let tsn = counters.take(DeliveryClass::Control, 1);
        let mut p = self.new_packet(DeliveryClass::Control, tsn)?;
        p.add_chunk(chunk)?;
        self.comm.send_to(self.peer, p.as_bytes())?;
        tracing::trace!(peer_addr = %self.peer, tsn, chunk_type = ?chunk.chunk_type(), "sent control packet");
        Ok(())
    }

    fn run_pump(&self) {
        let mut buf = vec![0u8; self.settings.mtu.max(mockets_core::wire::MAXIMUM_MTU)];
        while !self.closed.load(Ordering::Acquire) {
            match self.comm.receive(&mut buf) {
                Ok(Some((n, from))) => self.on_datagram(&buf[..n], from),
                Ok(None) => self.engine.poll(Instant::now()),
                Err(e) => {
                    let recoverable = e
                        .os_code()
                        .is_some_and(|code| self.comm.is_recoverable_error(code));
                    if recoverable {
                        tracing::debug!(error = %e, "transient receive error");
                        continue;
                    }
                    if !self.closed.load(Ordering::Acquire) {
                        tracing::warn!(peer_addr = %self.peer, error = %e, "receive failed; stopping");
                    }
                    break;
                }
            }
        }
        self.engine.close();
    }

    fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        if from != self.peer {
            tracing::trace!(peer_addr = %from, "datagram from unknown address; dropped");
            return;
        }
        let packet = match Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer_addr = %from, error = %e, "malformed packet");
                return;
            }
        };
        if packet.validation() != self.remote.validation {
            tracing::warn!(
                peer_addr = %from,
                validation = packet.validation(),
                expected = self.remote.validation,
                "validation mismatch; dropped"
            );
            return;
        }
        self.engine.packet_arrived(&packet, Instant::now());

        for event in self.engine.take_control_events() {
            tracing::debug!(peer_addr = %from, ?event, "control event");
            let reply = match event {
                ControlEvent::Shutdown => {
                    self.engine.close();
                    Some(Chunk::ShutdownAck)
                }
                ControlEvent::ShutdownAck => Some(Chunk::ShutdownComplete),
                ControlEvent::ShutdownComplete => None,
            };
            if let Some(chunk) = reply {
                if let Err(e) = self.send_control(&chunk) {
                    tracing::debug!(peer_addr = %from, error = %e, "failed to answer shutdown");
                }
            }
        }
    }
}
