//! Listening side of the connection handshakes.
//!
//! A [`ServerMocket`] owns the listening transport and one accept thread.
//! Init is answered statelessly with an InitAck carrying a StateCookie; no
//! connection exists until the client echoes that cookie back. The first
//! valid CookieEcho from an address allocates a new transport and a
//! [`Connection`]; later echoes of the same cookie are re-acknowledged with
//! the same port. New connections are handed out through [`ServerMocket::accept`].

mod cookie_table;

pub use cookie_table::{CookieRec, CookieTable, CookieTableError};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use mockets_core::config::{HandshakeMode, MocketsConfig};
use mockets_core::cookie::now_millis;
use mockets_core::crypto::{CryptoError, Keypair, ResumeCredentials, Role};
use mockets_core::queue::{BlockingQueue, Extract, Wait};
use mockets_core::wire::MAXIMUM_MTU;
use mockets_core::{Chunk, EndpointParams, Packet, PacketError, StateCookie};

use crate::comm::{CommError, CommInterface, SecureCommInterface, SecureSettings, UdpCommInterface};
use crate::connection::{Connection, ConnectionError, ConnectionSettings};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("accept loop already running")]
    AlreadyStarted,

    #[error("failed to spawn accept thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What a handshake datagram led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Not a handshake packet for the configured mode.
    Ignored,
    InitAcked,
    /// A new connection on the given local port.
    Established(u16),
    /// A replayed CookieEcho or SimpleConnect, acknowledged again.
    ReAcked(u16),
    Rejected,
}

/// Failure while setting up the connection for a first CookieEcho.
#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct ServerSettings {
    mode: HandshakeMode,
    cookie_lifespan_ms: i64,
    window_size: u32,
    connection: ConnectionSettings,
}

struct Listener {
    comm: Box<dyn CommInterface>,
    local: SocketAddr,
    settings: ServerSettings,
    cookies: Mutex<CookieTable>,
    accepted: BlockingQueue<Connection>,
    closed: AtomicBool,
}

pub struct ServerMocket {
    listener: Arc<Listener>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerMocket {
    /// Bind a UDP listener at `config.network.listen_addr`, secured when
    /// the configuration asks for it.
    pub fn bind(config: &MocketsConfig) -> Result<Self, ServerError> {
        let udp = UdpCommInterface::new();
        if config.network.receive_buffer_size > 0 {
            udp.set_receive_buffer_size(config.network.receive_buffer_size)?;
        }
        udp.bind(config.network.listen_addr)?;

        let comm: Box<dyn CommInterface> = if config.security.enabled {
            let keypair = Keypair::load_or_generate(&config.security.keypair_path)?;
            tracing::info!(public_key = hex::encode(keypair.public), "secure listener");
            Box::new(SecureCommInterface::new(
                Box::new(udp),
                Role::Server,
                &keypair,
                SecureSettings::from(&config.security),
            )?)
        } else {
            Box::new(udp)
        };
        Self::with_comm(comm, config)
    }

    /// Listen on an already bound transport. New connections get transports
    /// from its `new_instance`.
    pub fn with_comm(comm: Box<dyn CommInterface>, config: &MocketsConfig) -> Result<Self, ServerError> {
        let local = comm.local_addr()?;
        comm.set_receive_timeout(Some(config.network.accept_poll_interval()))?;
        tracing::info!(listen_addr = %local, mode = ?config.handshake.mode, "listening");
        Ok(Self {
            listener: Arc::new(Listener {
                comm,
                local,
                settings: ServerSettings {
                    mode: config.handshake.mode,
                    cookie_lifespan_ms: config.handshake.cookie_lifespan_ms,
                    window_size: config.handshake.maximum_window_size,
                    connection: ConnectionSettings::from(config),
                },
                cookies: Mutex::new(CookieTable::new(config.handshake.cookie_table_capacity)),
                accepted: BlockingQueue::new(),
                closed: AtomicBool::new(false),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local
    }

    /// Run the accept loop on its own thread.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut slot = self.accept_thread.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = self.listener.clone();
        let handle = std::thread::Builder::new()
            .name(format!("mockets-accept-{}", self.listener.local.port()))
            .spawn(move || listener.run())
            .map_err(ServerError::Spawn)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Next established connection.
    pub fn accept(&self, wait: Wait) -> Extract<Connection> {
        self.listener.accepted.extract(wait)
    }

    /// Process one datagram received on the listening transport.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> HandshakeOutcome {
        self.listener.handle_datagram(data, from)
    }

    /// Snapshot of the cookie record for `peer`, if one is live.
    pub fn cookie_record(&self, peer: &SocketAddr) -> Option<CookieRec> {
        self.listener
            .cookies()
            .lookup(peer, now_millis())
            .map(|rec| rec.clone())
    }

    /// Stop accepting. Connections already handed out are unaffected.
    pub fn close(&self) {
        if self.listener.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.accepted.close();
        if let Err(e) = self.listener.comm.close() {
            tracing::debug!(error = %e, "listener close failed");
        }
        tracing::info!(listen_addr = %self.listener.local, "listener closed");
    }
}

impl Drop for ServerMocket {
    fn drop(&mut self) {
        self.close();
        let handle = self
            .accept_thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("accept thread panicked");
            }
        }
    }
}

impl Listener {
    fn cookies(&self) -> MutexGuard<'_, CookieTable> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        let mut buf = vec![0u8; MAXIMUM_MTU];
        while !self.closed.load(Ordering::Acquire) {
            match self.comm.receive(&mut buf) {
                Ok(Some((n, from))) => {
                    let outcome = self.handle_datagram(&buf[..n], from);
                    tracing::trace!(peer_addr = %from, ?outcome, "handshake datagram");
                }
                Ok(None) => {}
                Err(e) if self.closed.load(Ordering::Acquire) => {
                    tracing::trace!(error = %e, "receive ended by close");
                }
                Err(CommError::NotBound) => {
                    tracing::warn!("listening transport closed");
                    break;
                }
                Err(e) => {
                    // a failed secure handshake abandons that peer only
                    tracing::warn!(error = %e, "accept receive failed");
                    if e.os_code().is_none() {
                        continue;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        tracing::debug!(listen_addr = %self.local, "accept loop finished");
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> HandshakeOutcome {
        let packet = match Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer_addr = %from, error = %e, "malformed handshake packet");
                return HandshakeOutcome::Rejected;
            }
        };
        let chunk = match packet.chunks().next() {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tracing::warn!(peer_addr = %from, error = %e, "malformed handshake chunk");
                return HandshakeOutcome::Rejected;
            }
            None => return HandshakeOutcome::Ignored,
        };

        match (self.settings.mode, chunk) {
            (HandshakeMode::Cookie, Chunk::Init(client)) => self.handle_init(client, from),
            (HandshakeMode::Cookie, Chunk::CookieEcho { cookie, public_key }) => {
                self.handle_cookie_echo(cookie, public_key, from)
            }
            (HandshakeMode::Simple, Chunk::SimpleConnect(client)) => {
                self.handle_simple_connect(client, from)
            }
            (_, other) => {
                tracing::debug!(peer_addr = %from, chunk_type = ?other.chunk_type(), "not a handshake packet; ignored");
                HandshakeOutcome::Ignored
            }
        }
    }

    /// Fresh server-side parameters and the cookie binding both sides.
    fn new_cookie(&self, client: EndpointParams, from: SocketAddr) -> StateCookie {
        let server = EndpointParams {
            validation: rand::random(),
            ..EndpointParams::default()
        };
        StateCookie::new(
            now_millis(),
            self.settings.cookie_lifespan_ms,
            client,
            server,
            from.port(),
            self.local.port(),
        )
    }

    fn reply_packet(&self, validation: u32, chunk: &Chunk<'_>) -> Result<Packet<'static>, PacketError> {
        let mut p = Packet::new(MAXIMUM_MTU)?;
        p.set_validation(validation)?;
        p.set_window_size(self.settings.window_size)?;
        p.set_sequence_num(0)?;
        p.add_chunk(chunk)?;
        Ok(p)
    }

    fn reply(&self, to: SocketAddr, validation: u32, chunk: &Chunk<'_>) {
        let packet = match self.reply_packet(validation, chunk) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer_addr = %to, chunk_type = ?chunk.chunk_type(), error = %e, "cannot build handshake reply");
                return;
            }
        };
        if let Err(e) = self.comm.send_to(to, packet.as_bytes()) {
            tracing::warn!(peer_addr = %to, chunk_type = ?chunk.chunk_type(), error = %e, "failed to send handshake reply");
        }
    }

    fn handle_init(&self, client: EndpointParams, from: SocketAddr) -> HandshakeOutcome {
        tracing::debug!(peer_addr = %from, "received Init");
        let cookie = self.new_cookie(client, from);
        self.reply(
            from,
            cookie.z.validation,
            &Chunk::InitAck {
                params: cookie.z,
                cookie,
            },
        );
        HandshakeOutcome::InitAcked
    }

    fn handle_cookie_echo(
        &self,
        cookie: StateCookie,
        public_key: Option<&[u8]>,
        from: SocketAddr,
    ) -> HandshakeOutcome {
        let now = now_millis();
        if cookie.is_expired(now) {
            tracing::warn!(peer_addr = %from, "expired cookie echoed");
            return HandshakeOutcome::Rejected;
        }
        if cookie.port_a != from.port() || cookie.port_z != self.local.port() {
            tracing::warn!(
                peer_addr = %from,
                port_a = cookie.port_a,
                port_z = cookie.port_z,
                "cookie issued to a different endpoint"
            );
            return HandshakeOutcome::Rejected;
        }

        let mut cookies = self.cookies();
        if let Some(rec) = cookies.lookup(&from, now) {
            if rec.cookie != cookie {
                tracing::warn!(peer_addr = %from, "echoed cookie does not match the accepted one");
                return HandshakeOutcome::Rejected;
            }
            rec.count += 1;
            let port = rec.local_port;
            let token = rec.resume_token.clone();
            drop(cookies);
            tracing::debug!(peer_addr = %from, port, "CookieEcho replayed; acknowledging again");
            self.send_cookie_ack(from, &cookie, port, token.as_deref());
            return HandshakeOutcome::ReAcked(port);
        }

        if let Err(e) = cookies.reserve(from, now) {
            tracing::warn!(peer_addr = %from, error = %e, "CookieEcho dropped");
            return HandshakeOutcome::Rejected;
        }
        drop(cookies);

        let resume_token = public_key.and_then(|key| {
            ResumeCredentials::generate()
                .seal(key)
                .map_err(|e| tracing::warn!(peer_addr = %from, error = %e, "cannot seal resume token"))
                .ok()
        });
        let Some(port) = self.admit(from, &cookie, resume_token.clone(), now) else {
            return HandshakeOutcome::Rejected;
        };
        tracing::info!(peer_addr = %from, port, resume = resume_token.is_some(), "connection accepted");
        self.send_cookie_ack(from, &cookie, port, resume_token.as_deref());
        HandshakeOutcome::Established(port)
    }

    /// Build the connection for a peer holding a reservation, commit its
    /// cookie record and queue it for `accept`. The cookie table is only
    /// locked to commit or release the reservation.
    fn admit(
        &self,
        from: SocketAddr,
        cookie: &StateCookie,
        resume_token: Option<Vec<u8>>,
        now: i64,
    ) -> Option<u16> {
        let opened = self.open_connection(from, cookie);

        let mut cookies = self.cookies();
        let (connection, port) = match opened {
            Ok(c) => c,
            Err(e) => {
                cookies.release(&from);
                drop(cookies);
                tracing::warn!(peer_addr = %from, error = %e, "failed to set up connection");
                return None;
            }
        };
        let mut rec = CookieRec::new(*cookie, port);
        rec.resume_token = resume_token;
        rec.count = 1;
        if let Err(e) = cookies.insert(from, rec, now) {
            drop(cookies);
            tracing::warn!(peer_addr = %from, error = %e, "cookie record not stored");
            connection.close();
            return None;
        }
        drop(cookies);

        if self.accepted.insert(connection).is_err() {
            tracing::debug!(peer_addr = %from, "listener closed during handshake");
            return None;
        }
        Some(port)
    }

    fn send_cookie_ack(&self, to: SocketAddr, cookie: &StateCookie, port: u16, token: Option<&[u8]>) {
        self.reply(
            to,
            cookie.z.validation,
            &Chunk::CookieAck {
                port,
                resume_token: token,
            },
        );
    }

    fn handle_simple_connect(&self, client: EndpointParams, from: SocketAddr) -> HandshakeOutcome {
        tracing::debug!(peer_addr = %from, "received SimpleConnect");
        let now = now_millis();
        let mut cookies = self.cookies();
        if let Some(rec) = cookies.lookup(&from, now) {
            if rec.cookie.a == client {
                rec.count += 1;
                let (cookie, port) = (rec.cookie, rec.local_port);
                drop(cookies);
                self.send_simple_ack(from, &cookie, port);
                return HandshakeOutcome::ReAcked(port);
            }
        }
        if let Err(e) = cookies.reserve(from, now) {
            tracing::warn!(peer_addr = %from, error = %e, "SimpleConnect dropped");
            return HandshakeOutcome::Rejected;
        }
        drop(cookies);

        let cookie = self.new_cookie(client, from);
        let Some(port) = self.admit(from, &cookie, None, now) else {
            return HandshakeOutcome::Rejected;
        };
        tracing::info!(peer_addr = %from, port, "connection accepted");
        self.send_simple_ack(from, &cookie, port);
        HandshakeOutcome::Established(port)
    }

    fn send_simple_ack(&self, to: SocketAddr, cookie: &StateCookie, port: u16) {
        self.reply(
            to,
            cookie.z.validation,
            &Chunk::SimpleConnectAck {
                params: cookie.z,
                port,
                cookie: *cookie,
            },
        );
    }

    /// New transport on the listening address and a connection over it.
    fn open_connection(&self, peer: SocketAddr, cookie: &StateCookie) -> Result<(Connection, u16), SetupError> {
        let comm = self.comm.new_instance()?;
        comm.bind(SocketAddr::new(self.listen_ip(), 0))?;
        let port = comm.local_addr()?.port();
        tracing::debug!(peer_addr = %peer, port, "allocated port for new connection");
        let connection = Connection::establish(
            Arc::from(comm),
            peer,
            cookie.z,
            cookie.a,
            self.settings.connection,
            None,
        )?;
        Ok((connection, port))
    }

    fn listen_ip(&self) -> IpAddr {
        self.local.ip()
    }
}
