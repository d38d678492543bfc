//! Client half of the connection handshakes.
//!
//! Cookie mode: Init → InitAck(cookie) → CookieEcho(cookie) → CookieAck(port).
//! Simple mode: SimpleConnect → SimpleConnectAck(port, cookie).
//!
//! Each request is resent every retransmit interval until the matching reply
//! arrives from the server's address or the connect timeout runs out. The
//! resulting connection talks to the port named in the final reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mockets_core::config::{HandshakeMode, MocketsConfig};
use mockets_core::crypto::{CryptoError, Keypair, Role};
use mockets_core::wire::{ChunkType, MAXIMUM_MTU};
use mockets_core::{Chunk, EndpointParams, Packet, PacketError};

use crate::comm::{CommError, CommInterface, SecureCommInterface, SecureSettings, UdpCommInterface};
use crate::connection::{Connection, ConnectionError, ConnectionSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no {awaiting:?} from {server} within {timeout:?}")]
    TimedOut {
        server: SocketAddr,
        awaiting: ChunkType,
        timeout: Duration,
    },

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Drives one handshake over a transport it then hands to the connection.
pub struct Connector {
    comm: Box<dyn CommInterface>,
    mode: HandshakeMode,
    connect_timeout: Duration,
    retransmit_interval: Duration,
    settings: ConnectionSettings,
    resume_key: Option<[u8; 32]>,
}

impl Connector {
    /// `comm` must already be bound.
    pub fn new(comm: Box<dyn CommInterface>, config: &MocketsConfig) -> Self {
        Self {
            comm,
            mode: config.handshake.mode,
            connect_timeout: config.handshake.connect_timeout(),
            retransmit_interval: config.handshake.retransmit_interval(),
            settings: ConnectionSettings::from(config),
            resume_key: None,
        }
    }

    /// Ask the server for a resume token sealed to `public_key`.
    /// Cookie mode only.
    pub fn with_resume_key(mut self, public_key: [u8; 32]) -> Self {
        self.resume_key = Some(public_key);
        self
    }

    pub fn connect(self, server: SocketAddr) -> Result<Connection, ConnectError> {
        self.comm.set_receive_timeout(Some(self.retransmit_interval))?;
        let deadline = Instant::now() + self.connect_timeout;
        let validation: u32 = rand::random();
        let local = EndpointParams {
            validation,
            ..EndpointParams::default()
        };

        let (port, cookie, resume_token) = match self.mode {
            HandshakeMode::Cookie => {
                let init = self.request(validation, &Chunk::Init(local))?;
                let cookie = self.exchange(server, &init, ChunkType::InitAck, deadline, |chunk| match chunk {
                    Chunk::InitAck { cookie, .. } if cookie.a.validation == validation => Some(cookie),
                    _ => None,
                })?;
                tracing::debug!(%server, "received InitAck");

                let echo = self.request(
                    validation,
                    &Chunk::CookieEcho {
                        cookie,
                        public_key: self.resume_key.as_ref().map(|k| &k[..]),
                    },
                )?;
                let (port, token) = self.exchange(server, &echo, ChunkType::CookieAck, deadline, |chunk| match chunk {
                    Chunk::CookieAck { port, resume_token } => {
                        Some((port, resume_token.map(<[u8]>::to_vec)))
                    }
                    _ => None,
                })?;
                (port, cookie, token)
            }
            HandshakeMode::Simple => {
                let connect = self.request(validation, &Chunk::SimpleConnect(local))?;
                let (port, cookie) = self.exchange(server, &connect, ChunkType::SimpleConnectAck, deadline, |chunk| match chunk {
                    Chunk::SimpleConnectAck { port, cookie, .. } if cookie.a.validation == validation => {
                        Some((port, cookie))
                    }
                    _ => None,
                })?;
                (port, cookie, None)
            }
        };

        let peer = SocketAddr::new(server.ip(), port);
        tracing::info!(%server, peer_addr = %peer, "handshake complete");
        let Self { comm, settings, .. } = self;
        Ok(Connection::establish(
            Arc::from(comm),
            peer,
            cookie.a,
            cookie.z,
            settings,
            resume_token,
        )?)
    }

    fn request(&self, validation: u32, chunk: &Chunk<'_>) -> Result<Packet<'static>, PacketError> {
        let mut p = Packet::new(self.settings.mtu)?;
        p.set_validation(validation)?;
        p.set_window_size(self.settings.window_size)?;
        p.set_sequence_num(0)?;
        p.add_chunk(chunk)?;
        Ok(p)
    }

    /// Send `request` until the server answers with a packet whose first
    /// chunk `accept` takes.
    fn exchange<T>(
        &self,
        server: SocketAddr,
        request: &Packet<'_>,
        awaiting: ChunkType,
        deadline: Instant,
        mut accept: impl FnMut(Chunk<'_>) -> Option<T>,
    ) -> Result<T, ConnectError> {
        let mut buf = vec![0u8; MAXIMUM_MTU];
        loop {
            if let Err(e) = self.comm.send_to(server, request.as_bytes()) {
                if !self.recoverable(&e) {
                    return Err(e.into());
                }
                tracing::debug!(%server, error = %e, "send failed; will retry");
            }
            tracing::trace!(%server, ?awaiting, "handshake request sent");

            let resend_at = Instant::now() + self.retransmit_interval;
            loop {
                match self.comm.receive(&mut buf) {
                    Ok(Some((n, from))) if from == server => match Packet::parse(&buf[..n]) {
                        Ok(packet) => match packet.chunks().next() {
                            Some(Ok(chunk)) => {
                                let found = chunk.chunk_type();
                                if found == awaiting {
                                    if let Some(reply) = accept(chunk) {
                                        return Ok(reply);
                                    }
                                }
                                tracing::debug!(%server, chunk_type = ?found, ?awaiting, "unexpected reply");
                            }
                            _ => tracing::warn!(%server, "reply without a usable chunk"),
                        },
                        Err(e) => tracing::warn!(%server, error = %e, "malformed reply"),
                    },
                    Ok(Some((_, from))) => {
                        tracing::debug!(peer_addr = %from, %server, "reply from a different endpoint; ignored")
                    }
                    Ok(None) => {}
                    Err(e) if self.recoverable(&e) => {
                        tracing::debug!(%server, error = %e, "receive failed; will retry")
                    }
                    Err(e) => return Err(e.into()),
                }
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(%server, ?awaiting, "connect timed out");
                    return Err(ConnectError::TimedOut {
                        server,
                        awaiting,
                        timeout: self.connect_timeout,
                    });
                }
                if now >= resend_at {
                    break;
                }
            }
        }
    }

    fn recoverable(&self, e: &CommError) -> bool {
        e.os_code()
            .is_some_and(|code| self.comm.is_recoverable_error(code))
    }
}

/// Connect to `server` over a fresh UDP socket, secured when the
/// configuration asks for it.
pub fn connect(server: SocketAddr, config: &MocketsConfig) -> Result<Connection, ConnectError> {
    let unspecified: IpAddr = match server {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let udp = UdpCommInterface::new();
    if config.network.receive_buffer_size > 0 {
        udp.set_receive_buffer_size(config.network.receive_buffer_size)?;
    }
    udp.bind(SocketAddr::new(unspecified, 0))?;

    let comm: Box<dyn CommInterface> = if config.security.enabled {
        let keypair = Keypair::load_or_generate(&config.security.keypair_path)?;
        Box::new(SecureCommInterface::new(
            Box::new(udp),
            Role::Client,
            &keypair,
            SecureSettings::from(&config.security),
        )?)
    } else {
        Box::new(udp)
    };
    Connector::new(comm, config).connect(server)
}
