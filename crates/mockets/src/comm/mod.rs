//! Datagram transport abstraction.
//!
//! Everything above this layer talks to a [`CommInterface`] and does not know
//! whether datagrams travel over a plain UDP socket, an in-memory pipe, or a
//! secured channel wrapping either of them.

mod memory;
mod secure;
mod udp;

pub use memory::MemoryCommInterface;
pub use secure::{SecureCommInterface, SecureSettings};
pub use udp::UdpCommInterface;

use std::net::SocketAddr;
use std::time::Duration;

use mockets_core::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("transport is not bound")]
    NotBound,

    #[error("I/O error: {source}")]
    Io {
        code: Option<i32>,
        #[source]
        source: std::io::Error,
    },

    #[error("datagram of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("secure handshake with {peer} failed after {attempts} attempts")]
    HandshakeTimedOut { peer: SocketAddr, attempts: u32 },

    #[error("secure handshake with {peer} failed: {source}")]
    HandshakeFailed {
        peer: SocketAddr,
        #[source]
        source: CryptoError,
    },

    #[error("no secure session with {0}")]
    NotEstablished(SocketAddr),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<std::io::Error> for CommError {
    fn from(source: std::io::Error) -> Self {
        CommError::Io {
            code: source.raw_os_error(),
            source,
        }
    }
}

impl CommError {
    /// OS error code, when the failure came from the socket layer.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            CommError::Io { code, .. } => *code,
            _ => None,
        }
    }
}

/// Socket-like capability consumed by the handshake and delivery layers.
///
/// Methods take `&self`: one thread blocks in `receive` while others send.
pub trait CommInterface: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> Result<(), CommError>;

    fn local_addr(&self) -> Result<SocketAddr, CommError>;

    fn close(&self) -> Result<(), CommError>;

    fn shutdown(&self, read: bool, write: bool) -> Result<(), CommError>;

    /// None blocks indefinitely.
    fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), CommError>;

    fn set_receive_buffer_size(&self, bytes: usize) -> Result<(), CommError>;

    fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize, CommError>;

    /// One datagram into `buf`. `Ok(None)` when the receive timeout expires
    /// with nothing to deliver.
    fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, CommError>;

    /// OS code of the most recent failed call.
    fn last_error(&self) -> Option<i32>;

    fn is_recoverable_error(&self, code: i32) -> bool {
        is_recoverable_os_error(code)
    }

    /// Unbound interface with the same configuration.
    fn new_instance(&self) -> Result<Box<dyn CommInterface>, CommError>;
}

/// Transient conditions worth retrying instead of tearing the endpoint down.
pub fn is_recoverable_os_error(code: i32) -> bool {
    code == libc::EINTR
        || code == libc::EAGAIN
        || code == libc::EWOULDBLOCK
        || code == libc::ECONNREFUSED
        || code == libc::ENOBUFS
}
