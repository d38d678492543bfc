//! Plain UDP transport.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{CommError, CommInterface};

/// UDP socket behind the [`CommInterface`] contract.
///
/// Receive timeout and buffer size set before `bind` are applied when the
/// socket is created, and carried over by `new_instance`.
#[derive(Default)]
pub struct UdpCommInterface {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receive_timeout: Mutex<Option<Duration>>,
    receive_buffer_size: AtomicUsize,
    last_error: AtomicI32,
}

impl UdpCommInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound interface in one step.
    pub fn bound(addr: SocketAddr) -> Result<Self, CommError> {
        let comm = Self::new();
        comm.bind(addr)?;
        Ok(comm)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, CommError> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CommError::NotBound)
    }

    fn record(&self, e: std::io::Error) -> CommError {
        if let Some(code) = e.raw_os_error() {
            self.last_error.store(code, Ordering::Relaxed);
        }
        CommError::from(e)
    }
}

// A zero read timeout is rejected by the OS; the shortest real wait stands in.
fn os_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|d| d.max(Duration::from_millis(1)))
}

impl CommInterface for UdpCommInterface {
    fn bind(&self, addr: SocketAddr) -> Result<(), CommError> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| self.record(e))?;
        let rcvbuf = self.receive_buffer_size.load(Ordering::Relaxed);
        if rcvbuf > 0 {
            socket.set_recv_buffer_size(rcvbuf).map_err(|e| self.record(e))?;
        }
        socket.bind(&addr.into()).map_err(|e| self.record(e))?;
        let socket: UdpSocket = socket.into();
        let timeout = *self.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner);
        socket
            .set_read_timeout(os_timeout(timeout))
            .map_err(|e| self.record(e))?;

        tracing::debug!(local_addr = ?socket.local_addr().ok(), "udp transport bound");
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, CommError> {
        self.socket()?.local_addr().map_err(|e| self.record(e))
    }

    fn close(&self) -> Result<(), CommError> {
        // receivers holding a clone return at their next timeout
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn shutdown(&self, read: bool, write: bool) -> Result<(), CommError> {
        let how = match (read, write) {
            (true, true) => Shutdown::Both,
            (true, false) => Shutdown::Read,
            (false, true) => Shutdown::Write,
            (false, false) => return Ok(()),
        };
        let socket = self.socket()?;
        match SockRef::from(&*socket).shutdown(how) {
            Ok(()) => Ok(()),
            // unconnected UDP sockets report ENOTCONN but are still shut down
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(e) => Err(self.record(e)),
        }
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), CommError> {
        *self.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        if let Ok(socket) = self.socket() {
            socket
                .set_read_timeout(os_timeout(timeout))
                .map_err(|e| self.record(e))?;
        }
        Ok(())
    }

    fn set_receive_buffer_size(&self, bytes: usize) -> Result<(), CommError> {
        self.receive_buffer_size.store(bytes, Ordering::Relaxed);
        if let Ok(socket) = self.socket() {
            SockRef::from(&*socket)
                .set_recv_buffer_size(bytes)
                .map_err(|e| self.record(e))?;
        }
        Ok(())
    }

    fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize, CommError> {
        let socket = self.socket()?;
        socket.send_to(buf, addr).map_err(|e| self.record(e))
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, CommError> {
        let socket = self.socket()?;
        match socket.recv_from(buf) {
            Ok(r) => Ok(Some(r)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(self.record(e)),
        }
    }

    fn last_error(&self) -> Option<i32> {
        match self.last_error.load(Ordering::Relaxed) {
            0 => None,
            code => Some(code),
        }
    }

    fn new_instance(&self) -> Result<Box<dyn CommInterface>, CommError> {
        let comm = UdpCommInterface::new();
        *comm.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner) =
            *self.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner);
        comm.receive_buffer_size.store(
            self.receive_buffer_size.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        Ok(Box::new(comm))
    }
}
