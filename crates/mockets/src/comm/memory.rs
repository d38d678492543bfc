//! In-memory transport for tests and same-process wiring.
//!
//! Two interfaces created by [`MemoryCommInterface::pair`] deliver datagrams
//! to each other through blocking queues. Datagrams addressed elsewhere are
//! dropped, as UDP would.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mockets_core::queue::{BlockingQueue, Extract, QueuedItem, Wait};

use super::{CommError, CommInterface};

struct Datagram {
    from: SocketAddr,
    bytes: Vec<u8>,
}

impl QueuedItem for Datagram {
    fn item_size(&self) -> usize {
        self.bytes.len()
    }
}

type Pipe = Arc<BlockingQueue<Datagram>>;

pub struct MemoryCommInterface {
    local: SocketAddr,
    peer: Option<(SocketAddr, Pipe)>,
    inbox: Pipe,
    receive_timeout: Mutex<Option<Duration>>,
    /// Outbound datagrams still to be discarded.
    drop_outbound: AtomicUsize,
}

impl MemoryCommInterface {
    /// Two connected interfaces with the given addresses.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let a_inbox: Pipe = Arc::new(BlockingQueue::new());
        let b_inbox: Pipe = Arc::new(BlockingQueue::new());
        (
            Self::with_pipes(a, Some((b, b_inbox.clone())), a_inbox.clone()),
            Self::with_pipes(b, Some((a, a_inbox)), b_inbox),
        )
    }

    fn with_pipes(local: SocketAddr, peer: Option<(SocketAddr, Pipe)>, inbox: Pipe) -> Self {
        Self {
            local,
            peer,
            inbox,
            receive_timeout: Mutex::new(None),
            drop_outbound: AtomicUsize::new(0),
        }
    }

    /// Silently lose the next `n` outbound datagrams.
    pub fn drop_next_outbound(&self, n: usize) {
        self.drop_outbound.store(n, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl CommInterface for MemoryCommInterface {
    fn bind(&self, _addr: SocketAddr) -> Result<(), CommError> {
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, CommError> {
        Ok(self.local)
    }

    fn close(&self) -> Result<(), CommError> {
        self.inbox.close();
        Ok(())
    }

    fn shutdown(&self, read: bool, _write: bool) -> Result<(), CommError> {
        if read {
            self.inbox.close();
        }
        Ok(())
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), CommError> {
        *self.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        Ok(())
    }

    fn set_receive_buffer_size(&self, _bytes: usize) -> Result<(), CommError> {
        Ok(())
    }

    fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize, CommError> {
        let dropped = self
            .drop_outbound
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            tracing::trace!(%addr, len = buf.len(), "memory transport dropped datagram");
            return Ok(buf.len());
        }
        if let Some((peer_addr, pipe)) = &self.peer {
            if *peer_addr == addr {
                // a closed peer inbox behaves like an unreachable host
                let datagram = Datagram {
                    from: self.local,
                    bytes: buf.to_vec(),
                };
                if let Err(e) = pipe.insert(datagram) {
                    tracing::trace!(%addr, len = buf.len(), error = %e, "datagram dropped");
                }
            }
        }
        Ok(buf.len())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, CommError> {
        let timeout = *self.receive_timeout.lock().unwrap_or_else(PoisonError::into_inner);
        let wait = match timeout {
            None => Wait::Forever,
            Some(d) => Wait::For(d.max(Duration::from_millis(1))),
        };
        match self.inbox.extract(wait) {
            Extract::Item(d) => {
                let n = d.bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&d.bytes[..n]);
                Ok(Some((n, d.from)))
            }
            Extract::TimedOut => Ok(None),
            Extract::Closed => Err(CommError::NotBound),
        }
    }

    fn last_error(&self) -> Option<i32> {
        None
    }

    fn new_instance(&self) -> Result<Box<dyn CommInterface>, CommError> {
        Ok(Box::new(Self::with_pipes(
            self.local,
            None,
            Arc::new(BlockingQueue::new()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:1000".parse().unwrap(), "10.0.0.2:2000".parse().unwrap())
    }

    #[test]
    fn pair_delivers_both_ways() {
        let (a_addr, b_addr) = addrs();
        let (a, b) = MemoryCommInterface::pair(a_addr, b_addr);
        a.send_to(b_addr, b"ping").unwrap();
        b.send_to(a_addr, b"pong").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.receive(&mut buf).unwrap(), Some((4, a_addr)));
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.receive(&mut buf).unwrap(), Some((4, b_addr)));
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn misaddressed_and_dropped_datagrams_vanish() {
        let (a_addr, b_addr) = addrs();
        let (a, b) = MemoryCommInterface::pair(a_addr, b_addr);
        a.send_to("10.0.0.9:9".parse().unwrap(), b"lost").unwrap();
        a.drop_next_outbound(1);
        a.send_to(b_addr, b"also lost").unwrap();
        a.send_to(b_addr, b"kept").unwrap();
        assert_eq!(b.pending(), 1);
    }

    #[test]
    fn timeout_then_close() {
        let (a_addr, b_addr) = addrs();
        let (a, _b) = MemoryCommInterface::pair(a_addr, b_addr);
        a.set_receive_timeout(Some(Duration::from_millis(10))).unwrap();
        let mut buf = [0u8; 4];
        assert!(a.receive(&mut buf).unwrap().is_none());
        a.close().unwrap();
        assert!(a.receive(&mut buf).is_err());
    }

    #[test]
    fn sending_to_a_closed_peer_still_succeeds() {
        let (a_addr, b_addr) = addrs();
        let (a, b) = MemoryCommInterface::pair(a_addr, b_addr);
        b.close().unwrap();
        assert_eq!(a.send_to(b_addr, b"into the void").unwrap(), 13);
        assert_eq!(b.pending(), 0);
    }
}
