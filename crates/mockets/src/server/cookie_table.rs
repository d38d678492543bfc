//! Per-remote-address bookkeeping for echoed cookies.
//!
//! Entries appear on the first valid CookieEcho from an address and live
//! until the cookie's lifespan runs out. Expired entries are evicted lazily,
//! cheapest-first, through a min-heap on expiration time.
//!
//! While a connection is being built for an address, the address holds a
//! reservation: it counts against capacity and keeps a second setup for the
//! same address out until the record is inserted or the reservation released.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;

use mockets_core::StateCookie;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieRec {
    /// Milliseconds since the UNIX epoch.
    pub expiration: i64,
    /// CookieEcho receipts acknowledged so far.
    pub count: u32,
    /// Port of the connection created for this peer.
    pub local_port: u16,
    pub resume_token: Option<Vec<u8>>,
    /// The cookie accepted on first receipt; later echoes must match it.
    pub cookie: StateCookie,
}

impl CookieRec {
    pub fn new(cookie: StateCookie, local_port: u16) -> Self {
        Self {
            expiration: cookie.expires_at(),
            count: 0,
            local_port,
            resume_token: None,
            cookie,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expiration
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CookieTableError {
    #[error("cookie table full ({0} live entries)")]
    Full(usize),

    #[error("connection setup for {0} already in progress")]
    SetupInProgress(SocketAddr),
}

pub struct CookieTable {
    capacity: usize,
    entries: HashMap<SocketAddr, (CookieRec, u64)>,
    reserved: HashSet<SocketAddr>,
    // (expiration, generation, addr); stale generations are skipped on pop
    expirations: BinaryHeap<Reverse<(i64, u64, SocketAddr)>>,
    next_generation: u64,
}

impl CookieTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            reserved: HashSet::new(),
            expirations: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live record for `addr`, after evicting everything expired by `now_ms`.
    pub fn lookup(&mut self, addr: &SocketAddr, now_ms: i64) -> Option<&mut CookieRec> {
        self.evict_expired(now_ms);
        self.entries.get_mut(addr).map(|(rec, _)| rec)
    }

    /// Whether `insert` for `addr` would succeed right now.
    pub fn has_room_for(&mut self, addr: &SocketAddr, now_ms: i64) -> bool {
        self.evict_expired(now_ms);
        self.entries.contains_key(addr)
            || self.reserved.contains(addr)
            || self.occupied() < self.capacity
    }

    /// Records plus outstanding reservations.
    fn occupied(&self) -> usize {
        self.entries.len() + self.reserved.len()
    }

    /// Hold a slot for `addr` while its connection is set up. Fails when the
    /// table is full or a setup for `addr` is already running.
    pub fn reserve(&mut self, addr: SocketAddr, now_ms: i64) -> Result<(), CookieTableError> {
        if self.reserved.contains(&addr) {
            return Err(CookieTableError::SetupInProgress(addr));
        }
        if !self.has_room_for(&addr, now_ms) {
            return Err(CookieTableError::Full(self.occupied()));
        }
        self.reserved.insert(addr);
        Ok(())
    }

    /// Give back a reservation whose setup failed.
    pub fn release(&mut self, addr: &SocketAddr) {
        self.reserved.remove(addr);
    }

    pub fn is_reserved(&self, addr: &SocketAddr) -> bool {
        self.reserved.contains(addr)
    }

    /// Store `rec` for `addr`, replacing any previous record and consuming
    /// any reservation held for `addr`.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        rec: CookieRec,
        now_ms: i64,
    ) -> Result<&mut CookieRec, CookieTableError> {
        self.evict_expired(now_ms);
        let had_reservation = self.reserved.remove(&addr);
        if !had_reservation && !self.entries.contains_key(&addr) && self.occupied() >= self.capacity {
            return Err(CookieTableError::Full(self.occupied()));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.expirations
            .push(Reverse((rec.expiration, generation, addr)));
        let slot = match self.entries.entry(addr) {
            Entry::Occupied(mut o) => {
                o.insert((rec, generation));
                o.into_mut()
            }
            Entry::Vacant(v) => v.insert((rec, generation)),
        };
        Ok(&mut slot.0)
    }

    /// Remove every record whose expiration is before `now_ms`.
    pub fn evict_expired(&mut self, now_ms: i64) -> usize {
        let mut evicted = 0;
        while let Some(Reverse((expiration, generation, addr))) = self.expirations.peek().copied() {
            if expiration >= now_ms {
                break;
            }
            self.expirations.pop();
            let current = matches!(self.entries.get(&addr), Some((_, g)) if *g == generation);
            if current {
                self.entries.remove(&addr);
                evicted += 1;
                tracing::trace!(peer_addr = %addr, "cookie record expired");
            }
        }
        evicted
    }
}
