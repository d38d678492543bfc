//! StateCookie — the self-contained record the server hands out in InitAck
//! and the client echoes back unmodified in CookieEcho.
//!
//! The server keeps no per-attempt state between the two; everything needed
//! to build the connection travels inside the cookie.

use std::time::{SystemTime, UNIX_EPOCH};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::{StateCookieBlock, STATE_COOKIE_SIZE};

/// Initial TSN / message id for each delivery class of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InitialTsns {
    pub control: u32,
    pub reliable_sequenced: u32,
    pub unreliable_sequenced: u32,
    pub reliable_unsequenced_id: u32,
    pub unreliable_unsequenced_id: u32,
}

/// One side of the handshake: validation tag plus initial counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EndpointParams {
    pub validation: u32,
    pub tsns: InitialTsns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateCookie {
    /// Milliseconds since the UNIX epoch.
    pub generation_time: i64,
    /// Milliseconds.
    pub lifespan: i64,
    /// Connecting side.
    pub a: EndpointParams,
    /// Accepting side.
    pub z: EndpointParams,
    pub port_a: u16,
    pub port_z: u16,
}

impl StateCookie {
    pub fn new(
        generation_time: i64,
        lifespan: i64,
        a: EndpointParams,
        z: EndpointParams,
        port_a: u16,
        port_z: u16,
    ) -> Self {
        Self {
            generation_time,
            lifespan,
            a,
            z,
            port_a,
            port_z,
        }
    }

    /// Milliseconds since the UNIX epoch at which the cookie stops being valid.
    pub fn expires_at(&self) -> i64 {
        self.generation_time.saturating_add(self.lifespan)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at()
    }

    pub fn to_block(&self) -> StateCookieBlock {
        let mut b = StateCookieBlock::new_zeroed();
        b.generation_time.set(self.generation_time);
        b.lifespan.set(self.lifespan);
        b.validation_a.set(self.a.validation);
        b.validation_z.set(self.z.validation);
        b.control_tsn_a.set(self.a.tsns.control);
        b.control_tsn_z.set(self.z.tsns.control);
        b.reliable_sequenced_tsn_a.set(self.a.tsns.reliable_sequenced);
        b.reliable_sequenced_tsn_z.set(self.z.tsns.reliable_sequenced);
        b.unreliable_sequenced_tsn_a.set(self.a.tsns.unreliable_sequenced);
        b.unreliable_sequenced_tsn_z.set(self.z.tsns.unreliable_sequenced);
        b.reliable_unsequenced_id_a.set(self.a.tsns.reliable_unsequenced_id);
        b.reliable_unsequenced_id_z.set(self.z.tsns.reliable_unsequenced_id);
        b.unreliable_unsequenced_id_a.set(self.a.tsns.unreliable_unsequenced_id);
        b.unreliable_unsequenced_id_z.set(self.z.tsns.unreliable_unsequenced_id);
        b.port_a.set(self.port_a);
        b.port_z.set(self.port_z);
        b
    }

    pub fn from_block(b: &StateCookieBlock) -> Self {
        Self {
            generation_time: b.generation_time.get(),
            lifespan: b.lifespan.get(),
            a: EndpointParams {
                validation: b.validation_a.get(),
                tsns: InitialTsns {
                    control: b.control_tsn_a.get(),
                    reliable_sequenced: b.reliable_sequenced_tsn_a.get(),
                    unreliable_sequenced: b.unreliable_sequenced_tsn_a.get(),
                    reliable_unsequenced_id: b.reliable_unsequenced_id_a.get(),
                    unreliable_unsequenced_id: b.unreliable_unsequenced_id_a.get(),
                },
            },
            z: EndpointParams {
                validation: b.validation_z.get(),
                tsns: InitialTsns {
                    control: b.control_tsn_z.get(),
                    reliable_sequenced: b.reliable_sequenced_tsn_z.get(),
                    unreliable_sequenced: b.unreliable_sequenced_tsn_z.get(),
                    reliable_unsequenced_id: b.reliable_unsequenced_id_z.get(),
                    unreliable_unsequenced_id: b.unreliable_unsequenced_id_z.get(),
                },
            },
            port_a: b.port_a.get(),
            port_z: b.port_z.get(),
        }
    }

    /// Serialized 68-byte form.
    pub fn to_bytes(&self) -> [u8; STATE_COOKIE_SIZE] {
        let mut out = [0u8; STATE_COOKIE_SIZE];
        out.copy_from_slice(self.to_block().as_bytes());
        out
    }

    /// Parse the 68-byte form. Returns None when `bytes` is too short.
    pub fn read_from_prefix(bytes: &[u8]) -> Option<Self> {
        StateCookieBlock::read_from_prefix(bytes).map(|b| Self::from_block(&b))
    }
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
