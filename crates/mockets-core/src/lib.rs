//! mockets-core — wire format, packet codec, and shared primitives.
//! All other Mockets crates depend on this one.

pub mod config;
pub mod cookie;
pub mod crypto;
pub mod packet;
pub mod queue;
pub mod seq;
pub mod wire;

pub use cookie::{EndpointParams, InitialTsns, StateCookie};
pub use packet::{Chunk, DeliveryClass, Packet, PacketError};
pub use queue::{BlockingQueue, Extract, QueuedItem, Wait};
