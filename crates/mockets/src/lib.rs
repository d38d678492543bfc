//! mockets — message-oriented connections over datagram transports.
//!
//! [`connect`] and [`ServerMocket`] run the handshakes; both yield a
//! [`Connection`] that sends in any of the four delivery classes and hands
//! received messages back through its delivery engine.

pub mod comm;
pub mod delivery;
pub mod server;

mod client;
mod connection;

pub use client::{connect, ConnectError, Connector};
pub use connection::{Connection, ConnectionError, ConnectionSettings};
pub use server::{HandshakeOutcome, ServerError, ServerMocket};

pub use mockets_core::{DeliveryClass, Extract, Wait};
