//! Mockets integration test harness.
//!
//! Every test runs a listener and one or more clients over UDP on the
//! loopback interface inside this process. No privileges or external setup
//! are needed:
//!
//!   cargo test --test integration
//!
//! Listeners bind port 0, so tests may run in parallel.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use mockets::{Connection, Extract, ServerMocket, Wait};
use mockets_core::config::{HandshakeMode, MocketsConfig};

mod delivery;
mod handshake;
mod secure;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything that should happen promptly on loopback.
pub const WAIT: Wait = Wait::For(Duration::from_secs(5));

/// Loopback listener on an ephemeral port with short timers.
pub fn loopback_config(mode: HandshakeMode) -> MocketsConfig {
    let mut config = MocketsConfig::default();
    config.network.listen_addr = "127.0.0.1:0".parse().expect("static address");
    config.network.accept_poll_interval_ms = 50;
    config.handshake.mode = mode;
    config.handshake.connect_timeout_ms = 5_000;
    config.handshake.retransmit_interval_ms = 100;
    config.delivery.unreliable_sequenced_timeout_ms = 200;
    config
}

/// Per-test scratch file name under the system temp directory.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mockets-it-{}-{name}", std::process::id()))
}

/// Bind a listener and start its accept loop.
pub fn serve(config: &MocketsConfig) -> Result<ServerMocket> {
    let server = ServerMocket::bind(config).context("failed to bind listener")?;
    server.start().context("failed to start accept loop")?;
    Ok(server)
}

pub fn accept(server: &ServerMocket) -> Result<Connection> {
    match server.accept(WAIT) {
        Extract::Item(conn) => Ok(conn),
        Extract::TimedOut => bail!("no connection accepted within {WAIT:?}"),
        Extract::Closed => bail!("listener closed while accepting"),
    }
}

/// Connected (client, server-side) pair. The listener must outlive both.
pub fn connected_pair(config: &MocketsConfig) -> Result<(ServerMocket, Connection, Connection)> {
    let server = serve(config)?;
    let client = mockets::connect(server.local_addr(), config)
        .with_context(|| format!("failed to connect to {}", server.local_addr()))?;
    let accepted = accept(&server)?;
    Ok((server, client, accepted))
}

pub fn next_message(conn: &Connection) -> Result<Vec<u8>> {
    match conn.receive_message(WAIT) {
        Extract::Item(msg) => Ok(msg.to_vec()),
        Extract::TimedOut => bail!("no message from {} within {WAIT:?}", conn.peer_addr()),
        Extract::Closed => bail!("connection to {} closed", conn.peer_addr()),
    }
}
