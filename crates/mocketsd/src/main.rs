//! mocketsd — Mockets endpoint daemon.
//!
//!   mocketsd [--config PATH] [--class CLASS] listen
//!   mocketsd [--config PATH] [--class CLASS] send ADDR TEXT...

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use mockets::{Connection, DeliveryClass, Extract, ServerMocket, Wait};
use mockets_core::config::MocketsConfig;

// ── Arguments ─────────────────────────────────────────────────────────────────

fn parse_class(s: &str) -> Result<DeliveryClass> {
    Ok(match s {
        "rs" | "reliable-sequenced" => DeliveryClass::ReliableSequenced,
        "ru" | "reliable-unsequenced" => DeliveryClass::ReliableUnsequenced,
        "us" | "unreliable-sequenced" => DeliveryClass::UnreliableSequenced,
        "uu" | "unreliable-unsequenced" => DeliveryClass::UnreliableUnsequenced,
        other => anyhow::bail!("unknown delivery class {other:?} (rs, ru, us, uu)"),
    })
}

fn load_config(path: Option<PathBuf>) -> MocketsConfig {
    let loaded = match path {
        Some(path) => MocketsConfig::load_from(&path),
        None => {
            if let Err(e) = MocketsConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            MocketsConfig::load()
        }
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MocketsConfig::default()
    })
}

fn print_usage() {
    eprintln!("usage: mocketsd [--config PATH] [--class rs|ru|us|uu] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  listen              accept connections and print received messages");
    eprintln!("  send ADDR TEXT...   connect to ADDR and send each TEXT as a message");
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

fn cmd_listen(config: &MocketsConfig) -> Result<()> {
    let server = ServerMocket::bind(config).context("failed to bind listener")?;
    server.start()?;
    tracing::info!(listen_addr = %server.local_addr(), "mocketsd listening");

    let receive_wait = Wait::from(config.delivery.receive_timeout_ms);
    loop {
        let conn = match server.accept(Wait::Forever) {
            Extract::Item(conn) => conn,
            Extract::TimedOut => continue,
            Extract::Closed => break,
        };
        let peer = conn.peer_addr();
        std::thread::Builder::new()
            .name(format!("mocketsd-{peer}"))
            .spawn(move || print_messages(&conn, receive_wait))
            .context("failed to spawn connection thread")?;
    }
    Ok(())
}

fn print_messages(conn: &Connection, wait: Wait) {
    let peer = conn.peer_addr();
    tracing::info!(peer_addr = %peer, "connection up");
    loop {
        match conn.receive_message(wait) {
            Extract::Item(msg) => {
                let data = msg.to_vec();
                println!("{peer} [{:?} tag {}] {}", msg.delivery_class(), msg.tag(), String::from_utf8_lossy(&data));
            }
            Extract::TimedOut => {}
            Extract::Closed => break,
        }
    }
    let stats = conn.stats();
    tracing::info!(
        peer_addr = %peer,
        received_bytes = stats.received_bytes,
        duplicates = stats.duplicate_discards,
        skipped = stats.reassembly_skipped_discards,
        "connection closed"
    );
}

fn cmd_send(config: &MocketsConfig, class: DeliveryClass, addr: &str, words: &[&str]) -> Result<()> {
    let server: SocketAddr = addr.parse().with_context(|| format!("invalid address {addr:?}"))?;
    let conn = mockets::connect(server, config).with_context(|| format!("failed to connect to {server}"))?;
    tracing::info!(peer_addr = %conn.peer_addr(), "connected");

    for word in words {
        conn.send(class, 0, word.as_bytes()).context("send failed")?;
    }
    tracing::info!(messages = words.len(), class = ?class, "sent");
    // unacknowledged classes have nothing to wait for; give the datagrams time to leave
    std::thread::sleep(Duration::from_millis(200));
    conn.close();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path = None;
    let mut class = DeliveryClass::ReliableSequenced;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(args.get(i).context("--config requires a value")?));
            }
            "--class" => {
                i += 1;
                class = parse_class(args.get(i).context("--class requires a value")?)?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let config = load_config(config_path);
    match remaining.as_slice() {
        ["listen"] => cmd_listen(&config),
        ["send", addr, words @ ..] if !words.is_empty() => cmd_send(&config, class, addr, words),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
