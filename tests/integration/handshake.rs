use std::net::UdpSocket;

use mockets::{ConnectError, DeliveryClass};
use mockets_core::wire::ChunkType;

use crate::*;

/// Both ends agree on the parameters bound into the cookie.
#[test]
fn test_cookie_handshake_binds_both_sides() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (server, client, accepted) = connected_pair(&config)?;

    assert_eq!(client.local_params(), accepted.remote_params());
    assert_eq!(client.remote_params(), accepted.local_params());
    assert_eq!(accepted.local_params().tsns, Default::default());

    // the connection lives on its own port, not the listener's
    let conn_port = accepted.local_addr()?.port();
    assert_eq!(client.peer_addr().port(), conn_port);
    assert_ne!(conn_port, server.local_addr().port());
    assert_eq!(accepted.peer_addr().port(), client.local_addr()?.port());

    let record = server
        .cookie_record(&accepted.peer_addr())
        .context("cookie record missing")?;
    assert_eq!(record.local_port, conn_port);
    assert!(record.count >= 1);
    Ok(())
}

#[test]
fn test_simple_handshake_carries_data() -> Result<()> {
    let config = loopback_config(HandshakeMode::Simple);
    let (_server, client, accepted) = connected_pair(&config)?;

    assert_eq!(client.remote_params(), accepted.local_params());
    client.send(DeliveryClass::ReliableSequenced, 0, b"over simple connect")?;
    assert_eq!(next_message(&accepted)?, b"over simple connect");
    Ok(())
}

#[test]
fn test_each_client_gets_its_own_port() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let server = serve(&config)?;

    let first = mockets::connect(server.local_addr(), &config)?;
    let second = mockets::connect(server.local_addr(), &config)?;
    let a = accept(&server)?;
    let b = accept(&server)?;

    assert_ne!(first.peer_addr(), second.peer_addr());
    let mut ports = [a.local_addr()?.port(), b.local_addr()?.port()];
    ports.sort_unstable();
    let mut expected = [first.peer_addr().port(), second.peer_addr().port()];
    expected.sort_unstable();
    assert_eq!(ports, expected);
    Ok(())
}

#[test]
fn test_silent_server_times_out() -> Result<()> {
    let silent = UdpSocket::bind("127.0.0.1:0")?;
    let mut config = loopback_config(HandshakeMode::Cookie);
    config.handshake.connect_timeout_ms = 400;

    match mockets::connect(silent.local_addr()?, &config) {
        Err(ConnectError::TimedOut { awaiting, server, .. }) => {
            assert_eq!(awaiting, ChunkType::InitAck);
            assert_eq!(server, silent.local_addr()?);
        }
        Err(e) => bail!("expected a timeout, got {e}"),
        Ok(_) => bail!("connected to a socket that never answers"),
    }

    // the client kept retrying while it waited
    silent.set_nonblocking(true)?;
    let mut buf = [0u8; 2048];
    let mut inits = 0;
    while silent.recv_from(&mut buf).is_ok() {
        inits += 1;
    }
    assert!(inits >= 2, "only {inits} Init packets sent");
    Ok(())
}

#[test]
fn test_listener_in_the_other_mode_is_ignored() -> Result<()> {
    let server = serve(&loopback_config(HandshakeMode::Simple))?;
    let mut config = loopback_config(HandshakeMode::Cookie);
    config.handshake.connect_timeout_ms = 400;

    let result = mockets::connect(server.local_addr(), &config);
    assert!(matches!(result, Err(ConnectError::TimedOut { .. })));
    assert!(matches!(server.accept(Wait::NoWait), Extract::TimedOut));
    Ok(())
}
