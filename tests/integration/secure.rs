use mockets::DeliveryClass;
use mockets_core::crypto::Keypair;

use crate::*;

fn secure_config(name: &str) -> MocketsConfig {
    let mut config = loopback_config(HandshakeMode::Cookie);
    config.security.enabled = true;
    config.security.keypair_path = temp_path(name);
    config.security.handshake_interval_ms = 50;
    config
}

/// Handshake and data both travel inside the secure channel.
#[test]
fn test_secure_connection_round_trip() -> Result<()> {
    let server_config = secure_config("server-key");
    let client_config = secure_config("client-key");
    let server = serve(&server_config)?;

    let client = mockets::connect(server.local_addr(), &client_config)?;
    let accepted = accept(&server)?;
    assert!(client.mtu() <= server_config.security.mtu);

    let payload: Vec<u8> = (0..100u8).collect();
    client.send(DeliveryClass::ReliableSequenced, 0, &payload)?;
    assert_eq!(next_message(&accepted)?, payload);

    accepted.send(DeliveryClass::ReliableSequenced, 0, b"sealed reply")?;
    assert_eq!(next_message(&client)?, b"sealed reply");

    // both keys were generated on first use and persisted
    let server_key = Keypair::load_or_generate(&server_config.security.keypair_path)?;
    let client_key = Keypair::load_or_generate(&client_config.security.keypair_path)?;
    assert_ne!(server_key.public, client_key.public);

    for path in [&server_config.security.keypair_path, &client_config.security.keypair_path] {
        std::fs::remove_file(path).ok();
    }
    Ok(())
}

#[test]
fn test_plain_client_cannot_reach_secure_listener() -> Result<()> {
    let server_config = secure_config("lonely-server-key");
    let server = serve(&server_config)?;

    let mut client_config = loopback_config(HandshakeMode::Cookie);
    client_config.handshake.connect_timeout_ms = 400;
    assert!(mockets::connect(server.local_addr(), &client_config).is_err());
    assert!(matches!(server.accept(Wait::NoWait), Extract::TimedOut));

    std::fs::remove_file(&server_config.security.keypair_path).ok();
    Ok(())
}
