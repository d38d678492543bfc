use mockets::DeliveryClass;

use crate::*;

const CLASSES: [DeliveryClass; 4] = [
    DeliveryClass::ReliableSequenced,
    DeliveryClass::ReliableUnsequenced,
    DeliveryClass::UnreliableSequenced,
    DeliveryClass::UnreliableUnsequenced,
];

#[test]
fn test_every_class_reaches_the_peer() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (_server, client, accepted) = connected_pair(&config)?;

    for (i, class) in CLASSES.into_iter().enumerate() {
        let payload = format!("message in {class:?}");
        client.send(class, i as u16 + 1, payload.as_bytes())?;
        let msg = match accepted.receive_message(WAIT) {
            Extract::Item(msg) => msg,
            _ => bail!("{class:?}: nothing received"),
        };
        assert_eq!(msg.delivery_class(), Some(class));
        assert_eq!(msg.tag(), i as u16 + 1);
        assert_eq!(msg.to_vec(), payload.as_bytes());
    }

    let stats = accepted.stats();
    assert_eq!(stats.messages.reliable_sequenced, 1);
    assert_eq!(stats.messages.reliable_unsequenced, 1);
    assert_eq!(stats.messages.unreliable_sequenced, 1);
    assert_eq!(stats.messages.unreliable_unsequenced, 1);
    assert_eq!(stats.per_tag.len(), 4);
    Ok(())
}

#[test]
fn test_reliable_sequenced_keeps_send_order() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (_server, client, accepted) = connected_pair(&config)?;

    for i in 0..50u32 {
        client.send(DeliveryClass::ReliableSequenced, 0, &i.to_be_bytes())?;
    }
    for i in 0..50u32 {
        assert_eq!(next_message(&accepted)?, i.to_be_bytes());
    }
    Ok(())
}

#[test]
fn test_large_message_is_fragmented_and_reassembled() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (_server, client, accepted) = connected_pair(&config)?;

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    assert!(payload.len() > client.mtu());
    client.send(DeliveryClass::ReliableSequenced, 7, &payload)?;

    assert_eq!(accepted.next_message_size(WAIT), Extract::Item(payload.len()));
    let (mut head, mut tail) = (vec![0u8; 4_000], vec![0u8; 6_000]);
    let n = accepted.receive_vectored(&mut [&mut head[..], &mut tail[..]], WAIT);
    assert_eq!(n, Extract::Item(payload.len()));
    head.extend_from_slice(&tail);
    assert_eq!(head, payload);
    Ok(())
}

#[test]
fn test_replies_flow_from_the_accepting_side() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (_server, client, accepted) = connected_pair(&config)?;

    client.send(DeliveryClass::ReliableSequenced, 0, b"ping")?;
    assert_eq!(next_message(&accepted)?, b"ping");
    accepted.send(DeliveryClass::ReliableSequenced, 0, b"pong")?;
    assert_eq!(next_message(&client)?, b"pong");
    Ok(())
}

#[test]
fn test_close_reaches_the_peer() -> Result<()> {
    let config = loopback_config(HandshakeMode::Cookie);
    let (_server, client, accepted) = connected_pair(&config)?;

    client.send(DeliveryClass::ReliableSequenced, 0, b"last words")?;
    assert_eq!(next_message(&accepted)?, b"last words");
    client.close();

    assert!(matches!(accepted.receive_message(WAIT), Extract::Closed));
    assert!(client.send(DeliveryClass::ReliableSequenced, 0, b"too late").is_err());
    Ok(())
}
