// Integration tests for the TLS relay


use std::time::Duration;
use test_utils::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_single_client_receives_own_message() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;

    a.write_all(b"hello").await.unwrap();
    assert_eq!(read_n(&mut a, 5).await, b"hello");

    let entries = relay.server.log().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.content_lossy(), "hello");
    assert_eq!(entries[0].message.sender, relay.server.registry().snapshot()[0].id);

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;
    let mut b = relay.connect_registered().await;
    let mut c = relay.connect_registered().await;

    b.write_all(b"from b").await.unwrap();

    for stream in [&mut a, &mut b, &mut c] {
        assert_eq!(read_n(stream, 6).await, b"from b");
    }

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_over_capacity_is_rejected() {
    let relay = start_relay(test_config(2)).await;
    let mut a = relay.connect_registered().await;
    let _b = relay.connect_registered().await;
    assert!(relay.server.registry().is_full());

    // C never gets a working channel
    match relay.connect().await {
        Err(_) => {}
        Ok(mut c) => {
            let _ = c.write_all(b"let me in").await;
            assert!(is_closed(&mut c).await, "third client was not closed");
        }
    }
    assert_eq!(relay.server.registry().len(), 2);

    // The existing clients are unaffected
    a.write_all(b"still here").await.unwrap();
    assert_eq!(read_n(&mut a, 10).await, b"still here");
    assert_eq!(relay.server.log().len().await, 1);

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnected_peer_does_not_stop_broadcast() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;
    let b = relay.connect_registered().await;
    let mut c = relay.connect_registered().await;

    // B vanishes without a TLS close
    drop(b);

    a.write_all(b"anyone?").await.unwrap();
    assert_eq!(read_n(&mut a, 7).await, b"anyone?");
    assert_eq!(read_n(&mut c, 7).await, b"anyone?");

    let registry = relay.server.registry();
    assert!(wait_for(|| registry.len() == 2, 5).await);

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_handshake_leaves_others_untouched() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;

    let mut plain = TcpStream::connect(relay.addr()).await.unwrap();
    plain.write_all(b"this is not TLS\r\n\r\n").await.unwrap();
    assert!(is_closed(&mut plain).await);

    a.write_all(b"ok").await.unwrap();
    assert_eq!(read_n(&mut a, 2).await, b"ok");
    assert_eq!(relay.server.registry().len(), 1);

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_messages_from_one_client_keep_their_order() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;
    let mut b = relay.connect_registered().await;

    let mut expected = Vec::new();
    for i in 0..20 {
        let line = format!("line {:02}\n", i);
        a.write_all(line.as_bytes()).await.unwrap();
        a.flush().await.unwrap();
        expected.extend_from_slice(line.as_bytes());
    }

    assert_eq!(read_n(&mut b, expected.len()).await, expected);
    assert_eq!(read_n(&mut a, expected.len()).await, expected);

    let logged: Vec<u8> = relay
        .server
        .log()
        .entries()
        .await
        .into_iter()
        .flat_map(|e| e.message.content.to_vec())
        .collect();
    assert_eq!(logged, expected);

    relay.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_closes_clients() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive.jsonl");

    let mut config = test_config(4);
    config.log.archive_path = Some(archive.clone());
    let relay = start_relay(config).await;

    let mut a = relay.connect_registered().await;
    let mut b = relay.connect_registered().await;
    a.write_all(b"bye").await.unwrap();
    assert_eq!(read_n(&mut a, 3).await, b"bye");
    assert_eq!(read_n(&mut b, 3).await, b"bye");

    let summary = relay.server.shutdown().await.unwrap();
    assert_eq!(summary.clients_closed, 2);
    assert!(summary.handlers_drained);
    assert_eq!(summary.archived, 1);

    assert!(is_closed(&mut a).await);
    assert!(is_closed(&mut b).await);

    let archived = std::fs::read_to_string(&archive).unwrap();
    assert_eq!(archived.lines().count(), 1);
    assert!(archived.contains("\"content\":\"bye\""));
}

#[tokio::test]
async fn test_stop_keeps_existing_clients() {
    let relay = start_relay(test_config(4)).await;
    let mut a = relay.connect_registered().await;

    relay.server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.connect().await.is_err());

    a.write_all(b"after stop").await.unwrap();
    assert_eq!(read_n(&mut a, 10).await, b"after stop");

    relay.server.shutdown().await.unwrap();
}
