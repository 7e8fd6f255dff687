//! End-to-end tests: clients talking through a live relay server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use sockrelay::config::{ClientConfig, ServerConfig};
use sockrelay::network::{ClientEvent, ClientState, RelayClient, Server};
use sockrelay::protocol::{encode, FrameReader};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn start_server() -> Result<(Server, SocketAddr)> {
    let mut server = Server::new(ServerConfig::new(0));
    let addr = server.start().await?;
    Ok((server, addr))
}

async fn wait_for_peers(server: &Server, expected: usize) {
    timeout(WAIT, async {
        while server.connection_count().await != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay never reached expected peer count");
}

/// Client whose "message" events are forwarded to a channel
async fn message_client(addr: SocketAddr) -> Result<(RelayClient, mpsc::UnboundedReceiver<Value>)> {
    let client = RelayClient::new(ClientConfig::default());
    let (tx, rx) = mpsc::unbounded_channel();
    client.on("message", move |data| {
        tx.send(data.clone())?;
        Ok(())
    });
    client.connect(addr).await?;
    Ok((client, rx))
}

#[tokio::test]
async fn message_reaches_other_client() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let (alice, mut alice_rx) = message_client(addr).await?;
    let (bob, mut bob_rx) = message_client(addr).await?;
    wait_for_peers(&server, 2).await;

    alice.send("message", &json!({ "message": "hi" })).await?;

    let received = timeout(WAIT, bob_rx.recv()).await?.expect("bob handler dropped");
    assert_eq!(received, json!({ "message": "hi" }));
    assert_eq!(received["message"], "hi");

    // No echo back to the sender.
    assert!(timeout(Duration::from_millis(100), alice_rx.recv()).await.is_err());

    alice.close().await;
    bob.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn lone_client_is_not_echoed() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let (alice, mut alice_rx) = message_client(addr).await?;
    wait_for_peers(&server, 1).await;

    alice.send("message", &json!({ "message": "anyone?" })).await?;
    assert!(timeout(Duration::from_millis(150), alice_rx.recv()).await.is_err());

    // Nothing is stored for peers that join later.
    let (bob, mut bob_rx) = message_client(addr).await?;
    wait_for_peers(&server, 2).await;
    assert!(timeout(Duration::from_millis(150), bob_rx.recv()).await.is_err());

    alice.close().await;
    bob.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn frames_split_across_writes_are_reassembled() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let (bob, mut bob_rx) = message_client(addr).await?;
    let mut raw = TcpStream::connect(addr).await?;
    raw.set_nodelay(true)?;
    wait_for_peers(&server, 2).await;

    let mut bytes = encode("message", br#"{"message":"one"}"#)?.to_vec();
    bytes.extend_from_slice(&encode("message", br#"{"message":"two"}"#)?);

    for chunk in [&bytes[..2], &bytes[2..11], &bytes[11..25], &bytes[25..]] {
        raw.write_all(chunk).await?;
        raw.flush().await?;
        sleep(Duration::from_millis(10)).await;
    }

    let first = timeout(WAIT, bob_rx.recv()).await?.expect("first message");
    let second = timeout(WAIT, bob_rx.recv()).await?.expect("second message");
    assert_eq!(first["message"], "one");
    assert_eq!(second["message"], "two");

    bob.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn failing_handler_does_not_stop_others() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let sender = RelayClient::new(ClientConfig::default());
    sender.connect(addr).await?;

    let receiver = RelayClient::new(ClientConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.on("message", |_| anyhow::bail!("first handler always fails"));
    let s = seen.clone();
    receiver.on("message", move |data| {
        s.lock().unwrap().push(data.clone());
        Ok(())
    });
    receiver.connect(addr).await?;
    wait_for_peers(&server, 2).await;

    sender.send("message", &json!({ "message": "1" })).await?;
    sender.send("message", &json!({ "message": "2" })).await?;

    timeout(WAIT, async {
        while seen.lock().unwrap().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert!(receiver.is_connected().await);

    sender.close().await;
    receiver.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn closed_client_is_removed_from_relay() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let (alice, _alice_rx) = message_client(addr).await?;
    let (bob, _bob_rx) = message_client(addr).await?;
    let mut observer = TcpStream::connect(addr).await?;
    wait_for_peers(&server, 3).await;

    bob.close().await;
    assert_eq!(bob.state().await, ClientState::Closed);
    wait_for_peers(&server, 2).await;

    alice.send("message", &json!({ "message": "after bob left" })).await?;

    let mut frames = FrameReader::new(&mut observer);
    let frame = timeout(WAIT, frames.read_frame()).await??.expect("frame");
    assert_eq!(frame.key(), "message");
    assert_eq!(server.connection_count().await, 2);

    alice.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn server_shutdown_disconnects_clients() -> Result<()> {
    let (mut server, addr) = start_server().await?;

    let mut client = RelayClient::new(ClientConfig::default());
    let mut events = client.take_event_receiver().expect("event receiver");
    client.connect(addr).await?;
    wait_for_peers(&server, 1).await;

    assert_eq!(
        timeout(WAIT, events.recv()).await?,
        Some(ClientEvent::Connected { server_addr: addr })
    );

    server.stop().await?;

    match timeout(WAIT, events.recv()).await? {
        Some(ClientEvent::Disconnected { .. }) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(client.state().await, ClientState::Closed);
    assert!(client.send("message", &json!({})).await.is_err());

    Ok(())
}
