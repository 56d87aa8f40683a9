//! Socket Session Integration Tests
//!
//! CONNECT / SD / SDSRV flows against an in-process agent.

mod integration_harness;

use bytes::Bytes;
use integration_harness::{TestAgent, closed_port, connect_payload, free_port, token};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use wsrelay_protocol::{CommandType, ConnectionToken, Endpoint, Payload, Protocol, SocketData};

/// Test: CONNECT to a closed port yields ERR and leaves the token free
#[tokio::test]
async fn test_connect_refused() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let t = token(1);

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Tcp, false, 0, closed_port()))
        .await;
    let message = controller.expect_err(t).await;
    assert!(message.starts_with("Socket connect error"), "{}", message);

    controller.send(CommandType::Sd, t, Bytes::from_static(b"x")).await;
    assert_eq!(
        controller.expect_err(t).await,
        "No socket session found for token"
    );

    agent.stop().await;
}

/// Test: TCP client relays both ways; a second CONNECT on the token is refused
#[tokio::test]
async fn test_tcp_client_relay() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let t = token(2);

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Tcp, false, 0, addr))
        .await;
    controller.expect(CommandType::Continue, t).await;
    let (mut peer, _) = listener.accept().await.unwrap();

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Tcp, false, 0, addr))
        .await;
    assert_eq!(controller.expect_err(t).await, "Token already exists");

    controller.send(CommandType::Sd, t, Bytes::from_static(b"ping")).await;
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    peer.write_all(b"pong").await.unwrap();
    let frame = controller.expect(CommandType::Sd, t).await;
    assert_eq!(&frame.payload[..], b"pong");

    // Peer hangs up: ERR, then the token is free again
    drop(peer);
    assert_eq!(controller.expect_err(t).await, "Connection closed by peer");
    controller.send(CommandType::Sd, t, Bytes::from_static(b"x")).await;
    assert_eq!(
        controller.expect_err(t).await,
        "No socket session found for token"
    );

    agent.stop().await;
}

/// Test: a TCP listener announces each peer before its data and keeps peers apart
#[tokio::test]
async fn test_tcp_server_children() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let bind = free_port().await;
    let t = token(3);

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Tcp, true, 1, bind))
        .await;
    controller.expect(CommandType::Continue, t).await;

    let mut a = TcpStream::connect(bind).await.unwrap();
    let opened_a = SocketData::decode(&controller.expect(CommandType::SdSrv, t).await.payload).unwrap();
    assert!(opened_a.data.is_empty());
    assert_eq!(opened_a.endpoint, Endpoint::from(a.local_addr().unwrap()));

    a.write_all(b"from-a").await.unwrap();
    let data = SocketData::decode(&controller.expect(CommandType::SdSrv, t).await.payload).unwrap();
    assert_eq!(data.connection, opened_a.connection);
    assert_eq!(&data.data[..], b"from-a");

    let mut b = TcpStream::connect(bind).await.unwrap();
    let opened_b = SocketData::decode(&controller.expect(CommandType::SdSrv, t).await.payload).unwrap();
    assert_ne!(opened_a.connection, opened_b.connection);

    let to_b = SocketData::new(opened_b.connection, opened_b.endpoint.clone(), Bytes::from_static(b"to-b"));
    controller.send(CommandType::SdSrv, t, to_b.encode()).await;
    let mut buf = [0u8; 4];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-b");

    let silent = tokio::time::timeout(Duration::from_millis(200), a.read(&mut buf)).await;
    assert!(silent.is_err(), "child A must not see child B's data");

    // Closing B is reported on the listener token; A is unaffected
    drop(b);
    let message = controller.expect_err(t).await;
    assert!(message.starts_with(&format!("Connection {} closed", opened_b.connection)));

    let to_a = SocketData::new(opened_a.connection, opened_a.endpoint, Bytes::from_static(b"still"));
    controller.send(CommandType::SdSrv, t, to_a.encode()).await;
    let mut buf = [0u8; 5];
    a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still");

    agent.stop().await;
}

/// Test: UDP client sends SD to its default remote and reports datagrams as SDSRV
#[tokio::test]
async fn test_udp_client() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let t = token(4);

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Udp, false, 0, peer_addr))
        .await;
    controller.expect(CommandType::Continue, t).await;

    controller.send(CommandType::Sd, t, Bytes::from_static(b"query")).await;
    let mut buf = [0u8; 32];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"query");

    peer.send_to(b"answer", from).await.unwrap();
    let record = SocketData::decode(&controller.expect(CommandType::SdSrv, t).await.payload).unwrap();
    assert_eq!(record.connection, ConnectionToken::from(t));
    assert_eq!(record.endpoint, Endpoint::from(peer_addr));
    assert_eq!(&record.data[..], b"answer");

    // Controller closes the session; nothing more is relayed
    controller.send(CommandType::Ok, t, Bytes::new()).await;
    peer.send_to(b"late", from).await.unwrap();
    controller.expect_silence(Duration::from_millis(200)).await;

    agent.stop().await;
}

/// Test: UDP listener with the plain bind profile
#[tokio::test]
async fn test_udp_server_plain_profile() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let bind = {
        let scratch = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        scratch.local_addr().unwrap()
    };
    let t = token(5);

    controller
        .send(CommandType::Connect, t, connect_payload(Protocol::Udp, true, 1, bind))
        .await;
    controller.expect(CommandType::Continue, t).await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"hello", bind).await.unwrap();
    let record = SocketData::decode(&controller.expect(CommandType::SdSrv, t).await.payload).unwrap();
    assert_eq!(&record.data[..], b"hello");

    let reply = SocketData::new(record.connection, record.endpoint, Bytes::from_static(b"hi"));
    controller.send(CommandType::SdSrv, t, reply.encode()).await;
    let mut buf = [0u8; 8];
    let (len, from) = peer.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"hi");
    assert_eq!(from, bind);

    controller
        .send(CommandType::Connect, token(6), connect_payload(Protocol::Udp, true, 9, bind))
        .await;
    assert_eq!(
        controller.expect_err(token(6)).await,
        "Unsupported UDP bind profile 9"
    );

    agent.stop().await;
}

/// Test: dropping the controller connection tears every session down
#[tokio::test]
async fn test_disconnect_stops_sessions() {
    let agent = TestAgent::start().await;
    let mut controller = agent.controller().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bind = free_port().await;

    controller
        .send(CommandType::Connect, token(7), connect_payload(Protocol::Tcp, false, 0, addr))
        .await;
    controller.expect(CommandType::Continue, token(7)).await;
    let (mut peer, _) = listener.accept().await.unwrap();

    controller
        .send(CommandType::Connect, token(8), connect_payload(Protocol::Tcp, true, 1, bind))
        .await;
    controller.expect(CommandType::Continue, token(8)).await;

    controller.close().await;

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("peer socket was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The listener is gone too
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(bind).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listening socket still open after disconnect");

    agent.stop().await;
}
