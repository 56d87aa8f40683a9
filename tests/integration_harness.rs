//! Integration Test Harness
#![allow(dead_code)]
//!
//! Runs an agent in-process on an ephemeral port and drives it as a
//! controller over a real WebSocket.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wsrelay_daemon::auth::UnsupportedProvider;
use wsrelay_daemon::config::AgentConfig;
use wsrelay_daemon::handler::Server;
use wsrelay_protocol::{
    CommandType, ConnectSpec, Endpoint, ErrorReply, Frame, Payload, Protocol, Token, decode,
};
use wsrelay_transport::WsClient;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// An agent listening on 127.0.0.1
pub struct TestAgent {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestAgent {
    pub async fn start() -> Self {
        Self::start_with(AgentConfig::default()).await
    }

    pub async fn start_with(mut config: AgentConfig) -> Self {
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(config, Arc::new(UnsupportedProvider))
            .await
            .expect("Failed to bind agent");
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run_until(shutdown.clone()));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn controller(&self) -> Controller {
        let client = WsClient::connect(&format!("ws://{}/", self.addr))
            .await
            .expect("Failed to connect controller");
        Controller { client }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Controller side of one agent connection
pub struct Controller {
    client: WsClient,
}

impl Controller {
    pub async fn send(&mut self, command: CommandType, token: Token, payload: impl Into<Bytes>) {
        let frame = Frame::new(command, token, payload).encode().unwrap();
        self.client.send_frame(frame).await.expect("Failed to send frame");
    }

    pub async fn recv(&mut self) -> Frame {
        let raw = tokio::time::timeout(RECV_TIMEOUT, self.client.recv_frame())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Transport error")
            .expect("Agent closed the connection");
        decode(&raw).expect("Agent sent a malformed frame")
    }

    /// Nothing arrives within `wait`
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Ok(Some(raw))) = tokio::time::timeout(wait, self.client.recv_frame()).await {
            panic!("Unexpected frame: {:?}", decode(&raw).map(|f| f.command));
        }
    }

    pub async fn expect_err(&mut self, token: Token) -> String {
        let frame = self.recv().await;
        assert_eq!(frame.command, CommandType::Err, "expected ERR");
        assert_eq!(frame.token, token);
        ErrorReply::decode(&frame.payload).unwrap().message
    }

    pub async fn expect(&mut self, command: CommandType, token: Token) -> Frame {
        let frame = self.recv().await;
        assert_eq!(frame.command, command);
        assert_eq!(frame.token, token);
        frame
    }

    pub async fn close(mut self) {
        let _ = self.client.close().await;
    }
}

pub fn token(n: u8) -> Token {
    Token([n; 16])
}

pub fn connect_payload(protocol: Protocol, bind: bool, bindtype: u8, addr: SocketAddr) -> Bytes {
    ConnectSpec {
        protocol,
        bind,
        endpoint: Endpoint::from(addr),
        bindtype,
    }
    .encode()
}

/// A port nothing listens on
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A free port for the agent to listen on
pub async fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
