//! Controller-side WebSocket client

use crate::websocket::{WsFrameSink, WsFrameSource, split_websocket, ws_config};
use crate::{FrameSink, FrameSource, TransportError};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, connect_async_with_config, tungstenite::client::IntoClientRequest,
};
use tracing::{debug, info};
use wsrelay_protocol::MAX_FRAME_SIZE;

type ClientStream = MaybeTlsStream<TcpStream>;

/// WebSocket client speaking raw frames
pub struct WsClient {
    sink: WsFrameSink<ClientStream>,
    source: WsFrameSource<ClientStream>,
}

impl WsClient {
    /// Connect to `ws://host:port/`
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("Connecting to {}", url);

        let (stream, response) =
            connect_async_with_config(request, Some(ws_config(MAX_FRAME_SIZE)), false)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!(
            "Connected to WebSocket server, status: {}",
            response.status()
        );

        let (sink, source) = split_websocket(stream);
        Ok(Self { sink, source })
    }

    /// Send one encoded frame
    pub async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.sink.send_frame(frame).await
    }

    /// Next frame from the agent; `None` once it disconnected
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.source.recv_frame().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await
    }

    /// Split into independent halves
    pub fn split(self) -> (WsFrameSink<ClientStream>, WsFrameSource<ClientStream>) {
        (self.sink, self.source)
    }
}
