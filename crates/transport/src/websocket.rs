//! WebSocket transport: one binary message carries one frame

use crate::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream, accept_async_with_config,
    tungstenite::{Message, protocol::WebSocketConfig},
};
use tracing::{debug, trace, warn};

/// WebSocket limits sized for the largest frame the protocol allows
pub fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

/// Outbound half of a WebSocket
pub struct WsFrameSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Inbound half of a WebSocket
pub struct WsFrameSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket into frame halves
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, rx) = ws.split();
    (WsFrameSink { inner: tx }, WsFrameSource { inner: rx })
}

/// Run the server side of the WebSocket handshake on an accepted stream
pub async fn accept_websocket<S>(
    stream: S,
    max_frame_size: usize,
) -> Result<(WsFrameSink<S>, WsFrameSource<S>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = accept_async_with_config(stream, Some(ws_config(max_frame_size)))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(split_websocket(ws))
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        trace!("Sending binary frame: {} bytes", frame.len());
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing WebSocket connection");
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        // Pings are answered by tungstenite itself while we poll
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Text(_)) => warn!("Text message is unexpected here"),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
        Ok(None)
    }
}
