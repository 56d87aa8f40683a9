//! wsrelay transport - moves raw frames between controller and agent
//!
//! This crate provides:
//! - `FrameSource` / `FrameSink`: one complete frame per call
//! - WebSocket transport (one binary message = one frame)
//! - Length-framed byte-stream transport (pipe style)
//! - In-memory channel transport
//! - `WsClient`: controller-side WebSocket client

mod memory;
mod stream;
mod websocket;
mod ws_client;

pub use stream::*;
pub use websocket::*;
pub use ws_client::*;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid frame length {length} (min: {min}, max: {max})")]
    InvalidLength { length: usize, min: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}

/// Inbound half: yields one complete raw frame per call
#[async_trait]
pub trait FrameSource: Send {
    /// `Ok(None)` once the peer has gone away
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Outbound half
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Flush and close the underlying transport
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub type BoxFrameSource = Box<dyn FrameSource>;
pub type BoxFrameSink = Box<dyn FrameSink>;

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).recv_frame().await
    }
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        (**self).send_frame(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}
