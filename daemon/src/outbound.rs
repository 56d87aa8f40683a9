//! Outbound frame queue
//!
//! Every task that talks to the controller goes through one bounded queue per
//! connection; a single writer task drains it into the transport sink, so
//! frames are never interleaved.

use crate::metrics;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};
use wsrelay_protocol::{
    AuthErrorReply, CommandType, ErrorReply, Frame, Payload, SocketData, Token,
};
use wsrelay_transport::FrameSink;

#[derive(Error, Debug)]
#[error("Outbound channel closed")]
pub struct OutboundClosed;

/// Cloneable handle onto a connection's outbound queue
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    /// Create the queue and spawn the writer task that drains it into `sink`
    pub fn spawn<S>(sink: S, capacity: usize) -> (Self, JoinHandle<()>)
    where
        S: FrameSink + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(writer_loop(sink, rx));
        (Self { tx }, handle)
    }

    /// Queue that hands encoded frames to the caller; used by tests
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue one frame
    pub async fn send(&self, frame: Frame) -> Result<(), OutboundClosed> {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                // Nothing on the wire yet; report on the same token instead
                error!("[OUT][{}][{}] {}", frame.token, frame.command, e);
                let reply = ErrorReply::new(format!("Error! {}", e)).encode();
                Frame::new(CommandType::Err, frame.token, reply)
                    .encode()
                    .map_err(|_| OutboundClosed)?
            }
        };
        trace!("[OUT][{}][{}] {} bytes", frame.token, frame.command, encoded.len());
        self.tx.send(encoded).await.map_err(|_| OutboundClosed)
    }

    pub async fn send_payload<P: Payload>(
        &self,
        command: CommandType,
        token: Token,
        payload: &P,
    ) -> Result<(), OutboundClosed> {
        self.send(Frame::new(command, token, payload.encode())).await
    }

    pub async fn ok(&self, token: Token) -> Result<(), OutboundClosed> {
        self.send(Frame::empty(CommandType::Ok, token)).await
    }

    pub async fn continue_(&self, token: Token) -> Result<(), OutboundClosed> {
        self.send(Frame::empty(CommandType::Continue, token)).await
    }

    pub async fn err(&self, token: Token, message: impl Into<String>) -> Result<(), OutboundClosed> {
        self.send_payload(CommandType::Err, token, &ErrorReply::new(message))
            .await
    }

    pub async fn auth_err(
        &self,
        token: Token,
        status: i64,
        message: impl Into<String>,
    ) -> Result<(), OutboundClosed> {
        let reply = AuthErrorReply {
            status,
            message: message.into(),
        };
        self.send_payload(CommandType::AuthErr, token, &reply).await
    }

    /// SD: raw socket data on a client session
    pub async fn sd(&self, token: Token, data: Bytes) -> Result<(), OutboundClosed> {
        self.send(Frame::new(CommandType::Sd, token, data)).await
    }

    /// SDSRV: addressed socket data
    pub async fn sdsrv(&self, token: Token, data: &SocketData) -> Result<(), OutboundClosed> {
        self.send_payload(CommandType::SdSrv, token, data).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn writer_loop<S: FrameSink>(mut sink: S, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len();
        if let Err(e) = sink.send_frame(frame).await {
            debug!("Transport send error: {}", e);
            break;
        }
        metrics::with(|m| {
            m.frames_sent.inc();
            m.frame_size.observe(len as f64);
        });
    }
    // Stop accepting frames, then let the transport close cleanly
    rx.close();
    if let Err(e) = sink.close().await {
        debug!("Transport close error: {}", e);
    }
    debug!("Outbound writer ended");
}
