//! In-memory transport over tokio channels

use crate::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[async_trait]
impl FrameSource for mpsc::Receiver<Bytes> {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.recv().await)
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<Bytes> {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport() {
        let (mut tx, mut rx) = mpsc::channel::<Bytes>(4);
        tx.send_frame(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(rx.recv_frame().await.unwrap().unwrap(), "frame");

        drop(tx);
        assert!(rx.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (mut tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        assert!(matches!(
            tx.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
