//! Length-framed transport over any byte stream (named-pipe style)
//!
//! Each frame is read by first taking its 4-byte `total_length`, then exactly
//! `total_length - 4` more bytes.

use crate::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;
use wsrelay_protocol::{HEADER_LEN, MAX_FRAME_SIZE, peek_length};

/// Reads frames from a byte stream
pub struct StreamFrameSource<R> {
    reader: R,
    max_frame_size: usize,
}

impl<R> StreamFrameSource<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for StreamFrameSource<R> {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = peek_length(header);
        if length < HEADER_LEN || length > self.max_frame_size {
            return Err(TransportError::InvalidLength {
                length,
                min: HEADER_LEN,
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(length);
        buf.put_slice(&header);
        buf.resize(length, 0);
        self.reader.read_exact(&mut buf[4..]).await?;

        trace!("Stream frame received: {} bytes", length);
        Ok(Some(buf.freeze()))
    }
}

/// Writes frames to a byte stream
pub struct StreamFrameSink<W> {
    writer: W,
}

impl<W> StreamFrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for StreamFrameSink<W> {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a byte stream into frame halves
pub fn split_stream<S>(
    stream: S,
    max_frame_size: usize,
) -> (StreamFrameSink<WriteHalf<S>>, StreamFrameSource<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        StreamFrameSink::new(writer),
        StreamFrameSource::new(reader, max_frame_size),
    )
}
