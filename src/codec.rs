use crate::{
    error::ConnectionError,
    frame::{Frame, FrameHeader},
    settings::DEFAULT_MAX_FRAME_SIZE,
};
use bytes::{Buf, BytesMut};
use log::trace;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The 24-octet magic a client sends before any frame.
/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Reads frames off the inbound half of the duplex.
///
/// Inbound payloads are bounded by the MAX_FRAME_SIZE we advertised. A clean
/// EOF at a frame boundary yields `None`; an EOF inside a frame is a
/// transport error.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn set_max_frame_size(&mut self, max: u32) {
        self.max_frame_size = max;
    }

    /// Consumes and validates the client connection preface.
    pub async fn read_preface(&mut self) -> Result<(), ConnectionError> {
        while self.buf.len() < PREFACE.len() {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(unexpected_eof("connection closed before the preface"));
            }
        }
        if &self.buf[..PREFACE.len()] != PREFACE {
            return Err(ConnectionError::Protocol("bad connection preface"));
        }
        self.buf.advance(PREFACE.len());
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        while self.buf.len() < FrameHeader::SIZE {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(unexpected_eof("connection closed inside a frame header"));
            }
        }
        let mut raw = [0u8; FrameHeader::SIZE];
        raw.copy_from_slice(&self.buf[..FrameHeader::SIZE]);
        let header = FrameHeader::parse(&raw);
        if header.length > self.max_frame_size {
            return Err(ConnectionError::FrameSize(
                "frame exceeds the advertised MAX_FRAME_SIZE",
            ));
        }
        let total = FrameHeader::SIZE + header.length as usize;
        while self.buf.len() < total {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(unexpected_eof("connection closed inside a frame payload"));
            }
        }
        self.buf.advance(FrameHeader::SIZE);
        let payload = self.buf.split_to(header.length as usize).freeze();
        let frame = Frame::parse(header, payload)?;
        trace!("recv {:?}", frame);
        Ok(Some(frame))
    }
}

fn unexpected_eof(what: &'static str) -> ConnectionError {
    ConnectionError::Transport(io::Error::new(io::ErrorKind::UnexpectedEof, what))
}

/// Writes frames to the outbound half of the duplex, one flush per frame.
///
/// Fragmenting DATA and header blocks against the peer's MAX_FRAME_SIZE is
/// the controller's job, not the writer's.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Writes the client connection preface.
    pub async fn write_preface(&mut self) -> Result<(), ConnectionError> {
        self.io.write_all(PREFACE).await?;
        Ok(())
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        trace!("send {:?}", frame);
        self.buf.clear();
        frame.encode(&mut self.buf);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.io.shutdown().await?;
        Ok(())
    }
}
