//! Framed reads and writes over async byte streams.

use crate::codec::{Decoder, Encoder};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::greeting::{Greeting, GREETING_SIZE};
use crate::message::Message;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

const READ_CHUNK: usize = 8192;

/// Outcome of a non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus<T> {
    Ready(T),
    /// No complete frame is available yet.
    WouldBlock,
    /// The peer closed the connection at a frame boundary.
    Closed,
}

/// Sources that support a non-blocking read.
pub trait TryRead {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl TryRead for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }
}

impl TryRead for OwnedReadHalf {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        OwnedReadHalf::try_read(self, buf)
    }
}

/// Reads whole frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: Decoder,
    chunk: Box<[u8]>,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: Decoder::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn eof_error(&self) -> ProtocolError {
        ProtocolError::UnexpectedEof {
            remaining: self.decoder.remaining().unwrap_or(1),
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reads the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes at a frame boundary and
    /// `UnexpectedEof` when it closes inside one. Cancel safe: bytes already
    /// received stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(self.eof_error());
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    /// Reads the next frame and decodes it as a message.
    pub async fn read_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.read_frame().await? {
            Some(frame) => Message::decode(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the fixed-size greeting that precedes all frames.
    pub async fn read_greeting(&mut self) -> Result<Greeting, ProtocolError> {
        loop {
            if let Some(raw) = self.decoder.take_raw(GREETING_SIZE) {
                return Greeting::decode(&raw);
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(ProtocolError::InvalidGreeting(format!(
                    "connection closed after {} greeting bytes",
                    self.decoder.buffered()
                )));
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

impl<R: TryRead> FrameReader<R> {
    /// Returns a frame if one can be completed without waiting.
    pub fn try_read_frame(&mut self) -> Result<ReadStatus<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                return Ok(ReadStatus::Ready(frame));
            }
            match self.inner.try_read(&mut self.chunk) {
                Ok(0) if self.decoder.is_idle() => return Ok(ReadStatus::Closed),
                Ok(0) => return Err(self.eof_error()),
                Ok(n) => self.decoder.extend(&self.chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Writes frames to a byte stream.
///
/// `queue` batches frames in memory; `send` and `flush` push them out.
pub struct FrameWriter<W> {
    inner: W,
    pending: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    /// Appends a message to the outgoing batch.
    pub fn queue(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let frame = Encoder::encode_message(message)?;
        self.pending.extend_from_slice(&frame);
        Ok(())
    }

    /// Number of bytes waiting for `flush`.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        if !self.pending.is_empty() {
            self.inner.write_all(&self.pending).await?;
            self.pending.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes one message and flushes.
    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.queue(message)?;
        self.flush().await
    }

    pub async fn send_greeting(&mut self, greeting: &Greeting) -> Result<(), ProtocolError> {
        let bytes = greeting.encode()?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
