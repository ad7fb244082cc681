//! Channels: framed, ordered message transport over a byte stream.
//!
//! A [`Channel`] knows nothing about JSON-RPC. It moves opaque payloads, and
//! the engine splits it into a sending half (owned by the write path) and a
//! receiving half (owned by the reader task).

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::error::ChannelError;
use crate::protocol::FrameCodec;

/// The sending half of a channel.
///
/// Taking `&mut self` makes callers serialize their writes.
#[async_trait]
pub trait ChannelSender: Send {
    /// Frames and writes one payload.
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError>;

    /// Flushes and shuts down the write side. The peer sees end of stream.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// The receiving half of a channel.
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Waits for the next complete payload. `Ok(None)` means the peer closed
    /// the stream cleanly.
    ///
    /// A framing or I/O error is returned once; afterwards every call
    /// returns [`ChannelError::Closed`].
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError>;
}

/// A bidirectional message channel.
pub struct Channel {
    sender: Box<dyn ChannelSender>,
    receiver: Box<dyn ChannelReceiver>,
}

impl Channel {
    /// Assembles a channel from its halves.
    pub fn new(
        sender: impl ChannelSender + 'static,
        receiver: impl ChannelReceiver + 'static,
    ) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }

    /// Builds a channel over separate read and write streams, framing both
    /// directions with `codec`.
    pub fn from_io<R, W>(reader: R, writer: W, codec: FrameCodec) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        debug!(framing = ?codec.framing(), "Opening framed channel");
        Self::new(
            FramedSender::new(writer, codec.clone()),
            FramedReceiver::new(reader, codec),
        )
    }

    /// Builds a channel over one duplex stream such as a TCP socket.
    pub fn from_stream<S>(stream: S, codec: FrameCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_io(reader, writer, codec)
    }

    /// Writes one payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be framed or written.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        self.sender.send(payload).await
    }

    /// Reads one payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed or fails.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        self.receiver.recv().await
    }

    /// Separates the halves so they can be driven from different tasks.
    #[must_use]
    pub fn split(self) -> (Box<dyn ChannelSender>, Box<dyn ChannelReceiver>) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Sending half backed by an [`AsyncWrite`].
pub struct FramedSender<W> {
    inner: FramedWrite<W, FrameCodec>,
    failed: bool,
}

impl<W: AsyncWrite + Send + Unpin> FramedSender<W> {
    /// Wraps `writer`.
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec),
            failed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ChannelSender for FramedSender<W> {
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if self.failed {
            return Err(ChannelError::Closed);
        }
        let result = self.inner.send(payload).await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.failed {
            return Ok(());
        }
        self.failed = true;
        self.inner.close().await
    }
}

/// Receiving half backed by an [`AsyncRead`].
pub struct FramedReceiver<R> {
    inner: FramedRead<R, FrameCodec>,
    state: ReadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Finished,
    Failed,
}

impl<R: AsyncRead + Send + Unpin> FramedReceiver<R> {
    /// Wraps `reader`.
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
            state: ReadState::Open,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> ChannelReceiver for FramedReceiver<R> {
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match self.state {
            ReadState::Open => {}
            ReadState::Finished => return Ok(None),
            ReadState::Failed => return Err(ChannelError::Closed),
        }

        match self.inner.next().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(e)) => {
                self.state = ReadState::Failed;
                Err(e)
            }
            None => {
                self.state = ReadState::Finished;
                Ok(None)
            }
        }
    }
}
