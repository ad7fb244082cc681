//! In-memory channel pair for tests and in-process wiring.
//!
//! Payloads travel over bounded flume queues, so a slow reader applies
//! back-pressure to the writer once `capacity` payloads are queued.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Channel, ChannelReceiver, ChannelSender};
use crate::error::ChannelError;

/// Default queue depth for [`pair`] callers that have no preference.
pub const DEFAULT_CAPACITY: usize = 100;

/// Creates two directly connected channels.
///
/// Anything sent on one end is received on the other, in order. Closing or
/// dropping one end's sender ends the other end's stream.
#[must_use]
pub fn pair(capacity: usize) -> (Channel, Channel) {
    let (left_tx, left_rx) = flume::bounded(capacity.max(1));
    let (right_tx, right_rx) = flume::bounded(capacity.max(1));

    debug!(capacity, "Created in-memory channel pair");

    (
        Channel::new(MemorySender::new(left_tx), MemoryReceiver::new(right_rx)),
        Channel::new(MemorySender::new(right_tx), MemoryReceiver::new(left_rx)),
    )
}

/// Sending half of an in-memory channel.
#[derive(Debug)]
pub struct MemorySender {
    tx: Option<flume::Sender<Bytes>>,
}

impl MemorySender {
    const fn new(tx: flume::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl ChannelSender for MemorySender {
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send_async(payload)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of an in-memory channel.
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: flume::Receiver<Bytes>,
}

impl MemoryReceiver {
    const fn new(rx: flume::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        match self.rx.recv_async().await {
            Ok(payload) => Ok(Some(payload)),
            Err(flume::RecvError::Disconnected) => Ok(None),
        }
    }
}
