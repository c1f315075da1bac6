//! Per-session outbound queues with backpressure.
//!
//! Each session owns one bounded queue drained by its socket writer task.
//! The room never waits on a queue: it encodes a frame once and hands the
//! same `Arc<Vec<u8>>` to every target with `try_send`. A full queue means
//! the consumer cannot keep up, and the room disconnects it instead of
//! blocking everyone else.
//!
//! Close requests travel on a side channel so they overtake queued frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::protocol::{CloseReason, Frame, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// What the writer task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Arc<Vec<u8>>),
    Close(CloseReason),
}

/// Room-side end of a session queue.
#[derive(Debug)]
pub struct OutboundSender {
    frames: mpsc::Sender<Arc<Vec<u8>>>,
    close: watch::Sender<Option<CloseReason>>,
}

/// Writer-side end of a session queue.
#[derive(Debug)]
pub struct OutboundReceiver {
    frames: mpsc::Receiver<Arc<Vec<u8>>>,
    close: watch::Receiver<Option<CloseReason>>,
}

/// A queue holding at most `capacity` frames.
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = watch::channel(None);
    (
        OutboundSender {
            frames: frames_tx,
            close: close_tx,
        },
        OutboundReceiver {
            frames: frames_rx,
            close: close_rx,
        },
    )
}

impl OutboundSender {
    /// Enqueue without waiting.
    pub fn send(&self, bytes: Arc<Vec<u8>>) -> Result<(), SendError> {
        if self.close.borrow().is_some() {
            return Err(SendError::Closed);
        }
        self.frames.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the writer to close the socket. The first reason sticks.
    pub fn close(&self, reason: CloseReason) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.close.borrow().is_some() || self.frames.is_closed()
    }

    /// Free slots left in the queue.
    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }
}

impl OutboundReceiver {
    /// Next thing to do. A pending close wins over queued frames; `None`
    /// once the room dropped the session without closing it.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            if let Some(reason) = *self.close.borrow() {
                return Some(Outbound::Close(reason));
            }
            let sender_gone = tokio::select! {
                biased;
                changed = self.close.changed() => changed.is_err(),
                frame = self.frames.recv() => return frame.map(Outbound::Frame),
            };
            if sender_gone {
                return self.frames.recv().await.map(Outbound::Frame);
            }
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }

    /// Pop one queued frame, decoded. Frames that fail to decode are skipped.
    pub fn try_recv_frame(&mut self) -> Option<Frame> {
        while let Ok(bytes) = self.frames.try_recv() {
            match Frame::decode(&bytes) {
                Ok(frame) => return Some(frame),
                Err(e) => log::warn!("Skipping undecodable outbound frame: {e}"),
            }
        }
        None
    }

    /// Every queued frame, decoded.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.try_recv_frame()).collect()
    }
}

/// Encode once for fan-out.
pub fn encode_shared(frame: &Frame) -> Result<Arc<Vec<u8>>, ProtocolError> {
    frame.encode().map(Arc::new)
}

/// Fan-out counters for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub slow_consumers: u64,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Debug, Default)]
pub(crate) struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    slow_consumers: AtomicU64,
}

impl AtomicBroadcastStats {
    pub(crate) fn sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn slow_consumer(&self) {
        self.slow_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            slow_consumers: self.slow_consumers.load(Ordering::Relaxed),
        }
    }
}
