//! Frame buffer and pending-read queue
//!
//! Bytes from the device accumulate in a [`BytesMut`] until a `:` arrives.
//! Everything up to and including it becomes one frame, handed to the
//! oldest registered reader. Frames that arrive before anyone asked for
//! them wait in order until a reader registers.
//!
//! ```ignore
//! let mut frames = FrameBuffer::new();
//! let read = frames.schedule_read();
//! frames.push(b"OK");
//! frames.push(b"\r:");
//! assert_eq!(read.recv().await, Some("OK\r:".to_string()));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tokio::sync::oneshot;

use super::FRAME_TERMINATOR;

/// A registered request for the next frame
///
/// Resolves to `None` when the buffer is drained before a frame arrives.
#[derive(Debug)]
pub struct PendingRead {
    rx: oneshot::Receiver<Option<String>>,
}

impl PendingRead {
    /// Wait for the frame (or the cancellation)
    pub async fn recv(self) -> Option<String> {
        self.rx.await.ok().flatten()
    }
}

/// Buffer turning a byte stream into colon-terminated frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Bytes not yet part of a complete frame
    buffer: BytesMut,
    /// Complete frames nobody has asked for yet
    ready: VecDeque<String>,
    /// Readers waiting for a frame, oldest first
    pending: VecDeque<oneshot::Sender<Option<String>>>,
}

impl FrameBuffer {
    /// Create an empty frame buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and hand out any completed frames
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.extract();
    }

    /// Register interest in the next frame
    ///
    /// A frame already sitting in the buffer is delivered immediately.
    pub fn schedule_read(&mut self) -> PendingRead {
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(tx);
        self.extract();
        PendingRead { rx }
    }

    /// Discard all buffered data and cancel every waiting reader
    ///
    /// Returns the number of readers that were cancelled.
    pub fn drain(&mut self) -> usize {
        self.buffer.clear();
        self.ready.clear();
        let mut cancelled = 0;
        for tx in self.pending.drain(..) {
            if tx.send(None).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of bytes not yet part of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of complete frames waiting for a reader
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of registered readers still waiting
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Split off every complete frame, then pair frames with readers.
    /// Runs until neither step makes progress.
    fn extract(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == FRAME_TERMINATOR) {
            let frame = self.buffer.split_to(pos + 1);
            self.ready
                .push_back(String::from_utf8_lossy(&frame).into_owned());
        }

        while !self.ready.is_empty() {
            let Some(tx) = self.pending.pop_front() else {
                break;
            };
            // The caller stopped waiting (timed out); keep the frame for the next reader.
            if tx.is_closed() {
                continue;
            }
            if let Some(frame) = self.ready.pop_front() {
                if let Err(Some(frame)) = tx.send(Some(frame)) {
                    self.ready.push_front(frame);
                }
            }
        }
    }
}

/// Frame buffer shared between the event loop (byte arrival) and the
/// command worker (read registration and drain)
///
/// The lock is only ever held for the duration of one synchronous call.
#[derive(Debug, Clone, Default)]
pub struct SharedFrameBuffer {
    inner: Arc<Mutex<FrameBuffer>>,
}

impl SharedFrameBuffer {
    /// Create an empty shared buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// See [`FrameBuffer::push`]
    pub fn push(&self, data: &[u8]) {
        self.lock().push(data);
    }

    /// See [`FrameBuffer::schedule_read`]
    pub fn schedule_read(&self) -> PendingRead {
        self.lock().schedule_read()
    }

    /// See [`FrameBuffer::drain`]
    pub fn drain(&self) -> usize {
        self.lock().drain()
    }

    /// Number of bytes not yet part of a frame
    pub fn buffered_len(&self) -> usize {
        self.lock().buffered_len()
    }

    /// Number of complete frames waiting for a reader
    pub fn ready_len(&self) -> usize {
        self.lock().ready_len()
    }
}
