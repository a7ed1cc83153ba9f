//! Reader registry and the consumer side of a stream.
//!
//! Every registered reader owns a bounded queue. The write path offers each
//! chunk to every queue with a non-blocking send; a full queue drops the
//! chunk for that reader only and bumps its drop counter. A slow consumer
//! therefore sees gaps, never a stalled producer.
//!
//! ## Cancellation
//!
//! Each reader carries a [`CancellationToken`]. Unregistering the reader or
//! closing its stream cancels the token, which wakes any pending
//! [`StreamReader::read_chunk`]. Chunks already queued are still handed out
//! before end-of-stream is reported.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::streaming::stream::Stream;

/// Identifier of a registered reader, unique for the lifetime of its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(pub u64);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader_{}", self.0)
    }
}

/// Outcome of offering one chunk to one reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Dropped,
    /// Reader was cancelled or its consumer went away.
    Gone,
}

/// Registry-side state of one reader.
#[derive(Debug)]
pub(crate) struct ReaderSlot {
    id: ReaderId,
    tx: mpsc::Sender<Bytes>,
    dropped: AtomicU64,
    read_index: u64,
    registered_at: Instant,
    cancel: CancellationToken,
}

impl ReaderSlot {
    pub(crate) fn id(&self) -> ReaderId {
        self.id
    }

    pub(crate) fn read_index(&self) -> u64 {
        self.read_index
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue. Never waits on the consumer.
    pub(crate) fn offer(&self, chunk: Bytes) -> Delivery {
        if self.cancel.is_cancelled() {
            return Delivery::Gone;
        }
        match self.tx.try_send(chunk) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Enqueue used for history replay: a full queue stops the replay but is
    /// not counted as a drop.
    pub(crate) fn offer_history(&self, chunk: Bytes) -> bool {
        !self.cancel.is_cancelled() && self.tx.try_send(chunk).is_ok()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    fn stats(&self) -> ReaderStats {
        ReaderStats {
            id: self.id,
            dropped: self.dropped(),
            queued: self.tx.max_capacity() - self.tx.capacity(),
            capacity: self.tx.max_capacity(),
            read_index: self.read_index,
            attached_for: self.registered_at.elapsed(),
        }
    }
}

/// Point-in-time view of one reader, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStats {
    pub id: ReaderId,
    /// Chunks this reader missed because its queue was full
    pub dropped: u64,
    /// Chunks waiting in the queue
    pub queued: usize,
    pub capacity: usize,
    /// Logical chunk index the reader started from
    pub read_index: u64,
    pub attached_for: Duration,
}

/// Per-stream map of attached readers.
#[derive(Debug)]
pub(crate) struct ReaderRegistry {
    readers: HashMap<ReaderId, Arc<ReaderSlot>>,
    next_id: u64,
    capacity: usize,
}

impl ReaderRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        ReaderRegistry {
            readers: HashMap::new(),
            next_id: 0,
            capacity: capacity.max(1),
        }
    }

    /// Attach a new reader whose history starts at `read_index`.
    pub(crate) fn register(&mut self, read_index: u64) -> (Arc<ReaderSlot>, mpsc::Receiver<Bytes>) {
        let id = ReaderId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.capacity);
        let slot = Arc::new(ReaderSlot {
            id,
            tx,
            dropped: AtomicU64::new(0),
            read_index,
            registered_at: Instant::now(),
            cancel: CancellationToken::new(),
        });
        self.readers.insert(id, Arc::clone(&slot));
        (slot, rx)
    }

    /// Detach a reader and cancel it. Unknown ids return `None`.
    pub(crate) fn unregister(&mut self, id: ReaderId) -> Option<Arc<ReaderSlot>> {
        let slot = self.readers.remove(&id)?;
        slot.cancel();
        Some(slot)
    }

    /// Cancel and detach every reader.
    pub(crate) fn close_all(&mut self) -> Vec<Arc<ReaderSlot>> {
        let slots: Vec<_> = self.readers.drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            slot.cancel();
        }
        slots
    }

    /// Cheap copy of the current reader set, for delivery outside the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ReaderSlot>> {
        self.readers.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.readers.len()
    }

    pub(crate) fn total_dropped(&self) -> u64 {
        self.readers.values().map(|slot| slot.dropped()).sum()
    }

    pub(crate) fn stats(&self) -> Vec<ReaderStats> {
        let mut stats: Vec<_> = self.readers.values().map(|slot| slot.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryChunk {
    Data(Bytes),
    /// Nothing queued right now; the stream is still live.
    Empty,
    EndOfStream,
}

/// Consumer handle for one registered reader.
///
/// Dropping it unregisters the reader.
pub struct StreamReader {
    stream: Arc<Stream>,
    slot: Arc<ReaderSlot>,
    rx: mpsc::Receiver<Bytes>,
    released: bool,
}

impl StreamReader {
    pub(crate) fn new(stream: Arc<Stream>, slot: Arc<ReaderSlot>, rx: mpsc::Receiver<Bytes>) -> Self {
        StreamReader {
            stream,
            slot,
            rx,
            released: false,
        }
    }

    pub fn id(&self) -> ReaderId {
        self.slot.id()
    }

    /// Name of the stream this reader is attached to.
    pub fn stream_name(&self) -> &str {
        self.stream.name()
    }

    /// Chunks this reader has missed so far.
    pub fn dropped_count(&self) -> u64 {
        self.slot.dropped()
    }

    /// Wait up to `timeout` for the next chunk.
    ///
    /// - `Ok(Some(chunk))`: next chunk in write order (gaps possible)
    /// - `Ok(None)`: end-of-stream
    /// - `Err(StreamError::Timeout)`: nothing arrived and the stream is still
    ///   open; retry
    pub async fn read_chunk(&mut self, timeout: Duration) -> StreamResult<Option<Bytes>> {
        let cancel = self.slot.cancel.clone();
        tokio::select! {
            biased;
            chunk = self.rx.recv() => Ok(chunk),
            _ = cancel.cancelled() => Ok(self.rx.try_recv().ok()),
            _ = tokio::time::sleep(timeout) => {
                if self.stream.is_closed() {
                    Ok(None)
                } else {
                    Err(StreamError::Timeout { duration: timeout })
                }
            }
        }
    }

    /// Take the next chunk if one is already queued.
    pub fn try_read_chunk(&mut self) -> TryChunk {
        match self.rx.try_recv() {
            Ok(chunk) => TryChunk::Data(chunk),
            Err(TryRecvError::Empty) if self.slot.cancel.is_cancelled() => TryChunk::EndOfStream,
            Err(TryRecvError::Empty) => TryChunk::Empty,
            Err(TryRecvError::Disconnected) => TryChunk::EndOfStream,
        }
    }

    /// Detach from the stream. Idempotent.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stream.unregister_reader(self.slot.id());
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("stream", &self.stream.name())
            .field("id", &self.slot.id())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if !self.released {
            debug!("Reader {} dropped without close, unregistering", self.slot.id());
            self.close();
        }
    }
}
