//! Stream
//!
//! One named stream: a ring of recent chunks, the attached readers, the byte
//! counter and, for rotating mounts, a rotation controller.
//!
//! ## Locking
//!
//! - `state`: ring, readers, counters, rotation. Held briefly; never across
//!   an await and never while delivering to readers.
//! - `fanout`: serializes delivery between concurrent writers so every reader
//!   sees chunks in ring order. Always taken before `state`.
//!
//! Registration replays history under `state`, so a new reader's queue holds
//! history strictly before any live chunk pushed after it joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::streaming::clock::{SharedClock, StreamingTimestamp};
use crate::streaming::config::StreamSettings;
use crate::streaming::output_store::SharedOutputStore;
use crate::streaming::reader::{Delivery, ReaderId, ReaderRegistry, ReaderStats, StreamReader};
use crate::streaming::ring::RingBuffer;
use crate::streaming::rotation::{RotationController, RotationStats};

struct StreamState {
    ring: RingBuffer,
    readers: ReaderRegistry,
    total_bytes_written: u64,
    modified_at: StreamingTimestamp,
    rotation: Option<RotationController>,
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub name: String,
    pub total_bytes_written: u64,
    pub total_chunks: u64,
    pub ring_capacity: usize,
    pub active_readers: usize,
    /// Drops summed over the currently attached readers
    pub dropped_chunks: u64,
    pub modified_at: StreamingTimestamp,
    pub closed: bool,
    pub rotation: Option<RotationStats>,
}

/// A named, append-only, multi-reader byte stream.
pub struct Stream {
    name: String,
    channel: String,
    state: Mutex<StreamState>,
    fanout: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    clock: SharedClock,
}

impl Stream {
    /// Create a stream. Rotation is attached when `settings.rotation` is set
    /// and an output store is available; a rotation interval also starts the
    /// rotation ticker on the current Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        settings: &StreamSettings,
        output: Option<SharedOutputStore>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let name = name.into();
        let channel = channel_of(&name).to_string();

        let rotation = match (&settings.rotation, output) {
            (Some(config), Some(store)) => Some(RotationController::new(
                config.clone(),
                channel.clone(),
                store,
                Arc::clone(&clock),
            )),
            (Some(_), None) => {
                warn!("Rotation configured for {} but no output store attached; streaming live only", name);
                None
            }
            (None, _) => None,
        };
        let interval = rotation.as_ref().and_then(|r| r.config().interval);

        let stream = Arc::new(Stream {
            state: Mutex::new(StreamState {
                ring: RingBuffer::new(settings.ring_buffer_chunks),
                readers: ReaderRegistry::new(settings.channel_buffer_chunks),
                total_bytes_written: 0,
                modified_at: clock.now(),
                rotation,
            }),
            fanout: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            name,
            channel,
            clock,
        });

        if let Some(interval) = interval {
            RotationTicker {
                stream: Arc::downgrade(&stream),
                name: stream.name.clone(),
                interval,
                shutdown: stream.shutdown.clone(),
            }
            .spawn();
        }

        stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path component of the name, used in output file names.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn rotation_enabled(&self) -> bool {
        self.state.lock().rotation.is_some()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.state.lock().total_bytes_written
    }

    /// Append one chunk and offer it to every reader. Never waits on readers.
    pub fn write(&self, data: &[u8]) -> StreamResult<usize> {
        self.append(data, None)
    }

    /// Append only if `offset` is the current append position.
    pub fn write_at(&self, data: &[u8], offset: u64) -> StreamResult<usize> {
        self.append(data, Some(offset))
    }

    fn append(&self, data: &[u8], expected_offset: Option<u64>) -> StreamResult<usize> {
        let chunk = Bytes::copy_from_slice(data);

        let fanout = self.fanout.lock();
        let readers = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(StreamError::Closed {
                    name: self.name.clone(),
                });
            }
            if let Some(offset) = expected_offset {
                if offset != state.total_bytes_written {
                    return Err(StreamError::NonAppendWrite {
                        offset,
                        append_at: state.total_bytes_written,
                    });
                }
            }

            if let Some(rotation) = state.rotation.as_mut() {
                rotation.write(&chunk);
            }

            state.ring.push(chunk.clone());
            state.total_bytes_written = state.total_bytes_written.saturating_add(chunk.len() as u64);
            state.modified_at = self.clock.now();
            state.readers.snapshot()
        };

        let mut delivered = 0usize;
        let mut dropped = 0usize;
        for slot in &readers {
            match slot.offer(chunk.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => dropped += 1,
                Delivery::Gone => {}
            }
        }
        drop(fanout);

        if dropped > 0 {
            warn!("{} slow readers dropped a chunk on {}", dropped, self.name);
        }
        debug!(
            "Wrote {} bytes to {} ({}/{} readers)",
            chunk.len(),
            self.name,
            delivered,
            readers.len()
        );

        Ok(chunk.len())
    }

    /// Attach a reader. Up to a ring's worth of history is queued before the
    /// reader is returned.
    pub fn register_reader(self: &Arc<Self>) -> StreamResult<StreamReader> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(StreamError::Closed {
                name: self.name.clone(),
            });
        }

        let history_start = state.ring.history_start();
        let (slot, rx) = state.readers.register(history_start);

        let mut replayed = 0usize;
        for chunk in state.ring.iter_from(slot.read_index()) {
            if !slot.offer_history(chunk.clone()) {
                warn!("Reader {} channel full during historical data send", slot.id());
                break;
            }
            replayed += 1;
        }
        drop(state);

        info!(
            "Registered reader {} for stream {} ({} chunks of history)",
            slot.id(),
            self.name,
            replayed
        );
        Ok(StreamReader::new(Arc::clone(self), slot, rx))
    }

    /// Detach a reader. Unknown ids are ignored. Returns whether one was removed.
    pub fn unregister_reader(&self, id: ReaderId) -> bool {
        let removed = self.state.lock().readers.unregister(id).is_some();
        if removed {
            info!("Unregistered reader {} for stream {}", id, self.name);
        }
        removed
    }

    pub fn reader_stats(&self) -> Vec<ReaderStats> {
        self.state.lock().readers.stats()
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.state.lock();
        StreamStats {
            name: self.name.clone(),
            total_bytes_written: state.total_bytes_written,
            total_chunks: state.ring.total_chunks(),
            ring_capacity: state.ring.capacity(),
            active_readers: state.readers.len(),
            dropped_chunks: state.readers.total_dropped(),
            modified_at: state.modified_at,
            closed: self.is_closed(),
            rotation: state.rotation.as_ref().map(|r| r.stats()),
        }
    }

    /// Time-based rotation hook, called by the ticker.
    pub fn rotate_on_tick(&self) {
        let mut state = self.state.lock();
        if self.is_closed() {
            return;
        }
        if let Some(rotation) = state.rotation.as_mut() {
            rotation.rotate_on_tick();
        }
    }

    /// Close the stream: writes fail from now on and every reader reaches
    /// end-of-stream once its queue is drained. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        if let Some(rotation) = state.rotation.as_mut() {
            rotation.close();
        }
        for slot in state.readers.close_all() {
            info!("Closed reader {} for stream {}", slot.id(), self.name);
        }
        info!("Stream {} closed", self.name);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Last component of a stream path: `/video` -> `video`.
pub fn channel_of(name: &str) -> &str {
    let trimmed = name.trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(last) if !last.is_empty() => last,
        _ => "/",
    }
}

// ============================================================================
// Time-based rotation
// ============================================================================

struct RotationTicker {
    stream: Weak<Stream>,
    name: String,
    interval: Duration,
    shutdown: CancellationToken,
}

impl RotationTicker {
    fn spawn(self) {
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Starting rotation ticker for {} every {:?}", self.name, self.interval);
                handle.spawn(self.run());
            }
            Err(_) => {
                warn!(
                    "No Tokio runtime available, time-based rotation disabled for {}",
                    self.name
                );
            }
        }
    }

    async fn run(self) {
        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let Some(stream) = self.stream.upgrade() else {
                        break;
                    };
                    stream.rotate_on_tick();
                }
            }
        }
        debug!("Rotation ticker for {} stopped", self.name);
    }
}
