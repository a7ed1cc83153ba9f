//! Fixed-capacity chunk ring.
//!
//! Retains the most recent `capacity` chunks of a stream so late-joining
//! readers can be replayed some history. Chunks are addressed by their
//! logical index (0 for the first chunk ever written); the oldest resident
//! chunk is always `total_chunks - capacity` (saturating at 0).
//!
//! No locking of its own: the owning stream guards it.

use bytes::Bytes;

/// Circular array of the most recent chunks.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<Bytes>>,
    write_index: u64,
    total_chunks: u64,
}

impl RingBuffer {
    /// Create a ring holding up to `capacity` chunks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            slots: vec![None; capacity],
            write_index: 0,
            total_chunks: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total chunks ever pushed.
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Logical index of the oldest chunk still resident.
    pub fn history_start(&self) -> u64 {
        self.total_chunks.saturating_sub(self.capacity() as u64)
    }

    /// Number of chunks currently resident.
    pub fn len(&self) -> usize {
        (self.total_chunks - self.history_start()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total_chunks == 0
    }

    /// Store a chunk, overwriting the oldest one when full.
    /// Returns the logical index assigned to the chunk.
    pub fn push(&mut self, chunk: Bytes) -> u64 {
        let slot = self.slot_for(self.write_index);
        self.slots[slot] = Some(chunk);

        let index = self.total_chunks;
        self.write_index = self.write_index.wrapping_add(1);
        self.total_chunks = self.total_chunks.saturating_add(1);

        debug_assert!(
            self.len() <= self.capacity(),
            "Postcondition: resident chunks bounded by capacity"
        );
        index
    }

    /// Chunk at a logical index, if it is still resident.
    pub fn get(&self, index: u64) -> Option<&Bytes> {
        if index < self.history_start() || index >= self.total_chunks {
            return None;
        }
        self.slots[self.slot_for(index)].as_ref()
    }

    /// Resident chunks from `from` (clamped to the oldest resident index)
    /// up to the newest, in write order.
    pub fn iter_from(&self, from: u64) -> impl Iterator<Item = &Bytes> + '_ {
        let start = from.max(self.history_start());
        (start..self.total_chunks).filter_map(move |i| self.get(i))
    }

    fn slot_for(&self, index: u64) -> usize {
        (index % self.capacity() as u64) as usize
    }
}
