//! Deterministic Simulation Testing for Streams
//!
//! Shadow-state harness that drives a `StreamFs` with a seeded random
//! workload (writes, reader attach/detach, drains, removals, output faults)
//! and checks after every drain that what readers saw is consistent with
//! what producers wrote.
//!
//! ## Invariants
//!
//! - Readers see chunks in write order, never duplicated (gaps allowed)
//! - A late reader's history starts no earlier than one ring behind
//! - Every live write is either delivered or counted as a drop
//! - A stream's reported size equals the bytes written to it
//! - Without output faults, rotated files hold exactly the bytes written and
//!   none exceeds the size threshold
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = StreamDstHarness::new(StreamDstConfig::calm(seed));
//!     harness.run(500);
//!     harness.check_invariants();
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::streaming::clock::SimulatedClock;
use crate::streaming::config::{RotationConfig, StreamSettings};
use crate::streaming::fs::{StreamFs, WriteOffset};
use crate::streaming::output_store::{InMemoryOutputStore, SharedOutputStore};
use crate::streaming::reader::{StreamReader, TryChunk};

const SEQ_BYTES: usize = 8;

/// Configuration for stream DST
#[derive(Debug, Clone)]
pub struct StreamDstConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of distinct stream names
    pub streams: usize,
    pub channel_chunks: usize,
    pub ring_chunks: usize,
    /// Rotation threshold; `None` runs without an output store
    pub rotation_size: Option<u64>,
    pub max_payload: usize,
    pub write_probability: f64,
    pub attach_probability: f64,
    pub detach_probability: f64,
    pub remove_probability: f64,
    /// Probability of flipping output append/create faults
    pub fault_probability: f64,
}

impl Default for StreamDstConfig {
    fn default() -> Self {
        StreamDstConfig {
            seed: 0,
            streams: 3,
            channel_chunks: 4,
            ring_chunks: 4,
            rotation_size: Some(128),
            max_payload: 48,
            write_probability: 0.55,
            attach_probability: 0.1,
            detach_probability: 0.04,
            remove_probability: 0.02,
            fault_probability: 0.0,
        }
    }
}

impl StreamDstConfig {
    pub fn new(seed: u64) -> Self {
        StreamDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// No output faults
    pub fn calm(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Output faults and tiny reader queues
    pub fn chaos(seed: u64) -> Self {
        StreamDstConfig {
            seed,
            channel_chunks: 2,
            ring_chunks: 3,
            remove_probability: 0.05,
            fault_probability: 0.05,
            ..Default::default()
        }
    }

    /// Live streaming only, no rotation
    pub fn live_only(seed: u64) -> Self {
        StreamDstConfig {
            seed,
            rotation_size: None,
            ..Default::default()
        }
    }
}

/// Operation generated by the workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOperation {
    Write { stream: usize, len: usize },
    Attach { stream: usize },
    Detach { reader: usize },
    Drain { reader: usize },
    Remove { stream: usize },
    SetOutputFaults { failing: bool },
}

/// Workload generator
pub struct StreamWorkload {
    rng: ChaCha8Rng,
    config: StreamDstConfig,
}

impl StreamWorkload {
    pub fn new(config: StreamDstConfig) -> Self {
        StreamWorkload {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        }
    }

    /// Generate the next operation. `readers` is the number of attached readers.
    pub fn next_operation(&mut self, readers: usize) -> StreamOperation {
        let c = &self.config;
        let stream = self.rng.gen_range(0..c.streams.max(1));
        let mut roll: f64 = self.rng.gen();

        if roll < c.fault_probability {
            return StreamOperation::SetOutputFaults {
                failing: self.rng.gen_bool(0.5),
            };
        }
        roll -= c.fault_probability;
        if roll < c.remove_probability {
            return StreamOperation::Remove { stream };
        }
        roll -= c.remove_probability;
        if roll < c.attach_probability || readers == 0 {
            return StreamOperation::Attach { stream };
        }
        roll -= c.attach_probability;
        if roll < c.detach_probability {
            return StreamOperation::Detach {
                reader: self.rng.gen_range(0..readers),
            };
        }
        roll -= c.detach_probability;
        if roll < c.write_probability {
            let len = self.rng.gen_range(SEQ_BYTES..=c.max_payload.max(SEQ_BYTES));
            return StreamOperation::Write { stream, len };
        }
        StreamOperation::Drain {
            reader: self.rng.gen_range(0..readers),
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone, Default)]
pub struct StreamDstResult {
    pub seed: u64,
    pub total_operations: u64,
    pub writes: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub removals: u64,
    pub invariant_violations: Vec<String>,
}

impl StreamDstResult {
    pub fn new(seed: u64) -> Self {
        StreamDstResult {
            seed,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops, {} writes, {} received, {} dropped, {} removals, {} violations",
            self.seed,
            self.total_operations,
            self.writes,
            self.chunks_received,
            self.chunks_dropped,
            self.removals,
            self.invariant_violations.len()
        )
    }
}

/// Ground truth for one incarnation of a stream name
#[derive(Debug, Clone, Copy, Default)]
struct ShadowStream {
    generation: u64,
    chunks: u64,
    bytes: u64,
}

struct TrackedReader {
    stream: usize,
    generation: u64,
    reader: StreamReader,
    /// Chunks written to the stream before this reader attached
    attached_at: u64,
    last_seq: Option<u64>,
    live_received: u64,
    ended: bool,
}

/// Main DST harness for streams
pub struct StreamDstHarness {
    config: StreamDstConfig,
    fs: StreamFs,
    store: Option<InMemoryOutputStore>,
    clock: SimulatedClock,
    workload: StreamWorkload,
    shadow: Vec<ShadowStream>,
    /// Chunks written per (stream, generation), kept after removal
    history: HashMap<(usize, u64), u64>,
    readers: Vec<TrackedReader>,
    output_faults: bool,
    bytes_written_while_faulty: bool,
    total_bytes: u64,
    result: StreamDstResult,
}

impl StreamDstHarness {
    pub fn new(config: StreamDstConfig) -> Self {
        let clock = SimulatedClock::new(1_700_000_000_000);
        let mut settings = StreamSettings::test().with_buffers(config.channel_chunks, config.ring_chunks);
        let mut store = None;
        let mut output: Option<SharedOutputStore> = None;
        if let Some(size) = config.rotation_size {
            settings = settings.with_rotation(
                RotationConfig::new("/out")
                    .with_size(size)
                    .with_pattern("{channel}_{timestamp}_{index}.dat"),
            );
            let memory = InMemoryOutputStore::new();
            output = Some(Arc::new(memory.clone()));
            store = Some(memory);
        }
        let fs = StreamFs::new(settings, output, Arc::new(clock.clone()));

        StreamDstHarness {
            workload: StreamWorkload::new(config.clone()),
            shadow: vec![ShadowStream::default(); config.streams.max(1)],
            result: StreamDstResult::new(config.seed),
            config,
            fs,
            store,
            clock,
            history: HashMap::new(),
            readers: Vec::new(),
            output_faults: false,
            bytes_written_while_faulty: false,
            total_bytes: 0,
        }
    }

    fn path(stream: usize) -> String {
        format!("/s{}", stream)
    }

    /// Run the workload for a number of operations
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation(self.readers.len());
            self.execute(op);
            self.clock.advance_ms(1000);
        }
    }

    fn execute(&mut self, op: StreamOperation) {
        self.result.total_operations += 1;
        match op {
            StreamOperation::Write { stream, len } => self.execute_write(stream, len),
            StreamOperation::Attach { stream } => self.execute_attach(stream),
            StreamOperation::Detach { reader } => {
                if reader < self.readers.len() {
                    let mut tracked = self.readers.swap_remove(reader);
                    self.drain(&mut tracked);
                    if !tracked.ended {
                        self.result.chunks_dropped += tracked.reader.dropped_count();
                    }
                    tracked.reader.close();
                }
            }
            StreamOperation::Drain { reader } => {
                if reader < self.readers.len() {
                    let mut tracked = self.readers.swap_remove(reader);
                    self.drain(&mut tracked);
                    if !tracked.ended {
                        self.readers.push(tracked);
                    }
                }
            }
            StreamOperation::Remove { stream } => self.execute_remove(stream),
            StreamOperation::SetOutputFaults { failing } => {
                if let Some(store) = &self.store {
                    store.set_fail_append(failing);
                    store.set_fail_create(failing);
                    self.output_faults = failing;
                }
            }
        }
    }

    fn execute_write(&mut self, stream: usize, len: usize) {
        let shadow = &mut self.shadow[stream];
        let mut payload = vec![0u8; len.max(SEQ_BYTES)];
        payload[..SEQ_BYTES].copy_from_slice(&shadow.chunks.to_be_bytes());

        match self.fs.write(&Self::path(stream), &payload, WriteOffset::Append) {
            Ok(n) if n == payload.len() => {
                shadow.chunks += 1;
                shadow.bytes += n as u64;
                self.history.insert((stream, shadow.generation), shadow.chunks);
                self.total_bytes += n as u64;
                self.bytes_written_while_faulty |= self.output_faults;
                self.result.writes += 1;
            }
            Ok(n) => self.violation(format!("short write of {} bytes, expected {}", n, payload.len())),
            Err(e) => self.violation(format!("write to {} failed: {}", Self::path(stream), e)),
        }
    }

    fn execute_attach(&mut self, stream: usize) {
        match self.fs.open_stream(&Self::path(stream)) {
            Ok(reader) => {
                let shadow = self.shadow[stream];
                self.readers.push(TrackedReader {
                    stream,
                    generation: shadow.generation,
                    reader,
                    attached_at: shadow.chunks,
                    last_seq: None,
                    live_received: 0,
                    ended: false,
                });
            }
            Err(e) => self.violation(format!("attach to {} failed: {}", Self::path(stream), e)),
        }
    }

    fn execute_remove(&mut self, stream: usize) {
        // Removing an unknown stream is an expected NotFound.
        if self.fs.remove(&Self::path(stream)).is_ok() {
            let shadow = &mut self.shadow[stream];
            shadow.generation += 1;
            shadow.chunks = 0;
            shadow.bytes = 0;
            self.result.removals += 1;
        }
    }

    /// Pull everything queued for a reader and check what came out.
    fn drain(&mut self, tracked: &mut TrackedReader) {
        let ring = self.config.ring_chunks as u64;
        loop {
            match tracked.reader.try_read_chunk() {
                TryChunk::Data(chunk) => {
                    self.result.chunks_received += 1;
                    if chunk.len() < SEQ_BYTES {
                        self.violation(format!("chunk of {} bytes lost its header", chunk.len()));
                        continue;
                    }
                    let mut header = [0u8; SEQ_BYTES];
                    header.copy_from_slice(&chunk[..SEQ_BYTES]);
                    let seq = u64::from_be_bytes(header);

                    if let Some(last) = tracked.last_seq {
                        if seq <= last {
                            self.violation(format!(
                                "reader on /s{} saw seq {} after {} (reordered or duplicated)",
                                tracked.stream, seq, last
                            ));
                        }
                    } else if seq < tracked.attached_at.saturating_sub(ring) {
                        self.violation(format!(
                            "reader on /s{} replayed seq {} older than one ring behind {}",
                            tracked.stream, seq, tracked.attached_at
                        ));
                    }
                    let written = self
                        .history
                        .get(&(tracked.stream, tracked.generation))
                        .copied()
                        .unwrap_or(0);
                    if seq >= written {
                        self.violation(format!(
                            "reader on /s{} saw seq {} but only {} chunks were written",
                            tracked.stream, seq, written
                        ));
                    }
                    if seq >= tracked.attached_at {
                        tracked.live_received += 1;
                    }
                    tracked.last_seq = Some(seq);
                }
                TryChunk::Empty => {
                    let live_writes = self.shadow[tracked.stream].chunks - tracked.attached_at;
                    let dropped = tracked.reader.dropped_count();
                    if tracked.live_received + dropped != live_writes {
                        self.violation(format!(
                            "reader on /s{}: {} received + {} dropped != {} live writes",
                            tracked.stream, tracked.live_received, dropped, live_writes
                        ));
                    }
                    return;
                }
                TryChunk::EndOfStream => {
                    if self.shadow[tracked.stream].generation == tracked.generation {
                        self.violation(format!("reader on live stream /s{} saw end-of-stream", tracked.stream));
                    }
                    self.result.chunks_dropped += tracked.reader.dropped_count();
                    tracked.ended = true;
                    return;
                }
            }
        }
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    /// Check end-of-run invariants
    pub fn check_invariants(&mut self) {
        let mut readers = std::mem::take(&mut self.readers);
        for tracked in &mut readers {
            self.drain(tracked);
            if !tracked.ended {
                self.result.chunks_dropped += tracked.reader.dropped_count();
            }
        }
        self.readers = readers;

        for stream in 0..self.shadow.len() {
            let expected = self.shadow[stream].bytes;
            match self.fs.stat(&Self::path(stream)) {
                Ok(info) if info.size != expected => self.violation(format!(
                    "/s{} reports {} bytes, {} were written",
                    stream, info.size, expected
                )),
                Ok(_) => {}
                Err(_) if expected == 0 => {}
                Err(e) => self.violation(format!("stat /s{} failed: {}", stream, e)),
            }
        }

        self.check_output_files();
    }

    fn check_output_files(&mut self) {
        let (Some(store), Some(threshold)) = (self.store.clone(), self.config.rotation_size) else {
            return;
        };
        let sizes: Vec<(String, usize)> = store
            .file_paths()
            .into_iter()
            .map(|p| {
                let len = store.file_data(&p).map(|d| d.len()).unwrap_or(0);
                (p, len)
            })
            .collect();

        for (path, len) in &sizes {
            if *len as u64 > threshold && self.config.max_payload as u64 <= threshold {
                self.violation(format!("{} holds {} bytes, above threshold {}", path, len, threshold));
            }
        }
        if !self.bytes_written_while_faulty {
            let persisted: u64 = sizes.iter().map(|(_, len)| *len as u64).sum();
            if persisted != self.total_bytes {
                self.violation(format!(
                    "output holds {} bytes, {} were written",
                    persisted, self.total_bytes
                ));
            }
        }
    }

    pub fn result(&self) -> &StreamDstResult {
        &self.result
    }

    pub fn into_result(mut self) -> StreamDstResult {
        std::mem::take(&mut self.result)
    }
}

impl Drop for StreamDstHarness {
    fn drop(&mut self) {
        self.fs.shutdown();
    }
}

/// Run a batch of DST runs with consecutive seeds
pub fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> StreamDstConfig,
) -> Vec<StreamDstResult> {
    (0..count)
        .map(|i| {
            let mut harness = StreamDstHarness::new(config_fn(base_seed + i as u64));
            harness.run(ops_per_run);
            harness.check_invariants();
            harness.result().clone()
        })
        .collect()
}

/// Summary of batch results
pub fn summarize_batch(results: &[StreamDstResult]) -> String {
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results.iter().filter(|r| !r.is_success()).map(|r| r.seed).collect();
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_dropped: u64 = results.iter().map(|r| r.chunks_dropped).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} chunks dropped",
        passed,
        results.len(),
        total_ops,
        total_dropped
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_harness_calm() {
        let mut harness = StreamDstHarness::new(StreamDstConfig::calm(42));
        harness.run(300);
        harness.check_invariants();

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.total_operations, 300);
        assert!(result.writes > 0);
    }

    #[test]
    fn test_dst_deterministic() {
        let run = |seed| {
            let mut harness = StreamDstHarness::new(StreamDstConfig::chaos(seed));
            harness.run(200);
            harness.check_invariants();
            harness.into_result()
        };
        let a = run(7);
        let b = run(7);
        assert_eq!(a.writes, b.writes);
        assert_eq!(a.chunks_received, b.chunks_received);
        assert_eq!(a.chunks_dropped, b.chunks_dropped);
    }

    #[test]
    fn test_workload_generator_mix() {
        let mut workload = StreamWorkload::new(StreamDstConfig::chaos(1));
        let mut writes = 0;
        let mut attaches = 0;
        let mut drains = 0;
        for _ in 0..1000 {
            match workload.next_operation(2) {
                StreamOperation::Write { len, .. } => {
                    assert!(len >= SEQ_BYTES);
                    writes += 1;
                }
                StreamOperation::Attach { .. } => attaches += 1,
                StreamOperation::Drain { reader } | StreamOperation::Detach { reader } => {
                    assert!(reader < 2);
                    drains += 1;
                }
                _ => {}
            }
        }
        assert!(writes > 300, "Expected mostly writes");
        assert!(attaches > 0);
        assert!(drains > 0);
    }

    #[test]
    fn test_no_readers_means_attach() {
        let mut workload = StreamWorkload::new(StreamDstConfig::new(3));
        for _ in 0..100 {
            let op = workload.next_operation(0);
            assert!(!matches!(op, StreamOperation::Drain { .. } | StreamOperation::Detach { .. }));
        }
    }
}
