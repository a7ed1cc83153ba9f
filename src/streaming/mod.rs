//! Streaming Virtual Files
//!
//! Append-only byte streams exposed as files. Producers write chunks; any
//! number of readers receive them live through bounded per-reader queues
//! where a slow reader loses chunks instead of stalling the producer. Each
//! stream keeps a ring of recent chunks so late readers start with history,
//! and can optionally persist everything to rotated output files.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──> reader queue ──> StreamReader / StreamHandle
//! write ──> Stream ──────┼──> reader queue ──> ...
//!             │  ring    └──> RotationController ──> OutputStore
//!             │
//!        StreamTable <── StreamFs (paths, stat, readdir, README)
//! ```
//!
//! ## Key Features
//!
//! - **Non-blocking fan-out**: a full reader queue drops the chunk for that
//!   reader only and counts it
//! - **History replay**: new readers get up to a ring's worth of recent chunks
//! - **Rotation**: size and interval triggers, pattern-named output files
//! - **Windowed handles**: file-like reads over a live stream with a bounded
//!   memory window

pub mod clock;
pub mod config;
pub mod dst;
pub mod fs;
pub mod handle;
pub mod output_store;
pub mod reader;
pub mod ring;
pub mod rotation;
pub mod stream;
pub mod table;

pub use clock::{ProductionClock, SharedClock, SimulatedClock, StreamingClock, StreamingTimestamp};
pub use config::{
    format_size, parse_size, HandleSettings, RotationConfig, SizeValue, StreamFsConfig, StreamSettings,
    NOMINAL_CHUNK_SIZE,
};
pub use dst::{
    run_dst_batch, summarize_batch, StreamDstConfig, StreamDstHarness, StreamDstResult, StreamOperation,
    StreamWorkload,
};
pub use fs::{EntryKind, StreamFs, StreamInfo, StreamWriter, WriteOffset, README_PATH};
pub use handle::{HandleId, HandleRead, HandleTable, OpenMode, SharedHandle, StreamHandle};
pub use output_store::{
    InMemoryOutputStore, LocalFsOutputStore, OutputFile, OutputStat, OutputStore, SharedOutputStore,
};
pub use reader::{ReaderId, ReaderStats, StreamReader, TryChunk};
pub use ring::RingBuffer;
pub use rotation::{render_filename, RotationController, RotationStats};
pub use stream::{Stream, StreamStats};
pub use table::StreamTable;
