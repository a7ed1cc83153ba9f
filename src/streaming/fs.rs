//! Stream Filesystem
//!
//! The filesystem-shaped surface a host mounts: create, write, read, list,
//! stat and remove over a flat namespace of streams, plus stream-mode reads,
//! a `std::io::Write` adapter and offset-addressable handles.
//!
//! Paths are absolute and one level deep (`/video`). `/` is the only
//! directory and `/README` is a read-only documentation file.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ConfigError, StreamError, StreamResult};
use crate::streaming::clock::{ProductionClock, SharedClock};
use crate::streaming::config::{format_size, StreamFsConfig, StreamSettings};
use crate::streaming::handle::{HandleId, HandleTable, OpenMode, StreamHandle};
use crate::streaming::output_store::SharedOutputStore;
use crate::streaming::reader::StreamReader;
use crate::streaming::stream::{Stream, StreamStats};
use crate::streaming::table::StreamTable;

pub const README_PATH: &str = "/README";

const README: &str = r#"streamfs - live streaming files

Streams are append-only byte files with any number of concurrent writers and
readers. Every reader gets its own copy of the data (broadcast), and readers
that attach late are first sent the most recent history from a ring buffer.

BEHAVIOR
  - Writes are never blocked by readers. A reader whose queue is full misses
    chunks; the miss is counted in the stream's dropped_chunks.
  - A stream is created on its first write or first reader, or explicitly.
  - Reported size is the total number of bytes ever written, not memory use.
  - Plain reads of a stream fail: attach in stream mode or open a handle.
  - Removing a stream ends it for every attached reader.
  - Writes only append. An explicit offset must equal the current size.

MEMORY
  ring buffer + channel buffer x readers, per stream. With the defaults and
  three readers: 6MB + 3 x 6MB = 24MB.

CONFIGURATION
  channel_buffer_size   per-reader queue            default 6MB
  ring_buffer_size      history for late readers    default 6MB
  handle_window_size    handle sliding window       default 1MB
  handle_reread_margin  kept behind handle cursor   default 64KB
  handle_fetch_timeout  handle read wait            default 30s

  Sizes: plain bytes (524288) or units B, KB, MB, GB ("512KB", "1.5MB").
  Buffers are counted in 64KB chunks, at least one.

ROTATION
  Setting output_path persists every stream to rotating files there while it
  is served live. Output errors never interrupt the live stream.

  output_path        absolute destination directory, e.g. /s3fs/bucket
  rotation_interval  rotate every interval, e.g. "5m" (empty disables)
  rotation_size      rotate before a file would exceed this, e.g. "100MB"
  filename_pattern   default "{channel}_{timestamp}.dat"

  Pattern variables (times in UTC):
    {channel}   stream name            {timestamp} unix seconds
    {date}      YYYYMMDD               {time}      HHMMSS
    {datetime}  YYYYMMDD_HHMMSS        {index}     file index, 6 digits

  Example: "{date}/{channel}_{index}.ts" -> 20240305/cam1_000003.ts
  Missing parent directories are created when the output store allows it.
"#;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Stream,
    RotateStream,
    Doc,
    Dir,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Stream => "stream",
            EntryKind::RotateStream => "rotate-stream",
            EntryKind::Doc => "doc",
            EntryKind::Dir => "dir",
        }
    }
}

/// Stat / directory-listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Name without the leading slash
    pub name: String,
    /// For streams: total bytes ever written
    pub size: u64,
    pub mode: u32,
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
    pub kind: EntryKind,
    pub meta: BTreeMap<String, String>,
}

impl StreamInfo {
    pub(crate) fn from_stats(stats: &StreamStats) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("total_written".to_string(), stats.total_bytes_written.to_string());
        meta.insert("active_readers".to_string(), stats.active_readers.to_string());
        meta.insert("dropped_chunks".to_string(), stats.dropped_chunks.to_string());

        let kind = match &stats.rotation {
            Some(rotation) => {
                meta.insert("current_file_size".to_string(), rotation.current_file_size.to_string());
                meta.insert("rotation_file_idx".to_string(), rotation.file_index.to_string());
                meta.insert(
                    "current_file".to_string(),
                    rotation.current_file.clone().unwrap_or_default(),
                );
                meta.insert(
                    "rotation_threshold".to_string(),
                    rotation.threshold.map(format_size).unwrap_or_else(|| "none".to_string()),
                );
                EntryKind::RotateStream
            }
            None => EntryKind::Stream,
        };

        StreamInfo {
            name: stats.name.trim_start_matches('/').to_string(),
            size: stats.total_bytes_written,
            mode: 0o644,
            modified_at: stats.modified_at.to_utc(),
            is_dir: false,
            kind,
            meta,
        }
    }

    pub(crate) fn readme(now: DateTime<Utc>) -> Self {
        StreamInfo {
            name: "README".to_string(),
            size: README.len() as u64,
            mode: 0o444,
            modified_at: now,
            is_dir: false,
            kind: EntryKind::Doc,
            meta: BTreeMap::new(),
        }
    }

    fn root(now: DateTime<Utc>) -> Self {
        StreamInfo {
            name: "/".to_string(),
            size: 0,
            mode: 0o755,
            modified_at: now,
            is_dir: true,
            kind: EntryKind::Dir,
            meta: BTreeMap::new(),
        }
    }
}

/// Where a write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOffset {
    #[default]
    Append,
    /// Must equal the stream's current size
    At(u64),
}

/// What a path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Root,
    Readme,
    Stream(String),
}

fn resolve(path: &str) -> StreamResult<Target> {
    let invalid = |reason| StreamError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    let name = path.trim_end_matches('/');
    if name.is_empty() {
        return Ok(Target::Root);
    }
    if name == README_PATH {
        return Ok(Target::Readme);
    }
    let leaf = &name[1..];
    if leaf.contains('/') {
        return Err(invalid("nested paths are not supported"));
    }
    if leaf == "." || leaf == ".." {
        return Err(invalid("not a stream name"));
    }
    Ok(Target::Stream(name.to_string()))
}

/// Streaming filesystem for one mount.
#[derive(Debug, Clone)]
pub struct StreamFs {
    table: Arc<StreamTable>,
}

impl StreamFs {
    pub fn new(settings: StreamSettings, output: Option<SharedOutputStore>, clock: SharedClock) -> Self {
        info!(
            "Initialized streamfs: channel buffer {} chunks, ring {} chunks, rotation {}",
            settings.channel_buffer_chunks,
            settings.ring_buffer_chunks,
            if settings.rotation.is_some() { "on" } else { "off" }
        );
        StreamFs {
            table: Arc::new(StreamTable::new(settings, output, clock)),
        }
    }

    /// Validate mount options and build a filesystem on the system clock.
    pub fn from_config(config: &StreamFsConfig, output: Option<SharedOutputStore>) -> Result<Self, ConfigError> {
        let settings = config.validate()?;
        Ok(Self::new(settings, output, ProductionClock::shared()))
    }

    pub fn settings(&self) -> &StreamSettings {
        self.table.settings()
    }

    /// Documentation served at `/README`.
    pub fn readme() -> &'static str {
        README
    }

    /// Look up a stream without creating it.
    pub fn stream(&self, path: &str) -> StreamResult<Arc<Stream>> {
        match resolve(path)? {
            Target::Stream(name) => self.table.get(&name).ok_or(StreamError::NotFound { path: name }),
            _ => Err(StreamError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    pub fn create(&self, path: &str) -> StreamResult<()> {
        let name = self.stream_name(path)?;
        self.table.create(&name).map(|_| ())
    }

    /// Append to a stream, creating it if needed. Returns bytes accepted.
    pub fn write(&self, path: &str, data: &[u8], offset: WriteOffset) -> StreamResult<usize> {
        let name = self.stream_name(path)?;
        let stream = self.table.get_or_create(&name);
        match offset {
            WriteOffset::Append => stream.write(data),
            WriteOffset::At(at) => stream.write_at(data, at),
        }
    }

    /// Plain read. Only the README supports it; streams need stream mode.
    pub fn read(&self, path: &str, offset: u64, size: Option<usize>) -> StreamResult<Bytes> {
        match resolve(path)? {
            Target::Readme => Ok(range_read(README.as_bytes(), offset, size)),
            Target::Root => Err(StreamError::InvalidPath {
                path: path.to_string(),
                reason: "is a directory",
            }),
            Target::Stream(name) => Err(StreamError::StreamModeRequired { path: name }),
        }
    }

    /// List the root: README first, then streams by name.
    pub fn read_dir(&self, path: &str) -> StreamResult<Vec<StreamInfo>> {
        if resolve(path)? != Target::Root {
            return Err(StreamError::InvalidPath {
                path: path.to_string(),
                reason: "not a directory",
            });
        }
        let now = self.table.clock().now().to_utc();
        let mut entries = vec![StreamInfo::readme(now)];
        entries.extend(self.table.list().iter().map(|s| StreamInfo::from_stats(&s.stats())));
        Ok(entries)
    }

    pub fn stat(&self, path: &str) -> StreamResult<StreamInfo> {
        let now = self.table.clock().now().to_utc();
        match resolve(path)? {
            Target::Root => Ok(StreamInfo::root(now)),
            Target::Readme => Ok(StreamInfo::readme(now)),
            Target::Stream(name) => self
                .table
                .get(&name)
                .map(|s| StreamInfo::from_stats(&s.stats()))
                .ok_or(StreamError::NotFound { path: name }),
        }
    }

    /// Close a stream and drop it from the namespace.
    pub fn remove(&self, path: &str) -> StreamResult<()> {
        let name = self.stream_name(path)?;
        self.table.remove(&name)
    }

    /// Attach a reader, creating the stream if needed.
    pub fn open_stream(&self, path: &str) -> StreamResult<StreamReader> {
        let name = self.stream_name(path)?;
        let reader = self.table.get_or_create(&name).register_reader()?;
        info!("Opened stream {} with reader {}", name, reader.id());
        Ok(reader)
    }

    /// Writer adapter for `std::io::copy` and friends.
    pub fn open_write(&self, path: &str) -> StreamResult<StreamWriter> {
        let name = self.stream_name(path)?;
        Ok(StreamWriter {
            table: Arc::clone(&self.table),
            path: name,
        })
    }

    /// Open an offset-addressable handle in `handles`.
    pub fn open_handle(&self, handles: &HandleTable, path: &str, mode: OpenMode) -> StreamResult<HandleId> {
        let target = resolve(path)?;
        let settings = self.table.settings().handle.clone();
        let (id, _) = match target {
            Target::Root => {
                return Err(StreamError::InvalidPath {
                    path: path.to_string(),
                    reason: "is a directory",
                })
            }
            Target::Readme => {
                if mode.can_write() {
                    return Err(StreamError::ReadOnly {
                        path: README_PATH.to_string(),
                    });
                }
                let info = StreamInfo::readme(self.table.clock().now().to_utc());
                handles.open(|id| {
                    debug!("Opened README handle {}", id);
                    Ok(StreamHandle::preloaded(id, README_PATH, Bytes::from_static(README.as_bytes()), info))
                })?
            }
            Target::Stream(name) => {
                let stream = self.table.get_or_create(&name);
                handles.open(|id| StreamHandle::for_stream(id, &name, mode, stream, settings))?
            }
        };
        Ok(id)
    }

    /// Close every stream. Attached readers reach end-of-stream.
    pub fn shutdown(&self) {
        self.table.close_all();
        info!("streamfs shut down");
    }

    fn stream_name(&self, path: &str) -> StreamResult<String> {
        match resolve(path)? {
            Target::Stream(name) => Ok(name),
            Target::Readme => Err(StreamError::ReadOnly {
                path: README_PATH.to_string(),
            }),
            Target::Root => Err(StreamError::InvalidPath {
                path: path.to_string(),
                reason: "is a directory",
            }),
        }
    }
}

fn range_read(content: &[u8], offset: u64, size: Option<usize>) -> Bytes {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
    let end = match size {
        Some(size) => start.saturating_add(size).min(content.len()),
        None => content.len(),
    };
    Bytes::copy_from_slice(&content[start..end])
}

/// `std::io::Write` adapter appending to a stream.
///
/// Each `write` call becomes one chunk. The stream is looked up per write,
/// so a removed stream is transparently recreated.
#[derive(Debug)]
pub struct StreamWriter {
    table: Arc<StreamTable>,
    path: String,
}

impl StreamWriter {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl io::Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.table.get_or_create(&self.path).write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
