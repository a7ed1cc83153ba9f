//! Read Handles
//!
//! Offset-addressable view over a stream for hosts that issue `read(offset,
//! len)` calls rather than consuming a queue. A handle owns a reader and
//! accumulates what it receives into a sliding window:
//!
//! ```text
//!   read_base            read_offset                 read_base + len
//!       |<---- margin ---->|                               |
//!       [==================|===============================]
//! ```
//!
//! Once the window grows past `window_size`, everything more than
//! `reread_margin` behind the cursor is discarded. Offsets before
//! `read_base` are gone for good.
//!
//! Handles live in a `HandleTable` owned by the caller's session; there is no
//! process-wide registry.

use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{StreamError, StreamResult};
use crate::streaming::config::HandleSettings;
use crate::streaming::fs::StreamInfo;
use crate::streaming::reader::{ReaderId, StreamReader, TryChunk};
use crate::streaming::stream::Stream;

/// Identifier of an open handle, unique within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access mode requested at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadOnly,
    /// Does not attach a reader
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn can_read(&self) -> bool {
        !matches!(self, OpenMode::WriteOnly)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Outcome of a handle read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRead {
    /// Bytes copied into the caller's buffer
    pub bytes: usize,
    /// No more data will ever be available past this read
    pub end_of_stream: bool,
}

impl HandleRead {
    fn data(bytes: usize) -> Self {
        HandleRead {
            bytes,
            end_of_stream: false,
        }
    }

    fn eof() -> Self {
        HandleRead {
            bytes: 0,
            end_of_stream: true,
        }
    }
}

/// Stateful, offset-addressable view over one stream.
pub struct StreamHandle {
    id: HandleId,
    path: String,
    mode: OpenMode,
    stream: Option<Arc<Stream>>,
    reader: Option<StreamReader>,
    static_info: Option<StreamInfo>,
    settings: HandleSettings,
    read_buffer: Vec<u8>,
    read_base: u64,
    read_offset: u64,
    read_closed: bool,
}

impl StreamHandle {
    /// Handle over a live stream. Readable modes attach a reader.
    pub fn for_stream(
        id: HandleId,
        path: &str,
        mode: OpenMode,
        stream: Arc<Stream>,
        settings: HandleSettings,
    ) -> StreamResult<Self> {
        let reader = if mode.can_read() {
            let reader = stream.register_reader()?;
            info!("Opened read handle {} for {} (reader: {})", id, path, reader.id());
            Some(reader)
        } else {
            info!("Opened write handle {} for {}", id, path);
            None
        };

        Ok(StreamHandle {
            id,
            path: path.to_string(),
            mode,
            stream: Some(stream),
            reader,
            static_info: None,
            settings,
            read_buffer: Vec::new(),
            read_base: 0,
            read_offset: 0,
            read_closed: !mode.can_read(),
        })
    }

    /// Read-only handle over fixed content, already at end-of-stream.
    pub fn preloaded(id: HandleId, path: &str, content: Bytes, info: StreamInfo) -> Self {
        StreamHandle {
            id,
            path: path.to_string(),
            mode: OpenMode::ReadOnly,
            stream: None,
            reader: None,
            static_info: Some(info),
            settings: HandleSettings::default(),
            read_buffer: content.to_vec(),
            read_base: 0,
            read_offset: 0,
            read_closed: true,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Oldest offset still addressable.
    pub fn read_base(&self) -> u64 {
        self.read_base
    }

    /// Current cursor.
    pub fn position(&self) -> u64 {
        self.read_offset
    }

    /// One past the newest buffered byte.
    pub fn window_end(&self) -> u64 {
        self.read_base + self.read_buffer.len() as u64
    }

    pub fn buffered_len(&self) -> usize {
        self.read_buffer.len()
    }

    fn reader_id(&self) -> Option<ReaderId> {
        self.reader.as_ref().map(|r| r.id())
    }

    /// Read at the cursor and advance it.
    pub async fn read(&mut self, buf: &mut [u8]) -> StreamResult<HandleRead> {
        if buf.is_empty() {
            return Ok(HandleRead::data(0));
        }
        self.drain_available_data();

        if let Some(read) = self.copy_at(self.read_offset, buf) {
            self.read_offset += read.bytes as u64;
            self.trim_buffer();
            return Ok(read);
        }
        if self.read_closed {
            return Ok(HandleRead::eof());
        }

        self.fetch_more_data().await?;

        if let Some(read) = self.copy_at(self.read_offset, buf) {
            self.read_offset += read.bytes as u64;
            self.trim_buffer();
            return Ok(read);
        }
        Ok(HandleRead {
            bytes: 0,
            end_of_stream: self.read_closed,
        })
    }

    /// Read at an absolute offset. Moves the cursor forward to the end of
    /// what was returned, never backwards.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> StreamResult<HandleRead> {
        self.drain_available_data();

        if offset < self.read_base {
            return Err(StreamError::OffsetTrimmed {
                offset,
                base: self.read_base,
            });
        }
        if buf.is_empty() {
            return Ok(HandleRead::data(0));
        }
        if let Some(read) = self.copy_at(offset, buf) {
            self.advance_to(offset + read.bytes as u64);
            return Ok(read);
        }
        if self.read_closed {
            return Ok(HandleRead::eof());
        }

        self.fetch_more_data().await?;

        if let Some(read) = self.copy_at(offset, buf) {
            self.advance_to(offset + read.bytes as u64);
            return Ok(read);
        }
        // Poll-based callers retry on an empty, non-final read.
        Ok(HandleRead {
            bytes: 0,
            end_of_stream: self.read_closed,
        })
    }

    /// Move the cursor within the buffered window.
    pub fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(delta) => self.read_offset as i128 + delta as i128,
            SeekFrom::End(delta) => self.window_end() as i128 + delta as i128,
        };
        if target < self.read_base as i128 || target > self.window_end() as i128 {
            return Err(StreamError::InvalidSeek {
                target,
                base: self.read_base,
                end: self.window_end(),
            });
        }
        self.read_offset = target as u64;
        Ok(self.read_offset)
    }

    /// Append to the underlying stream.
    pub fn write(&mut self, data: &[u8]) -> StreamResult<usize> {
        self.writable_stream()?.write(data)
    }

    /// Append at `offset`, which must be the stream's current size.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> StreamResult<usize> {
        self.writable_stream()?.write_at(data, offset)
    }

    pub fn stat(&self) -> StreamResult<StreamInfo> {
        match (&self.static_info, &self.stream) {
            (Some(info), _) => Ok(info.clone()),
            (None, Some(stream)) if !stream.is_closed() => Ok(StreamInfo::from_stats(&stream.stats())),
            _ => Err(StreamError::NotFound {
                path: self.path.clone(),
            }),
        }
    }

    /// Detach the reader. Buffered data stays readable. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
            info!("Handle {} closed, unregistered reader {}", self.id, reader.id());
        }
        self.drain_available_data();
        self.read_closed = true;
    }

    fn writable_stream(&self) -> StreamResult<&Arc<Stream>> {
        match &self.stream {
            Some(stream) if self.mode.can_write() => Ok(stream),
            _ => Err(StreamError::NotWritable { id: self.id.0 }),
        }
    }

    /// Copy buffered bytes starting at `offset`, if any are buffered there.
    fn copy_at(&self, offset: u64, buf: &mut [u8]) -> Option<HandleRead> {
        if offset < self.read_base || offset >= self.window_end() {
            return None;
        }
        let start = (offset - self.read_base) as usize;
        let available = &self.read_buffer[start..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);

        let reached_end = start + n >= self.read_buffer.len();
        Some(HandleRead {
            bytes: n,
            end_of_stream: self.read_closed && reached_end,
        })
    }

    fn advance_to(&mut self, offset: u64) {
        if offset > self.read_offset {
            self.read_offset = offset;
        }
        self.trim_buffer();
    }

    /// Pull everything already queued without waiting.
    fn drain_available_data(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        loop {
            match reader.try_read_chunk() {
                TryChunk::Data(chunk) => self.read_buffer.extend_from_slice(&chunk),
                TryChunk::Empty => return,
                TryChunk::EndOfStream => {
                    self.read_closed = true;
                    return;
                }
            }
        }
    }

    /// Wait up to the fetch timeout for one more chunk. A timeout is not an
    /// error; it just adds nothing.
    async fn fetch_more_data(&mut self) -> StreamResult<()> {
        let Some(reader) = self.reader.as_mut() else {
            self.read_closed = true;
            return Ok(());
        };
        match reader.read_chunk(self.settings.fetch_timeout).await {
            Ok(Some(chunk)) => self.read_buffer.extend_from_slice(&chunk),
            Ok(None) => self.read_closed = true,
            Err(e) if e.is_retryable() => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Bound memory: past the window size, drop what lies more than the
    /// re-read margin behind the cursor.
    fn trim_buffer(&mut self) {
        if self.read_buffer.len() <= self.settings.window_size {
            return;
        }
        let consumed = (self.read_offset - self.read_base) as usize;
        let trim_point = consumed.saturating_sub(self.settings.reread_margin);
        if trim_point == 0 {
            return;
        }

        self.read_buffer.drain(..trim_point);
        self.read_base += trim_point as u64;

        debug_assert!(
            self.read_base <= self.read_offset && self.read_offset <= self.window_end(),
            "Invariant: cursor stays inside the window"
        );
        debug!(
            "Trimmed handle {} buffer: new base={}, new size={}",
            self.id,
            self.read_base,
            self.read_buffer.len()
        );
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("read_base", &self.read_base)
            .field("read_offset", &self.read_offset)
            .field("buffered", &self.read_buffer.len())
            .field("read_closed", &self.read_closed)
            .finish()
    }
}

// ============================================================================
// HandleTable
// ============================================================================

/// Handle shared between the table and in-flight operations.
pub type SharedHandle = Arc<tokio::sync::Mutex<StreamHandle>>;

struct HandleEntry {
    handle: SharedHandle,
    stream: Option<Arc<Stream>>,
    reader: Option<ReaderId>,
}

impl HandleEntry {
    /// Detach the reader without waiting for the handle lock, so a read
    /// blocked in a fetch wakes up with end-of-stream.
    fn release(&self) {
        if let (Some(stream), Some(reader)) = (&self.stream, self.reader) {
            stream.unregister_reader(reader);
        }
    }
}

/// Session-scoped registry of open handles.
pub struct HandleTable {
    handles: Mutex<HashMap<HandleId, HandleEntry>>,
    next_id: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id, build the handle with it and register the result.
    pub fn open<F>(&self, build: F) -> StreamResult<(HandleId, SharedHandle)>
    where
        F: FnOnce(HandleId) -> StreamResult<StreamHandle>,
    {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = build(id)?;
        debug_assert_eq!(handle.id(), id, "Postcondition: handle carries its table id");

        let entry = HandleEntry {
            stream: handle.stream.clone(),
            reader: handle.reader_id(),
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
        };
        let shared = Arc::clone(&entry.handle);
        self.handles.lock().insert(id, entry);
        Ok((id, shared))
    }

    pub fn get(&self, id: HandleId) -> StreamResult<SharedHandle> {
        self.handles
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or(StreamError::HandleNotFound { id: id.0 })
    }

    /// Forget a handle and detach its reader.
    pub fn close(&self, id: HandleId) -> StreamResult<()> {
        let entry = self
            .handles
            .lock()
            .remove(&id)
            .ok_or(StreamError::HandleNotFound { id: id.0 })?;
        entry.release();
        info!("Closed handle {}", id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Close every handle, e.g. when the owning session ends.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.handles.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.release();
        }
        if !drained.is_empty() {
            info!("Closed {} handles", drained.len());
        }
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable").field("open", &self.len()).finish()
    }
}
