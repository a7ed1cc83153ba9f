//! Rotation Controller
//!
//! Persists a stream's bytes to a sequence of output files. A new file is
//! started when none is open, when the next write would push the current file
//! past the size threshold, or when the stream's rotation ticker fires.
//!
//! Output failures never reach the producer: they are logged and the live
//! stream keeps flowing. A failed open leaves no writer, so the next write
//! tries again.

use tracing::{error, info, warn};

use crate::error::OutputError;
use crate::streaming::clock::{SharedClock, StreamingTimestamp};
use crate::streaming::config::RotationConfig;
use crate::streaming::output_store::{OutputFile, SharedOutputStore};

/// Render a file name from a pattern.
///
/// Recognized variables: `{channel}`, `{timestamp}` (unix seconds), `{date}`
/// (`YYYYMMDD`), `{time}` (`HHMMSS`), `{datetime}` (`YYYYMMDD_HHMMSS`) and
/// `{index}` (six digits, zero padded). Anything else in braces is kept as is.
pub fn render_filename(pattern: &str, channel: &str, index: u64, now: StreamingTimestamp) -> String {
    let utc = now.to_utc();
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('}') else {
            rest = tail;
            break;
        };
        let token = &tail[..=close];
        match token {
            "{channel}" => out.push_str(channel),
            "{timestamp}" => out.push_str(&now.as_secs().to_string()),
            "{date}" => out.push_str(&utc.format("%Y%m%d").to_string()),
            "{time}" => out.push_str(&utc.format("%H%M%S").to_string()),
            "{datetime}" => out.push_str(&utc.format("%Y%m%d_%H%M%S").to_string()),
            "{index}" => out.push_str(&format!("{:06}", index)),
            _ => out.push_str(token),
        }
        rest = &tail[close + 1..];
    }
    // Either no braces remain or an unterminated '{' starts the tail.
    out.push_str(rest);
    out
}

fn join_path(dir: &str, file: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), file.trim_start_matches('/'))
}

/// Insert `_{suffix}` before the extension of the last path component.
fn with_suffix(path: &str, suffix: u64) -> String {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}_{}{}", &path[..dot], suffix, &path[dot..])
        }
        _ => format!("{}_{}", path, suffix),
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Point-in-time view of a controller, for stat output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationStats {
    pub current_file: Option<String>,
    pub current_file_size: u64,
    /// Number of files opened so far
    pub file_index: u64,
    pub threshold: Option<u64>,
    pub failed_writes: u64,
}

/// Writes a stream's chunks into rotating output files.
///
/// Not synchronized: the owning stream calls it under its lock.
pub struct RotationController {
    config: RotationConfig,
    channel: String,
    store: SharedOutputStore,
    clock: SharedClock,
    writer: Option<Box<dyn OutputFile>>,
    current_file_size: u64,
    current_file_path: Option<String>,
    file_index: u64,
    failed_writes: u64,
}

impl RotationController {
    pub fn new(config: RotationConfig, channel: impl Into<String>, store: SharedOutputStore, clock: SharedClock) -> Self {
        debug_assert!(
            config.output_path.starts_with('/'),
            "Precondition: output_path must be absolute"
        );
        RotationController {
            config,
            channel: channel.into(),
            store,
            clock,
            writer: None,
            current_file_size: 0,
            current_file_path: None,
            file_index: 0,
            failed_writes: 0,
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn stats(&self) -> RotationStats {
        RotationStats {
            current_file: self.current_file_path.clone(),
            current_file_size: self.current_file_size,
            file_index: self.file_index,
            threshold: self.config.size,
            failed_writes: self.failed_writes,
        }
    }

    /// Full output path the next rotation would open.
    pub fn next_file_path(&self) -> String {
        let name = render_filename(
            &self.config.filename_pattern,
            &self.channel,
            self.file_index,
            self.clock.now(),
        );
        join_path(&self.config.output_path, &name)
    }

    /// Close the current file (if any) and open the next one.
    pub fn rotate(&mut self) -> Result<(), OutputError> {
        self.close_writer();

        let path = self.unused_path(self.next_file_path());
        self.ensure_parent_dir(&path);

        if let Err(e) = self.store.create(&path) {
            error!("Error creating output file {}: {}", path, e);
            return Err(e);
        }
        let writer = match self.store.open_write(&path) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Error opening output file {} for write: {}", path, e);
                return Err(e);
            }
        };

        self.writer = Some(writer);
        self.current_file_size = 0;
        self.current_file_path = Some(path);
        self.file_index += 1;

        info!(
            "Rotated to new file: {} (index: {})",
            self.current_file_path.as_deref().unwrap_or_default(),
            self.file_index
        );
        Ok(())
    }

    /// Persist one chunk, rotating first when needed. Never fails.
    pub fn write(&mut self, data: &[u8]) {
        if let (Some(threshold), true) = (self.config.size, self.writer.is_some()) {
            let projected = self.current_file_size.saturating_add(data.len() as u64);
            if self.current_file_size > 0 && projected > threshold {
                info!(
                    "Size-based rotation triggered for {} (current: {}, threshold: {})",
                    self.channel, self.current_file_size, threshold
                );
                // A failed rotation leaves no writer; retried below.
                let _ = self.rotate();
            }
        }

        if self.writer.is_none() && self.rotate().is_err() {
            warn!(
                "No output file for {}, chunk of {} bytes kept live only",
                self.channel,
                data.len()
            );
            self.failed_writes += 1;
            return;
        }

        if let Some(writer) = self.writer.as_mut() {
            match writer.append(data) {
                Ok(_) => {
                    self.current_file_size = self.current_file_size.saturating_add(data.len() as u64);
                }
                Err(e) => {
                    self.failed_writes += 1;
                    error!("Error writing to output file: {}", e);
                }
            }
        }
    }

    /// Rotation requested by the ticker. Only rotates an active file.
    pub fn rotate_on_tick(&mut self) {
        if self.writer.is_none() {
            return;
        }
        info!("Time-based rotation triggered for {}", self.channel);
        let _ = self.rotate();
    }

    /// Close the current file. The next write opens a new one.
    pub fn close(&mut self) {
        self.close_writer();
    }

    fn close_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                error!("Error closing current file: {}", e);
            }
        }
        self.current_file_size = 0;
    }

    /// Never truncate an earlier file: a pattern with coarse time resolution
    /// renders the same name for rotations within one second.
    fn unused_path(&self, path: String) -> String {
        if self.store.stat(&path).is_err() {
            return path;
        }
        let mut suffix = self.file_index;
        loop {
            let candidate = with_suffix(&path, suffix);
            if self.store.stat(&candidate).is_err() {
                warn!("Output file {} already exists, writing to {}", path, candidate);
                return candidate;
            }
            suffix += 1;
        }
    }

    fn ensure_parent_dir(&self, path: &str) {
        let parent = parent_dir(path);
        if parent == "/" {
            return;
        }
        if self.store.stat(parent).is_err() {
            if let Err(e) = self.store.mkdir(parent) {
                warn!("Could not create parent directory {}: {}", parent, e);
            }
        }
    }
}

impl std::fmt::Debug for RotationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationController")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .field("current_file_path", &self.current_file_path)
            .field("current_file_size", &self.current_file_size)
            .field("file_index", &self.file_index)
            .finish()
    }
}
