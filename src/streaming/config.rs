//! Mount Options and Stream Settings
//!
//! `StreamFsConfig` is what the host hands over: loosely typed mount options
//! where sizes may be integers, floats or strings like `"512KB"`, and
//! durations are strings like `"5m"`. `StreamFsConfig::validate` normalizes
//! them once into `StreamSettings`; nothing downstream re-parses.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Nominal chunk size used to convert byte budgets into chunk counts.
pub const NOMINAL_CHUNK_SIZE: u64 = 64 * 1024;

/// Default per-reader queue and history budget (6MB each).
pub const DEFAULT_BUFFER_BYTES: u64 = 6 * 1024 * 1024;

pub const DEFAULT_FILENAME_PATTERN: &str = "{channel}_{timestamp}.dat";

/// Every key accepted in the mount options.
pub const KNOWN_KEYS: &[&str] = &[
    "channel_buffer_size",
    "ring_buffer_size",
    "rotation_interval",
    "rotation_size",
    "output_path",
    "filename_pattern",
    "handle_window_size",
    "handle_reread_margin",
    "handle_fetch_timeout",
    "mount_path",
];

// ============================================================================
// Raw mount options
// ============================================================================

/// A size as written in the mount options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Float(f64),
    Text(String),
}

impl SizeValue {
    /// Resolve to bytes. `key` names the option in errors.
    pub fn to_bytes(&self, key: &'static str) -> Result<u64, ConfigError> {
        let invalid = |value: String| ConfigError::InvalidSize { key, value };
        match self {
            SizeValue::Bytes(n) => Ok(*n),
            SizeValue::Float(f) if f.is_finite() && *f >= 0.0 => Ok(*f as u64),
            SizeValue::Float(f) => Err(invalid(f.to_string())),
            SizeValue::Text(s) => parse_size(s).ok_or_else(|| invalid(s.clone())),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, SizeValue::Text(s) if s.trim().is_empty())
    }
}

impl From<&str> for SizeValue {
    fn from(s: &str) -> Self {
        SizeValue::Text(s.to_string())
    }
}

impl From<u64> for SizeValue {
    fn from(n: u64) -> Self {
        SizeValue::Bytes(n)
    }
}

/// Mount options as supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamFsConfig {
    /// Per-reader queue budget (default 6MB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_buffer_size: Option<SizeValue>,
    /// History budget for late joiners (default 6MB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_buffer_size: Option<SizeValue>,
    /// Time-based rotation, e.g. "5m". Empty disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_interval: Option<String>,
    /// Size-based rotation, e.g. "100MB". Empty disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_size: Option<SizeValue>,
    /// Abstract destination directory for rotated files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_window_size: Option<SizeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_reread_margin: Option<SizeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_fetch_timeout: Option<String>,
    /// Host routing, accepted and ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

impl StreamFsConfig {
    /// Parse mount options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        check_known_keys(table.keys())?;
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Parse mount options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse mount options from a JSON object, as hosts that pass a generic
    /// key/value map do.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        if let serde_json::Value::Object(map) = &value {
            check_known_keys(map.keys())?;
        }
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Normalize into typed settings, rejecting anything malformed.
    pub fn validate(&self) -> Result<StreamSettings, ConfigError> {
        let defaults = StreamSettings::default();

        let channel_bytes = size_or(&self.channel_buffer_size, "channel_buffer_size", DEFAULT_BUFFER_BYTES)?;
        let ring_bytes = size_or(&self.ring_buffer_size, "ring_buffer_size", DEFAULT_BUFFER_BYTES)?;

        let handle = HandleSettings {
            window_size: size_or(
                &self.handle_window_size,
                "handle_window_size",
                defaults.handle.window_size as u64,
            )? as usize,
            reread_margin: size_or(
                &self.handle_reread_margin,
                "handle_reread_margin",
                defaults.handle.reread_margin as u64,
            )? as usize,
            fetch_timeout: match non_blank(&self.handle_fetch_timeout) {
                Some(s) => parse_duration("handle_fetch_timeout", s)?,
                None => defaults.handle.fetch_timeout,
            },
        };

        let interval = non_blank(&self.rotation_interval)
            .map(|s| parse_duration("rotation_interval", s))
            .transpose()?;
        let size = match &self.rotation_size {
            Some(v) if !v.is_blank() => Some(v.to_bytes("rotation_size")?).filter(|n| *n > 0),
            _ => None,
        };

        let rotation = match non_blank(&self.output_path) {
            Some(path) => {
                if !path.starts_with('/') {
                    return Err(ConfigError::InvalidOutputPath(path.to_string()));
                }
                Some(RotationConfig {
                    interval,
                    size,
                    output_path: path.to_string(),
                    filename_pattern: non_blank(&self.filename_pattern)
                        .unwrap_or(DEFAULT_FILENAME_PATTERN)
                        .to_string(),
                })
            }
            None if interval.is_some() || size.is_some() => {
                return Err(ConfigError::MissingOutputPath);
            }
            None => None,
        };

        Ok(StreamSettings {
            channel_buffer_chunks: bytes_to_chunks(channel_bytes),
            ring_buffer_chunks: bytes_to_chunks(ring_bytes),
            rotation,
            handle,
        })
    }
}

fn check_known_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Result<(), ConfigError> {
    for key in keys {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::UnknownKey(key.clone()));
        }
    }
    Ok(())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn size_or(value: &Option<SizeValue>, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(v) if !v.is_blank() => v.to_bytes(key),
        _ => Ok(default),
    }
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
        reason,
    };
    let duration = humantime::parse_duration(value).map_err(|e| invalid(e.to_string()))?;
    if duration.is_zero() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(duration)
}

/// Convert a byte budget to a chunk count, never below one.
pub fn bytes_to_chunks(bytes: u64) -> usize {
    (bytes / NOMINAL_CHUNK_SIZE).max(1) as usize
}

/// Parse sizes such as `"1024"`, `"512KB"`, `"1.5mb"`, `"2 GB"`.
///
/// Units are binary multiples and case-insensitive.
pub fn parse_size(text: &str) -> Option<u64> {
    let upper = text.trim().to_ascii_uppercase();
    if let Ok(n) = upper.parse::<u64>() {
        return Some(n);
    }

    // Longest suffix first so "MB" is not taken for "B".
    const UNITS: [(&str, u64); 4] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)];
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|n| (n.trim(), *mult)))?;
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Human-readable size: `512B`, `1.5KB`, `6.0MB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{}B", bytes);
    }
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < UNITS.len() - 1 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1}{}", bytes as f64 / div as f64, UNITS[exp])
}

// ============================================================================
// Validated settings
// ============================================================================

/// Validated, strongly typed settings shared by every stream of a mount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSettings {
    /// Per-reader queue capacity in chunks
    pub channel_buffer_chunks: usize,
    /// History ring capacity in chunks
    pub ring_buffer_chunks: usize,
    /// Present when streams persist to rotating output files
    pub rotation: Option<RotationConfig>,
    pub handle: HandleSettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            channel_buffer_chunks: bytes_to_chunks(DEFAULT_BUFFER_BYTES),
            ring_buffer_chunks: bytes_to_chunks(DEFAULT_BUFFER_BYTES),
            rotation: None,
            handle: HandleSettings::default(),
        }
    }
}

impl StreamSettings {
    /// Settings for tests (small buffers, short timeouts)
    pub fn test() -> Self {
        StreamSettings {
            channel_buffer_chunks: 16,
            ring_buffer_chunks: 16,
            rotation: None,
            handle: HandleSettings::test(),
        }
    }

    pub fn with_buffers(mut self, channel_chunks: usize, ring_chunks: usize) -> Self {
        self.channel_buffer_chunks = channel_chunks.max(1);
        self.ring_buffer_chunks = ring_chunks.max(1);
        self
    }

    pub fn with_rotation(mut self, rotation: RotationConfig) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_handle(mut self, handle: HandleSettings) -> Self {
        self.handle = handle;
        self
    }
}

/// Rotation triggers and output naming.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,
    /// Rotate before a write would push the current file past this many bytes
    pub size: Option<u64>,
    /// Absolute abstract directory for output files
    pub output_path: String,
    pub filename_pattern: String,
}

impl RotationConfig {
    /// Rotation into `output_path` with no triggers: one ever-growing file.
    pub fn new(output_path: impl Into<String>) -> Self {
        RotationConfig {
            interval: None,
            size: None,
            output_path: output_path.into(),
            filename_pattern: DEFAULT_FILENAME_PATTERN.to_string(),
        }
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size = Some(bytes);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = pattern.into();
        self
    }
}

/// Sliding-window settings for offset-addressable handles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandleSettings {
    /// Buffer size that triggers trimming (default 1MB)
    pub window_size: usize,
    /// Bytes kept behind the cursor when trimming (default 64KB)
    pub reread_margin: usize,
    /// How long a read waits for new data (default 30s)
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for HandleSettings {
    fn default() -> Self {
        HandleSettings {
            window_size: 1024 * 1024,
            reread_margin: 64 * 1024,
            // Below the 60s request timeout common upstream
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl HandleSettings {
    /// Settings for tests (tiny window, fast fetch timeout)
    pub fn test() -> Self {
        HandleSettings {
            window_size: 1024,
            reread_margin: 128,
            fetch_timeout: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_size("1.5mb"), Some(1024 * 1024 + 512 * 1024));
        assert_eq!(parse_size(" 2 GB "), Some(2 << 30));
        assert_eq!(parse_size("100B"), Some(100));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("-1KB"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(6 * 1024 * 1024), "6.0MB");
        assert_eq!(format_size(100 * 1024 * 1024), "100.0MB");
    }

    #[test]
    fn test_defaults() {
        let settings = StreamFsConfig::default().validate().unwrap();
        assert_eq!(settings, StreamSettings::default());
        assert_eq!(settings.channel_buffer_chunks, 96);
        assert_eq!(settings.ring_buffer_chunks, 96);
        assert!(settings.rotation.is_none());
        assert_eq!(settings.handle.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_small_buffers_clamp_to_one_chunk() {
        let config = StreamFsConfig {
            channel_buffer_size: Some(SizeValue::Bytes(100)),
            ring_buffer_size: Some(SizeValue::Float(10.0)),
            ..Default::default()
        };
        let settings = config.validate().unwrap();
        assert_eq!(settings.channel_buffer_chunks, 1);
        assert_eq!(settings.ring_buffer_chunks, 1);
    }

    #[test]
    fn test_from_toml() {
        let config = StreamFsConfig::from_toml_str(
            r#"
            channel_buffer_size = "512KB"
            ring_buffer_size = 1048576
            rotation_interval = "5m"
            rotation_size = "100MB"
            output_path = "/s3fs/bucket"
            filename_pattern = "{channel}_{datetime}_{index}.dat"
            mount_path = "/streams"
            "#,
        )
        .unwrap();

        let settings = config.validate().unwrap();
        assert_eq!(settings.channel_buffer_chunks, 8);
        assert_eq!(settings.ring_buffer_chunks, 16);
        let rotation = settings.rotation.unwrap();
        assert_eq!(rotation.interval, Some(Duration::from_secs(300)));
        assert_eq!(rotation.size, Some(100 * 1024 * 1024));
        assert_eq!(rotation.output_path, "/s3fs/bucket");
        assert_eq!(rotation.filename_pattern, "{channel}_{datetime}_{index}.dat");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = StreamFsConfig::from_toml_str("buffer = 1").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(ref k) if k == "buffer"));

        let err = StreamFsConfig::from_json_value(serde_json::json!({ "nope": true })).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn test_invalid_size_rejected() {
        let config = StreamFsConfig {
            ring_buffer_size: Some("huge".into()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSize { key: "ring_buffer_size", .. }));
    }

    #[test]
    fn test_rotation_requires_output_path() {
        let config = StreamFsConfig {
            rotation_size: Some("1MB".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingOutputPath)));

        let config = StreamFsConfig {
            rotation_interval: Some("1h".to_string()),
            output_path: Some("relative/dir".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOutputPath(_))));
    }

    #[test]
    fn test_empty_triggers_disable_rotation() {
        let config = StreamFsConfig::from_json_value(serde_json::json!({
            "rotation_interval": "",
            "rotation_size": "",
            "output_path": "/localfs/data",
        }))
        .unwrap();
        let rotation = config.validate().unwrap().rotation.unwrap();
        assert_eq!(rotation.interval, None);
        assert_eq!(rotation.size, None);
        assert_eq!(rotation.filename_pattern, DEFAULT_FILENAME_PATTERN);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let config = StreamFsConfig {
            rotation_interval: Some("soon".to_string()),
            output_path: Some("/out".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration { key: "rotation_interval", .. })
        ));

        let config = StreamFsConfig {
            handle_fetch_timeout: Some("0s".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_serialize() {
        let settings = StreamSettings::test().with_rotation(
            RotationConfig::new("/out").with_interval(Duration::from_secs(90)),
        );
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["rotation"]["interval"], "1m 30s");
        assert_eq!(json["handle"]["fetch_timeout"], "50ms");
    }
}
