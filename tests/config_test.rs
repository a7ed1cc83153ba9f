//! Mount options end to end: files, JSON maps, and the buffer sizes they
//! produce on a live mount.

use std::io::Write;
use std::time::Duration;

use serde_json::json;
use streamfs::streaming::TryChunk;
use streamfs::{ConfigError, StreamFs, StreamFsConfig, WriteOffset};

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        channel_buffer_size = "512KB"
        ring_buffer_size = "1MB"
        rotation_interval = "5m"
        output_path = "/localfs/data"
        handle_fetch_timeout = "250ms"
        mount_path = "/streams"
        "#
    )
    .unwrap();

    let settings = StreamFsConfig::from_file(file.path()).unwrap().validate().unwrap();
    assert_eq!(settings.channel_buffer_chunks, 8);
    assert_eq!(settings.ring_buffer_chunks, 16);
    assert_eq!(settings.handle.fetch_timeout, Duration::from_millis(250));

    let rotation = settings.rotation.unwrap();
    assert_eq!(rotation.interval, Some(Duration::from_secs(300)));
    assert_eq!(rotation.size, None);
    assert_eq!(rotation.output_path, "/localfs/data");
    assert_eq!(rotation.filename_pattern, "{channel}_{timestamp}.dat");
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = StreamFsConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_config_from_json_map() {
    let config = StreamFsConfig::from_json_value(json!({
        "channel_buffer_size": 131072,
        "ring_buffer_size": 65536.0,
        "rotation_size": "1.5MB",
        "output_path": "/s3fs/bucket",
    }))
    .unwrap();
    let settings = config.validate().unwrap();

    assert_eq!(settings.channel_buffer_chunks, 2);
    assert_eq!(settings.ring_buffer_chunks, 1);
    assert_eq!(settings.rotation.unwrap().size, Some(1024 * 1024 * 3 / 2));

    let err = StreamFsConfig::from_json_value(json!({ "buffer": "1MB" })).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownKey(key) if key == "buffer"));
}

#[test]
fn test_relative_output_path_rejected() {
    let config = StreamFsConfig::from_toml_str(r#"output_path = "data/out""#).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidOutputPath(_)));
    assert!(err.to_string().contains("must start with /"));
}

#[test]
fn test_mount_uses_configured_buffers() {
    let config = StreamFsConfig::from_toml_str(
        r#"
        channel_buffer_size = "128KB"
        ring_buffer_size = "64KB"
        "#,
    )
    .unwrap();
    let fs = StreamFs::from_config(&config, None).unwrap();

    fs.write("/cfg", b"old", WriteOffset::Append).unwrap();
    fs.write("/cfg", b"newest", WriteOffset::Append).unwrap();

    // Ring of one chunk: a late reader replays only the newest
    let mut reader = fs.open_stream("/cfg").unwrap();
    assert!(matches!(reader.try_read_chunk(), TryChunk::Data(c) if c[..] == b"newest"[..]));

    // Queue of two chunks
    for i in 0..5u8 {
        fs.write("/cfg", &[i], WriteOffset::Append).unwrap();
    }
    assert_eq!(reader.dropped_count(), 3);
    fs.shutdown();
}
