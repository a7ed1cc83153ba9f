//! End-to-end stream scenarios through the filesystem surface.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use streamfs::streaming::{EntryKind, HandleSettings, ReaderId, SimulatedClock, TryChunk};
use streamfs::{HandleTable, OpenMode, StreamError, StreamFs, StreamSettings, WriteOffset};

const SHORT: Duration = Duration::from_millis(50);

fn mount(settings: StreamSettings) -> StreamFs {
    StreamFs::new(settings, None, Arc::new(SimulatedClock::new(1_700_000_000_000)))
}

// =============================================================================
// Live fan-out
// =============================================================================

#[tokio::test]
async fn test_reader_sees_writes_in_order_then_times_out() {
    let fs = mount(StreamSettings::test());
    let mut reader = fs.open_stream("/live").unwrap();

    for chunk in [&b"a"[..], b"b", b"c"] {
        fs.write("/live", chunk, WriteOffset::Append).unwrap();
    }

    for expected in [&b"a"[..], b"b", b"c"] {
        let chunk = reader.read_chunk(SHORT).await.unwrap().unwrap();
        assert_eq!(&chunk[..], expected);
    }
    assert!(matches!(reader.read_chunk(SHORT).await, Err(StreamError::Timeout { .. })));
}

#[tokio::test]
async fn test_late_reader_gets_ring_history() {
    let fs = mount(StreamSettings::test().with_buffers(16, 2));
    for chunk in [&b"1"[..], b"2", b"3"] {
        fs.write("/hist", chunk, WriteOffset::Append).unwrap();
    }

    let mut reader = fs.open_stream("/hist").unwrap();
    assert_eq!(&reader.read_chunk(SHORT).await.unwrap().unwrap()[..], b"2");
    assert_eq!(&reader.read_chunk(SHORT).await.unwrap().unwrap()[..], b"3");
    assert!(matches!(reader.try_read_chunk(), TryChunk::Empty));
}

#[test]
fn test_slow_reader_drops_without_blocking_writer() {
    let fs = mount(StreamSettings::test().with_buffers(2, 2));
    let mut slow = fs.open_stream("/burst").unwrap();

    for i in 0..10u8 {
        assert_eq!(fs.write("/burst", &[i], WriteOffset::Append).unwrap(), 1);
    }

    assert_eq!(slow.dropped_count(), 8);
    let info = fs.stat("/burst").unwrap();
    assert_eq!(info.size, 10);
    assert_eq!(info.meta["dropped_chunks"], "8");

    // The two that fit are the first two written
    assert!(matches!(slow.try_read_chunk(), TryChunk::Data(c) if c[..] == [0]));
    assert!(matches!(slow.try_read_chunk(), TryChunk::Data(c) if c[..] == [1]));
}

#[tokio::test]
async fn test_remove_ends_every_reader() {
    let fs = mount(StreamSettings::test());
    let mut readers: Vec<_> = (0..3).map(|_| fs.open_stream("/gone").unwrap()).collect();
    fs.write("/gone", b"last", WriteOffset::Append).unwrap();

    fs.remove("/gone").unwrap();

    for reader in &mut readers {
        // Queued data is still delivered before end-of-stream
        assert_eq!(&reader.read_chunk(SHORT).await.unwrap().unwrap()[..], b"last");
        assert!(reader.read_chunk(SHORT).await.unwrap().is_none());
    }
    assert!(matches!(fs.stat("/gone"), Err(StreamError::NotFound { .. })));
}

#[test]
fn test_reader_close_is_idempotent() {
    let fs = mount(StreamSettings::test());
    let mut reader = fs.open_stream("/once").unwrap();
    let mut other = fs.open_stream("/once").unwrap();
    assert_eq!(fs.stat("/once").unwrap().meta["active_readers"], "2");

    reader.close();
    reader.close();
    assert_eq!(fs.stat("/once").unwrap().meta["active_readers"], "1");

    let stream = fs.stream("/once").unwrap();
    assert!(!stream.unregister_reader(reader.id()));
    assert!(!stream.unregister_reader(ReaderId(u64::MAX)));
    assert_eq!(fs.stat("/once").unwrap().meta["active_readers"], "1");

    fs.write("/once", b"still here", WriteOffset::Append).unwrap();
    assert!(matches!(other.try_read_chunk(), TryChunk::Data(c) if c[..] == b"still here"[..]));
}

#[tokio::test]
async fn test_concurrent_writers_keep_reader_order_per_writer() {
    let fs = mount(StreamSettings::test().with_buffers(4096, 16));
    let mut reader = fs.open_stream("/multi").unwrap();

    let mut tasks = Vec::new();
    for writer in 0..4u8 {
        let fs = fs.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for seq in 0..200u8 {
                fs.write("/multi", &[writer, seq], WriteOffset::Append).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut last = [None::<u8>; 4];
    let mut seen = 0;
    while let TryChunk::Data(chunk) = reader.try_read_chunk() {
        let (writer, seq) = (chunk[0] as usize, chunk[1]);
        if let Some(prev) = last[writer] {
            assert!(seq > prev, "writer {} went {} -> {}", writer, prev, seq);
        }
        last[writer] = Some(seq);
        seen += 1;
    }
    assert_eq!(seen, 800);
    assert_eq!(fs.stat("/multi").unwrap().size, 1600);
}

// =============================================================================
// Namespace
// =============================================================================

#[test]
fn test_readdir_and_readme() {
    let fs = mount(StreamSettings::test());
    fs.write("/b", b"x", WriteOffset::Append).unwrap();
    fs.create("/a").unwrap();

    let entries = fs.read_dir("/").unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["README", "a", "b"]);
    assert_eq!(entries[0].kind, EntryKind::Doc);
    assert_eq!(entries[1].kind, EntryKind::Stream);

    let readme = fs.read("/README", 0, None).unwrap();
    assert_eq!(&readme[..], StreamFs::readme().as_bytes());
    assert!(matches!(
        fs.read("/b", 0, None),
        Err(StreamError::StreamModeRequired { .. })
    ));
    assert!(matches!(
        fs.write("/README", b"no", WriteOffset::Append),
        Err(StreamError::ReadOnly { .. })
    ));
}

#[test]
fn test_positional_write_must_append() {
    let fs = mount(StreamSettings::test());
    fs.write("/pos", b"abc", WriteOffset::At(0)).unwrap();
    fs.write("/pos", b"def", WriteOffset::At(3)).unwrap();

    let err = fs.write("/pos", b"x", WriteOffset::At(1)).unwrap_err();
    assert!(matches!(err, StreamError::NonAppendWrite { offset: 1, append_at: 6 }));
    assert_eq!(fs.stat("/pos").unwrap().size, 6);
}

#[test]
fn test_io_write_adapter() {
    use std::io::Write;

    let fs = mount(StreamSettings::test());
    let mut reader = fs.open_stream("/copy").unwrap();
    let mut writer = fs.open_write("/copy").unwrap();

    std::io::copy(&mut &b"piped bytes"[..], &mut writer).unwrap();
    writer.flush().unwrap();

    let mut got = Vec::new();
    while let TryChunk::Data(chunk) = reader.try_read_chunk() {
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"piped bytes");
}

// =============================================================================
// Handles
// =============================================================================

#[tokio::test]
async fn test_handle_window_trims_behind_cursor() {
    let settings = StreamSettings::test().with_handle(HandleSettings {
        window_size: 100,
        reread_margin: 10,
        fetch_timeout: SHORT,
    });
    let fs = mount(settings);
    let handles = HandleTable::new();

    let id = fs.open_handle(&handles, "/win", OpenMode::ReadOnly).unwrap();
    for _ in 0..3 {
        fs.write("/win", &[7u8; 50], WriteOffset::Append).unwrap();
    }

    let handle = handles.get(id).unwrap();
    let mut handle = handle.lock().await;
    let mut buf = [0u8; 120];
    let read = handle.read(&mut buf).await.unwrap();
    assert_eq!(read.bytes, 120);
    assert!(!read.end_of_stream);

    assert_eq!(handle.read_base(), 110);
    assert_eq!(handle.buffered_len(), 40);

    // Within the margin is still readable, past it is gone
    let mut small = [0u8; 5];
    assert_eq!(handle.read_at(&mut small, 112).await.unwrap().bytes, 5);
    assert!(matches!(
        handle.read_at(&mut small, 50).await,
        Err(StreamError::OffsetTrimmed { offset: 50, base: 110 })
    ));
    assert!(matches!(handle.seek(SeekFrom::Start(0)), Err(StreamError::InvalidSeek { .. })));
    assert_eq!(handle.seek(SeekFrom::Start(115)).unwrap(), 115);
}

#[tokio::test]
async fn test_handle_sees_eof_after_remove() {
    let fs = mount(StreamSettings::test());
    let handles = HandleTable::new();
    let id = fs.open_handle(&handles, "/eof", OpenMode::ReadOnly).unwrap();
    fs.write("/eof", b"tail", WriteOffset::Append).unwrap();
    fs.remove("/eof").unwrap();

    let handle = handles.get(id).unwrap();
    let mut handle = handle.lock().await;
    let mut buf = [0u8; 16];
    let read = handle.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..read.bytes], b"tail");
    assert!(read.end_of_stream);

    let read = handle.read(&mut buf).await.unwrap();
    assert_eq!(read.bytes, 0);
    assert!(read.end_of_stream);
}

#[tokio::test]
async fn test_write_handle_and_readme_handle() {
    let fs = mount(StreamSettings::test());
    let handles = HandleTable::new();

    let writer = fs.open_handle(&handles, "/wh", OpenMode::WriteOnly).unwrap();
    let writer_handle = handles.get(writer).unwrap();
    writer_handle.lock().await.write(b"via handle").unwrap();
    assert_eq!(fs.stat("/wh").unwrap().size, 10);
    assert_eq!(fs.stat("/wh").unwrap().meta["active_readers"], "0");

    assert!(matches!(
        fs.open_handle(&handles, "/README", OpenMode::ReadWrite),
        Err(StreamError::ReadOnly { .. })
    ));
    let readme = fs.open_handle(&handles, "/README", OpenMode::ReadOnly).unwrap();
    let readme_handle = handles.get(readme).unwrap();
    let mut buf = vec![0u8; StreamFs::readme().len() + 10];
    let read = readme_handle.lock().await.read(&mut buf).await.unwrap();
    assert_eq!(read.bytes, StreamFs::readme().len());
    assert!(read.end_of_stream);

    handles.close(writer).unwrap();
    assert!(matches!(handles.close(writer), Err(StreamError::HandleNotFound { .. })));
    assert_eq!(handles.len(), 1);
}
