//! Pipe stdin into a stream
//!
//! Mounts a streamfs instance, copies standard input into one stream chunk by
//! chunk, and prints the stream's stat as JSON on exit. With rotation
//! configured, the bytes land in rotated files under the output root.
//!
//! ```text
//! ffmpeg ... -f mpegts - | streamfs-pipe /camera1 mount.toml
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | STREAMFS_CONFIG | - | Mount options TOML (if no second argument) |
//! | STREAMFS_OUTPUT_ROOT | ./streamfs-data | Local directory backing `output_path` |
//! | STREAMFS_LOG_FORMAT | text | `text` or `json` |
//! | RUST_LOG | info | Log filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use futures::StreamExt;
use streamfs::streaming::{LocalFsOutputStore, SharedOutputStore, NOMINAL_CHUNK_SIZE};
use streamfs::{StreamFs, StreamFsConfig, WriteOffset};
use tokio::signal;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT_ROOT: &str = "./streamfs-data";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("STREAMFS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // stdout carries the final stat, logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(arg: Option<String>) -> Result<StreamFsConfig, Box<dyn std::error::Error>> {
    match arg.or_else(|| std::env::var("STREAMFS_CONFIG").ok()) {
        Some(path) => {
            info!("Loading mount options from {}", path);
            Ok(StreamFsConfig::from_file(&path)?)
        }
        None => Ok(StreamFsConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: streamfs-pipe <stream-path> [mount.toml]");
        std::process::exit(2);
    };
    let config = load_config(args.next())?;

    let output: Option<SharedOutputStore> = if config.output_path.is_some() {
        let root = std::env::var("STREAMFS_OUTPUT_ROOT").unwrap_or_else(|_| DEFAULT_OUTPUT_ROOT.to_string());
        info!("Rotated output rooted at {}", root);
        Some(Arc::new(LocalFsOutputStore::new(root)?))
    } else {
        None
    };

    let fs = StreamFs::from_config(&config, output)?;
    fs.create(&path)?;

    let mut stdin = FramedRead::with_capacity(tokio::io::stdin(), BytesCodec::new(), NOMINAL_CHUNK_SIZE as usize);
    let mut chunks = 0u64;
    loop {
        tokio::select! {
            frame = stdin.next() => match frame {
                Some(Ok(chunk)) => {
                    fs.write(&path, &chunk, WriteOffset::Append)?;
                    chunks += 1;
                }
                Some(Err(e)) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let info = fs.stat(&path)?;
    info!("Copied {} chunks ({} bytes) into {}", chunks, info.size, path);
    println!("{}", serde_json::to_string_pretty(&info)?);

    fs.shutdown();
    Ok(())
}
