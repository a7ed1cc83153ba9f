pub mod error;
pub mod streaming;

pub use error::{ConfigError, OutputError, StreamError, StreamResult};
pub use streaming::{
    HandleTable, OpenMode, RotationConfig, Stream, StreamFs, StreamFsConfig, StreamInfo, StreamReader,
    StreamSettings, WriteOffset,
};
