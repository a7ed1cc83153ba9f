//! Stream Table
//!
//! Name -> stream map for one mount. Streams come into existence on first
//! write or first reader attach, or explicitly via `create`. The table lock
//! only guards membership; stream state has its own lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{StreamError, StreamResult};
use crate::streaming::clock::SharedClock;
use crate::streaming::config::StreamSettings;
use crate::streaming::output_store::SharedOutputStore;
use crate::streaming::stream::Stream;

pub struct StreamTable {
    streams: RwLock<BTreeMap<String, Arc<Stream>>>,
    settings: StreamSettings,
    output: Option<SharedOutputStore>,
    clock: SharedClock,
}

impl StreamTable {
    pub fn new(settings: StreamSettings, output: Option<SharedOutputStore>, clock: SharedClock) -> Self {
        StreamTable {
            streams: RwLock::new(BTreeMap::new()),
            settings,
            output,
            clock,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(name).cloned()
    }

    /// Existing stream, or a new one if the name is unknown.
    pub fn get_or_create(&self, name: &str) -> Arc<Stream> {
        if let Some(stream) = self.get(name) {
            return stream;
        }

        let mut streams = self.streams.write();
        // Another caller may have won the race between the two locks.
        if let Some(stream) = streams.get(name) {
            return Arc::clone(stream);
        }
        let stream = self.new_stream(name);
        streams.insert(name.to_string(), Arc::clone(&stream));
        info!("Auto-created stream {}", name);
        stream
    }

    /// Create a stream, failing if the name is taken.
    pub fn create(&self, name: &str) -> StreamResult<Arc<Stream>> {
        let mut streams = self.streams.write();
        if streams.contains_key(name) {
            return Err(StreamError::AlreadyExists {
                path: name.to_string(),
            });
        }
        let stream = self.new_stream(name);
        streams.insert(name.to_string(), Arc::clone(&stream));
        info!("Created stream {}", name);
        Ok(stream)
    }

    /// Close and forget a stream.
    pub fn remove(&self, name: &str) -> StreamResult<()> {
        let stream = self
            .streams
            .write()
            .remove(name)
            .ok_or_else(|| StreamError::NotFound {
                path: name.to_string(),
            })?;
        stream.close();
        info!("Removed stream {}", name);
        Ok(())
    }

    /// All streams, ordered by name.
    pub fn list(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Close every stream and empty the table.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.streams.write());
        let count = drained.len();
        for stream in drained.into_values() {
            stream.close();
        }
        if count > 0 {
            info!("Closed {} streams", count);
        }
    }

    fn new_stream(&self, name: &str) -> Arc<Stream> {
        Stream::new(name, &self.settings, self.output.clone(), Arc::clone(&self.clock))
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("streams", &self.streams.read().keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::clock::ProductionClock;

    fn table() -> StreamTable {
        StreamTable::new(StreamSettings::test(), None, ProductionClock::shared())
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let t = table();
        assert!(t.get("/a").is_none());

        let first = t.get_or_create("/a");
        let second = t.get_or_create("/a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_create_rejects_duplicate() {
        let t = table();
        t.create("/a").unwrap();
        assert!(matches!(t.create("/a"), Err(StreamError::AlreadyExists { .. })));
    }

    #[test]
    fn test_remove_closes() {
        let t = table();
        let stream = t.get_or_create("/a");
        t.remove("/a").unwrap();

        assert!(stream.is_closed());
        assert!(t.is_empty());
        assert!(matches!(t.remove("/a"), Err(StreamError::NotFound { .. })));
    }

    #[test]
    fn test_list_sorted_and_close_all() {
        let t = table();
        for name in ["/c", "/a", "/b"] {
            t.get_or_create(name);
        }
        let names: Vec<_> = t.list().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["/a", "/b", "/c"]);

        let kept = t.get("/a").unwrap();
        t.close_all();
        assert!(t.is_empty());
        assert!(kept.is_closed());
    }
}
