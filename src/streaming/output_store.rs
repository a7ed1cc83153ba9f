//! Output Storage Abstraction
//!
//! Rotating streams persist their bytes through an external "file create /
//! open for write / stat / mkdir" capability provided by the host. Paths are
//! abstract and absolute (`/s3fs/bucket/cam1_000001.dat`); how they map onto
//! real storage is up to the implementation.
//!
//! ## Implementations
//!
//! - `InMemoryOutputStore`: for unit tests, with fault toggles
//! - `LocalFsOutputStore`: abstract paths mapped under a local directory

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::OutputError;

/// Metadata returned by [`OutputStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStat {
    pub size: u64,
    pub is_dir: bool,
}

/// An output file opened for appending.
pub trait OutputFile: Send {
    /// Append data. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, OutputError>;
    /// Bytes written through this writer plus the size at open.
    fn size(&self) -> u64;
    /// Flush and release the file. Further appends fail.
    fn close(&mut self) -> Result<(), OutputError>;
}

/// Storage capability consumed by the rotation controller.
pub trait OutputStore: Send + Sync + 'static {
    /// Create an empty file, truncating any existing one.
    fn create(&self, path: &str) -> Result<(), OutputError>;
    /// Open an existing file for appending.
    fn open_write(&self, path: &str) -> Result<Box<dyn OutputFile>, OutputError>;
    fn stat(&self, path: &str) -> Result<OutputStat, OutputError>;
    fn mkdir(&self, path: &str) -> Result<(), OutputError>;
}

pub type SharedOutputStore = Arc<dyn OutputStore>;

// ============================================================================
// InMemoryOutputStore - For unit tests
// ============================================================================

#[derive(Debug, Default)]
struct InMemoryState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct FaultToggles {
    fail_create: AtomicBool,
    fail_append: AtomicBool,
    fail_mkdir: AtomicBool,
}

/// In-memory output store for tests
///
/// Clones share the same files, so a test can keep one clone for inspection
/// while the stream writes through another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutputStore {
    state: Arc<Mutex<InMemoryState>>,
    faults: Arc<FaultToggles>,
    creates: Arc<AtomicU64>,
}

impl InMemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.faults.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `append` fail, on existing writers too.
    pub fn set_fail_append(&self, fail: bool) {
        self.faults.fail_append.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mkdir(&self, fail: bool) {
        self.faults.fail_mkdir.store(fail, Ordering::SeqCst);
    }

    /// Contents of a file, if it exists.
    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    /// All file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    /// Successful `create` calls so far.
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }
}

/// Writer for [`InMemoryOutputStore`]
pub struct InMemoryOutputFile {
    path: String,
    state: Arc<Mutex<InMemoryState>>,
    faults: Arc<FaultToggles>,
    size: u64,
    closed: bool,
}

impl OutputFile for InMemoryOutputFile {
    fn append(&mut self, data: &[u8]) -> Result<u64, OutputError> {
        if self.closed {
            return Err(OutputError::WriterClosed(self.path.clone()));
        }
        if self.faults.fail_append.load(Ordering::SeqCst) {
            return Err(OutputError::Other(format!("injected append failure: {}", self.path)));
        }

        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(&self.path)
            .ok_or_else(|| OutputError::NotFound(self.path.clone()))?;
        file.extend_from_slice(data);
        self.size = file.len() as u64;

        debug_assert!(
            self.size >= data.len() as u64,
            "Postcondition: size must be at least data length"
        );
        Ok(self.size)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<(), OutputError> {
        self.closed = true;
        Ok(())
    }
}

impl OutputStore for InMemoryOutputStore {
    fn create(&self, path: &str) -> Result<(), OutputError> {
        debug_assert!(path.starts_with('/'), "Precondition: output paths are absolute");

        if self.faults.fail_create.load(Ordering::SeqCst) {
            return Err(OutputError::Other(format!("injected create failure: {}", path)));
        }
        self.state.lock().files.insert(path.to_string(), Vec::new());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn OutputFile>, OutputError> {
        let size = {
            let state = self.state.lock();
            state
                .files
                .get(path)
                .map(|f| f.len() as u64)
                .ok_or_else(|| OutputError::NotFound(path.to_string()))?
        };
        Ok(Box::new(InMemoryOutputFile {
            path: path.to_string(),
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            size,
            closed: false,
        }))
    }

    fn stat(&self, path: &str) -> Result<OutputStat, OutputError> {
        let state = self.state.lock();
        if path == "/" || state.dirs.contains(path) {
            return Ok(OutputStat { size: 0, is_dir: true });
        }
        state
            .files
            .get(path)
            .map(|f| OutputStat {
                size: f.len() as u64,
                is_dir: false,
            })
            .ok_or_else(|| OutputError::NotFound(path.to_string()))
    }

    fn mkdir(&self, path: &str) -> Result<(), OutputError> {
        if self.faults.fail_mkdir.load(Ordering::SeqCst) {
            return Err(OutputError::Other(format!("injected mkdir failure: {}", path)));
        }
        self.state.lock().dirs.insert(path.to_string());
        Ok(())
    }
}

// ============================================================================
// LocalFsOutputStore - Abstract paths under a local directory
// ============================================================================

/// Output store backed by the local filesystem
///
/// `/archive/cam1.dat` maps to `<root>/archive/cam1.dat`. Paths that try to
/// climb out of the root are rejected.
#[derive(Debug, Clone)]
pub struct LocalFsOutputStore {
    root: PathBuf,
}

impl LocalFsOutputStore {
    /// Create a store rooted at `root`. Creates the directory if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(LocalFsOutputStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an abstract path onto the local root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, OutputError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(OutputError::Other(format!(
                        "path escapes output root: {}",
                        path
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

/// Writer for [`LocalFsOutputStore`]
pub struct LocalOutputFile {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl OutputFile for LocalOutputFile {
    fn append(&mut self, data: &[u8]) -> Result<u64, OutputError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| OutputError::WriterClosed(self.path.display().to_string()))?;
        file.write_all(data)?;
        self.size = self.size.saturating_add(data.len() as u64);
        Ok(self.size)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn close(&mut self) -> Result<(), OutputError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl OutputStore for LocalFsOutputStore {
    fn create(&self, path: &str) -> Result<(), OutputError> {
        let local = self.resolve(path)?;
        File::create(&local)?;
        Ok(())
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn OutputFile>, OutputError> {
        let local = self.resolve(path)?;
        let file = OpenOptions::new().append(true).open(&local)?;
        let size = file.metadata()?.len();
        Ok(Box::new(LocalOutputFile {
            path: local,
            file: Some(file),
            size,
        }))
    }

    fn stat(&self, path: &str) -> Result<OutputStat, OutputError> {
        let meta = std::fs::metadata(self.resolve(path)?)?;
        Ok(OutputStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn mkdir(&self, path: &str) -> Result<(), OutputError> {
        std::fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_create_append() {
        let store = InMemoryOutputStore::new();
        store.create("/out/a.dat").unwrap();
        let mut writer = store.open_write("/out/a.dat").unwrap();

        assert_eq!(writer.append(b"hello").unwrap(), 5);
        assert_eq!(writer.append(b" world").unwrap(), 11);
        assert_eq!(writer.size(), 11);
        assert_eq!(store.file_data("/out/a.dat").unwrap(), b"hello world");
        assert_eq!(store.stat("/out/a.dat").unwrap().size, 11);
    }

    #[test]
    fn test_in_memory_open_missing() {
        let store = InMemoryOutputStore::new();
        assert!(matches!(
            store.open_write("/nope"),
            Err(OutputError::NotFound(_))
        ));
        assert!(matches!(store.stat("/nope"), Err(OutputError::NotFound(_))));
    }

    #[test]
    fn test_in_memory_faults() {
        let store = InMemoryOutputStore::new();
        store.create("/a").unwrap();
        let mut writer = store.open_write("/a").unwrap();

        store.set_fail_append(true);
        assert!(writer.append(b"x").is_err());
        store.set_fail_append(false);
        assert_eq!(writer.append(b"x").unwrap(), 1);

        store.set_fail_create(true);
        assert!(store.create("/b").is_err());
        assert_eq!(store.create_count(), 1);
    }

    #[test]
    fn test_in_memory_closed_writer() {
        let store = InMemoryOutputStore::new();
        store.create("/a").unwrap();
        let mut writer = store.open_write("/a").unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.append(b"x"),
            Err(OutputError::WriterClosed(_))
        ));
    }

    #[test]
    fn test_in_memory_dirs() {
        let store = InMemoryOutputStore::new();
        assert!(store.stat("/").unwrap().is_dir);
        assert!(store.stat("/logs").is_err());
        store.mkdir("/logs").unwrap();
        assert!(store.stat("/logs").unwrap().is_dir);
        assert!(store.has_dir("/logs"));
    }

    #[test]
    fn test_local_fs_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsOutputStore::new(tmp.path()).unwrap();

        store.mkdir("/archive").unwrap();
        store.create("/archive/cam.dat").unwrap();
        let mut writer = store.open_write("/archive/cam.dat").unwrap();
        writer.append(b"abc").unwrap();
        writer.append(b"def").unwrap();
        writer.close().unwrap();

        let on_disk = std::fs::read(tmp.path().join("archive/cam.dat")).unwrap();
        assert_eq!(on_disk, b"abcdef");
        assert_eq!(store.stat("/archive/cam.dat").unwrap().size, 6);
        assert!(store.stat("/archive").unwrap().is_dir);
    }

    #[test]
    fn test_local_fs_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsOutputStore::new(tmp.path()).unwrap();
        assert!(store.resolve("/../etc/passwd").is_err());
        assert_eq!(
            store.resolve("/a/b.dat").unwrap(),
            tmp.path().join("a").join("b.dat")
        );
    }
}
