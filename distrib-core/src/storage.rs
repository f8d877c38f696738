//! File access behind a provider, on disk or in memory.
//!
//! The write-ahead log never touches `std::fs` directly. It goes through a
//! [`StorageProvider`], so tests can swap in [`MemoryStorageProvider`] and
//! inject sync failures to exercise the durability-failure path.
//!
//! The API is blocking on purpose: log appends run on the dedicated worker
//! thread of a [`SingularUpdateQueue`](crate::SingularUpdateQueue).

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// How to open a file, mirroring [`std::fs::OpenOptions`] as plain data.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Allow reads.
    pub read: bool,
    /// Allow writes at the cursor.
    pub write: bool,
    /// Create a missing file.
    pub create: bool,
    /// Empty the file on open.
    pub truncate: bool,
    /// Every write goes to the end.
    pub append: bool,
}

impl OpenOptions {
    /// Every flag off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle `read`.
    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// Toggle `write`.
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Toggle `create`.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Toggle `truncate`.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Toggle `append`.
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Reading an existing segment.
    pub fn read_only() -> Self {
        Self::new().read(true)
    }

    /// Writing the active segment, created on first use.
    pub fn create_append() -> Self {
        Self::new().read(true).append(true).create(true)
    }
}

/// Where durable files live.
///
/// Cloning shares the same underlying files.
pub trait StorageProvider: Clone + Send + Sync + 'static {
    /// Handle returned by [`open`](Self::open).
    type File: StorageFile + 'static;

    /// Open `path`.
    fn open(&self, path: &Path, options: OpenOptions) -> io::Result<Self::File>;

    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Remove the file at `path`.
    fn delete(&self, path: &Path) -> io::Result<()>;

    /// List the files directly inside `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Make sure `dir` exists.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

/// An open file with blocking I/O and explicit durability points.
pub trait StorageFile: Read + Write + Seek + Send {
    /// Persist data and metadata.
    fn sync_all(&self) -> io::Result<()>;

    /// Persist data only.
    fn sync_data(&self) -> io::Result<()>;

    /// Length in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Cut or extend the file to `size` bytes.
    fn set_len(&self, size: u64) -> io::Result<()>;
}

// =============================================================================
// Filesystem
// =============================================================================

/// Real filesystem storage.
#[derive(Debug, Clone, Default)]
pub struct FsStorageProvider;

impl FsStorageProvider {
    /// Create a new filesystem storage provider.
    pub fn new() -> Self {
        Self
    }
}

impl StorageProvider for FsStorageProvider {
    type File = std::fs::File;

    fn open(&self, path: &Path, options: OpenOptions) -> io::Result<Self::File> {
        std::fs::OpenOptions::new()
            .read(options.read)
            .write(options.write)
            .create(options.create)
            .truncate(options.truncate)
            .append(options.append)
            .open(path)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }
}

impl StorageFile for std::fs::File {
    fn sync_all(&self) -> io::Result<()> {
        std::fs::File::sync_all(self)
    }

    fn sync_data(&self) -> io::Result<()> {
        std::fs::File::sync_data(self)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        std::fs::File::set_len(self, size)
    }
}

// =============================================================================
// In-memory
// =============================================================================

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// In-memory storage with fault injection.
///
/// Clones share the same files, so a "reopen" after dropping every handle
/// sees exactly the bytes written so far. Directories are implicit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    files: Arc<Mutex<HashMap<PathBuf, SharedBuffer>>>,
    faults: Arc<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_sync: AtomicBool,
    fail_write: AtomicBool,
}

impl MemoryStorageProvider {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `sync_all`/`sync_data` fail.
    pub fn fail_syncs(&self, fail: bool) {
        self.faults.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_write.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the raw bytes of a file, creating it if needed.
    pub fn set_contents(&self, path: &Path, contents: Vec<u8>) {
        let buffer = self
            .files
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        *buffer.lock() = contents;
    }

    /// Raw bytes of a file, if it exists.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|buffer| buffer.lock().clone())
    }
}

impl StorageProvider for MemoryStorageProvider {
    type File = MemoryStorageFile;

    fn open(&self, path: &Path, options: OpenOptions) -> io::Result<Self::File> {
        let mut files = self.files.lock();
        let existing = files.get(path).cloned();
        let buffer = match existing {
            Some(buffer) => buffer,
            None if options.create => files.entry(path.to_path_buf()).or_default().clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ))
            }
        };
        if options.truncate {
            buffer.lock().clear();
        }
        Ok(MemoryStorageFile {
            buffer,
            position: 0,
            append: options.append,
            faults: self.faults.clone(),
        })
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match self.files.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Handle to a file of a [`MemoryStorageProvider`].
#[derive(Debug)]
pub struct MemoryStorageFile {
    buffer: SharedBuffer,
    position: u64,
    append: bool,
    faults: Arc<Faults>,
}

fn injected(what: &str) -> io::Error {
    io::Error::other(format!("injected {what} failure"))
}

impl Read for MemoryStorageFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.buffer.lock();
        let start = usize::try_from(self.position)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStorageFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.faults.fail_write.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        let mut data = self.buffer.lock();
        if self.append {
            self.position = data.len() as u64;
        }
        let start = usize::try_from(self.position).unwrap_or(usize::MAX);
        if start > data.len() {
            data.resize(start, 0);
        }
        let overlap = buf.len().min(data.len() - start);
        data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStorageFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.buffer.lock().len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = u64::try_from(target).unwrap_or(u64::MAX);
        Ok(self.position)
    }
}

impl StorageFile for MemoryStorageFile {
    fn sync_all(&self) -> io::Result<()> {
        if self.faults.fail_sync.load(Ordering::SeqCst) {
            return Err(injected("sync"));
        }
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        self.sync_all()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.buffer.lock().len() as u64)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        self.buffer.lock().resize(size, 0);
        Ok(())
    }
}
