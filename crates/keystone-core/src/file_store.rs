//! File resources handed out by the storage handle
//!
//! A [`FileStore`] is an open file plus the path it came from, so every I/O
//! error can name the file. Writes are positional or appending; `sync` maps
//! to the strongest durability primitive the platform offers.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{StorageError, StoreResult};

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// "r": read only, file must exist
    Read,
    /// "rw": read/write, created if missing
    ReadWrite,
    /// "rws": read/write, every write is durably synced
    ReadWriteSync,
}

impl AccessMode {
    /// Parse the mode strings the execution engine passes through.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "r" => Some(AccessMode::Read),
            "rw" => Some(AccessMode::ReadWrite),
            "rws" | "rwd" => Some(AccessMode::ReadWriteSync),
            _ => None,
        }
    }

    /// True if writes are permitted.
    pub fn is_writable(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// An open file owned by the caller of `open_file`.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    mode: AccessMode,
}

impl FileStore {
    /// Open `path`. With `must_exist`, a missing file is `NotFound` instead of
    /// being created.
    pub fn open(path: &Path, mode: AccessMode, must_exist: bool) -> StoreResult<Self> {
        if must_exist && !path.exists() {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if mode.is_writable() {
            options.write(true).create(!must_exist);
        }

        let file = options.open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                path: path.to_path_buf(),
            },
            _ => StorageError::io_at(path, &e, "Failed to open file"),
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    /// Path this store was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode this store was opened with.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current file length in bytes.
    pub fn len(&self) -> StoreResult<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| StorageError::io_at(&self.path, &e, "Failed to stat file"))?;
        Ok(metadata.len())
    }

    /// True if the file holds no bytes.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read the whole file into memory.
    pub fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        let mut buffer = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut buffer))
            .map_err(|e| StorageError::io_at(&self.path, &e, "Failed to read file"))?;
        Ok(buffer)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| {
                let context = format!("Failed to read at offset {}", offset);
                StorageError::io_at(&self.path, &e, &context)
            })
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StoreResult<()> {
        self.ensure_writable()?;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| {
                let context = format!("Failed to write at offset {}", offset);
                StorageError::io_at(&self.path, &e, &context)
            })?;
        self.sync_if_required()
    }

    /// Append `bytes` at the end of the file. Returns the offset written at.
    pub fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        self.ensure_writable()?;
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::io_at(&self.path, &e, "Failed to seek to end"))?;
        self.file
            .write_all(bytes)
            .map_err(|e| StorageError::io_at(&self.path, &e, "Append failed"))?;
        self.sync_if_required()?;
        Ok(offset)
    }

    /// Truncate or extend the file to `len` bytes.
    pub fn set_len(&mut self, len: u64) -> StoreResult<()> {
        self.ensure_writable()?;
        self.file.set_len(len).map_err(|e| {
            let context = format!("Failed to set length {}", len);
            StorageError::io_at(&self.path, &e, &context)
        })
    }

    /// Make everything written so far durable.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StorageError::io_at(&self.path, &e, "durable_sync failed"))
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(StorageError::ReadOnly {
                reason: format!("{} was opened read-only", self.path.display()),
            })
        }
    }

    fn sync_if_required(&self) -> StoreResult<()> {
        if self.mode == AccessMode::ReadWriteSync {
            self.sync()?;
        }
        Ok(())
    }
}

/// Ensures data is durably written to persistent storage before returning.
///
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC); plain fsync stops at the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: sync_data()
///
/// May block for a long time under heavy I/O. Do not hold locks that other
/// writers need across this call.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference and stays open for the call.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference and stays open for the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_must_exist_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.data");
        let err = FileStore::open(&path, AccessMode::ReadWrite, true).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!path.exists(), "must_exist must not create the file");
    }

    #[test]
    fn test_read_mode_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = FileStore::open(&dir.path().join("x"), AccessMode::Read, false).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.data");
        let mut store = FileStore::open(&path, AccessMode::ReadWrite, false).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.append(b"hello").unwrap(), 0);
        assert_eq!(store.append(b" world").unwrap(), 5);
        assert_eq!(store.read_all().unwrap(), b"hello world");

        let mut buf = [0u8; 5];
        store.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_write_at_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.data");
        let mut store = FileStore::open(&path, AccessMode::ReadWriteSync, false).unwrap();
        store.append(b"abcdef").unwrap();
        store.write_at(2, b"ZZ").unwrap();
        store.set_len(4).unwrap();
        assert_eq!(store.read_all().unwrap(), b"abZZ");
    }

    #[test]
    fn test_read_only_store_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.data");
        std::fs::write(&path, b"data").unwrap();
        let mut store = FileStore::open(&path, AccessMode::Read, true).unwrap();
        assert!(matches!(store.append(b"x"), Err(StorageError::ReadOnly { .. })));
        assert_eq!(store.read_all().unwrap(), b"data");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(AccessMode::parse("r"), Some(AccessMode::Read));
        assert_eq!(AccessMode::parse("rw"), Some(AccessMode::ReadWrite));
        assert_eq!(AccessMode::parse("rws"), Some(AccessMode::ReadWriteSync));
        assert_eq!(AccessMode::parse("w"), None);
    }

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data for durable sync").unwrap();
        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }
}
