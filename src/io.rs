//! # File Driver Abstraction
//!
//! The engine never talks to the operating system directly; it goes through
//! the [`FileDriver`] trait, a copy-based positional-I/O seam. All offsets
//! handed to a driver by the engine are multiples of the engine's block
//! size.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileStorage`]: a real file accessed with positional reads and writes.
//!   Growing the file with `truncate` produces zero-filled content, which is
//!   what the engine's "content zero on first read" guarantee relies on.
//! - [`MemoryStorage`]: an in-memory byte vector behind a shared handle.
//!   Cloning the handle shares the backing storage, so a test can drop an
//!   engine and reopen a second one over the same bytes to exercise
//!   close/reopen durability without touching the filesystem.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::rc::Rc;

use crate::error::Result;

/// Copy-based positional I/O over a resizable byte store.
///
/// Offsets are block-aligned by the caller. Reads and writes are exact:
/// short transfers are errors.
pub trait FileDriver {
    /// Current size of the backing store in bytes.
    fn size(&self) -> Result<u64>;

    /// Resizes the backing store. Growing zero-fills the new region.
    fn truncate(&self, new_size: u64) -> Result<()>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flushes buffered writes to durable storage.
    fn sync(&self) -> Result<()>;
}

/// [`FileDriver`] over a [`std::fs::File`] using positional I/O.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Creates (or truncates) a file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens an existing file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl FileDriver for FileStorage {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        Ok(())
    }

    #[cfg(unix)]
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            done += n;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.seek_write(&buf[done..], offset + done as u64)?;
            done += n;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory [`FileDriver`] for tests and transient embedders.
///
/// Clones share the same backing vector.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn out_of_range(offset: u64, len: usize, size: usize) -> crate::error::Error {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "access at offset {} of {} bytes beyond storage size {}",
                offset, len, size
            ),
        )
        .into()
    }
}

impl FileDriver for MemoryStorage {
    fn size(&self) -> Result<u64> {
        Ok(self.data.borrow().len() as u64)
    }

    fn truncate(&self, new_size: u64) -> Result<()> {
        self.data.borrow_mut().resize(new_size as usize, 0);
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.borrow();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Self::out_of_range(offset, buf.len(), data.len()));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.borrow_mut();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Self::out_of_range(offset, buf.len(), data.len()));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_truncate_zero_fills() {
        let storage = MemoryStorage::new();
        storage.truncate(64).unwrap();

        let mut buf = [0xFFu8; 64];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage.truncate(128).unwrap();

        storage.write(32, b"hello").unwrap();

        let mut buf = [0u8; 5];
        storage.read(32, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn memory_storage_read_past_end_fails() {
        let storage = MemoryStorage::new();
        storage.truncate(16).unwrap();

        let mut buf = [0u8; 32];
        assert!(storage.read(0, &mut buf).is_err());
    }

    #[test]
    fn memory_storage_clones_share_backing() {
        let storage = MemoryStorage::new();
        storage.truncate(16).unwrap();
        let other = storage.clone();

        storage.write(0, &[7u8]).unwrap();

        let mut buf = [0u8; 1];
        other.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn file_storage_create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.shelf");

        {
            let storage = FileStorage::create(&path).unwrap();
            storage.truncate(256).unwrap();
            storage.write(128, b"persist me").unwrap();
            storage.sync().unwrap();
        }

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.size().unwrap(), 256);

        let mut buf = [0u8; 10];
        storage.read(128, &mut buf).unwrap();
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn file_storage_grow_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.shelf");

        let storage = FileStorage::create(&path).unwrap();
        storage.truncate(64).unwrap();

        let mut buf = [0xAAu8; 64];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }
}
