//! The file abstraction the engine runs on top of.
//!
//! [`RawFile`] is deliberately thin and object-safe so [`crate::engine::Engine`]
//! can hold it as `Box<dyn RawFile>` instead of threading a backend type
//! parameter through every container. [`FileBackend`] opens a real file with
//! positional reads/writes (no memory mapping: the engine owns caching, so a
//! second layer of OS-managed paging would just be redundant). [`MemoryBackend`]
//! is an in-memory stand-in used by tests.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{Error, Result};

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Open for both reading and writing.
    ReadWrite,
    /// Open read-only; any write call must fail.
    ReadOnly,
}

/// Whether [`open`] may create the file if it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the file does not already exist.
    MustExist,
    /// Create the file (and any missing parent need not be created) if it
    /// is not already present.
    Create,
}

/// A file or file-like object the engine can page blocks in and out of.
///
/// Implementations perform plain positional I/O; none of the paging,
/// caching, or dirty-tracking machinery lives here -- that's
/// [`crate::engine::Engine`]'s job.
pub trait RawFile: std::fmt::Debug {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes exactly `buf.len()` bytes starting at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Returns the current size of the file in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Grows or shrinks the file to exactly `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flushes any buffered writes to the backing storage.
    fn sync(&mut self) -> Result<()>;
}

/// A [`RawFile`] backed by a real `std::fs::File`, using platform positional
/// I/O so no shared file cursor needs locking.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    fn new(file: File) -> Self {
        FileBackend { file }
    }
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::fs::FileExt;

    impl RawFile for FileBackend {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.file
                .read_exact_at(buf, offset)
                .map_err(|e| Error::Io(format!("read_at({offset}): {e}")))
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            self.file
                .write_all_at(buf, offset)
                .map_err(|e| Error::Io(format!("write_at({offset}): {e}")))
        }

        fn size(&mut self) -> Result<u64> {
            Ok(self.file.metadata()?.len())
        }

        fn truncate(&mut self, size: u64) -> Result<()> {
            self.file.set_len(size).map_err(Error::from)
        }

        fn sync(&mut self) -> Result<()> {
            self.file.sync_data().map_err(Error::from)
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    impl RawFile for FileBackend {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(buf).map_err(Error::from)
        }

        fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(buf).map_err(Error::from)
        }

        fn size(&mut self) -> Result<u64> {
            Ok(self.file.metadata()?.len())
        }

        fn truncate(&mut self, size: u64) -> Result<()> {
            self.file.set_len(size).map_err(Error::from)
        }

        fn sync(&mut self) -> Result<()> {
            self.file.sync_data().map_err(Error::from)
        }
    }
}

/// Opens (or creates) a file at `path` for use as an engine backend.
pub fn open(path: impl AsRef<Path>, access: Access, mode: OpenMode) -> Result<FileBackend> {
    let mut options = OpenOptions::new();
    options.read(true);
    match access {
        Access::ReadWrite => {
            options.write(true);
        }
        Access::ReadOnly => {}
    }
    match mode {
        OpenMode::Create => {
            options.create(true);
        }
        OpenMode::MustExist => {}
    }
    let file = options
        .open(path.as_ref())
        .map_err(|e| Error::Io(format!("open {:?}: {e}", path.as_ref())))?;
    Ok(FileBackend::new(file))
}

/// An in-memory [`RawFile`], used by tests so they don't touch the
/// filesystem.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl RawFile for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::Io(format!(
                "read_at({offset}, {}) past end of {}-byte backend",
                buf.len(),
                self.data.len()
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::Io(format!(
                "write_at({offset}, {}) past end of {}-byte backend",
                buf.len(),
                self.data.len()
            )));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.resize(size as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_round_trip() {
        let mut backend = MemoryBackend::new();
        backend.truncate(16).unwrap();
        backend.write_at(4, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        backend.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(backend.size().unwrap(), 16);
    }

    #[test]
    fn memory_backend_rejects_out_of_bounds() {
        let mut backend = MemoryBackend::new();
        backend.truncate(4).unwrap();
        let mut buf = [0u8; 8];
        assert!(backend.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.db");
        let mut backend = open(&path, Access::ReadWrite, OpenMode::Create).unwrap();
        backend.truncate(8).unwrap();
        backend.write_at(0, b"abcdefgh").unwrap();
        backend.sync().unwrap();
        let mut buf = [0u8; 8];
        backend.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }
}
