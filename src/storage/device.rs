//! # Device Abstraction
//!
//! A device is the byte-addressed block store underneath the pager: it
//! reads and writes at explicit offsets and knows its own length. There is
//! no buffering here; the page cache is the only buffer in the engine.
//!
//! Two backends implement the trait:
//!
//! - [`FileDevice`]: positioned I/O over `std::fs::File`. All transfers are
//!   page-aligned except the initial header probe, which reads the first
//!   512 bytes to discover the real page size.
//! - [`MemDevice`]: a growable byte vector, backing in-memory databases and
//!   tests. Same semantics, no file.
//!
//! Partial transfers surface as `ShortRead` / `ShortWrite` so callers can
//! distinguish a truncated file from an I/O failure.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{Result, WrapErr};

use crate::error::{raise, Error};

pub trait Device {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` starting at `offset`, extending the device if
    /// the write ends past the current size.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grows or shrinks the device to exactly `size` bytes. Grown space
    /// reads as zeroes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current device length in bytes.
    fn size(&self) -> Result<u64>;

    /// Forces buffered writes to durable storage.
    fn sync(&mut self) -> Result<()>;

    fn is_in_memory(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("opening database file {}", path.display()))?;
        Ok(Self { file })
    }

    /// Creates a fresh database file. Refuses to clobber an existing one.
    pub fn create(path: &Path, mode: u32) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = match options.open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                raise!(Error::AlreadyOpen, "database file {} already exists", path.display())
            }
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("creating database file {}", path.display())
                })
            }
        };
        Ok(Self { file })
    }
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                raise!(Error::ShortRead, "read of {} bytes at offset {}", buf.len(), offset)
            }
            Err(e) => Err(e).wrap_err_with(|| format!("read at offset {}", offset)),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WriteZero => {
                raise!(Error::ShortWrite, "write of {} bytes at offset {}", buf.len(), offset)
            }
            Err(e) => Err(e).wrap_err_with(|| format!("write at offset {}", offset)),
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .wrap_err_with(|| format!("truncating device to {} bytes", size))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data().wrap_err("syncing device")
    }
}

#[derive(Default)]
pub struct MemDevice {
    bytes: Vec<u8>,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            raise!(Error::ShortRead, "read of {} bytes at offset {}", buf.len(), offset);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.bytes.resize(size as usize, 0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}
