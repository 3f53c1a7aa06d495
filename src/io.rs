//! File storage for block files
//!
//! [`FileStore`] creates, opens and deletes files; [`FileHandle`] is one open
//! file with its header mapped into memory. [`DiskStore`] is the local
//! filesystem implementation.

use crate::error::{BlockFileError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Creates, opens and deletes block files
pub trait FileStore {
    type Handle: FileHandle;

    /// Create `path`. With `exclusive`, fail if it already exists; otherwise
    /// truncate any existing file.
    fn create(&self, path: &Path, exclusive: bool) -> Result<Self::Handle>;

    /// Open an existing file for reading and writing
    fn open(&self, path: &Path) -> Result<Self::Handle>;

    /// Remove `path`
    fn delete(&self, path: &Path) -> Result<()>;
}

/// One open block file
pub trait FileHandle {
    /// Map the first `header_size` bytes for in-place access
    fn map(&mut self, header_size: usize) -> Result<()>;

    /// Mapped header bytes; empty before [`map`](Self::map)
    fn header(&self) -> &[u8];

    /// Mutable mapped header bytes; empty before [`map`](Self::map)
    fn header_mut(&mut self) -> &mut [u8];

    /// Fill `buf` from `offset`
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Extend the file to `len` bytes
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Current file length
    fn len(&self) -> Result<u64>;

    /// Schedule mapped header changes for write-back
    fn flush(&mut self) -> Result<()>;

    /// Write everything back and wait for the device
    fn sync(&mut self) -> Result<()>;
}

/// Local filesystem store
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

impl DiskStore {
    pub fn new() -> Self {
        DiskStore
    }
}

impl FileStore for DiskStore {
    type Handle = DiskFile;

    fn create(&self, path: &Path, exclusive: bool) -> Result<DiskFile> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }

        let file = options.open(path)?;
        Ok(DiskFile { file, map: None })
    }

    fn open(&self, path: &Path) -> Result<DiskFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(DiskFile { file, map: None })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

/// Block file on local disk
///
/// The header is a shared writable mapping; block data goes through regular
/// positioned reads and writes.
pub struct DiskFile {
    file: File,
    map: Option<MmapMut>,
}

impl FileHandle for DiskFile {
    fn map(&mut self, header_size: usize) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len < header_size as u64 {
            return Err(BlockFileError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot map {} header bytes of a {} byte file", header_size, len),
            )));
        }

        // SAFETY: the mapping covers only the header, which is never
        // truncated (set_len refuses to shrink), and the single owner of the
        // block files is the only writer.
        let map = unsafe { MmapOptions::new().len(header_size).map_mut(&self.file)? };
        self.map = Some(map);
        Ok(())
    }

    fn header(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn header_mut(&mut self) -> &mut [u8] {
        match self.map.as_mut() {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let current = self.file.metadata()?.len();
        if len < current {
            // A header that asks to shrink the file is stale; truncating
            // would drop live blocks.
            return Err(BlockFileError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to truncate block file from {} to {} bytes", current, len),
            )));
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush_async()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}
