//! A single block file
//!
//! A [`BlockFile`] owns one open [`FileHandle`] with its header mapped, and
//! hands out [`BitmapAllocator`] views over that header. Opening a file that
//! was not closed cleanly runs the repair path before anything else touches
//! it.

use crate::allocator::BitmapAllocator;
use crate::error::{BlockFileError, Result};
use crate::header::{
    BlockFileHeader, HeaderLayout, BLOCK_MAGIC, BLOCK_VERSION, MAX_ENTRY_SIZE, MIN_ENTRY_SIZE,
};
use crate::io::{FileHandle, FileStore};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// `updating` value marking a file for a full rebuild on the next open
pub const UPDATING_NEEDS_REBUILD: i32 = 100;

/// Above this `updating` value a grow does not attempt another repair
const UPDATING_REPAIR_LIMIT: i32 = 10;

pub struct BlockFile<H> {
    id: u8,
    path: PathBuf,
    handle: H,
    layout: HeaderLayout,
}

impl<H: FileHandle> BlockFile<H> {
    /// Write a fresh, empty block file
    ///
    /// Without `force` the call fails if `path` already exists.
    pub fn create<S>(
        store: &S,
        path: &Path,
        id: u8,
        entry_size: u32,
        layout: HeaderLayout,
        force: bool,
    ) -> Result<()>
    where
        S: FileStore<Handle = H>,
    {
        let mut handle = store.create(path, !force)?;
        let header = BlockFileHeader::new(layout, id, entry_size);
        handle.write_at(&header.to_bytes(layout), 0)?;
        handle.sync()?;

        info!("Created block file {} ({} byte blocks)", id, entry_size);
        Ok(())
    }

    /// Open, validate and if necessary repair a block file
    ///
    /// With `eager_read` the whole file is read once to warm the page cache.
    pub fn open<S>(
        store: &S,
        path: &Path,
        id: u8,
        layout: HeaderLayout,
        eager_read: bool,
    ) -> Result<Self>
    where
        S: FileStore<Handle = H>,
    {
        let mut handle = store.open(path)?;

        let len = handle.len()?;
        let header_size = layout.size() as u64;
        if len < header_size {
            error!("Block file {} too small for its header ({} bytes)", id, len);
            return Err(BlockFileError::Truncated {
                file: id,
                len,
                expected: header_size,
            });
        }
        handle.map(layout.size())?;

        let mut file = BlockFile {
            id,
            path: path.to_path_buf(),
            handle,
            layout,
        };

        let (magic, version) = {
            let header = file.header();
            (header.magic(), header.version())
        };
        if magic != BLOCK_MAGIC || version != BLOCK_VERSION {
            error!("Invalid magic or version in block file {}", id);
            return Err(BlockFileError::FormatMismatch {
                file: id,
                magic,
                version,
            });
        }

        let needs_repair = {
            let header = file.header();
            let entry_size = header.entry_size();
            header.updating() != 0
                || !header.validate_counters()
                || entry_size < MIN_ENTRY_SIZE as i32
                || entry_size > MAX_ENTRY_SIZE as i32
        };
        if needs_repair {
            warn!(
                "Block file {} was not closed cleanly or has bad counters, repairing",
                id
            );
            file.fix_header()?;
        }

        if len < file.expected_len() && !needs_repair {
            // The header may be left over from an interrupted grow.
            if let Err(e) = file.fix_header() {
                debug!("Repair of short block file {} failed: {}", id, e);
            }
        }

        let expected = file.expected_len();
        if len < expected {
            error!(
                "Block file {} is {} bytes, header needs {}",
                id, len, expected
            );
            return Err(BlockFileError::Truncated {
                file: id,
                len,
                expected,
            });
        }

        if eager_read {
            let mut buf = vec![0u8; len as usize];
            file.handle.read_at(&mut buf, 0)?;
        }

        file.handle.flush()?;

        let header = file.header();
        debug!(
            "Opened block file {}: {}/{} blocks used",
            id,
            header.num_entries(),
            header.max_entries()
        );
        Ok(file)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    /// Read-only view of the header
    pub fn header(&self) -> BitmapAllocator<&[u8]> {
        BitmapAllocator::from_mapped(self.handle.header(), self.layout)
    }

    /// Mutable view of the header
    pub fn header_mut(&mut self) -> BitmapAllocator<&mut [u8]> {
        BitmapAllocator::from_mapped(self.handle.header_mut(), self.layout)
    }

    /// Block size in bytes
    pub fn entry_size(&self) -> u32 {
        self.header().entry_size().max(0) as u32
    }

    /// File length implied by the header
    fn expected_len(&self) -> u64 {
        let header = self.header();
        let max_entries = header.max_entries().max(0) as u64;
        let entry_size = header.entry_size().max(0) as u64;
        self.layout.size() as u64 + max_entries * entry_size
    }

    /// Byte offset of block `index` in the file
    pub fn block_offset(&self, index: u32) -> u64 {
        self.layout.size() as u64 + index as u64 * self.entry_size() as u64
    }

    /// Rebuild the header counters from the allocation map
    ///
    /// Also recovers from a grow that extended the file but died before the
    /// header recorded it. Fails with `FileCorrupted` when the header cannot
    /// be made consistent; `updating` is then left raised.
    pub fn fix_header(&mut self) -> Result<()> {
        let id = self.id;
        let corrupted = || BlockFileError::FileCorrupted { file: id };

        let file_size = self.handle.len()?;
        let header_size = self.layout.size() as u64;
        if file_size < header_size {
            return Err(corrupted());
        }

        let max_blocks = self.layout.max_blocks() as i32;
        let mut header = self.header_mut();
        let entry_size = header.entry_size();
        if entry_size < MIN_ENTRY_SIZE as i32
            || entry_size > MAX_ENTRY_SIZE as i32
            || header.num_entries() < 0
            || header.max_entries() < 0
            || header.max_entries() > max_blocks
        {
            error!("Block file {} has an unusable header", id);
            return Err(corrupted());
        }

        // Survive a crash during the repair itself.
        header.set_updating(1);

        let entry_size = entry_size as u64;
        let expected = entry_size * header.max_entries() as u64 + header_size;
        if file_size != expected {
            let max_expected = entry_size * max_blocks as u64 + header_size;
            if file_size < expected || header.empty(3) != 0 || file_size > max_expected {
                error!(
                    "Unexpected size {} for block file {} (header expects {})",
                    file_size, id, expected
                );
                return Err(corrupted());
            }

            // The file grew but the header never heard about it.
            let max_entries = ((file_size - header_size) / entry_size) as i32;
            header.set_max_entries(max_entries);
        }

        header.fix_allocation_counters();
        header.reconcile_num_entries();
        if !header.validate_counters() {
            error!("Counters of block file {} still invalid after repair", id);
            return Err(corrupted());
        }

        header.set_updating(0);
        let (num_entries, max_entries) = (header.num_entries(), header.max_entries());
        self.handle.flush()?;

        warn!(
            "Repaired block file {}: {}/{} blocks used",
            id, num_entries, max_entries
        );
        Ok(())
    }

    /// Add up to `growth_step` blocks, capped at the layout's block limit
    pub fn grow(&mut self, growth_step: u32) -> Result<()> {
        let max_blocks = self.layout.max_blocks() as i32;
        let (max_entries, entry_size) = {
            let header = self.header();
            (header.max_entries(), header.entry_size())
        };
        if max_entries >= max_blocks {
            return Err(BlockFileError::AtCapacity { file: self.id });
        }

        let new_size = max_entries.saturating_add(growth_step as i32).min(max_blocks);
        let new_len = self.layout.size() as u64 + new_size as u64 * entry_size.max(0) as u64;

        if let Err(e) = self.handle.set_len(new_len) {
            warn!("Failed to extend block file {} to {} bytes: {}", self.id, new_len, e);

            // Most likely the header is stale and this was a truncation.
            let updating = self.header().updating();
            let repaired = updating < UPDATING_REPAIR_LIMIT && self.fix_header().is_ok();
            if !repaired {
                self.mark_for_rebuild();
                return Err(BlockFileError::GrowFailed { file: self.id });
            }

            if self.header().max_entries() >= new_size {
                return Ok(());
            }

            if let Err(e) = self.handle.set_len(new_len) {
                error!("Retry of grow for block file {} failed: {}", self.id, e);
                self.mark_for_rebuild();
                return Err(BlockFileError::GrowFailed { file: self.id });
            }
        }

        self.header_mut().extend(new_size)?;
        self.handle.flush()?;

        info!("Grew block file {} to {} blocks", self.id, new_size);
        Ok(())
    }

    /// Flag the header so the next open rebuilds it
    fn mark_for_rebuild(&mut self) {
        self.header_mut().set_updating(UPDATING_NEEDS_REBUILD);
        if let Err(e) = self.handle.flush() {
            error!("Failed to flush block file {}: {}", self.id, e);
        }
    }

    /// Read `buf.len()` bytes at `offset` from the start of the file
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.handle.read_at(buf, offset)
    }

    /// Write `buf` at `offset` from the start of the file
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.handle.write_at(buf, offset)
    }

    /// Overwrite `count` blocks starting at `index` with zeros
    pub fn zero_blocks(&mut self, index: u32, count: usize) -> Result<()> {
        let zeros = vec![0u8; count * self.entry_size() as usize];
        let offset = self.block_offset(index);
        self.handle.write_at(&zeros, offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.handle.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.handle.sync()
    }
}
