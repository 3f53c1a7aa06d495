//! The set of block files behind a cache directory
//!
//! [`BlockFiles`] keeps one base file per size class (ids 0..=3) and grows a
//! chain of overflow files (ids 4..=255) behind each base file as it fills:
//!
//! ```text
//! data_0 (rankings)  ──next──▶ data_7 ──next──▶ data_12
//! data_1 (256 B)     ──next──▶ data_4
//! data_2 (1 KiB)
//! data_3 (4 KiB)     ──next──▶ data_5
//! ```
//!
//! Files are opened lazily and stay open until [`BlockFiles::close`]. A file
//! that fails in a way repair cannot fix is rejected for the rest of the
//! process and never reopened.

use crate::addr::{Addr, FileType, FIRST_ADDITIONAL_BLOCK_FILE, MAX_BLOCK_FILE, MAX_NUM_BLOCKS};
use crate::block_file::BlockFile;
use crate::config::BlockFilesConfig;
use crate::error::{BlockFileError, Result};
use crate::header::{BlockFileHeader, HeaderLayout};
use crate::io::{DiskStore, FileStore};
use crate::stats::{BlockFileStats, ClassStats};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on files visited while walking one chain
const MAX_CHAIN_HOPS: usize = MAX_BLOCK_FILE as usize + 1;

/// Block files of one cache directory
pub struct BlockFiles<S: FileStore = DiskStore> {
    store: S,
    path: PathBuf,
    config: BlockFilesConfig,
    layout: HeaderLayout,
    files: Vec<Option<BlockFile<S::Handle>>>,
    rejected: HashSet<u8>,
    init: bool,
}

impl BlockFiles<DiskStore> {
    /// Block files under `path` on the local filesystem
    pub fn open_dir(path: impl AsRef<Path>, config: BlockFilesConfig) -> Result<Self> {
        Self::new(DiskStore::new(), path, config)
    }
}

impl<S: FileStore> BlockFiles<S> {
    pub fn new(store: S, path: impl AsRef<Path>, config: BlockFilesConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();

        Ok(BlockFiles {
            store,
            path: path.as_ref().to_path_buf(),
            config,
            layout,
            files: (0..=MAX_BLOCK_FILE as usize).map(|_| None).collect(),
            rejected: HashSet::new(),
            init: false,
        })
    }

    /// Open the base files and drop empty overflow files from their chains
    ///
    /// With `create_if_missing`, absent base files are created empty.
    pub fn init(&mut self, create_if_missing: bool) -> Result<()> {
        if self.init {
            return Ok(());
        }

        for file_type in FileType::ALL {
            let id = file_type.base_file();
            self.init_base_file(file_type, create_if_missing)
                .map_err(|source| {
                    error!("Failed to initialize block file {}: {}", id, source);
                    BlockFileError::InitFailed {
                        file: id,
                        source: Box::new(source),
                    }
                })?;
        }

        self.init = true;
        for file_type in FileType::ALL {
            self.remove_empty_files(file_type);
        }

        info!("Block files ready in {}", self.path.display());
        Ok(())
    }

    fn init_base_file(&mut self, file_type: FileType, create_if_missing: bool) -> Result<()> {
        let id = file_type.base_file();
        if create_if_missing {
            let path = self.file_path(id);
            let entry_size = self.config.entry_size(file_type);
            let created =
                BlockFile::<S::Handle>::create(&self.store, &path, id, entry_size, self.layout, false);
            match created {
                Ok(()) => {}
                Err(BlockFileError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        self.file_mut(id).map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.init
    }

    pub fn config(&self) -> &BlockFilesConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of block file `id`
    pub fn file_path(&self, id: u8) -> PathBuf {
        self.path.join(format!("{}{}", self.config.file_prefix, id))
    }

    /// True if `id` was disabled after an unrecoverable failure
    pub fn is_rejected(&self, id: u8) -> bool {
        self.rejected.contains(&id)
    }

    fn check_init(&self) -> Result<()> {
        if !self.init {
            return Err(BlockFileError::NotInitialized);
        }
        Ok(())
    }

    fn reject(&mut self, id: u8) {
        warn!("Rejecting block file {} until restart", id);
        self.rejected.insert(id);
        self.files[id as usize] = None;
    }

    fn open_file(&mut self, id: u8) -> Result<()> {
        if self.rejected.contains(&id) {
            return Err(BlockFileError::FileCorrupted { file: id });
        }

        let path = self.file_path(id);
        let eager_read = id == 0 && self.config.eager_read_first_file;
        match BlockFile::<S::Handle>::open(&self.store, &path, id, self.layout, eager_read) {
            Ok(file) => {
                // Base files must hold their class's block size.
                if let Some(&file_type) = FileType::ALL.get(id as usize) {
                    let expected = self.config.entry_size(file_type);
                    if file.entry_size() != expected {
                        error!(
                            "Block file {} has {} byte blocks, {} needs {}",
                            id,
                            file.entry_size(),
                            file_type,
                            expected
                        );
                        self.reject(id);
                        return Err(BlockFileError::FileCorrupted { file: id });
                    }
                }
                self.files[id as usize] = Some(file);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal_for_file() {
                    self.reject(id);
                }
                Err(e)
            }
        }
    }

    /// Block file `id`, opened on first use
    fn file_mut(&mut self, id: u8) -> Result<&mut BlockFile<S::Handle>> {
        let index = id as usize;
        if self.files[index].is_none() {
            self.open_file(id)?;
        }
        match self.files[index].as_mut() {
            Some(file) => Ok(file),
            None => Err(BlockFileError::FileCorrupted { file: id }),
        }
    }

    /// Decoded copy of the header of file `id`
    pub fn file_header(&mut self, id: u8) -> Result<BlockFileHeader> {
        self.check_init()?;
        self.file_mut(id)?.header().snapshot()
    }

    /// Successor of `id` in its chain, if any
    ///
    /// The successor is opened and must use the same block size as `id`.
    fn next_in_chain(&mut self, id: u8) -> Result<Option<u8>> {
        let (next, entry_size) = {
            let file = self.file_mut(id)?;
            (file.header().next_file(), file.entry_size())
        };
        if next == 0 {
            return Ok(None);
        }
        if next < FIRST_ADDITIONAL_BLOCK_FILE as i16 || next > MAX_BLOCK_FILE as i16 {
            error!("Block file {} links to invalid file {}", id, next);
            return Err(BlockFileError::FileCorrupted { file: id });
        }

        let next = next as u8;
        let next_size = self.file_mut(next)?.entry_size();
        if next_size != entry_size {
            error!(
                "Block file {} has {} byte blocks but follows {} with {}",
                next, next_size, id, entry_size
            );
            self.reject(next);
            return Err(BlockFileError::FileCorrupted { file: next });
        }
        Ok(Some(next))
    }

    /// Successor of the full file `id`, creating and linking one if needed
    fn next_file(&mut self, file_type: FileType, id: u8) -> Result<u8> {
        if let Some(next) = self.next_in_chain(id)? {
            return Ok(next);
        }

        let new_id = self.create_next_block_file(file_type)?;
        let file = self.file_mut(id)?;
        file.header_mut().update(|h| h.set_next_file(new_id as i16));
        file.flush()?;

        info!("Chained block file {} after {} ({})", new_id, id, file_type);
        Ok(new_id)
    }

    /// Create the lowest free overflow file for `file_type`
    fn create_next_block_file(&mut self, file_type: FileType) -> Result<u8> {
        let entry_size = self.config.entry_size(file_type);
        for id in FIRST_ADDITIONAL_BLOCK_FILE..=MAX_BLOCK_FILE {
            if self.rejected.contains(&id) || self.files[id as usize].is_some() {
                continue;
            }

            let path = self.file_path(id);
            let created =
                BlockFile::<S::Handle>::create(&self.store, &path, id, entry_size, self.layout, false);
            match created {
                Ok(()) => return Ok(id),
                // Owned by another chain
                Err(BlockFileError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }

        error!("No block file id left for {}", file_type);
        Err(BlockFileError::OutOfSpace)
    }

    /// File of the `file_type` chain that should serve a run of `block_count`
    fn file_for_new_block(&mut self, file_type: FileType, block_count: usize) -> Result<u8> {
        let threshold = self.config.almost_full_threshold();
        let max_blocks = self.layout.max_blocks() as i32;
        let mut id = file_type.base_file();

        for _ in 0..MAX_CHAIN_HOPS {
            let (need_to_grow, at_capacity) = {
                let header = self.file_mut(id)?.header();
                (
                    header.need_to_grow(block_count, threshold),
                    header.max_entries() >= max_blocks,
                )
            };
            if !need_to_grow {
                return Ok(id);
            }

            if at_capacity {
                id = self.next_file(file_type, id)?;
                continue;
            }

            let step = self.config.growth_step;
            if let Err(e) = self.file_mut(id)?.grow(step) {
                if e.is_fatal_for_file() {
                    self.reject(id);
                }
                return Err(e);
            }
            return Ok(id);
        }

        error!("Chain of {} is too long", file_type);
        Err(BlockFileError::OutOfSpace)
    }

    /// Allocate a run of `block_count` blocks of `file_type`
    pub fn allocate(&mut self, file_type: FileType, block_count: usize) -> Result<Addr> {
        self.check_init()?;
        if block_count == 0 || block_count > MAX_NUM_BLOCKS {
            return Err(BlockFileError::invalid(format!(
                "cannot allocate {} blocks",
                block_count
            )));
        }

        let mut repaired = false;
        loop {
            let id = self.file_for_new_block(file_type, block_count)?;
            let result = self.file_mut(id)?.header_mut().create_run(block_count);

            match result {
                Ok(index) => {
                    let addr = Addr::new(file_type, block_count, id, index)?;
                    trace!("Allocated {} ({} x {})", addr, block_count, file_type);
                    return Ok(addr);
                }
                Err(BlockFileError::CorruptedAllocationState { .. }) if !repaired => {
                    // Counters were rebuilt from the map; one more try.
                    warn!("Retrying allocation in block file {} after repair", id);
                    repaired = true;
                }
                Err(e @ BlockFileError::CorruptedAllocationState { .. }) => {
                    self.reject(id);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The open file holding `addr`, after checking the run is allocated there
    fn locate(&mut self, addr: Addr) -> Result<&mut BlockFile<S::Handle>> {
        let file_type = match addr.file_type() {
            Some(file_type) if addr.is_block_file() => file_type,
            _ => {
                return Err(BlockFileError::invalid(format!(
                    "{} is not a block file address",
                    addr
                )))
            }
        };

        let expected_size = self.config.entry_size(file_type);
        let file = self.file_mut(addr.file_number())?;
        let header = file.header();
        let start = addr.start_block();
        let count = addr.num_blocks();

        if header.entry_size() != expected_size as i32
            || start as u64 + count as u64 > header.max_entries().max(0) as u64
            || !header.is_used(start, count)
        {
            return Err(BlockFileError::invalid(format!(
                "{} does not name an allocated run",
                addr
            )));
        }
        Ok(file)
    }

    /// Release the run at `addr`
    ///
    /// With `wipe`, the blocks are zeroed before the run is released. An
    /// overflow file left with no entries is removed from its chain and
    /// deleted.
    pub fn free(&mut self, addr: Addr, wipe: bool) -> Result<()> {
        self.check_init()?;
        let file = self.locate(addr)?;

        if wipe {
            file.zero_blocks(addr.start_block(), addr.num_blocks())?;
        }
        let mut header = file.header_mut();
        header.delete_run(addr.start_block(), addr.num_blocks())?;
        let now_empty = header.num_entries() == 0;

        trace!("Freed {}", addr);

        let id = addr.file_number();
        if now_empty && id >= FIRST_ADDITIONAL_BLOCK_FILE {
            if let Some(file_type) = addr.file_type() {
                self.remove_empty_files(file_type);
            }
        }
        Ok(())
    }

    /// True if `addr` names a run that is currently allocated
    pub fn validate(&mut self, addr: Addr) -> bool {
        self.init && self.locate(addr).is_ok()
    }

    /// Byte offset of the run at `addr` inside its file
    pub fn file_offset(&mut self, addr: Addr) -> Result<u64> {
        self.check_init()?;
        let file = self.locate(addr)?;
        Ok(file.block_offset(addr.start_block()))
    }

    fn check_run_bounds(&self, addr: Addr, offset: usize, len: usize) -> Result<()> {
        let run_len = addr
            .file_type()
            .map(|ft| self.config.entry_size(ft) as usize * addr.num_blocks())
            .unwrap_or(0);
        if offset.checked_add(len).map_or(true, |end| end > run_len) {
            return Err(BlockFileError::invalid(format!(
                "{} bytes at offset {} overrun the {} byte run {}",
                len, offset, run_len, addr
            )));
        }
        Ok(())
    }

    /// Read from the run at `addr`, starting `offset` bytes into it
    pub fn read_block(&mut self, addr: Addr, buf: &mut [u8], offset: usize) -> Result<()> {
        self.check_init()?;
        self.check_run_bounds(addr, offset, buf.len())?;
        let file = self.locate(addr)?;
        let position = file.block_offset(addr.start_block()) + offset as u64;
        file.read_at(buf, position)
    }

    /// Write into the run at `addr`, starting `offset` bytes into it
    pub fn write_block(&mut self, addr: Addr, buf: &[u8], offset: usize) -> Result<()> {
        self.check_init()?;
        self.check_run_bounds(addr, offset, buf.len())?;
        let file = self.locate(addr)?;
        let position = file.block_offset(addr.start_block()) + offset as u64;
        file.write_at(buf, position)
    }

    /// Unlink and delete empty overflow files of the `file_type` chain
    ///
    /// Failures are logged; the chain is left as far as it was fixed.
    fn remove_empty_files(&mut self, file_type: FileType) {
        let mut id = file_type.base_file();

        for _ in 0..MAX_CHAIN_HOPS {
            let next = match self.next_in_chain(id) {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    warn!("Stopped cleaning chain of {} at file {}: {}", file_type, id, e);
                    return;
                }
            };

            let (empty, after) = match self.file_mut(next) {
                Ok(file) => {
                    let header = file.header();
                    (header.num_entries() == 0, header.next_file())
                }
                Err(e) => {
                    warn!("Cannot inspect block file {}: {}", next, e);
                    return;
                }
            };
            if !empty {
                id = next;
                continue;
            }

            // Splice `next` out before deleting it.
            match self.file_mut(id) {
                Ok(file) => {
                    file.header_mut().update(|h| h.set_next_file(after));
                    if let Err(e) = file.flush() {
                        warn!("Failed to flush block file {}: {}", id, e);
                    }
                }
                Err(e) => {
                    warn!("Cannot unlink block file {}: {}", next, e);
                    return;
                }
            }

            self.files[next as usize] = None;
            let path = self.file_path(next);
            match self.store.delete(&path) {
                Ok(()) => info!("Deleted empty block file {}", next),
                Err(e) => warn!("Failed to delete block file {}: {}", next, e),
            }
        }
    }

    /// Capacity and usage per size class
    ///
    /// Files that cannot be opened are left out of the report.
    pub fn report_statistics(&mut self) -> BlockFileStats {
        let mut report = BlockFileStats::default();
        if !self.init {
            return report;
        }

        for file_type in FileType::ALL {
            let mut stats = ClassStats::new(file_type);
            let mut id = file_type.base_file();

            for _ in 0..MAX_CHAIN_HOPS {
                match self.file_mut(id) {
                    Ok(file) => {
                        let header = file.header();
                        stats.record_file(header.max_entries(), header.empty_blocks());
                    }
                    Err(e) => {
                        warn!("Skipping block file {} in statistics: {}", id, e);
                        break;
                    }
                }

                match self.next_in_chain(id) {
                    Ok(Some(next)) => id = next,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped walking chain of {}: {}", file_type, e);
                        break;
                    }
                }
            }

            debug!(
                "{}: {} files, {}/{} blocks used",
                file_type, stats.files, stats.used_blocks, stats.max_blocks
            );
            report.classes.push(stats);
        }
        report
    }

    /// Sync and release every open file
    ///
    /// Every file is released even when one fails to sync; the first error is
    /// returned.
    pub fn close(&mut self) -> Result<()> {
        if !self.init {
            return Ok(());
        }
        self.init = false;

        let mut first_error = None;
        for slot in self.files.iter_mut() {
            if let Some(mut file) = slot.take() {
                if let Err(e) = file.sync() {
                    error!("Failed to sync block file {}: {}", file.id(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!("Closed block files in {}", self.path.display());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: FileStore> Drop for BlockFiles<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing block files: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> BlockFilesConfig {
        BlockFilesConfig {
            max_blocks: 1024,
            growth_step: 256,
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_init() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();

        assert!(matches!(
            files.allocate(FileType::Block256, 1),
            Err(BlockFileError::NotInitialized)
        ));
        assert!(matches!(
            files.free(Addr::from_value(0xA000_0000), false),
            Err(BlockFileError::NotInitialized)
        ));
        assert!(!files.validate(Addr::from_value(0xA000_0000)));
        assert!(files.report_statistics().classes.is_empty());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = BlockFilesConfig {
            max_blocks: 1000,
            ..Default::default()
        };
        assert!(matches!(
            BlockFiles::open_dir(dir.path(), config),
            Err(BlockFileError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_file_names() {
        let dir = TempDir::new().unwrap();
        let files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        assert_eq!(files.file_path(0), dir.path().join("data_0"));
        assert_eq!(files.file_path(255), dir.path().join("data_255"));
    }

    #[test]
    fn test_init_creates_base_files() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        files.init(true).unwrap();
        assert!(files.is_initialized());

        for file_type in FileType::ALL {
            let id = file_type.base_file();
            assert!(files.file_path(id).exists());
            let header = files.file_header(id).unwrap();
            assert_eq!(header.this_file, id as i16);
            assert_eq!(header.entry_size as u32, files.config().entry_size(file_type));
        }
        assert!(!files.file_path(4).exists());
    }

    #[test]
    fn test_init_without_files_fails() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        assert!(matches!(
            files.init(false),
            Err(BlockFileError::InitFailed { file: 0, .. })
        ));
        assert!(!files.is_initialized());
    }

    #[test]
    fn test_allocate_invalid_count() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        files.init(true).unwrap();

        assert!(matches!(
            files.allocate(FileType::Block1K, 0),
            Err(BlockFileError::InvalidArgument(_))
        ));
        assert!(matches!(
            files.allocate(FileType::Block1K, 5),
            Err(BlockFileError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_first_allocation_grows_base_file() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        files.init(true).unwrap();

        let addr = files.allocate(FileType::Block4K, 2).unwrap();
        assert_eq!(addr.file_number(), 3);
        assert_eq!(addr.start_block(), 0);
        assert_eq!(addr.num_blocks(), 2);
        assert_eq!(addr.file_type(), Some(FileType::Block4K));

        let header = files.file_header(3).unwrap();
        assert_eq!(header.max_entries, 256);
        assert_eq!(header.num_entries, 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut files = BlockFiles::open_dir(dir.path(), small_config()).unwrap();
        files.init(true).unwrap();
        files.allocate(FileType::Rankings, 1).unwrap();

        files.close().unwrap();
        assert!(!files.is_initialized());
        files.close().unwrap();
        assert!(matches!(
            files.allocate(FileType::Rankings, 1),
            Err(BlockFileError::NotInitialized)
        ));
    }
}
