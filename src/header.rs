//! On-disk block-file header
//!
//! Every block file starts with a fixed header followed by the block array:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ 0   magic: u32                               │
//! │ 4   version: u32                             │
//! │ 8   this_file: i16    10  next_file: i16     │
//! │ 12  entry_size: i32                          │
//! │ 16  max_entries: i32                         │
//! │ 20  num_entries: i32                         │
//! │ 24  updating: i32                            │
//! │ 28  allocation_map: u32[max_blocks / 32]     │
//! │ ..  hints: i32[4]                            │
//! │ ..  empty: i32[4]                            │
//! │ ..  zero padding to a page boundary          │
//! ├──────────────────────────────────────────────┤
//! │ block 0, block 1, ... (entry_size each)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All fields are little-endian. The map is sized for the hard block cap, not
//! the current capacity, so the header size never changes as a file grows.

use crate::addr::MAX_NUM_BLOCKS;
use crate::error::{BlockFileError, Result};

pub const BLOCK_MAGIC: u32 = 0xC104_CAC3;
pub const BLOCK_VERSION: u32 = 0x0002_0000;

/// Smallest block size a header may declare
pub const MIN_ENTRY_SIZE: u32 = 36;
/// Largest block size a header may declare
pub const MAX_ENTRY_SIZE: u32 = 4096;

/// The header is padded to a multiple of this
pub const PAGE_SIZE: usize = 4096;

pub(crate) const MAGIC_OFFSET: usize = 0;
pub(crate) const VERSION_OFFSET: usize = 4;
pub(crate) const THIS_FILE_OFFSET: usize = 8;
pub(crate) const NEXT_FILE_OFFSET: usize = 10;
pub(crate) const ENTRY_SIZE_OFFSET: usize = 12;
pub(crate) const MAX_ENTRIES_OFFSET: usize = 16;
pub(crate) const NUM_ENTRIES_OFFSET: usize = 20;
pub(crate) const UPDATING_OFFSET: usize = 24;
pub(crate) const ALLOCATION_MAP_OFFSET: usize = 28;

/// Offsets of the variable-position header fields
///
/// Only the map length depends on configuration, and everything after the
/// map shifts with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    max_blocks: u32,
}

impl HeaderLayout {
    pub const fn new(max_blocks: u32) -> Self {
        HeaderLayout { max_blocks }
    }

    /// Hard cap on blocks per file
    pub const fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Number of 32-bit words in the allocation map
    pub const fn map_words(&self) -> usize {
        self.max_blocks as usize / 32
    }

    pub const fn map_offset(&self) -> usize {
        ALLOCATION_MAP_OFFSET
    }

    pub const fn hints_offset(&self) -> usize {
        ALLOCATION_MAP_OFFSET + self.map_words() * 4
    }

    pub const fn empty_offset(&self) -> usize {
        self.hints_offset() + MAX_NUM_BLOCKS * 4
    }

    /// Bytes actually occupied by header fields
    pub const fn used_len(&self) -> usize {
        self.empty_offset() + MAX_NUM_BLOCKS * 4
    }

    /// Header size on disk, including padding
    pub const fn size(&self) -> usize {
        self.used_len().div_ceil(PAGE_SIZE) * PAGE_SIZE
    }
}

/// Owned copy of a block-file header
///
/// Used when creating files and for inspection. Live files are edited in
/// place through [`BitmapAllocator`](crate::allocator::BitmapAllocator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileHeader {
    pub magic: u32,
    pub version: u32,
    pub this_file: i16,
    pub next_file: i16,
    pub entry_size: i32,
    pub max_entries: i32,
    pub num_entries: i32,
    pub updating: i32,
    pub allocation_map: Vec<u32>,
    pub hints: [i32; MAX_NUM_BLOCKS],
    pub empty: [i32; MAX_NUM_BLOCKS],
}

impl BlockFileHeader {
    /// Header for a freshly created, empty file
    pub fn new(layout: HeaderLayout, this_file: u8, entry_size: u32) -> Self {
        BlockFileHeader {
            magic: BLOCK_MAGIC,
            version: BLOCK_VERSION,
            this_file: this_file as i16,
            next_file: 0,
            entry_size: entry_size as i32,
            max_entries: 0,
            num_entries: 0,
            updating: 0,
            allocation_map: vec![0; layout.map_words()],
            hints: [0; MAX_NUM_BLOCKS],
            empty: [0; MAX_NUM_BLOCKS],
        }
    }

    /// Serialize to `layout.size()` bytes
    pub fn to_bytes(&self, layout: HeaderLayout) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(layout.size());

        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.this_file.to_le_bytes());
        bytes.extend_from_slice(&self.next_file.to_le_bytes());
        bytes.extend_from_slice(&self.entry_size.to_le_bytes());
        bytes.extend_from_slice(&self.max_entries.to_le_bytes());
        bytes.extend_from_slice(&self.num_entries.to_le_bytes());
        bytes.extend_from_slice(&self.updating.to_le_bytes());

        for i in 0..layout.map_words() {
            let word = self.allocation_map.get(i).copied().unwrap_or(0);
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        for hint in self.hints {
            bytes.extend_from_slice(&hint.to_le_bytes());
        }
        for empty in self.empty {
            bytes.extend_from_slice(&empty.to_le_bytes());
        }

        // Pad to the page boundary
        bytes.resize(layout.size(), 0);

        bytes
    }

    /// Deserialize from the start of `bytes`
    ///
    /// Magic and version are not checked here.
    pub fn from_bytes(bytes: &[u8], layout: HeaderLayout) -> Result<Self> {
        if bytes.len() < layout.used_len() {
            return Err(BlockFileError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for block file header",
            )));
        }

        let allocation_map = (0..layout.map_words())
            .map(|i| read_u32(bytes, layout.map_offset() + i * 4))
            .collect();

        let mut hints = [0; MAX_NUM_BLOCKS];
        let mut empty = [0; MAX_NUM_BLOCKS];
        for i in 0..MAX_NUM_BLOCKS {
            hints[i] = read_i32(bytes, layout.hints_offset() + i * 4);
            empty[i] = read_i32(bytes, layout.empty_offset() + i * 4);
        }

        Ok(BlockFileHeader {
            magic: read_u32(bytes, MAGIC_OFFSET),
            version: read_u32(bytes, VERSION_OFFSET),
            this_file: read_i16(bytes, THIS_FILE_OFFSET),
            next_file: read_i16(bytes, NEXT_FILE_OFFSET),
            entry_size: read_i32(bytes, ENTRY_SIZE_OFFSET),
            max_entries: read_i32(bytes, MAX_ENTRIES_OFFSET),
            num_entries: read_i32(bytes, NUM_ENTRIES_OFFSET),
            updating: read_i32(bytes, UPDATING_OFFSET),
            allocation_map,
            hints,
            empty,
        })
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    read_u32(bytes, offset) as i32
}

pub(crate) fn read_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    write_u32(bytes, offset, value as u32);
}

pub(crate) fn write_i16(bytes: &mut [u8], offset: usize, value: i16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}
