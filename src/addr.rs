//! Size classes and packed block addresses
//!
//! An [`Addr`] is a single `u32` naming a run of blocks inside one block file:
//!
//! ```text
//!  31  30..28     27..26        25..18       17..0
//! ┌───┬─────────┬────────────┬────────────┬──────────────┐
//! │ I │ type    │ blocks - 1 │ file id    │ start block  │
//! └───┴─────────┴────────────┴────────────┴──────────────┘
//! ```
//!
//! `I` is the initialized bit; a zero value is the null address.

use crate::error::{BlockFileError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest run, in blocks, a single allocation may span.
pub const MAX_NUM_BLOCKS: usize = 4;

/// Number of base files, one per size class.
pub const NUM_BASE_FILES: u8 = 4;

/// First id handed out to overflow files.
pub const FIRST_ADDITIONAL_BLOCK_FILE: u8 = NUM_BASE_FILES;

/// Highest file id the address format can name.
pub const MAX_BLOCK_FILE: u8 = u8::MAX;

const INITIALIZED_MASK: u32 = 0x8000_0000;
const FILE_TYPE_MASK: u32 = 0x7000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const NUM_BLOCKS_MASK: u32 = 0x0C00_0000;
const NUM_BLOCKS_OFFSET: u32 = 26;
const FILE_NUMBER_MASK: u32 = 0x03FC_0000;
const FILE_NUMBER_OFFSET: u32 = 18;
const START_BLOCK_MASK: u32 = 0x0003_FFFF;

/// Largest start block an address can carry.
pub const MAX_START_BLOCK: u32 = START_BLOCK_MASK;

/// Block size class
///
/// Each class owns one base file and the chain of overflow files hanging off
/// it. The byte size of a block comes from configuration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// Small fixed records (36-byte blocks by default)
    Rankings = 1,
    /// 256-byte blocks
    Block256 = 2,
    /// 1 KiB blocks
    Block1K = 3,
    /// 4 KiB blocks
    Block4K = 4,
}

impl FileType {
    pub const ALL: [FileType; 4] = [
        FileType::Rankings,
        FileType::Block256,
        FileType::Block1K,
        FileType::Block4K,
    ];

    /// Parse a size class from its encoded value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FileType::Rankings),
            2 => Some(FileType::Block256),
            3 => Some(FileType::Block1K),
            4 => Some(FileType::Block4K),
            _ => None,
        }
    }

    /// Zero-based position of this class in per-class tables
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Id of the base file anchoring this class's chain
    pub fn base_file(self) -> u8 {
        self as u8 - 1
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Rankings => "rankings",
            FileType::Block256 => "block-256",
            FileType::Block1K => "block-1k",
            FileType::Block4K => "block-4k",
        };
        f.write_str(name)
    }
}

/// Packed address of an allocated run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(u32);

impl Addr {
    /// The null address
    pub const NULL: Addr = Addr(0);

    /// Build an address for `num_blocks` blocks starting at `start_block` of
    /// file `file_number`.
    pub fn new(
        file_type: FileType,
        num_blocks: usize,
        file_number: u8,
        start_block: u32,
    ) -> Result<Self> {
        if num_blocks == 0 || num_blocks > MAX_NUM_BLOCKS {
            return Err(BlockFileError::invalid(format!(
                "run of {} blocks cannot be addressed",
                num_blocks
            )));
        }
        if start_block > MAX_START_BLOCK {
            return Err(BlockFileError::invalid(format!(
                "start block {} exceeds the address range",
                start_block
            )));
        }

        Ok(Addr(
            INITIALIZED_MASK
                | ((file_type as u32) << FILE_TYPE_OFFSET)
                | (((num_blocks as u32) - 1) << NUM_BLOCKS_OFFSET)
                | ((file_number as u32) << FILE_NUMBER_OFFSET)
                | start_block,
        ))
    }

    /// Reinterpret a stored value
    pub const fn from_value(value: u32) -> Self {
        Addr(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_initialized(self) -> bool {
        self.0 & INITIALIZED_MASK != 0
    }

    /// True if the address names a run inside a block file
    pub fn is_block_file(self) -> bool {
        self.is_initialized() && self.file_type().is_some()
    }

    pub fn file_type(self) -> Option<FileType> {
        FileType::from_u8(((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET) as u8)
    }

    pub const fn num_blocks(self) -> usize {
        (((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1) as usize
    }

    pub const fn file_number(self) -> u8 {
        ((self.0 & FILE_NUMBER_MASK) >> FILE_NUMBER_OFFSET) as u8
    }

    pub const fn start_block(self) -> u32 {
        self.0 & START_BLOCK_MASK
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
