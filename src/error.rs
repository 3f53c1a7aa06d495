//! Error types for block-file operations

use thiserror::Error;

/// Block-file operation errors
///
/// Errors are split into three groups: storage failures (`Io`), problems with
/// the on-disk state of one file (`FormatMismatch`, `Truncated`,
/// `CorruptedAllocationState`, `GrowFailed`, `FileCorrupted`), and ordinary
/// capacity or caller errors.
#[derive(Error, Debug)]
pub enum BlockFileError {
    /// Underlying file-store operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic number or version of a block file did not match
    #[error("Invalid magic (0x{magic:08x}) or version (0x{version:08x}) in block file {file}")]
    FormatMismatch { file: u8, magic: u32, version: u32 },

    /// File is shorter than its header claims
    #[error("Block file {file} is truncated: {len} bytes, expected at least {expected}")]
    Truncated { file: u8, len: u64, expected: u64 },

    /// Allocation counters disagree with the bitmap
    #[error("Corrupted allocation state in block file {file}")]
    CorruptedAllocationState { file: u8 },

    /// No free run of the requested length
    #[error("Allocation failed: no free run of {0} blocks")]
    AllocationFailed(usize),

    /// Every file id of the chain is in use
    #[error("Out of space: no block file id left for a new file")]
    OutOfSpace,

    /// Out-of-range size, index or malformed address
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// File already holds the maximum number of blocks
    #[error("Block file {file} is at capacity")]
    AtCapacity { file: u8 },

    /// Extending the file failed and the header could not be repaired
    #[error("Failed to grow block file {file}")]
    GrowFailed { file: u8 },

    /// File could not be repaired and is unusable for this process
    #[error("Block file {file} is corrupted and cannot be used")]
    FileCorrupted { file: u8 },

    /// One of the base files could not be opened or created
    #[error("Failed to initialize block file {file}: {source}")]
    InitFailed {
        file: u8,
        #[source]
        source: Box<BlockFileError>,
    },

    /// Operation attempted before `init` or after `close`
    #[error("Block files are not initialized")]
    NotInitialized,

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),
}

impl BlockFileError {
    /// Returns true if the error leaves the file it came from unusable.
    pub fn is_fatal_for_file(&self) -> bool {
        matches!(
            self,
            BlockFileError::FormatMismatch { .. }
                | BlockFileError::Truncated { .. }
                | BlockFileError::GrowFailed { .. }
                | BlockFileError::FileCorrupted { .. }
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BlockFileError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BlockFileError>;
