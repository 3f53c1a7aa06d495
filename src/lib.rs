//! # blockfiles - Block-File Allocation for a Disk Cache
//!
//! Small cache records live in *block files*: a page-aligned header holding an
//! allocation bitmap and free-run counters, followed by an array of fixed-size
//! blocks. Records take runs of 1 to 4 contiguous blocks.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ Header (bitmap + counters)  │  mapped into memory
//! ├─────────────────────────────┤
//! │ block 0 │ block 1 │ ...     │  entry_size bytes each
//! └─────────────────────────────┘
//! ```
//!
//! There is one base file per size class and a chain of overflow files behind
//! each one. Every header mutation raises an `updating` flag first, so a file
//! left behind by a crash is rebuilt from its bitmap on the next open.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockfiles::{BlockFiles, BlockFilesConfig, FileType, Result};
//!
//! # fn main() -> Result<()> {
//! let mut files = BlockFiles::open_dir("/tmp/cache", BlockFilesConfig::default())?;
//! files.init(true)?;
//!
//! let addr = files.allocate(FileType::Block256, 2)?;
//! files.write_block(addr, b"hello", 0)?;
//! assert!(files.validate(addr));
//!
//! files.free(addr, true)?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod allocator;
pub mod block_file;
pub mod config;
pub mod error;
pub mod file_set;
pub mod header;
pub mod io;
pub mod stats;

pub use addr::{Addr, FileType};
pub use allocator::BitmapAllocator;
pub use block_file::BlockFile;
pub use config::BlockFilesConfig;
pub use error::{BlockFileError, Result};
pub use file_set::BlockFiles;
pub use header::{BlockFileHeader, HeaderLayout, PAGE_SIZE};
pub use io::{DiskFile, DiskStore, FileHandle, FileStore};
pub use stats::{BlockFileStats, ClassStats};
