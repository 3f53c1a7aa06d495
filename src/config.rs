//! Block-file set configuration
//!
//! Loaded from TOML or built in code; passed explicitly to
//! [`BlockFiles::new`](crate::file_set::BlockFiles::new).
//!
//! ```toml
//! entry_sizes = [36, 256, 1024, 4096]
//! max_blocks = 65024
//! growth_step = 1024
//! ```

use crate::addr::{FileType, MAX_NUM_BLOCKS, MAX_START_BLOCK};
use crate::error::{BlockFileError, Result};
use crate::header::{HeaderLayout, MAX_ENTRY_SIZE, MIN_ENTRY_SIZE};
use serde::{Deserialize, Serialize};

/// Default block sizes for the four size classes
pub const DEFAULT_ENTRY_SIZES: [u32; 4] = [36, 256, 1024, 4096];

/// Default per-file block cap; keeps the header inside two pages
pub const DEFAULT_MAX_BLOCKS: u32 = 65_024;

/// Default number of blocks added by one grow
pub const DEFAULT_GROWTH_STEP: u32 = 1024;

/// Default divisor for the "almost full" heuristic (cap / 10)
pub const DEFAULT_ALMOST_FULL_DIVISOR: u32 = 10;

/// Default file name prefix (`data_0`, `data_1`, ...)
pub const DEFAULT_FILE_PREFIX: &str = "data_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockFilesConfig {
    /// Block size in bytes for each size class, in [`FileType`] order
    pub entry_sizes: [u32; 4],

    /// Hard cap on blocks per file; sizes the on-disk allocation map
    pub max_blocks: u32,

    /// Blocks added each time a file grows
    pub growth_step: u32,

    /// A chained file with fewer than `max_blocks / almost_full_divisor` free
    /// blocks is skipped in favour of the next file. Zero disables the skip.
    pub almost_full_divisor: u32,

    /// File name prefix inside the cache directory
    pub file_prefix: String,

    /// Read the whole of file 0 once on open to warm the page cache
    pub eager_read_first_file: bool,
}

impl Default for BlockFilesConfig {
    fn default() -> Self {
        BlockFilesConfig {
            entry_sizes: DEFAULT_ENTRY_SIZES,
            max_blocks: DEFAULT_MAX_BLOCKS,
            growth_step: DEFAULT_GROWTH_STEP,
            almost_full_divisor: DEFAULT_ALMOST_FULL_DIVISOR,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            eager_read_first_file: true,
        }
    }
}

impl BlockFilesConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: BlockFilesConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (ft, &size) in FileType::ALL.iter().zip(self.entry_sizes.iter()) {
            if !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&size) {
                return Err(BlockFileError::InvalidConfig(format!(
                    "entry size {} for {} is outside [{}, {}]",
                    size, ft, MIN_ENTRY_SIZE, MAX_ENTRY_SIZE
                )));
            }
        }

        if self.max_blocks == 0 || self.max_blocks % 32 != 0 {
            return Err(BlockFileError::InvalidConfig(format!(
                "max_blocks ({}) must be a non-zero multiple of 32",
                self.max_blocks
            )));
        }

        if self.max_blocks > MAX_START_BLOCK + 1 {
            return Err(BlockFileError::InvalidConfig(format!(
                "max_blocks ({}) exceeds the address range ({})",
                self.max_blocks,
                MAX_START_BLOCK + 1
            )));
        }

        if self.growth_step == 0 || self.growth_step % 32 != 0 {
            return Err(BlockFileError::InvalidConfig(format!(
                "growth_step ({}) must be a non-zero multiple of 32",
                self.growth_step
            )));
        }

        if self.growth_step > self.max_blocks {
            return Err(BlockFileError::InvalidConfig(format!(
                "growth_step ({}) exceeds max_blocks ({})",
                self.growth_step, self.max_blocks
            )));
        }

        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\\']) {
            return Err(BlockFileError::InvalidConfig(format!(
                "file_prefix {:?} must be a plain, non-empty name",
                self.file_prefix
            )));
        }

        Ok(())
    }

    /// Block size in bytes for `file_type`
    pub fn entry_size(&self, file_type: FileType) -> u32 {
        self.entry_sizes[file_type.index()]
    }

    /// Header layout implied by `max_blocks`
    pub fn layout(&self) -> HeaderLayout {
        HeaderLayout::new(self.max_blocks)
    }

    /// Free-block threshold below which a chained file counts as almost full
    pub fn almost_full_threshold(&self) -> i32 {
        if self.almost_full_divisor == 0 {
            return 0;
        }
        (self.max_blocks / self.almost_full_divisor) as i32
    }

    /// Smallest data class whose largest run can hold `size` bytes
    ///
    /// The rankings class is reserved for fixed records and never chosen.
    /// Returns `None` when the payload belongs in a separate file.
    pub fn file_type_for_size(&self, size: usize) -> Option<FileType> {
        [FileType::Block256, FileType::Block1K, FileType::Block4K]
            .into_iter()
            .find(|&ft| size <= self.entry_size(ft) as usize * MAX_NUM_BLOCKS)
    }

    /// Number of blocks of `file_type` needed to hold `size` bytes
    pub fn blocks_for_size(&self, file_type: FileType, size: usize) -> usize {
        let entry = self.entry_size(file_type) as usize;
        size.div_ceil(entry).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = BlockFilesConfig::default();
        config.validate().unwrap();
        assert_eq!(config.entry_size(FileType::Rankings), 36);
        assert_eq!(config.entry_size(FileType::Block4K), 4096);
        assert_eq!(config.almost_full_threshold(), 6502);
    }

    #[test]
    fn test_default_layout_fits_two_pages() {
        let layout = BlockFilesConfig::default().layout();
        assert_eq!(layout.size(), 8192);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = BlockFilesConfig::from_toml_str(
            r#"
            max_blocks = 2048
            growth_step = 256
            "#,
        )
        .unwrap();
        assert_eq!(config.max_blocks, 2048);
        assert_eq!(config.growth_step, 256);
        assert_eq!(config.entry_sizes, DEFAULT_ENTRY_SIZES);
        assert_eq!(config.file_prefix, "data_");
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            BlockFilesConfig::from_toml_str("max_blocks = 100"),
            Err(BlockFileError::InvalidConfig(_))
        ));
        assert!(matches!(
            BlockFilesConfig::from_toml_str("entry_sizes = [8, 256, 1024, 4096]"),
            Err(BlockFileError::InvalidConfig(_))
        ));
        assert!(matches!(
            BlockFilesConfig::from_toml_str("growth_step = 0"),
            Err(BlockFileError::InvalidConfig(_))
        ));
        assert!(matches!(
            BlockFilesConfig::from_toml_str("file_prefix = \"../x\""),
            Err(BlockFileError::InvalidConfig(_))
        ));
        assert!(matches!(
            BlockFilesConfig::from_toml_str("max_blocks = \"lots\""),
            Err(BlockFileError::Config(_))
        ));
    }

    #[test]
    fn test_max_blocks_bounded_by_address() {
        let config = BlockFilesConfig {
            max_blocks: (MAX_START_BLOCK + 1) * 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_growth_step_bounded_by_max_blocks() {
        let config = BlockFilesConfig {
            max_blocks: 1024,
            growth_step: 2048,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BlockFileError::InvalidConfig(_))
        ));

        // Would wrap negative as a block count.
        let config = BlockFilesConfig {
            growth_step: 1 << 31,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BlockFilesConfig {
            max_blocks: 1024,
            growth_step: 1024,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_file_type_for_size() {
        let config = BlockFilesConfig::default();
        assert_eq!(config.file_type_for_size(1), Some(FileType::Block256));
        assert_eq!(config.file_type_for_size(1024), Some(FileType::Block256));
        assert_eq!(config.file_type_for_size(1025), Some(FileType::Block1K));
        assert_eq!(config.file_type_for_size(16 * 1024), Some(FileType::Block4K));
        assert_eq!(config.file_type_for_size(16 * 1024 + 1), None);

        assert_eq!(config.blocks_for_size(FileType::Block256, 0), 1);
        assert_eq!(config.blocks_for_size(FileType::Block256, 257), 2);
        assert_eq!(config.blocks_for_size(FileType::Block1K, 4096), 4);
    }
}
