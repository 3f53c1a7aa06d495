//! Usage report for the block files

use crate::addr::FileType;
use serde::{Deserialize, Serialize};

/// Usage of one size class, summed over its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    pub file_type: FileType,
    /// Files in the chain that could be read
    pub files: u32,
    /// Current capacity in blocks
    pub max_blocks: u64,
    pub used_blocks: u64,
}

impl ClassStats {
    pub fn new(file_type: FileType) -> Self {
        ClassStats {
            file_type,
            files: 0,
            max_blocks: 0,
            used_blocks: 0,
        }
    }

    pub(crate) fn record_file(&mut self, max_entries: i32, empty_blocks: i32) {
        let max_entries = max_entries.max(0) as u64;
        let empty_blocks = empty_blocks.max(0) as u64;

        self.files += 1;
        self.max_blocks += max_entries;
        self.used_blocks += max_entries.saturating_sub(empty_blocks);
    }

    /// Used blocks as a percentage of capacity
    pub fn load(&self) -> u32 {
        if self.max_blocks == 0 {
            return 0;
        }
        (self.used_blocks * 100 / self.max_blocks) as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFileStats {
    pub classes: Vec<ClassStats>,
}

impl BlockFileStats {
    pub fn class(&self, file_type: FileType) -> Option<&ClassStats> {
        self.classes.iter().find(|c| c.file_type == file_type)
    }

    pub fn used_blocks(&self) -> u64 {
        self.classes.iter().map(|c| c.used_blocks).sum()
    }

    pub fn files(&self) -> u32 {
        self.classes.iter().map(|c| c.files).sum()
    }
}
