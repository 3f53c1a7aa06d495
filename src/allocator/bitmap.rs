//! Nibble-bitmap allocator over a block-file header
//!
//! [`BitmapAllocator`] is a typed view over the raw header bytes of one block
//! file. It reads and writes header fields in place, so when the bytes are a
//! memory map every change lands in the file directly.
//!
//! Crash ordering: every mutation runs inside [`BitmapAllocator::update`],
//! which raises the `updating` flag first and clears it last. Allocation bumps
//! `num_entries` before setting map bits and release clears map bits before
//! dropping `num_entries`, with a fence in between. An interrupted operation
//! therefore leaves `num_entries` at or above the number of used blocks, and
//! repair only ever has to lower it.

use super::block_type;
use crate::addr::MAX_NUM_BLOCKS;
use crate::error::{BlockFileError, Result};
use crate::header::{
    self, BlockFileHeader, HeaderLayout, ENTRY_SIZE_OFFSET, MAGIC_OFFSET, MAX_ENTRIES_OFFSET,
    NEXT_FILE_OFFSET, NUM_ENTRIES_OFFSET, THIS_FILE_OFFSET, UPDATING_OFFSET, VERSION_OFFSET,
};
use std::sync::atomic::{fence, Ordering};

/// Bitmap allocator bound to one header region
///
/// `B` is any byte buffer: a memory-mapped header in production, a `Vec<u8>`
/// in tests. Read-only queries need `AsRef<[u8]>`; mutation also needs
/// `AsMut<[u8]>`.
#[derive(Debug, Clone)]
pub struct BitmapAllocator<B> {
    buf: B,
    layout: HeaderLayout,
}

fn check_run_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_NUM_BLOCKS {
        return Err(BlockFileError::invalid(format!(
            "run size {} outside [1, {}]",
            size, MAX_NUM_BLOCKS
        )));
    }
    Ok(())
}

impl<B: AsRef<[u8]>> BitmapAllocator<B> {
    /// Wrap a header buffer
    pub fn new(buf: B, layout: HeaderLayout) -> Result<Self> {
        if buf.as_ref().len() < layout.used_len() {
            return Err(BlockFileError::invalid(format!(
                "header buffer of {} bytes is smaller than the {} byte layout",
                buf.as_ref().len(),
                layout.used_len()
            )));
        }
        Ok(BitmapAllocator { buf, layout })
    }

    /// Wrap a buffer already known to hold `layout.size()` bytes
    pub(crate) fn from_mapped(buf: B, layout: HeaderLayout) -> Self {
        debug_assert!(buf.as_ref().len() >= layout.used_len());
        BitmapAllocator { buf, layout }
    }

    /// Release the underlying buffer
    pub fn into_inner(self) -> B {
        self.buf
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn magic(&self) -> u32 {
        header::read_u32(self.bytes(), MAGIC_OFFSET)
    }

    pub fn version(&self) -> u32 {
        header::read_u32(self.bytes(), VERSION_OFFSET)
    }

    /// Id stored in the header (`this_file`)
    pub fn file_id(&self) -> i16 {
        header::read_i16(self.bytes(), THIS_FILE_OFFSET)
    }

    /// Next file of the chain, or 0
    pub fn next_file(&self) -> i16 {
        header::read_i16(self.bytes(), NEXT_FILE_OFFSET)
    }

    pub fn entry_size(&self) -> i32 {
        header::read_i32(self.bytes(), ENTRY_SIZE_OFFSET)
    }

    pub fn max_entries(&self) -> i32 {
        header::read_i32(self.bytes(), MAX_ENTRIES_OFFSET)
    }

    pub fn num_entries(&self) -> i32 {
        header::read_i32(self.bytes(), NUM_ENTRIES_OFFSET)
    }

    pub fn updating(&self) -> i32 {
        header::read_i32(self.bytes(), UPDATING_OFFSET)
    }

    pub fn hint(&self, i: usize) -> i32 {
        header::read_i32(self.bytes(), self.layout.hints_offset() + i * 4)
    }

    /// Number of free runs of length `i + 1`
    pub fn empty(&self, i: usize) -> i32 {
        header::read_i32(self.bytes(), self.layout.empty_offset() + i * 4)
    }

    pub fn map_word(&self, i: usize) -> u32 {
        header::read_u32(self.bytes(), self.layout.map_offset() + i * 4)
    }

    fn map_byte(&self, i: usize) -> u8 {
        self.bytes()[self.layout.map_offset() + i]
    }

    /// Map words covering the current capacity
    fn words_in_use(&self) -> usize {
        let max = usize::try_from(self.max_entries()).unwrap_or(0);
        (max / 32).min(self.layout.map_words())
    }

    /// Decoded copy of the whole header
    pub fn snapshot(&self) -> Result<BlockFileHeader> {
        BlockFileHeader::from_bytes(self.bytes(), self.layout)
    }

    /// True if some free run can hold `block_count` blocks
    pub fn can_allocate(&self, block_count: usize) -> bool {
        let first = block_count.max(1) - 1;
        (first..MAX_NUM_BLOCKS).any(|i| self.empty(i) > 0)
    }

    /// True if this file should not serve a run of `block_count` blocks
    ///
    /// Besides the plain capacity check, a file that already has a successor
    /// and fewer than `almost_full_threshold` free blocks is skipped so that
    /// it can accumulate free space before being used again.
    pub fn need_to_grow(&self, block_count: usize, almost_full_threshold: i32) -> bool {
        let first = block_count.max(1) - 1;
        let mut have_space = false;
        let mut empty_blocks = 0;
        for i in 0..MAX_NUM_BLOCKS {
            empty_blocks += self.empty(i) * (i as i32 + 1);
            if i >= first && self.empty(i) > 0 {
                have_space = true;
            }
        }

        if self.next_file() != 0 && empty_blocks < almost_full_threshold {
            return true;
        }
        !have_space
    }

    /// Blocks tracked as free by the `empty` counters
    ///
    /// A negative counter makes the total meaningless; 0 is returned then.
    pub fn empty_blocks(&self) -> i32 {
        let mut empty_blocks = 0;
        for i in 0..MAX_NUM_BLOCKS {
            if self.empty(i) < 0 {
                return 0;
            }
            empty_blocks += self.empty(i) * (i as i32 + 1);
        }
        empty_blocks
    }

    /// Number of whole free nibbles, i.e. guaranteed 4-block allocations
    pub fn minimum_allocations(&self) -> i32 {
        self.empty(MAX_NUM_BLOCKS - 1)
    }

    pub fn capacity(&self) -> i32 {
        self.max_entries()
    }

    /// Blocks whose map bit is set
    pub fn used_blocks_in_map(&self) -> i32 {
        (0..self.words_in_use())
            .map(|i| self.map_word(i).count_ones() as i32)
            .sum()
    }

    /// Cheap consistency check of the counters against the capacity
    pub fn validate_counters(&self) -> bool {
        let max_entries = self.max_entries();
        if max_entries < 0
            || max_entries > self.layout.max_blocks() as i32
            || self.num_entries() < 0
        {
            return false;
        }

        if (0..MAX_NUM_BLOCKS).any(|i| self.empty(i) < 0) {
            return false;
        }

        self.empty_blocks() + self.num_entries() <= max_entries
    }

    /// True if all `size` blocks starting at `index` are marked used
    pub fn is_used(&self, index: u32, size: usize) -> bool {
        if size == 0 || size > MAX_NUM_BLOCKS {
            return false;
        }
        let index = index as usize;
        if index % 8 + size > 8 || index + size > self.layout.max_blocks() as usize {
            return false;
        }

        let mask = (((1u32 << size) - 1) << (index % 8)) as u8;
        self.map_byte(index / 8) & mask == mask
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BitmapAllocator<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    pub(crate) fn set_next_file(&mut self, id: i16) {
        header::write_i16(self.bytes_mut(), NEXT_FILE_OFFSET, id);
    }

    pub(crate) fn set_max_entries(&mut self, value: i32) {
        header::write_i32(self.bytes_mut(), MAX_ENTRIES_OFFSET, value);
    }

    pub(crate) fn set_num_entries(&mut self, value: i32) {
        header::write_i32(self.bytes_mut(), NUM_ENTRIES_OFFSET, value);
    }

    pub(crate) fn set_updating(&mut self, value: i32) {
        header::write_i32(self.bytes_mut(), UPDATING_OFFSET, value);
    }

    pub(crate) fn set_hint(&mut self, i: usize, value: i32) {
        let offset = self.layout.hints_offset() + i * 4;
        header::write_i32(self.bytes_mut(), offset, value);
    }

    pub(crate) fn set_empty(&mut self, i: usize, value: i32) {
        let offset = self.layout.empty_offset() + i * 4;
        header::write_i32(self.bytes_mut(), offset, value);
    }

    pub(crate) fn set_map_word(&mut self, i: usize, value: u32) {
        let offset = self.layout.map_offset() + i * 4;
        header::write_u32(self.bytes_mut(), offset, value);
    }

    fn set_map_byte(&mut self, i: usize, value: u8) {
        let offset = self.layout.map_offset() + i;
        self.bytes_mut()[offset] = value;
    }

    /// Run `f` with the `updating` flag raised
    ///
    /// If the process dies inside `f` the flag stays set and the next open
    /// repairs the file.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.set_updating(1);
        fence(Ordering::SeqCst);
        let out = f(self);
        fence(Ordering::SeqCst);
        self.set_updating(0);
        out
    }

    /// Allocate a run of `size` contiguous blocks, returning its first index
    ///
    /// Runs never straddle a nibble. The run is placed at the bottom of the
    /// smallest free run that fits, so any leftover stays at the top of the
    /// nibble as a shorter free run.
    pub fn create_run(&mut self, size: usize) -> Result<u32> {
        check_run_size(size)?;

        let target = match (size..=MAX_NUM_BLOCKS).find(|&n| self.empty(n - 1) > 0) {
            Some(target) => target,
            None => return Err(BlockFileError::AllocationFailed(size)),
        };

        // Walk the map one 32-block word at a time, starting at the hint for
        // this run length and wrapping around.
        let words = self.words_in_use();
        let mut current = usize::try_from(self.hint(target - 1)).unwrap_or(0);
        for _ in 0..words {
            if current >= words {
                current = 0;
            }
            let mut map_block = self.map_word(current);

            for j in 0..8 {
                if block_type(map_block) != target {
                    map_block >>= 4;
                    continue;
                }

                let index_offset = j * 4 + 4 - target;
                let index = current * 32 + index_offset;
                let to_add = ((1u32 << size) - 1) << index_offset;

                self.update(|a| {
                    a.set_num_entries(a.num_entries() + size as i32);

                    // num_entries must never lag the map, even across a crash.
                    fence(Ordering::SeqCst);
                    a.set_map_word(current, a.map_word(current) | to_add);

                    a.set_hint(target - 1, current as i32);
                    a.set_empty(target - 1, a.empty(target - 1) - 1);
                    if target != size {
                        a.set_empty(target - size - 1, a.empty(target - size - 1) + 1);
                    }
                });

                tracing::trace!(
                    "Created run of {} at block {} (from free run of {})",
                    size,
                    index,
                    target
                );
                return Ok(index as u32);
            }
            current += 1;
        }

        // The counters promised a free run that the map does not have.
        tracing::error!(
            "No free run of {} in block file {} despite counters; repairing",
            target,
            self.file_id()
        );
        self.update(|a| {
            a.fix_allocation_counters();
            a.reconcile_num_entries();
        });
        Err(BlockFileError::CorruptedAllocationState {
            file: self.file_id() as u8,
        })
    }

    /// Release the run of `size` blocks starting at `index`
    pub fn delete_run(&mut self, index: u32, size: usize) -> Result<()> {
        check_run_size(size)?;

        let idx = index as usize;
        let max_entries = usize::try_from(self.max_entries()).unwrap_or(0);
        if idx + size > max_entries {
            return Err(BlockFileError::invalid(format!(
                "run {}+{} beyond capacity {}",
                index, size, max_entries
            )));
        }
        if idx % 4 + size > 4 {
            return Err(BlockFileError::invalid(format!(
                "run {}+{} crosses a nibble boundary",
                index, size
            )));
        }
        if !self.is_used(index, size) {
            return Err(BlockFileError::invalid(format!(
                "run {}+{} is not allocated",
                index, size
            )));
        }

        let byte_index = idx / 8;
        let mut map_block = self.map_byte(byte_index) as u32;
        if idx % 8 >= 4 {
            map_block >>= 4;
        }

        // The nibble's free run only changes if everything above the run is
        // already free.
        let bits_at_end = 4 - size - idx % 4;
        let end_mask = (0xfu32 << (4 - bits_at_end)) & 0xf;
        let update_counters = map_block & end_mask == 0;
        let new_value = map_block & !(((1u32 << size) - 1) << (idx % 4));
        let new_type = block_type(new_value);

        let to_clear = (((1u32 << size) - 1) << (idx % 8)) as u8;

        self.update(|a| {
            let byte = a.map_byte(byte_index);
            a.set_map_byte(byte_index, byte & !to_clear);

            if update_counters {
                if bits_at_end > 0 {
                    a.set_empty(bits_at_end - 1, a.empty(bits_at_end - 1) - 1);
                }
                a.set_empty(new_type - 1, a.empty(new_type - 1) + 1);
            }

            fence(Ordering::SeqCst);
            a.set_num_entries(a.num_entries() - size as i32);
        });

        tracing::trace!("Deleted run of {} at block {}", size, index);
        Ok(())
    }

    /// Recompute `empty` from the map and reset `hints`
    ///
    /// Leaves `num_entries` alone; see [`reconcile_num_entries`](Self::reconcile_num_entries).
    pub fn fix_allocation_counters(&mut self) {
        let mut empty = [0i32; MAX_NUM_BLOCKS];
        for i in 0..self.words_in_use() {
            let mut map_block = self.map_word(i);
            for _ in 0..8 {
                let t = block_type(map_block);
                if t > 0 {
                    empty[t - 1] += 1;
                }
                map_block >>= 4;
            }
        }

        for (i, &count) in empty.iter().enumerate() {
            self.set_hint(i, 0);
            self.set_empty(i, count);
        }
    }

    /// Bring `num_entries` back inside what the map allows
    ///
    /// Clamped from above by the capacity left after free runs, and from
    /// below by the number of set bits.
    pub fn reconcile_num_entries(&mut self) {
        let max_entries = self.max_entries();
        let empty_blocks = self.empty_blocks();
        let used = self.used_blocks_in_map();

        let mut num_entries = self.num_entries();
        if num_entries + empty_blocks > max_entries {
            num_entries = max_entries - empty_blocks;
        }
        if num_entries < used {
            num_entries = used;
        }
        self.set_num_entries(num_entries);
    }

    /// Raise the capacity to `new_max`; the new space is whole free nibbles
    pub fn extend(&mut self, new_max: i32) -> Result<()> {
        let max_entries = self.max_entries();
        if new_max < max_entries || new_max > self.layout.max_blocks() as i32 {
            return Err(BlockFileError::invalid(format!(
                "cannot extend capacity from {} to {}",
                max_entries, new_max
            )));
        }

        self.update(|a| {
            let added = (new_max - max_entries) / 4;
            a.set_empty(MAX_NUM_BLOCKS - 1, a.empty(MAX_NUM_BLOCKS - 1) + added);
            a.set_max_entries(new_max);
        });
        Ok(())
    }
}
