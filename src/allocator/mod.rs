//! Run allocation inside a single block file
//!
//! The allocation map is read as nibbles, each covering four consecutive
//! blocks. A nibble's *type* is the length of the free run at its top:
//!
//! ```text
//! 0000 -> 4    0001 -> 3    001x -> 2    01xx -> 1    1xxx -> 0
//! ```
//!
//! `empty[n - 1]` counts the nibbles of type `n`, so finding room for a run
//! of length `n` is a table lookup per nibble.

pub mod bitmap;

pub use bitmap::BitmapAllocator;

/// Nibble bit pattern to length of the free run at its top
const BLOCK_TYPES: [u8; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

/// Type of the low nibble of `value`
#[inline]
pub fn block_type(value: u32) -> usize {
    BLOCK_TYPES[(value & 0xf) as usize] as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_types() {
        assert_eq!(block_type(0b0000), 4);
        assert_eq!(block_type(0b0001), 3);
        assert_eq!(block_type(0b0010), 2);
        assert_eq!(block_type(0b0011), 2);
        for v in 0b0100..=0b0111 {
            assert_eq!(block_type(v), 1);
        }
        for v in 0b1000..=0b1111 {
            assert_eq!(block_type(v), 0);
        }
    }

    #[test]
    fn test_only_low_nibble_counts() {
        assert_eq!(block_type(0xfff0), 4);
        assert_eq!(block_type(0x0018), 0);
    }
}
