//! Block splitting policy.
//!
//! The splitter decides where file contents break into blocks, and whether a
//! revision's change list is small enough to embed in the metadata itself.
//! It is injected so tests can force pathological splits.

use crate::data::md::BlockChanges;
use crate::data::{FileBlock, FileBody};

pub trait BlockSplitter: Send + Sync {
    /// Copies `data` into `block` at byte offset `off` (relative to the
    /// block's start), respecting the policy's block-size bound. Returns the
    /// number of bytes copied, which may be zero if the block has no room.
    fn copy_until_split(&self, block: &mut FileBlock, last_block: bool, data: &[u8], off: u64)
        -> u64;

    /// Probes a dirty block during sync: 0 to leave it as-is, a positive
    /// offset to split it there (moving the excess right), or a negative
    /// value to pull bytes in from the following block.
    fn check_split(&self, block: &FileBlock) -> i64;

    /// Whether the change list is small enough to embed in the metadata.
    fn should_embed_block_changes(&self, changes: &BlockChanges) -> bool;
}

/// Splits at a fixed maximum block size.
pub struct FixedSizeSplitter {
    max_size: usize,
    max_embed_bytes: u64,
}

impl FixedSizeSplitter {
    pub fn new(max_size: usize, max_embed_bytes: u64) -> Self {
        FixedSizeSplitter {
            max_size,
            max_embed_bytes,
        }
    }
}

impl Default for FixedSizeSplitter {
    fn default() -> Self {
        // 512 KiB blocks, 8 KiB embedded change lists.
        FixedSizeSplitter::new(512 << 10, 8 << 10)
    }
}

impl BlockSplitter for FixedSizeSplitter {
    fn copy_until_split(
        &self,
        block: &mut FileBlock,
        last_block: bool,
        data: &[u8],
        off: u64,
    ) -> u64 {
        let mut contents = match &block.body {
            FileBody::Direct(data) => data.to_vec(),
            FileBody::Indirect(_) => return 0,
        };
        let off = off as usize;
        let curr_len = contents.len();

        // A sparse write landing wholly past this block's capacity still
        // pads the final block full of zeros, so the caller's loop advances.
        if off >= self.max_size {
            if last_block && curr_len < self.max_size {
                contents.resize(self.max_size, 0);
                block.set_contents(contents.into());
            }
            return 0;
        }

        let to_copy = data.len().min(self.max_size - off);
        if to_copy == 0 {
            return 0;
        }

        // Zero-fill a gap left by a write past the current end.
        if off > curr_len {
            contents.resize(off, 0);
        }
        let copy_end = off + to_copy;
        if copy_end > contents.len() {
            contents.resize(copy_end, 0);
        }
        contents[off..copy_end].copy_from_slice(&data[..to_copy]);
        block.set_contents(contents.into());
        to_copy as u64
    }

    fn check_split(&self, block: &FileBlock) -> i64 {
        match &block.body {
            FileBody::Direct(data) if data.len() > self.max_size => self.max_size as i64,
            _ => 0,
        }
    }

    fn should_embed_block_changes(&self, changes: &BlockChanges) -> bool {
        changes.size_estimate() <= self.max_embed_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(data: &[u8]) -> FileBlock {
        let mut block = FileBlock::new_direct();
        block.set_contents(bytes::Bytes::copy_from_slice(data));
        block
    }

    #[test]
    fn copy_within_existing_block() {
        let splitter = FixedSizeSplitter::new(8, 1024);
        let mut block = direct(b"aaaaaa");
        let n = splitter.copy_until_split(&mut block, false, b"bb", 2);
        assert_eq!(n, 2);
        assert_eq!(&block.contents()[..], b"aabbaa");
    }

    #[test]
    fn any_block_caps_at_max_size() {
        let splitter = FixedSizeSplitter::new(4, 1024);
        let mut block = direct(b"aaaa");
        let n = splitter.copy_until_split(&mut block, false, b"bbbb", 2);
        assert_eq!(n, 2);
        assert_eq!(&block.contents()[..], b"aabb");
    }

    #[test]
    fn pulling_bytes_grows_a_non_final_block() {
        let splitter = FixedSizeSplitter::new(8, 1024);
        let mut block = direct(b"aaaa");
        let n = splitter.copy_until_split(&mut block, false, b"bbbb", 4);
        assert_eq!(n, 4);
        assert_eq!(&block.contents()[..], b"aaaabbbb");
    }

    #[test]
    fn final_block_grows_to_max() {
        let splitter = FixedSizeSplitter::new(4, 1024);
        let mut block = direct(b"aa");
        let n = splitter.copy_until_split(&mut block, true, b"bbbb", 2);
        assert_eq!(n, 2);
        assert_eq!(&block.contents()[..], b"aabb");
        // a full block accepts nothing more
        let n = splitter.copy_until_split(&mut block, true, b"c", 4);
        assert_eq!(n, 0);
    }

    #[test]
    fn gap_writes_are_zero_filled() {
        let splitter = FixedSizeSplitter::new(16, 1024);
        let mut block = direct(b"a");
        let n = splitter.copy_until_split(&mut block, true, b"z", 3);
        assert_eq!(n, 1);
        assert_eq!(&block.contents()[..], b"a\0\0z");
    }

    #[test]
    fn check_split_points_at_max_size() {
        let splitter = FixedSizeSplitter::new(4, 1024);
        assert_eq!(splitter.check_split(&direct(b"abc")), 0);
        assert_eq!(splitter.check_split(&direct(b"abcdef")), 4);
    }
}
