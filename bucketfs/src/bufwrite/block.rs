//! Fixed-size write blocks and the sliding window they form.
//!
//! Only the active block is resident here: as soon as a block is full it is
//! returned to the caller, which hands it to the upload pipeline. Bytes before
//! the active block's start (the flushed boundary) can no longer change.

use crate::vfs::error::VfsError;
use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct Block {
    start: u64,
    capacity: u64,
    data: BytesMut,
}

impl Block {
    pub fn new(start: u64, capacity: u64) -> Self {
        Self {
            start,
            capacity,
            data: BytesMut::with_capacity(capacity as usize),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn filled(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn end(&self) -> u64 {
        self.start + self.filled()
    }

    pub fn is_full(&self) -> bool {
        self.filled() == self.capacity
    }

    /// Copy as much of `src` as fits at `offset_in_block`, zero-filling any
    /// gap after the current fill. Returns the number of bytes taken.
    fn write_at(&mut self, offset_in_block: u64, src: &[u8]) -> usize {
        debug_assert!(offset_in_block <= self.capacity);
        let room = (self.capacity - offset_in_block) as usize;
        let take = room.min(src.len());
        let off = offset_in_block as usize;
        let end = off + take;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[off..end].copy_from_slice(&src[..take]);
        take
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

/// Window of blocks for one file being written.
#[derive(Debug)]
pub struct BlockStore {
    block_size: u64,
    active: Option<Block>,
    // start of the active (or next) block; everything before is handed off
    boundary: u64,
    allocated: usize,
}

impl BlockStore {
    pub fn new(block_size: u64, start: u64) -> Self {
        Self {
            block_size,
            active: None,
            boundary: start,
            allocated: 0,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Offset below which bytes have been handed to the uploader.
    pub fn flushed_boundary(&self) -> u64 {
        self.boundary
    }

    /// Blocks allocated over the lifetime of this window.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Highest offset written so far.
    pub fn high_water(&self) -> u64 {
        self.active.as_ref().map_or(self.boundary, Block::end)
    }

    pub fn check_offset(&self, offset: u64) -> Result<(), VfsError> {
        if offset < self.boundary {
            return Err(VfsError::OutOfOrderWrite {
                offset,
                boundary: self.boundary,
            });
        }
        Ok(())
    }

    /// Number of blocks that become full if the window is filled up to `end`.
    pub fn completions_until(&self, end: u64) -> u64 {
        end.saturating_sub(self.boundary) / self.block_size
    }

    fn active_mut(&mut self) -> &mut Block {
        if self.active.is_none() {
            self.allocated += 1;
        }
        let (start, cap) = (self.boundary, self.block_size);
        self.active.get_or_insert_with(|| Block::new(start, cap))
    }

    fn rotate(&mut self, done: &mut Vec<Block>) {
        if self.active.as_ref().is_some_and(Block::is_full) {
            if let Some(block) = self.active.take() {
                self.boundary = block.start() + block.filled();
                done.push(block);
            }
        }
    }

    /// Write `data` at `offset` and return the blocks that became full, in
    /// offset order. The caller must have called [`Self::check_offset`].
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Vec<Block> {
        let mut done = Vec::new();
        self.pad_into(offset, &mut done);
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let block = self.active_mut();
            let took = block.write_at(pos - block.start(), rest);
            pos += took as u64;
            rest = &rest[took..];
            self.rotate(&mut done);
        }
        done
    }

    /// Zero-fill the window up to `end` and return the blocks that became full.
    pub fn pad_to(&mut self, end: u64) -> Vec<Block> {
        let mut done = Vec::new();
        self.pad_into(end, &mut done);
        done
    }

    fn pad_into(&mut self, end: u64, done: &mut Vec<Block>) {
        while self.high_water() < end {
            let block = self.active_mut();
            let from = block.filled();
            let want = (end - block.start()).min(block.capacity) - from;
            let zeros = vec![0u8; want as usize];
            block.write_at(from, &zeros);
            self.rotate(done);
        }
    }

    /// Take the trailing, possibly partial block.
    pub fn take_trailing(&mut self) -> Option<Block> {
        let block = self.active.take()?;
        self.boundary = block.end();
        Some(block)
    }

    /// Drop the buffered block without handing it off.
    pub fn discard(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_block_is_handed_off() {
        let mut store = BlockStore::new(8, 0);
        let done = store.write(0, &[1u8; 8]);
        assert_eq!(done.len(), 1);
        assert_eq!(store.allocated(), 1);
        assert_eq!(store.flushed_boundary(), 8);
        assert_eq!(store.high_water(), 8);
        assert!(store.take_trailing().is_none());
    }

    #[test]
    fn test_write_spanning_blocks() {
        let mut store = BlockStore::new(8, 0);
        let data: Vec<u8> = (0..20).collect();
        let done = store.write(0, &data);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].start(), 0);
        assert_eq!(done[1].start(), 8);
        assert_eq!(&done[1].data[..], &data[8..16]);
        let tail = store.take_trailing().unwrap();
        assert_eq!(tail.start(), 16);
        assert_eq!(tail.filled(), 4);
        assert_eq!(store.allocated(), 3);
    }

    #[test]
    fn test_overwrite_inside_active_block() {
        let mut store = BlockStore::new(8, 0);
        assert!(store.write(0, b"abcdef").is_empty());
        assert!(store.write(2, b"XY").is_empty());
        assert_eq!(store.high_water(), 6);
        let tail = store.take_trailing().unwrap();
        assert_eq!(&tail.freeze()[..], b"abXYef");
    }

    #[test]
    fn test_gap_is_zero_filled() {
        let mut store = BlockStore::new(4, 0);
        let done = store.write(6, b"z");
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].data[..], &[0, 0, 0, 0]);
        let tail = store.take_trailing().unwrap();
        assert_eq!(&tail.freeze()[..], &[0, 0, b'z']);
    }

    #[test]
    fn test_write_behind_boundary_rejected() {
        let mut store = BlockStore::new(4, 0);
        store.write(0, b"abcdef");
        assert!(store.check_offset(5).is_ok());
        let err = store.check_offset(2).unwrap_err();
        assert!(matches!(
            err,
            VfsError::OutOfOrderWrite {
                offset: 2,
                boundary: 4
            }
        ));
    }

    #[test]
    fn test_window_can_start_past_zero() {
        let mut store = BlockStore::new(4, 10);
        assert!(store.check_offset(9).is_err());
        let done = store.write(10, b"abcd");
        assert_eq!(done[0].start(), 10);
        assert_eq!(store.completions_until(22), 2);
    }
}
