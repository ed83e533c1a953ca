//! Chunk layout and object identity for the read cache.
//!
//! - A chunk is a fixed-size, offset-aligned segment of one object generation.
//! - The last chunk of an object may be shorter than `chunk_size`.

use std::fmt;
use std::ops::Range;

/// One generation of one object. A new generation is a different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub name: String,
    pub generation: i64,
}

impl ObjectKey {
    pub fn new(name: impl Into<String>, generation: i64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    #[inline]
    pub fn chunk_index_of(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    /// Byte range of chunk `index` in an object of `object_size` bytes.
    #[inline]
    pub fn chunk_byte_range(&self, index: u64, object_size: u64) -> Range<u64> {
        let start = index * self.chunk_size;
        start.min(object_size)..(start + self.chunk_size).min(object_size)
    }

    /// Indices of the chunks overlapping `range`.
    pub fn chunks_covering(&self, range: &Range<u64>) -> Range<u64> {
        if range.start >= range.end {
            return 0..0;
        }
        self.chunk_index_of(range.start)..self.chunk_index_of(range.end - 1) + 1
    }
}
