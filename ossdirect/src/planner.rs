//! Splitting an object into the parts of a multipart upload.
use std::ops::Range;

/// One part of an upload: which bytes of the object it carries, and where it falls in the upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 0-based position of this chunk in the upload
    pub index: usize,

    /// The bytes of the object in this chunk.  Empty only for the single chunk of an empty object.
    pub byte_range: Range<u64>,
}

impl ChunkDescriptor {
    /// The 1-based part number the object store uses for this chunk
    pub fn part_number(&self) -> usize {
        self.index + 1
    }

    pub fn len(&self) -> u64 {
        self.byte_range.end - self.byte_range.start
    }

    pub fn is_empty(&self) -> bool {
        self.byte_range.is_empty()
    }
}

/// How many chunks an object of `total_size` bytes is split into.
///
/// An empty object is still one (empty) chunk, because the upload can't be completed without at
/// least one part.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    assert!(chunk_size > 0, "BUG: chunk size is validated to be non-zero");

    (total_size.div_ceil(chunk_size) as usize).max(1)
}

/// Split an object of `total_size` bytes into chunks of `chunk_size`.
///
/// The chunks are in ascending order, and together cover `0..total_size` with no gaps or overlap.
/// Every chunk is exactly `chunk_size` long except the last one, which can be shorter.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let count = chunk_count(total_size, chunk_size);

    (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            let end = (start + chunk_size).min(total_size);

            ChunkDescriptor {
                index,
                byte_range: start..end,
            }
        })
        .collect()
}
