//! Bounded views into memory blocks.

use super::MemBlock;
use crate::error::Result;

/// A `{block, offset, length}` view into a [`MemBlock`].
///
/// Chunks are what actually travels between threads alongside control
/// messages: cloning a chunk only bumps the block's refcount. Writing
/// through a chunk whose block is shared or read-only goes through
/// [`MemChunk::make_writable`], which materializes a private copy of exactly
/// the viewed bytes.
#[derive(Clone, Debug)]
pub struct MemChunk {
    block: MemBlock,
    offset: usize,
    length: usize,
}

impl MemChunk {
    /// Create a view of `length` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + length` exceeds the block's length.
    pub fn new(block: MemBlock, offset: usize, length: usize) -> Self {
        assert!(
            offset + length <= block.len(),
            "chunk exceeds block bounds"
        );
        Self {
            block,
            offset,
            length,
        }
    }

    /// Create a view covering an entire block.
    pub fn from_block(block: MemBlock) -> Self {
        let length = block.len();
        Self {
            block,
            offset: 0,
            length,
        }
    }

    /// The underlying block.
    pub fn block(&self) -> &MemBlock {
        &self.block
    }

    /// Offset of the view within the block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view has zero length.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.offset..self.offset + self.length]
    }

    /// Mutable access to the viewed bytes.
    ///
    /// Returns `None` when the block is shared or read-only; call
    /// [`MemChunk::make_writable`] first.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let offset = self.offset;
        let length = self.length;
        self.block
            .as_mut_slice()
            .map(|data| &mut data[offset..offset + length])
    }

    /// Ensure the chunk's bytes can be written in place.
    ///
    /// If the underlying block is shared (refcount > 1) or read-only, a new
    /// exclusively-owned heap block of `max(len, min_length)` bytes is
    /// allocated from the same stats pool, the viewed bytes are copied to
    /// its start, and the chunk is repointed at it (offset reset to 0).
    /// Otherwise this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`](crate::Error::AllocationFailed)
    /// if the replacement block cannot be created.
    pub fn make_writable(&mut self, min_length: usize) -> Result<()> {
        if !self.block.is_shared() && !self.block.is_read_only() {
            return Ok(());
        }

        let new_len = self.length.max(min_length).max(1);
        let mut block = MemBlock::new(self.block.stats(), new_len)?;
        {
            let data = block
                .as_mut_slice()
                .expect("freshly created block is exclusive and writable");
            data[..self.length].copy_from_slice(self.as_slice());
        }
        self.block = block;
        self.offset = 0;
        Ok(())
    }

    /// Zero-fill the viewed bytes, copying on write if the block is shared
    /// or read-only.
    pub fn silence(&mut self) -> Result<()> {
        self.make_writable(self.length)?;
        if let Some(data) = self.as_mut_slice() {
            data.fill(0);
        }
        Ok(())
    }
}
