//! Memory management for Quaver.
//!
//! This module provides the refcounted buffer layer that audio data moves
//! through: blocks are shared across threads by reference counting, and
//! mutation of shared or read-only data always goes through an explicit
//! copy-on-write step.
//!
//! # Architecture
//!
//! - [`MemBlock`]: refcounted byte buffer, heap-owned or externally owned
//! - [`MemChunk`]: a bounded `{block, offset, length}` view into a block
//! - [`BlockStats`]: pool-wide allocation statistics shared by blocks
//!
//! # Example
//!
//! ```rust
//! use quaver::memory::{BlockStats, MemBlock, MemChunk};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(BlockStats::new());
//! let block = MemBlock::new(Some(&stats), 1024).unwrap();
//!
//! // Cloning a handle only bumps the refcount
//! let shared = block.clone();
//! assert_eq!(block.refcount(), 2);
//!
//! // A view into the shared block; writing forces a private copy
//! let mut chunk = MemChunk::new(shared, 0, 64);
//! chunk.make_writable(64).unwrap();
//! assert_eq!(block.refcount(), 1);
//! ```

mod block;
mod chunk;

pub use block::{BlockKind, BlockStats, MemBlock};
pub use chunk::MemChunk;
