//! Refcounted memory blocks.

use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Destructor invoked exactly once when the last handle to an
/// externally-owned block is dropped.
pub type FreeFn = Box<dyn FnOnce(NonNull<u8>, usize) + Send>;

/// Pool-wide allocation statistics.
///
/// A stats object can be shared by any number of blocks. Counters are
/// incremented when a block is created and decremented exactly once when it
/// is destroyed, synchronized by the block's refcount reaching zero.
///
/// The stats object is itself refcounted (wrap it in an [`Arc`]); dropping
/// it while blocks are still alive is a contract violation checked in debug
/// builds.
#[derive(Debug, Default)]
pub struct BlockStats {
    total: AtomicU64,
    allocated: AtomicU64,
    total_size: AtomicU64,
    allocated_size: AtomicU64,
}

impl BlockStats {
    /// Create a fresh stats object with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks ever created against this pool.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of currently live blocks.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Total bytes ever allocated against this pool.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Bytes currently held by live blocks.
    pub fn allocated_size(&self) -> u64 {
        self.allocated_size.load(Ordering::Relaxed)
    }

    fn block_created(&self, len: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(len as u64, Ordering::Relaxed);
        self.allocated_size.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn block_destroyed(&self, len: usize) {
        let prev = self.allocated.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "block destroyed against empty stats pool");
        self.allocated_size.fetch_sub(len as u64, Ordering::Relaxed);
    }
}

impl Drop for BlockStats {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.allocated.load(Ordering::Relaxed),
            0,
            "stats pool dropped with live blocks"
        );
    }
}

/// Discriminator for how a block's bytes are owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Heap allocation owned (and freed) by the block itself.
    Heap,
    /// Foreign memory; the external owner frees it after the last handle
    /// drops.
    External,
    /// Foreign memory released through a registered destructor on the last
    /// drop.
    ExternalWithFree,
}

enum BlockData {
    Heap(Box<[u8]>),
    External {
        ptr: NonNull<u8>,
        len: usize,
    },
    ExternalWithFree {
        ptr: NonNull<u8>,
        len: usize,
        free: Option<FreeFn>,
    },
}

impl BlockData {
    fn len(&self) -> usize {
        match self {
            BlockData::Heap(data) => data.len(),
            BlockData::External { len, .. } => *len,
            BlockData::ExternalWithFree { len, .. } => *len,
        }
    }

    fn as_ptr(&self) -> *const u8 {
        match self {
            BlockData::Heap(data) => data.as_ptr(),
            BlockData::External { ptr, .. } => ptr.as_ptr(),
            BlockData::ExternalWithFree { ptr, .. } => ptr.as_ptr(),
        }
    }
}

struct BlockInner {
    data: BlockData,
    read_only: bool,
    stats: Option<Arc<BlockStats>>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        let len = self.data.len();
        if let BlockData::ExternalWithFree { ptr, len, free } = &mut self.data {
            if let Some(free) = free.take() {
                free(*ptr, *len);
            }
        }
        if let Some(stats) = &self.stats {
            stats.block_destroyed(len);
        }
    }
}

// SAFETY: heap data is Send + Sync by itself; for the external variants the
// constructors' safety contracts require the memory to remain valid and
// usable from any thread until the last handle drops.
unsafe impl Send for BlockInner {}
unsafe impl Sync for BlockInner {}

/// A refcounted, possibly-shared byte buffer.
///
/// Handles are cheap to clone (one atomic increment). The underlying bytes
/// are freed (or handed to the registered destructor) exactly once, when the
/// refcount transitions to zero.
///
/// A shared or read-only block is never mutated in place: writers either use
/// [`MemChunk::make_writable`](super::MemChunk::make_writable) or
/// [`MemBlock::unref_fixed`], both of which copy on write.
pub struct MemBlock {
    inner: Arc<BlockInner>,
}

impl MemBlock {
    /// Create a fresh, zero-initialized, heap-owned block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if `length` is 0.
    pub fn new(stats: Option<&Arc<BlockStats>>, length: usize) -> Result<Self> {
        if length == 0 {
            return Err(Error::AllocationFailed(
                "block length must be greater than 0".into(),
            ));
        }
        let data = vec![0u8; length].into_boxed_slice();
        Ok(Self::from_data(BlockData::Heap(data), false, stats))
    }

    /// Create a heap-owned block by taking ownership of existing bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if `data` is empty.
    pub fn from_vec(stats: Option<&Arc<BlockStats>>, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::AllocationFailed(
                "block length must be greater than 0".into(),
            ));
        }
        Ok(Self::from_data(
            BlockData::Heap(data.into_boxed_slice()),
            false,
            stats,
        ))
    }

    /// Wrap externally-owned memory that the caller frees after the last
    /// handle drops.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable (and, unless `read_only`,
    /// writable) bytes that stay valid and unaliased-for-writes from any
    /// thread until the last handle to this block is dropped.
    pub unsafe fn from_external(
        stats: Option<&Arc<BlockStats>>,
        ptr: NonNull<u8>,
        len: usize,
        read_only: bool,
    ) -> Self {
        debug_assert!(len > 0, "external block must not be empty");
        Self::from_data(BlockData::External { ptr, len }, read_only, stats)
    }

    /// Wrap externally-owned memory released through `free` on the last
    /// drop.
    ///
    /// The destructor runs exactly once, synchronized by the refcount
    /// transition to zero.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemBlock::from_external`]; additionally `free`
    /// must be safe to call from whichever thread drops the last handle.
    pub unsafe fn from_external_with_free(
        stats: Option<&Arc<BlockStats>>,
        ptr: NonNull<u8>,
        len: usize,
        free: impl FnOnce(NonNull<u8>, usize) + Send + 'static,
        read_only: bool,
    ) -> Self {
        debug_assert!(len > 0, "external block must not be empty");
        Self::from_data(
            BlockData::ExternalWithFree {
                ptr,
                len,
                free: Some(Box::new(free)),
            },
            read_only,
            stats,
        )
    }

    fn from_data(data: BlockData, read_only: bool, stats: Option<&Arc<BlockStats>>) -> Self {
        if let Some(stats) = stats {
            stats.block_created(data.len());
        }
        Self {
            inner: Arc::new(BlockInner {
                data,
                read_only,
                stats: stats.cloned(),
            }),
        }
    }

    /// Get the ownership kind of this block.
    pub fn kind(&self) -> BlockKind {
        match &self.inner.data {
            BlockData::Heap(_) => BlockKind::Heap,
            BlockData::External { .. } => BlockKind::External,
            BlockData::ExternalWithFree { .. } => BlockKind::ExternalWithFree,
        }
    }

    /// Length of the block in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Whether the block has zero length (never true for a live block).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the block was created read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Current number of handles to this block.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether more than one handle currently exists.
    pub fn is_shared(&self) -> bool {
        self.refcount() > 1
    }

    /// The stats pool this block was created against, if any.
    pub fn stats(&self) -> Option<&Arc<BlockStats>> {
        self.inner.stats.as_ref()
    }

    /// Get the block's bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: for external variants, the constructor contract guarantees
        // the pointer is valid for the block's lifetime; no exclusive writer
        // can exist while this shared handle is alive.
        unsafe { std::slice::from_raw_parts(self.inner.data.as_ptr(), self.inner.data.len()) }
    }

    /// Get mutable access to the block's bytes.
    ///
    /// Returns `None` if the block is read-only or shared: a shared block is
    /// never mutated in place.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.inner.read_only {
            return None;
        }
        let inner = Arc::get_mut(&mut self.inner)?;
        match &mut inner.data {
            BlockData::Heap(data) => Some(&mut data[..]),
            BlockData::External { ptr, len }
            | BlockData::ExternalWithFree { ptr, len, .. } => {
                // SAFETY: the handle is exclusive (get_mut succeeded) and the
                // block is not read-only, so the constructor contract allows
                // writing through the pointer.
                Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *len) })
            }
        }
    }

    /// Release a handle to an externally-owned fixed block whose memory the
    /// caller is about to invalidate.
    ///
    /// If this is the last handle, the block simply dies and `None` is
    /// returned. Otherwise the bytes are duplicated into a new heap-owned
    /// block (returned to the caller), and this handle is released,
    /// decrementing the original's refcount — copy-on-write under sharing.
    /// The surviving owners keep the original block untouched.
    ///
    /// Only meaningful for [`BlockKind::External`] blocks (debug-asserted).
    pub fn unref_fixed(self) -> Option<MemBlock> {
        debug_assert_eq!(
            self.kind(),
            BlockKind::External,
            "unref_fixed is only valid on external fixed blocks"
        );
        if !self.is_shared() {
            return None;
        }
        let copy = Self::from_vec(self.inner.stats.as_ref(), self.as_slice().to_vec())
            .expect("live block is never empty");
        Some(copy)
    }
}

impl Clone for MemBlock {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("read_only", &self.is_read_only())
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn leak_bytes(data: &[u8]) -> (NonNull<u8>, usize) {
        let boxed: Box<[u8]> = data.to_vec().into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut u8).unwrap();
        (ptr, len)
    }

    unsafe fn reclaim_bytes(ptr: NonNull<u8>, len: usize) {
        let slice = std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);
        drop(unsafe { Box::from_raw(slice) });
    }

    #[test]
    fn test_refcount_lifecycle() {
        let block = MemBlock::new(None, 64).unwrap();
        assert_eq!(block.refcount(), 1);

        let second = block.clone();
        assert_eq!(block.refcount(), 2);
        assert!(block.is_shared());

        drop(second);
        assert_eq!(block.refcount(), 1);
        assert!(!block.is_shared());
    }

    #[test]
    fn test_new_block_is_zeroed() {
        let block = MemBlock::new(None, 128).unwrap();
        assert!(block.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_fails() {
        assert!(MemBlock::new(None, 0).is_err());
        assert!(MemBlock::from_vec(None, Vec::new()).is_err());
    }

    #[test]
    fn test_stats_lifecycle() {
        let stats = Arc::new(BlockStats::new());

        let block = MemBlock::new(Some(&stats), 100).unwrap();
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.allocated(), 1);
        assert_eq!(stats.total_size(), 100);
        assert_eq!(stats.allocated_size(), 100);

        // A clone is not a new block
        let second = block.clone();
        assert_eq!(stats.allocated(), 1);
        drop(second);

        drop(block);
        assert_eq!(stats.allocated(), 0);
        assert_eq!(stats.allocated_size(), 0);
        // Historical counters are monotonic
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.total_size(), 100);
    }

    #[test]
    fn test_destructor_runs_exactly_once() {
        let freed = Arc::new(AtomicU32::new(0));
        let (ptr, len) = leak_bytes(&[7u8; 32]);

        let freed2 = Arc::clone(&freed);
        let block = unsafe {
            MemBlock::from_external_with_free(
                None,
                ptr,
                len,
                move |p, l| {
                    unsafe { reclaim_bytes(p, l) };
                    freed2.fetch_add(1, Ordering::SeqCst);
                },
                false,
            )
        };
        assert_eq!(block.kind(), BlockKind::ExternalWithFree);

        let second = block.clone();
        drop(block);
        assert_eq!(freed.load(Ordering::SeqCst), 0, "still referenced");

        drop(second);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_block_not_writable() {
        let mut block = MemBlock::new(None, 16).unwrap();
        assert!(block.as_mut_slice().is_some());

        let second = block.clone();
        assert!(block.as_mut_slice().is_none());
        drop(second);

        assert!(block.as_mut_slice().is_some());
    }

    #[test]
    fn test_read_only_never_writable() {
        let data = [1u8, 2, 3, 4];
        let ptr = NonNull::new(data.as_ptr() as *mut u8).unwrap();
        let mut block = unsafe { MemBlock::from_external(None, ptr, data.len(), true) };

        assert!(block.is_read_only());
        assert!(block.as_mut_slice().is_none());
        assert_eq!(block.as_slice(), &data);
    }

    #[test]
    fn test_unref_fixed_last_handle() {
        let data = [9u8; 8];
        let ptr = NonNull::new(data.as_ptr() as *mut u8).unwrap();
        let block = unsafe { MemBlock::from_external(None, ptr, data.len(), true) };

        assert!(block.unref_fixed().is_none());
    }

    #[test]
    fn test_unref_fixed_shared_copies() {
        let data = [0xABu8; 24];
        let ptr = NonNull::new(data.as_ptr() as *mut u8).unwrap();
        let original = unsafe { MemBlock::from_external(None, ptr, data.len(), false) };
        let second = original.clone();
        assert_eq!(original.refcount(), 2);

        let copy = second.unref_fixed().expect("shared handle yields a copy");

        // Original owner keeps the untouched external block
        assert_eq!(original.refcount(), 1);
        assert_eq!(original.kind(), BlockKind::External);
        assert_eq!(original.as_slice(), &data);

        // The copy is independent and heap-owned, byte-identical
        assert_eq!(copy.kind(), BlockKind::Heap);
        assert_eq!(copy.as_slice(), &data);
        assert_eq!(copy.refcount(), 1);
    }
}
