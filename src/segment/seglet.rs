//! Seglets: fixed-size memory fragments backing segments.

use std::sync::Arc;

use parking_lot::Mutex;

/// Shared pool state behind a [`SegletAllocator`].
#[derive(Debug)]
struct Pool {
    seglet_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

/// Thread-safe pool of fixed-size seglet blocks.
///
/// Allocations hand out exclusively owned [`Seglet`]s; dropping a seglet
/// returns its block to the pool.
#[derive(Debug, Clone)]
pub struct SegletAllocator {
    pool: Arc<Pool>,
}

impl SegletAllocator {
    /// Create a pool of `count` blocks of `seglet_size` bytes each.
    /// The size must be a power of two.
    pub fn new(seglet_size: usize, count: usize) -> Self {
        assert!(seglet_size.is_power_of_two());
        let free = (0..count)
            .map(|_| vec![0u8; seglet_size].into_boxed_slice())
            .collect();
        Self {
            pool: Arc::new(Pool {
                seglet_size,
                free: Mutex::new(free),
            }),
        }
    }

    /// Size of each seglet in bytes.
    pub fn seglet_size(&self) -> usize {
        self.pool.seglet_size
    }

    /// Number of blocks currently free in the pool.
    pub fn free_count(&self) -> usize {
        self.pool.free.lock().len()
    }

    /// Allocate `count` seglets, or `None` if the pool cannot satisfy
    /// the whole request.
    pub fn alloc(&self, count: usize) -> Option<Vec<Seglet>> {
        let mut free = self.pool.free.lock();
        if free.len() < count {
            return None;
        }
        let len = free.len();
        let seglets = free
            .drain(len - count..)
            .map(|block| Seglet {
                block: Some(block),
                pool: Some(Arc::clone(&self.pool)),
            })
            .collect();
        Some(seglets)
    }
}

/// One fixed-size memory fragment, exclusively owned by at most one
/// segment while attached.
#[derive(Debug)]
pub struct Seglet {
    block: Option<Box<[u8]>>,
    pool: Option<Arc<Pool>>,
}

impl Seglet {
    /// Create a free-standing seglet not backed by any pool. Used for
    /// temporary segments that move data between servers.
    pub fn standalone(size: usize) -> Self {
        Self {
            block: Some(vec![0u8; size].into_boxed_slice()),
            pool: None,
        }
    }

    /// Length of the seglet in bytes.
    pub fn len(&self) -> usize {
        self.block.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Check whether the seglet has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The seglet's bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.block.as_deref().unwrap_or(&[])
    }

    /// The seglet's bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.block.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Seglet {
    fn drop(&mut self) {
        if let (Some(block), Some(pool)) = (self.block.take(), self.pool.take()) {
            pool.free.lock().push(block);
        }
    }
}
