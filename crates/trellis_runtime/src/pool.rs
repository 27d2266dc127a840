//! Pool resource: a cache of reusable memory arenas.
//!
//! Every graph draws an arena when it is built and returns it when it
//! finishes; kernels reach it through `with_pool` on their contexts.
//! The number of arenas kept around adapts to demand: a periodic sample
//! measures how far in-use counts swung since the previous sample and
//! moves the cache limit towards that spread.

use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Resource name the engine registers the pool resource under
pub const POOL_RESOURCE: &str = "pool_resource";

/// Pool resource settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolResourceConfig {
    /// Arenas retaining more than this are dropped instead of cached
    pub release_threshold_bytes: usize,
    /// Lower bound of the cache limit
    pub min_cache: usize,
    /// Weight of the newest spread in the smoothed limit, in `[0, 1]`
    pub smoothing: f64,
    /// Size of each arena block
    pub block_size: usize,
}

impl PoolResourceConfig {
    /// Set the release threshold
    #[must_use]
    pub fn with_release_threshold_bytes(mut self, bytes: usize) -> Self {
        self.release_threshold_bytes = bytes;
        self
    }

    /// Set the minimum cache limit
    #[must_use]
    pub fn with_min_cache(mut self, min_cache: usize) -> Self {
        self.min_cache = min_cache;
        self
    }

    /// Set the smoothing factor
    #[must_use]
    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing.clamp(0.0, 1.0);
        self
    }
}

impl Default for PoolResourceConfig {
    fn default() -> Self {
        Self {
            release_threshold_bytes: 4 * 1024 * 1024,
            min_cache: 4,
            smoothing: 0.5,
            block_size: 64 * 1024,
        }
    }
}

/// Bump arena made of `BytesMut` blocks
#[derive(Debug)]
pub struct Pool {
    blocks: Vec<BytesMut>,
    block_size: usize,
    allocated: usize,
}

impl Pool {
    /// Create an empty arena
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size: block_size.max(1),
            allocated: 0,
        }
    }

    /// Allocate `len` zeroed bytes
    pub fn alloc(&mut self, len: usize) -> &mut [u8] {
        let fits = self
            .blocks
            .last()
            .is_some_and(|b| b.capacity() - b.len() >= len);
        if !fits {
            self.blocks
                .push(BytesMut::with_capacity(self.block_size.max(len)));
        }
        self.allocated += len;
        let last = self.blocks.len() - 1;
        let block = &mut self.blocks[last];
        let start = block.len();
        block.resize(start + len, 0);
        &mut block[start..]
    }

    /// Copy `bytes` into the arena
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> &mut [u8] {
        let out = self.alloc(bytes.len());
        out.copy_from_slice(bytes);
        out
    }

    /// Bytes handed out since the last reset
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Bytes held by the arena's blocks
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.blocks.iter().map(BytesMut::capacity).sum()
    }

    /// Forget every allocation, keeping the blocks
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.clear();
        }
        self.allocated = 0;
    }
}

/// Result of one sampling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSample {
    /// High minus low water mark since the previous sample
    pub spread: usize,
    /// New cache limit
    pub limit: usize,
    /// Arenas trimmed from the cache
    pub trimmed: usize,
}

/// Counters for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Arenas currently handed out
    pub in_use: usize,
    /// Arenas cached
    pub cached: usize,
    /// Cache limit
    pub limit: usize,
    /// Arenas allocated over the lifetime
    pub created: u64,
    /// Arenas dropped instead of cached
    pub destroyed: u64,
}

/// Adaptive arena cache
#[derive(Debug)]
pub struct PoolResource {
    config: PoolResourceConfig,
    cache: SegQueue<Pool>,
    in_use: AtomicUsize,
    high_water: AtomicUsize,
    low_water: AtomicUsize,
    limit: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl PoolResource {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: PoolResourceConfig) -> Self {
        let limit = config.min_cache;
        Self {
            config,
            cache: SegQueue::new(),
            in_use: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            low_water: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &PoolResourceConfig {
        &self.config
    }

    /// Take an arena, from the cache if possible
    pub fn get_pool(&self) -> Pool {
        let pool = self.cache.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Pool::new(self.config.block_size)
        });
        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(in_use, Ordering::SeqCst);
        pool
    }

    /// Return an arena
    pub fn put_pool(&self, mut pool: Pool) {
        let in_use = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));
        self.low_water.fetch_min(in_use, Ordering::SeqCst);

        pool.reset();
        let too_big = pool.retained_bytes() > self.config.release_threshold_bytes;
        let cache_full = self.cache.len() >= self.limit.load(Ordering::SeqCst);
        if too_big || cache_full {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.cache.push(pool);
    }

    /// Recompute the cache limit from the water marks and trim the cache
    pub fn sample(&self) -> PoolSample {
        let in_use = self.in_use.load(Ordering::SeqCst);
        let high = self.high_water.swap(in_use, Ordering::SeqCst);
        let low = self.low_water.swap(in_use, Ordering::SeqCst);
        let spread = high.saturating_sub(low);

        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let old = self.limit.load(Ordering::SeqCst) as f64;
        let smoothed = (alpha * spread as f64 + (1.0 - alpha) * old).round() as usize;
        let limit = smoothed.max(self.config.min_cache);
        self.limit.store(limit, Ordering::SeqCst);

        let mut trimmed = 0;
        while self.cache.len() > limit {
            if self.cache.pop().is_none() {
                break;
            }
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            trimmed += 1;
        }
        PoolSample {
            spread,
            limit,
            trimmed,
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use.load(Ordering::SeqCst),
            cached: self.cache.len(),
            limit: self.limit.load(Ordering::SeqCst),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl Default for PoolResource {
    fn default() -> Self {
        Self::new(PoolResourceConfig::default())
    }
}

/// The arena one graph holds; goes back to the cache on release or drop
#[derive(Debug)]
pub(crate) struct PoolLease {
    pools: Arc<PoolResource>,
    pool: Mutex<Option<Pool>>,
}

impl PoolLease {
    pub(crate) fn draw(pools: &Arc<PoolResource>) -> Self {
        Self {
            pool: Mutex::new(Some(pools.get_pool())),
            pools: Arc::clone(pools),
        }
    }

    /// Run `f` on the arena unless it was already returned
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> Option<R> {
        self.pool.lock().as_mut().map(f)
    }

    pub(crate) fn release(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            self.pools.put_pool(pool);
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.release();
    }
}
