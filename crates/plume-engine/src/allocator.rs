//! Work distribution: the batch allocator.
//!
//! Workers pull [`WorkAssignment`]s from a single mutex-guarded cursor.
//! Within one particle phase the assignments are pairwise disjoint and
//! cover exactly `[0, releasable_boundary)`. Block *n* of a phase always
//! starts at `n * block_size` and carries random stream *n*, so the
//! mapping from particles to streams does not depend on which worker asks
//! first.

use std::error::Error;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plume_core::{SimTime, StreamIndex};

use crate::rng::{RandomStreams, StreamLease};

/// A contiguous block of particle indices plus its random stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkAssignment {
    /// First index (inclusive).
    pub start: usize,
    /// Last index (exclusive).
    pub end: usize,
    /// Random stream for this block.
    pub stream: StreamIndex,
}

impl WorkAssignment {
    /// Indices covered by this block.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Number of indices covered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the block covers no index. Never true for issued blocks.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Errors from reconfiguring the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// A run is active; reconfiguration would change the block/stream
    /// mapping mid-phase.
    Running,
    /// Block size must be at least 1.
    ZeroBlockSize,
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "allocator is frozen while a run is active"),
            Self::ZeroBlockSize => write!(f, "block size must be at least 1"),
        }
    }
}

impl Error for AllocatorError {}

struct Cursor {
    next_start: usize,
    releasable: usize,
    next_stream: u32,
    block_size: usize,
    seed: u64,
    blocks_issued: u64,
    particles_assigned: u64,
}

/// Hands out non-overlapping index ranges of the particle pool.
pub struct BatchAllocator {
    pool_len: usize,
    cursor: Mutex<Cursor>,
    streams: Mutex<Arc<RandomStreams>>,
    frozen: AtomicBool,
}

// Compile-time assertion: BatchAllocator must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<BatchAllocator>();
};

impl BatchAllocator {
    /// Allocator for a pool of `pool_len` particles.
    pub fn new(pool_len: usize, block_size: usize, seed: u64) -> Result<Self, AllocatorError> {
        if block_size == 0 {
            return Err(AllocatorError::ZeroBlockSize);
        }
        Ok(Self {
            pool_len,
            cursor: Mutex::new(Cursor {
                next_start: 0,
                releasable: 0,
                next_stream: 0,
                block_size,
                seed,
                blocks_issued: 0,
                particles_assigned: 0,
            }),
            streams: Mutex::new(Arc::new(RandomStreams::new(
                seed,
                RandomStreams::required(pool_len, block_size),
            ))),
            frozen: AtomicBool::new(false),
        })
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn regenerate_streams(&self, seed: u64, block_size: usize) {
        let fresh = RandomStreams::new(seed, RandomStreams::required(self.pool_len, block_size));
        *self.streams.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
    }

    /// Next block of the current phase, or `None` once the releasable
    /// prefix is exhausted.
    pub fn next_batch(&self) -> Option<WorkAssignment> {
        let mut c = self.cursor();
        if c.next_start >= c.releasable {
            return None;
        }
        let start = c.next_start;
        let end = start.saturating_add(c.block_size).min(c.releasable);
        let stream = StreamIndex(c.next_stream);
        c.next_start = end;
        c.next_stream += 1;
        c.blocks_issued += 1;
        c.particles_assigned += (end - start) as u64;
        Some(WorkAssignment { start, end, stream })
    }

    /// Check out the random stream of a block.
    pub fn lease(&self, stream: StreamIndex) -> StreamLease {
        let streams: Arc<RandomStreams> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        streams.checkout(stream)
    }

    /// Change the block size and regenerate the streams.
    pub fn configure_block_size(&self, block_size: usize) -> Result<(), AllocatorError> {
        if self.is_frozen() {
            return Err(AllocatorError::Running);
        }
        if block_size == 0 {
            return Err(AllocatorError::ZeroBlockSize);
        }
        let seed = {
            let mut c = self.cursor();
            c.block_size = block_size;
            c.seed
        };
        self.regenerate_streams(seed, block_size);
        Ok(())
    }

    /// Change the global seed and regenerate the streams.
    pub fn reseed(&self, seed: u64) -> Result<(), AllocatorError> {
        if self.is_frozen() {
            return Err(AllocatorError::Running);
        }
        let block_size = {
            let mut c = self.cursor();
            c.seed = seed;
            c.block_size
        };
        self.regenerate_streams(seed, block_size);
        Ok(())
    }

    /// Extend the releasable boundary past every particle whose insertion
    /// time is at or before `step_start`. Returns the new boundary.
    ///
    /// `insertion_times` must be sorted (the pool guarantees it). The scan
    /// starts at the current boundary, so over a whole run each particle
    /// is inspected once.
    pub fn advance_releasable_boundary(
        &self,
        insertion_times: &[SimTime],
        step_start: SimTime,
    ) -> usize {
        let from = self.cursor().releasable;
        let limit = insertion_times.len().min(self.pool_len);
        let mut boundary = from;
        while boundary < limit && insertion_times[boundary] <= step_start {
            boundary += 1;
        }
        let mut c = self.cursor();
        c.releasable = c.releasable.max(boundary);
        c.releasable
    }

    /// Start a new phase: rewind the cursor and stream counter.
    pub fn reset_cursor(&self) {
        let mut c = self.cursor();
        c.next_start = 0;
        c.next_stream = 0;
        c.blocks_issued = 0;
        c.particles_assigned = 0;
    }

    /// Back to step zero: cursor, boundary and every stream.
    pub fn reset(&self) {
        let (seed, block_size) = {
            let mut c = self.cursor();
            c.next_start = 0;
            c.releasable = 0;
            c.next_stream = 0;
            c.blocks_issued = 0;
            c.particles_assigned = 0;
            (c.seed, c.block_size)
        };
        self.regenerate_streams(seed, block_size);
    }

    /// Mark a run as active; reconfiguration is refused until `thaw`.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Mark the run as inactive.
    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    /// Whether a run is active.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Current releasable boundary.
    pub fn releasable_boundary(&self) -> usize {
        self.cursor().releasable
    }

    /// Current block size.
    pub fn block_size(&self) -> usize {
        self.cursor().block_size
    }

    /// Current global seed.
    pub fn seed(&self) -> u64 {
        self.cursor().seed
    }

    /// Number of random streams.
    pub fn stream_count(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `(blocks issued, particles assigned)` in the current phase.
    pub fn phase_counters(&self) -> (u64, u64) {
        let c = self.cursor();
        (c.blocks_issued, c.particles_assigned)
    }
}

impl fmt::Debug for BatchAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.cursor();
        f.debug_struct("BatchAllocator")
            .field("pool_len", &self.pool_len)
            .field("next_start", &c.next_start)
            .field("releasable", &c.releasable)
            .field("next_stream", &c.next_stream)
            .field("block_size", &c.block_size)
            .finish()
    }
}
