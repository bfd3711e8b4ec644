//! Deterministic per-block random streams.
//!
//! Block *n* of every particle phase draws from stream *n*. Each stream is
//! a ChaCha8 generator seeded from the global seed with its index as the
//! ChaCha stream id, so its output is a pure function of
//! `(seed, index)` and of the draws made on it, never of which worker
//! thread happens to process the block.
//!
//! Streams are leased: [`RandomStreams::checkout`] takes the generator out
//! of its slot and the [`StreamLease`] puts it back on drop. A slot found
//! empty means the previous holder is wedged; the lease then carries a
//! freshly derived generator and reports [`replaced`](StreamLease::replaced).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plume_core::StreamIndex;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// A fixed set of independent random streams.
pub struct RandomStreams {
    seed: u64,
    slots: Vec<Mutex<Option<ChaCha8Rng>>>,
}

impl RandomStreams {
    /// Create `count` streams for `seed`, each at its initial state.
    pub fn new(seed: u64, count: usize) -> Self {
        Self {
            seed,
            slots: (0..count)
                .map(|i| Mutex::new(Some(Self::derive(seed, i))))
                .collect(),
        }
    }

    /// Number of streams required for `pool_len` particles split into
    /// blocks of `block_size`.
    pub fn required(pool_len: usize, block_size: usize) -> usize {
        pool_len.div_ceil(block_size.max(1)) + 1
    }

    /// The initial state of stream `index` for `seed`.
    pub fn derive(seed: u64, index: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(index as u64);
        rng
    }

    /// The seed these streams were derived from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no streams.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Take stream `index` out of its slot for the duration of one block.
    pub fn checkout(self: &Arc<Self>, index: StreamIndex) -> StreamLease {
        let slot = index.0 as usize;
        let taken = self.slots.get(slot).and_then(|s| lock(s).take());
        let replaced = taken.is_none();
        let rng = taken.unwrap_or_else(|| Self::derive(self.seed, slot));
        StreamLease {
            streams: Arc::clone(self),
            index,
            rng: Some(rng),
            replaced,
        }
    }

    /// Whether stream `index` is currently in its slot (not leased).
    pub fn is_available(&self, index: StreamIndex) -> bool {
        self.slots
            .get(index.0 as usize)
            .is_some_and(|s| lock(s).is_some())
    }
}

impl fmt::Debug for RandomStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomStreams")
            .field("seed", &self.seed)
            .field("len", &self.slots.len())
            .finish()
    }
}

fn lock(slot: &Mutex<Option<ChaCha8Rng>>) -> MutexGuard<'_, Option<ChaCha8Rng>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive use of one random stream; returned to its slot on drop.
pub struct StreamLease {
    streams: Arc<RandomStreams>,
    index: StreamIndex,
    rng: Option<ChaCha8Rng>,
    replaced: bool,
}

impl StreamLease {
    /// Index of the leased stream.
    pub fn index(&self) -> StreamIndex {
        self.index
    }

    /// Whether the slot was empty and the generator had to be re-derived.
    pub fn replaced(&self) -> bool {
        self.replaced
    }

    /// The leased generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        let (seed, slot) = (self.streams.seed, self.index.0 as usize);
        self.rng
            .get_or_insert_with(|| RandomStreams::derive(seed, slot))
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let Some(rng) = self.rng.take() else { return };
        if let Some(slot) = self.streams.slots.get(self.index.0 as usize) {
            let mut guard = lock(slot);
            // A replacement may already have returned its own copy.
            if guard.is_none() {
                *guard = Some(rng);
            }
        }
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("index", &self.index)
            .field("replaced", &self.replaced)
            .finish()
    }
}
