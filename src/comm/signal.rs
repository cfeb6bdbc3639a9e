//! Point-to-point signal rings and the block-level barrier protocol.
//!
//! Each device owns one `P2pState`: a table of 32-bit counters indexed by
//! (phase, block, source rank). Peers release by incrementing a counter in
//! the consumer's ring with a system-scope atomic add; the consumer
//! acquires by spinning a nonzero-guarded CAS decrement on its own ring.
//! One release/acquire pair per (block, peer) orders the producer's
//! cache-streaming stores before the consumer's non-coherent loads, so the
//! payload path needs no per-access fencing.
//!
//! Counters return to their pre-call value across every balanced phase, so
//! the rings never need resetting between collectives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::{MAX_ALL_REDUCE_BLOCKS, MAX_DEVICES};

/// Spin iterations between yields while waiting on a signal. Keeps
/// oversubscribed hosts live without giving up the fast path.
const SPIN_YIELD_INTERVAL: u32 = 64;

/// Per-device signal table: two phases so a kernel can sequence two
/// barriers without resetting state between them.
pub struct P2pState {
    signals: [[[AtomicU32; MAX_DEVICES]; MAX_ALL_REDUCE_BLOCKS]; 2],
}

impl P2pState {
    /// A zeroed signal table, ready for the first collective.
    pub fn new() -> Self {
        // AtomicU32 is not Copy; build the nested table element-wise.
        Self {
            signals: std::array::from_fn(|_| {
                std::array::from_fn(|_| std::array::from_fn(|_| AtomicU32::new(0)))
            }),
        }
    }

    /// The counter peers use to signal `src_rank`'s arrival at `block`.
    pub(crate) fn counter(&self, phase: usize, block: usize, src_rank: usize) -> &AtomicU32 {
        &self.signals[phase][block][src_rank]
    }

    /// True when every counter is zero, the steady state between
    /// collectives.
    pub fn is_quiesced(&self) -> bool {
        self.signals.iter().flatten().flatten().all(|c| c.load(Ordering::Acquire) == 0)
    }
}

impl Default for P2pState {
    fn default() -> Self {
        Self::new()
    }
}

/// Release: publish this rank's arrival to a consumer's ring.
///
/// Orders every prior store by this thread before the consumer's matching
/// acquire.
pub(crate) fn release_signal(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Release);
}

/// Acquire: consume one pending release, spinning until it arrives.
///
/// The nonzero guard makes each acquire consume exactly one release, so a
/// balanced phase leaves the counter at zero.
pub(crate) fn acquire_signal(counter: &AtomicU32) {
    let mut spins: u32 = 0;
    loop {
        let observed = counter.load(Ordering::Acquire);
        if observed > 0
            && counter
                .compare_exchange_weak(
                    observed,
                    observed - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            return;
        }
        spins = spins.wrapping_add(1);
        if spins % SPIN_YIELD_INTERVAL == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Full-group barrier for one block: release to every rank (self included,
/// keeping every column balanced), then drain one signal per rank.
pub(crate) fn block_barrier(
    states: &[Arc<P2pState>],
    rank: usize,
    world_size: usize,
    phase: usize,
    block: usize,
) {
    for peer in 0..world_size {
        release_signal(states[peer].counter(phase, block, rank));
    }
    for peer in 0..world_size {
        acquire_signal(states[rank].counter(phase, block, peer));
    }
}

/// Subgroup barrier for one block, used by the hybrid-cube-mesh kernel to
/// synchronize with its direct neighbors only. The peer's rank indexes the
/// counter column, so disjoint subgroups never collide.
pub(crate) fn block_barrier_with(
    states: &[Arc<P2pState>],
    rank: usize,
    peers: &[usize],
    phase: usize,
    block: usize,
) {
    for &peer in peers {
        release_signal(states[peer].counter(phase, block, rank));
    }
    for &peer in peers {
        acquire_signal(states[rank].counter(phase, block, peer));
    }
}
