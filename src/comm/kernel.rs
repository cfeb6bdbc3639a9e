//! Grid geometry and block execution shared by the reduction kernels.
//!
//! A kernel launch is a grid of up to 24 blocks; every block runs the same
//! body and coordinates with the same block index on every peer device.
//! Blocks execute as scoped threads; within a block, lanes run in order
//! between the barrier points of the signal protocol, which preserves the
//! intra-block happens-before edges the protocol relies on.

use std::sync::Arc;

use crate::fabric::memory::{DeviceBuffer, SendPtr};

use super::topology::HcmTopoInfo;
use super::{
    ELEMS_PER_THREAD, MAX_ALL_REDUCE_BLOCKS, P2pState, THREADS_PER_BLOCK, WARP_SIZE,
};

/// Blocks and threads for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaunchConfig {
    pub blocks: usize,
    pub threads: usize,
}

impl LaunchConfig {
    /// Geometry for a reduction window of `aligned_numel` elements.
    ///
    /// Payloads too small to fill one block shrink to the exact warp
    /// count; larger payloads saturate blocks up to the grid cap and
    /// cover the remainder with a grid-stride loop.
    pub fn for_numel(aligned_numel: usize) -> Self {
        debug_assert_eq!(aligned_numel % (WARP_SIZE * ELEMS_PER_THREAD), 0);
        let threads_needed = aligned_numel / ELEMS_PER_THREAD;
        if threads_needed <= THREADS_PER_BLOCK {
            return Self {
                blocks: 1,
                threads: threads_needed,
            };
        }
        let blocks = threads_needed
            .div_ceil(THREADS_PER_BLOCK)
            .min(MAX_ALL_REDUCE_BLOCKS);
        let warps_needed = threads_needed / WARP_SIZE;
        let threads = (warps_needed.div_ceil(blocks) * WARP_SIZE).min(THREADS_PER_BLOCK);
        Self { blocks, threads }
    }

    /// Threads across the whole grid.
    pub fn grid_threads(&self) -> usize {
        self.blocks * self.threads
    }
}

/// Everything a reduction kernel needs, independent of algorithm.
pub(crate) struct KernelArgs {
    pub rank: usize,
    pub world_size: usize,
    /// Caller-visible element count; stores past it are lane-guarded.
    pub numel: usize,
    /// Element count rounded up to the packed-warp multiple.
    pub aligned_numel: usize,
    /// Peer buffers in rank order; the kernels apply the rank rotation.
    pub buffers: Vec<Arc<DeviceBuffer>>,
    /// Peer signal rings in rank order.
    pub states: Vec<Arc<P2pState>>,
    /// Output base; the caller's tensor, or the aligned scratch for the
    /// two-shot tail path.
    pub out: SendPtr,
    /// Role row for the hybrid-cube-mesh kernel.
    pub topo: Option<Arc<HcmTopoInfo>>,
}

impl KernelArgs {
    /// Peer buffer base in rank-rotated order: slot `k` is the buffer of
    /// rank `(rank + k) % world_size`, so slot 0 is always the local rank.
    pub fn src(&self, k: usize) -> *mut u8 {
        self.buffers[(self.rank + k) % self.world_size].as_ptr()
    }
}

/// Run one kernel: spawn a thread per block and join the grid.
pub(crate) fn run_grid<F>(config: LaunchConfig, body: F)
where
    F: Fn(usize) + Sync,
{
    std::thread::scope(|scope| {
        for block in 0..config.blocks {
            let body = &body;
            scope.spawn(move || body(block));
        }
    });
}

/// Iterate the packed chunks owned by `block`, in grid-stride order.
/// Yields element offsets that are multiples of `ELEMS_PER_THREAD`.
pub(crate) fn block_chunks(
    config: LaunchConfig,
    block: usize,
    begin_elem: usize,
    end_elem: usize,
) -> impl Iterator<Item = usize> {
    let stride = config.grid_threads() * ELEMS_PER_THREAD;
    let first = begin_elem + block * config.threads * ELEMS_PER_THREAD;
    (0..)
        .map(move |step| first + step * stride)
        .take_while(move |&chunk| chunk < end_elem)
        .flat_map(move |chunk| {
            (chunk..(chunk + config.threads * ELEMS_PER_THREAD).min(end_elem))
                .step_by(ELEMS_PER_THREAD)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_sub_block() {
        // 512 elements need 64 threads: two warps in a single block.
        let config = LaunchConfig::for_numel(512);
        assert_eq!(config, LaunchConfig { blocks: 1, threads: 64 });
    }

    #[test]
    fn test_launch_config_saturated() {
        // 1 MiB of bf16: 524288 elements, 65536 threads.
        let config = LaunchConfig::for_numel(512 * 1024);
        assert_eq!(config.blocks, MAX_ALL_REDUCE_BLOCKS);
        assert_eq!(config.threads, THREADS_PER_BLOCK);
    }

    #[test]
    fn test_launch_config_mid_size() {
        // 16384 elements need 2048 threads: two full blocks.
        let config = LaunchConfig::for_numel(16384);
        assert_eq!(config, LaunchConfig { blocks: 2, threads: 1024 });
    }

    #[test]
    fn test_block_chunks_partition_window() {
        let config = LaunchConfig { blocks: 3, threads: 64 };
        let end = 3 * 64 * ELEMS_PER_THREAD * 2 + 256;
        let mut seen: Vec<usize> = (0..config.blocks)
            .flat_map(|b| block_chunks(config, b, 0, end))
            .collect();
        seen.sort_unstable();
        let expected: Vec<usize> = (0..end).step_by(ELEMS_PER_THREAD).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_block_chunks_respect_begin() {
        let config = LaunchConfig { blocks: 2, threads: 32 };
        let chunks: Vec<usize> = block_chunks(config, 0, 1024, 1536).collect();
        assert!(chunks.iter().all(|&c| (1024..1536).contains(&c)));
        assert_eq!(chunks[0], 1024);
    }
}
