//! Two-shot all-reduce: reduce-scatter, then all-gather.
//!
//! Each rank owns the shard at `rank × N/W`. Phase one sums the shard
//! across all peers and publishes the result in the rank's own peer buffer
//! (slot 0 under the rotation); phase two pulls every other rank's reduced
//! shard. Roughly 2·N of traffic per device, the bandwidth-optimal shape.
//!
//! The window must already be a multiple of `world_size` packed warps; the
//! dispatcher pads into an aligned scratch output and restores the prefix,
//! keeping this inner loop free of lane guards.

use crate::fabric::memory::SendPtr;

use super::kernel::{block_chunks, run_grid, KernelArgs, LaunchConfig};
use super::packed::Bf16x8;
use super::signal::block_barrier;
use super::MAX_DEVICES;

pub(crate) fn launch(args: &KernelArgs, config: LaunchConfig) {
    debug_assert_eq!(args.aligned_numel % args.world_size, 0);
    let numel_per_rank = args.aligned_numel / args.world_size;
    let shard_start = args.rank * numel_per_rank;

    let mut srcs = [SendPtr(std::ptr::null_mut()); MAX_DEVICES];
    for (k, src) in srcs.iter_mut().enumerate().take(args.world_size) {
        *src = SendPtr(args.src(k));
    }

    run_grid(config, |block| {
        block_barrier(&args.states, args.rank, args.world_size, 0, block);

        // Reduce-scatter: sum the local shard across peers, publish the
        // result in this rank's own buffer (srcs[0] under the rotation)
        // and in the output.
        for offset in block_chunks(config, block, shard_start, shard_start + numel_per_rank) {
            let mut sum = Bf16x8::ZERO;
            for src in srcs.iter().take(args.world_size) {
                // SAFETY: staged data covers the aligned window on every
                // peer behind the phase-0 barrier.
                let value =
                    unsafe { Bf16x8::stream_load128(src.0.cast::<Bf16x8>().add(offset / 8)) };
                sum = sum.add(value);
            }
            // SAFETY: shard regions are disjoint across ranks, so this
            // rank is the only writer of these offsets during phase one.
            unsafe {
                Bf16x8::stream_store128(srcs[0].0.cast::<Bf16x8>().add(offset / 8), sum);
                Bf16x8::store128(args.out.0.cast::<Bf16x8>().add(offset / 8), sum);
            }
        }

        block_barrier(&args.states, args.rank, args.world_size, 1, block);

        // All-gather: pull every other rank's reduced shard from the
        // buffer that owns it.
        for k in 1..args.world_size {
            let src_rank = (args.rank + k) % args.world_size;
            let src_shard = src_rank * numel_per_rank;
            for offset in block_chunks(config, block, src_shard, src_shard + numel_per_rank) {
                // SAFETY: the owning rank published this shard before its
                // phase-1 release; reads and the local store stay in the
                // aligned window.
                unsafe {
                    let value =
                        Bf16x8::stream_load128(srcs[k].0.cast::<Bf16x8>().add(offset / 8));
                    Bf16x8::store128(args.out.0.cast::<Bf16x8>().add(offset / 8), value);
                }
            }
        }

        // Trailing barrier: no peer may restage its buffer until every
        // gather of the published shards has drained.
        block_barrier(&args.states, args.rank, args.world_size, 0, block);
    });
}
