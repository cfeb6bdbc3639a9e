//! Hybrid-cube-mesh all-reduce for 8-rank meshes that are not fully
//! connected.
//!
//! Each rank sums with its three direct link neighbors, parks the 4-way
//! partial in its relay scratch (the upper half of its peer buffer), then
//! exchanges partials with its relay neighbor to complete the 8-way total.
//! Every transfer rides a direct link; nothing is routed multi-hop.

use crate::fabric::memory::SendPtr;

use super::kernel::{block_chunks, run_grid, KernelArgs, LaunchConfig};
use super::one_shot::store_guarded;
use super::packed::Bf16x8;
use super::signal::{acquire_signal, block_barrier_with, release_signal};
use super::RELAY_SCRATCH_OFFSET;

pub(crate) fn launch(args: &KernelArgs, config: LaunchConfig) {
    let topo = args.topo.as_ref().expect("HCM kernel requires a role row");
    let neighbors = topo.neighbors;
    let relay = topo.relay;

    let local = SendPtr(args.buffers[args.rank].as_ptr());
    let remote_scratch = SendPtr(args.buffers[relay].as_ptr());
    let neighbor_srcs: [SendPtr; 3] = neighbors.map(|n| SendPtr(args.buffers[n].as_ptr()));

    run_grid(config, |block| {
        // Force whole-value capture of these `SendPtr`s: capturing only
        // their `.0` field would project through to the bare `*mut u8`,
        // which isn't `Sync`, even though `SendPtr` itself is.
        let local = &local;
        let remote_scratch = &remote_scratch;
        let neighbor_srcs = &neighbor_srcs;

        // Barrier over the direct neighbors only; their rank indices pick
        // the signal columns, so the relay column stays untouched.
        block_barrier_with(&args.states, args.rank, &neighbors, 0, block);

        // 4-way partial into the local relay scratch. Plain stores: this
        // region is re-read below on the same device.
        for offset in block_chunks(config, block, 0, args.aligned_numel) {
            // SAFETY: all four buffers staged the aligned window behind
            // the neighbor barrier; scratch writes stay inside this
            // rank's own upper half.
            unsafe {
                let mut sum = Bf16x8::load128(local.0.cast::<Bf16x8>().add(offset / 8));
                for src in neighbor_srcs {
                    let value = Bf16x8::stream_load128(src.0.cast::<Bf16x8>().add(offset / 8));
                    sum = sum.add(value);
                }
                Bf16x8::store128(
                    local.0.add(RELAY_SCRATCH_OFFSET).cast::<Bf16x8>().add(offset / 8),
                    sum,
                );
            }
        }

        // Point-to-point handshake with the relay on the phase-0 table;
        // the relay is not among the barrier participants above, so its
        // counter column is free.
        release_signal(args.states[relay].counter(0, block, args.rank));
        acquire_signal(args.states[args.rank].counter(0, block, relay));

        // Combine with the relay's 4-way partial for the 8-way total.
        for offset in block_chunks(config, block, 0, args.aligned_numel) {
            // SAFETY: the relay published its partial before releasing;
            // output stores are lane-guarded against the caller-visible
            // length.
            unsafe {
                let mine = Bf16x8::load128(
                    local.0.add(RELAY_SCRATCH_OFFSET).cast::<Bf16x8>().add(offset / 8),
                );
                let theirs = Bf16x8::stream_load128(
                    remote_scratch
                        .0
                        .add(RELAY_SCRATCH_OFFSET)
                        .cast::<Bf16x8>()
                        .add(offset / 8),
                );
                store_guarded(args.out.0, offset, args.numel, mine.add(theirs));
            }
        }

        // Trailing barrier over everyone this rank's buffer serves (the
        // three staged-data readers plus the scratch-reading relay): no
        // restaging until they have all drained.
        let readers = [neighbors[0], neighbors[1], neighbors[2], relay];
        block_barrier_with(&args.states, args.rank, &readers, 0, block);
    });
}
