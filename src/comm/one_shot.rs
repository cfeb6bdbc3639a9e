//! One-shot all-reduce: every rank reads every peer's full vector.
//!
//! Per 128-bit position, each rank pulls the staged contribution of all W
//! peers with non-coherent loads, sums in registers, and stores to its own
//! output. Total traffic is (W + 1)·N per device in a single data phase,
//! so it wins when the handshake dominates the payload.

use half::bf16;

use crate::fabric::memory::SendPtr;

use super::kernel::{block_chunks, run_grid, KernelArgs, LaunchConfig};
use super::packed::Bf16x8;
use super::signal::block_barrier;
use super::MAX_DEVICES;

pub(crate) fn launch(args: &KernelArgs, config: LaunchConfig) {
    // Rotate the peer order by the local rank so simultaneous readers
    // spread across the fabric instead of converging on one buffer.
    let mut srcs = [SendPtr(std::ptr::null_mut()); MAX_DEVICES];
    for (k, src) in srcs.iter_mut().enumerate().take(args.world_size) {
        *src = SendPtr(args.src(k));
    }

    run_grid(config, |block| {
        block_barrier(&args.states, args.rank, args.world_size, 0, block);

        for offset in block_chunks(config, block, 0, args.aligned_numel) {
            let mut sum = Bf16x8::ZERO;
            for src in srcs.iter().take(args.world_size) {
                // SAFETY: peer buffers cover the aligned window (staged
                // payload plus residue; residue lanes never survive the
                // guarded store); offsets stay in bounds and 16-byte
                // aligned.
                let value =
                    unsafe { Bf16x8::stream_load128(src.0.cast::<Bf16x8>().add(offset / 8)) };
                sum = sum.add(value);
            }
            // SAFETY: each rank writes only its own output; the final
            // fragment is lane-guarded against the caller-visible length.
            unsafe { store_guarded(args.out.0, offset, args.numel, sum) };
        }

        // Trailing barrier: no peer may restage its buffer until every
        // reader of the current window has drained.
        block_barrier(&args.states, args.rank, args.world_size, 0, block);
    });
}

/// Store a packed vector at `offset`, truncating lane-by-lane where the
/// window extends past the caller-visible length.
///
/// # Safety
/// `out` must be valid for writes covering `numel` elements rounded up to
/// the next 16-byte boundary, and `offset` must be 8-element aligned.
pub(crate) unsafe fn store_guarded(out: *mut u8, offset: usize, numel: usize, value: Bf16x8) {
    if offset + 8 <= numel {
        Bf16x8::store128(out.cast::<Bf16x8>().add(offset / 8), value);
    } else {
        let base = out.cast::<bf16>();
        for lane in 0..8 {
            if offset + lane < numel {
                base.add(offset + lane).write(value.lane(lane));
            }
        }
    }
}
