//! Dispatcher: validation, staging, algorithm selection, kernel launch.
//!
//! The collective is in-place: the caller's tensor is staged into the
//! rank's peer buffer, the chosen kernel reduces into the tensor's own
//! storage, and stream order makes the result visible at `synchronize`.

use std::sync::Arc;

use tracing::debug;

use crate::fabric::memory::{DeviceBuffer, SendPtr};
use crate::fabric::stream::Stream;
use crate::fabric::tensor::{DType, DeviceTensor};
use crate::utils::config::CommConfig;
use crate::utils::error::{CommError, Result};

use super::kernel::{KernelArgs, LaunchConfig};
use super::signal::{block_barrier, P2pState};
use super::topology::{HcmTopoInfo, Topology};
use super::{
    hcm, one_shot, two_shot, AllReduceAlgo, ELEMS_PER_THREAD, MAX_DEVICES, MAX_INTRA_NODE_SIZE,
    RELAY_SCRATCH_OFFSET, WARP_SIZE,
};

/// Whether this build target provides the packed bf16 addition and the
/// atomic/load/store encodings the kernels require. The host substrate
/// carries all of them on every supported target, so this is the
/// capability seam rather than a runtime probe.
pub fn is_supported() -> bool {
    true
}

/// Allocate one zeroed signal ring. Called once per device at bootstrap.
pub fn init_p2p_state() -> Arc<P2pState> {
    Arc::new(P2pState::new())
}

/// Round the reduction window up to the packed-warp multiple the kernels
/// assume; two-shot additionally needs a whole number of warps per shard.
fn aligned_numel(numel: usize, world_size: usize, algo: AllReduceAlgo) -> usize {
    let mut unit = WARP_SIZE * ELEMS_PER_THREAD;
    if algo == AllReduceAlgo::TwoShot {
        unit *= world_size;
    }
    numel.div_ceil(unit) * unit
}

/// Pick the reduction algorithm for a payload, using the process-wide
/// configuration.
pub fn select_all_reduce_algo(
    input: &DeviceTensor,
    topology: Topology,
    world_size: usize,
) -> AllReduceAlgo {
    select_all_reduce_algo_with_config(input, topology, world_size, CommConfig::global())
}

/// Pick the reduction algorithm for a payload under an explicit
/// configuration. Deterministic in its inputs.
pub fn select_all_reduce_algo_with_config(
    input: &DeviceTensor,
    topology: Topology,
    world_size: usize,
    config: &CommConfig,
) -> AllReduceAlgo {
    if !config.enabled
        || input.dtype() != DType::BF16
        || !(2..=MAX_DEVICES).contains(&world_size)
    {
        return AllReduceAlgo::None;
    }

    let elem = input.dtype().size_in_bytes();
    let bytes = aligned_numel(input.numel(), world_size, AllReduceAlgo::OneShot) * elem;
    if bytes > MAX_INTRA_NODE_SIZE {
        return AllReduceAlgo::None;
    }

    match topology {
        Topology::HybridCubeMesh => {
            if world_size == MAX_DEVICES && bytes <= config.hcm_thresh_bytes {
                AllReduceAlgo::Hcm
            } else {
                AllReduceAlgo::None
            }
        }
        Topology::FullyConnected => {
            if bytes <= config.one_shot_thresh_bytes {
                AllReduceAlgo::OneShot
            } else {
                let two_shot_bytes =
                    aligned_numel(input.numel(), world_size, AllReduceAlgo::TwoShot) * elem;
                if two_shot_bytes <= config.two_shot_thresh_bytes {
                    AllReduceAlgo::TwoShot
                } else {
                    AllReduceAlgo::None
                }
            }
        }
        Topology::Unsupported => AllReduceAlgo::None,
    }
}

#[allow(clippy::too_many_arguments)]
fn validate(
    input: &DeviceTensor,
    peer_states: &[Arc<P2pState>],
    peer_buffers: &[Arc<DeviceBuffer>],
    topo_info: Option<&Arc<HcmTopoInfo>>,
    rank: usize,
    world_size: usize,
    algo: AllReduceAlgo,
    stream: &Stream,
) -> Result<usize> {
    if input.dtype() != DType::BF16 {
        return Err(CommError::Configuration(format!(
            "All-reduce requires bf16, got {:?}",
            input.dtype()
        )));
    }
    if !(2..=MAX_DEVICES).contains(&world_size) {
        return Err(CommError::Configuration(format!(
            "World size {} outside [2, {}]",
            world_size, MAX_DEVICES
        )));
    }
    if rank >= world_size {
        return Err(CommError::Configuration(format!(
            "Rank {} outside world of size {}",
            rank, world_size
        )));
    }
    if input.device() != rank {
        return Err(CommError::Configuration(format!(
            "Tensor on device {} but collective called for rank {}",
            input.device(),
            rank
        )));
    }
    if stream.device() != rank {
        return Err(CommError::Configuration(format!(
            "Stream bound to device {} but collective called for rank {}",
            stream.device(),
            rank
        )));
    }
    if peer_states.len() < world_size || peer_buffers.len() < world_size {
        return Err(CommError::Configuration(format!(
            "Peer tables ({} states, {} buffers) shorter than world size {}",
            peer_states.len(),
            peer_buffers.len(),
            world_size
        )));
    }
    if input.size_in_bytes() > MAX_INTRA_NODE_SIZE {
        return Err(CommError::Configuration(format!(
            "Payload of {} bytes exceeds the {}-byte intra-node cap",
            input.size_in_bytes(),
            MAX_INTRA_NODE_SIZE
        )));
    }

    let aligned = aligned_numel(input.numel(), world_size, algo);
    let aligned_bytes = aligned * input.dtype().size_in_bytes();

    match algo {
        AllReduceAlgo::None => {
            return Err(CommError::Configuration(
                "No intra-node algorithm applies to this payload".to_string(),
            ));
        }
        AllReduceAlgo::Hcm => {
            if world_size != MAX_DEVICES {
                return Err(CommError::Configuration(format!(
                    "Hybrid cube mesh requires {} ranks, got {}",
                    MAX_DEVICES, world_size
                )));
            }
            if topo_info.is_none() {
                return Err(CommError::Configuration(
                    "Hybrid cube mesh requested without a role row".to_string(),
                ));
            }
            if aligned_bytes > RELAY_SCRATCH_OFFSET {
                return Err(CommError::Configuration(format!(
                    "Aligned payload of {} bytes overruns the relay scratch at {}",
                    aligned_bytes, RELAY_SCRATCH_OFFSET
                )));
            }
        }
        AllReduceAlgo::OneShot | AllReduceAlgo::TwoShot => {}
    }

    for peer in 0..world_size {
        if peer_buffers[peer].len() < aligned_bytes {
            return Err(CommError::Configuration(format!(
                "Peer buffer {} holds {} bytes, need {}",
                peer,
                peer_buffers[peer].len(),
                aligned_bytes
            )));
        }
    }

    Ok(aligned)
}

/// In-place all-reduce of `input` across the group, enqueued on `stream`.
///
/// Returns the input handle; the reduced values are observable after the
/// stream synchronizes. Every rank must call with the same element count,
/// algorithm, and grid-visible parameters, or the group deadlocks; that
/// contract belongs to the caller, and nothing in the kernels detects a
/// missing participant.
#[allow(clippy::too_many_arguments)]
pub fn all_reduce<'a>(
    input: &'a DeviceTensor,
    peer_states: &[Arc<P2pState>],
    peer_buffers: &[Arc<DeviceBuffer>],
    topo_info: Option<&Arc<HcmTopoInfo>>,
    rank: usize,
    world_size: usize,
    algo: AllReduceAlgo,
    stream: &Stream,
) -> Result<&'a DeviceTensor> {
    let aligned = validate(
        input,
        peer_states,
        peer_buffers,
        topo_info,
        rank,
        world_size,
        algo,
        stream,
    )?;

    let numel = input.numel();
    let config = LaunchConfig::for_numel(aligned);
    debug!(
        rank,
        world_size,
        ?algo,
        numel,
        aligned,
        blocks = config.blocks,
        threads = config.threads,
        "Launching intra-node all-reduce"
    );

    // Stage the caller's data into this rank's peer-visible buffer.
    let src = input.buffer().clone();
    let dst = peer_buffers[rank].clone();
    let bytes = input.size_in_bytes();
    stream.enqueue(move || {
        // SAFETY: distinct allocations; the staging region is this rank's
        // own and no peer reads it before the kernel's first barrier.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), bytes) };
    })?;

    // Two-shot keeps its inner loop unguarded by reducing into an aligned
    // scratch output when the window was padded.
    let needs_scratch_out = algo == AllReduceAlgo::TwoShot && aligned != numel;
    let out_buf: Arc<DeviceBuffer> = if needs_scratch_out {
        Arc::new(DeviceBuffer::alloc(aligned * 2))
    } else {
        input.buffer().clone()
    };

    let states: Vec<Arc<P2pState>> = peer_states[..world_size].to_vec();
    let buffers: Vec<Arc<DeviceBuffer>> = peer_buffers[..world_size].to_vec();
    let topo = topo_info.cloned();
    let kernel_out = out_buf.clone();
    stream.enqueue(move || {
        let args = KernelArgs {
            rank,
            world_size,
            numel,
            aligned_numel: aligned,
            buffers,
            states,
            out: SendPtr(kernel_out.as_ptr()),
            topo,
        };
        match algo {
            AllReduceAlgo::OneShot => one_shot::launch(&args, config),
            AllReduceAlgo::TwoShot => two_shot::launch(&args, config),
            AllReduceAlgo::Hcm => hcm::launch(&args, config),
            AllReduceAlgo::None => unreachable!("validated above"),
        }
    })?;

    if needs_scratch_out {
        let scratch = out_buf;
        let dst = input.buffer().clone();
        stream.enqueue(move || {
            // SAFETY: prefix copy back into the caller's tensor; bytes
            // past `numel` in the caller's allocation stay untouched.
            unsafe { std::ptr::copy_nonoverlapping(scratch.as_ptr(), dst.as_ptr(), bytes) };
        })?;
    }

    Ok(input)
}

/// Device-side rendezvous without payload: one balanced phase-0 barrier
/// across the whole group, enqueued on `stream`.
pub fn intra_node_barrier(
    peer_states: &[Arc<P2pState>],
    rank: usize,
    world_size: usize,
    stream: &Stream,
) -> Result<()> {
    if !(2..=MAX_DEVICES).contains(&world_size) {
        return Err(CommError::Configuration(format!(
            "World size {} outside [2, {}]",
            world_size, MAX_DEVICES
        )));
    }
    if rank >= world_size {
        return Err(CommError::Configuration(format!(
            "Rank {} outside world of size {}",
            rank, world_size
        )));
    }
    if peer_states.len() < world_size {
        return Err(CommError::Configuration(format!(
            "Peer state table ({}) shorter than world size {}",
            peer_states.len(),
            world_size
        )));
    }

    let states: Vec<Arc<P2pState>> = peer_states[..world_size].to_vec();
    stream.enqueue(move || {
        block_barrier(&states, rank, world_size, 0, 0);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf16_tensor(numel: usize, device: usize) -> DeviceTensor {
        DeviceTensor::zeros(numel, DType::BF16, device)
    }

    #[test]
    fn test_aligned_numel() {
        assert_eq!(aligned_numel(1, 4, AllReduceAlgo::OneShot), 256);
        assert_eq!(aligned_numel(256, 4, AllReduceAlgo::OneShot), 256);
        assert_eq!(aligned_numel(257, 4, AllReduceAlgo::OneShot), 512);
        // Two-shot also rounds to whole shards.
        assert_eq!(aligned_numel(257, 4, AllReduceAlgo::TwoShot), 1024);
        assert_eq!(aligned_numel(7, 3, AllReduceAlgo::TwoShot), 768);
    }

    #[test]
    fn test_selector_thresholds() {
        let config = CommConfig::default();
        let select = |numel, topology, world| {
            select_all_reduce_algo_with_config(&bf16_tensor(numel, 0), topology, world, &config)
        };

        // 8 elements align to 512 bytes: handshake-dominated.
        assert_eq!(
            select(8, Topology::FullyConnected, 2),
            AllReduceAlgo::OneShot
        );
        // 128 KiB stays one-shot; 1 MiB crosses into two-shot.
        assert_eq!(
            select(64 * 1024, Topology::FullyConnected, 4),
            AllReduceAlgo::OneShot
        );
        assert_eq!(
            select(512 * 1024, Topology::FullyConnected, 4),
            AllReduceAlgo::TwoShot
        );
        // 256 KiB sits exactly on the HCM ceiling; 3 MiB exceeds it.
        assert_eq!(
            select(128 * 1024, Topology::HybridCubeMesh, 8),
            AllReduceAlgo::Hcm
        );
        assert_eq!(
            select(3 * 512 * 1024, Topology::HybridCubeMesh, 8),
            AllReduceAlgo::None
        );
        // Past the two-shot ceiling nothing applies.
        assert_eq!(
            select(6 * 1024 * 1024, Topology::FullyConnected, 8),
            AllReduceAlgo::None
        );
        assert_eq!(select(8, Topology::Unsupported, 2), AllReduceAlgo::None);
    }

    #[test]
    fn test_selector_rejections() {
        let config = CommConfig::default();
        let f32_tensor = DeviceTensor::zeros(8, DType::F32, 0);
        assert_eq!(
            select_all_reduce_algo_with_config(&f32_tensor, Topology::FullyConnected, 2, &config),
            AllReduceAlgo::None
        );

        let disabled = CommConfig {
            enabled: false,
            ..CommConfig::default()
        };
        assert_eq!(
            select_all_reduce_algo_with_config(
                &bf16_tensor(8, 0),
                Topology::FullyConnected,
                2,
                &disabled
            ),
            AllReduceAlgo::None
        );

        // Hybrid cube mesh is meaningless below eight ranks.
        assert_eq!(
            select_all_reduce_algo_with_config(
                &bf16_tensor(8, 0),
                Topology::HybridCubeMesh,
                4,
                &config
            ),
            AllReduceAlgo::None
        );
    }

    #[test]
    fn test_selector_idempotent() {
        let config = CommConfig::default();
        let tensor = bf16_tensor(1000, 0);
        let first =
            select_all_reduce_algo_with_config(&tensor, Topology::FullyConnected, 4, &config);
        for _ in 0..8 {
            assert_eq!(
                select_all_reduce_algo_with_config(&tensor, Topology::FullyConnected, 4, &config),
                first
            );
        }
    }

    #[test]
    fn test_validation_errors() {
        let world_size = 2;
        let states: Vec<_> = (0..world_size).map(|_| init_p2p_state()).collect();
        let buffers: Vec<_> = (0..world_size)
            .map(|_| Arc::new(DeviceBuffer::alloc(1024 * 1024)))
            .collect();
        let stream = Stream::new(0);

        // Wrong dtype.
        let f32_tensor = DeviceTensor::zeros(8, DType::F32, 0);
        assert!(matches!(
            all_reduce(
                &f32_tensor,
                &states,
                &buffers,
                None,
                0,
                world_size,
                AllReduceAlgo::OneShot,
                &stream
            ),
            Err(CommError::Configuration(_))
        ));

        // Device / rank mismatch.
        let misplaced = bf16_tensor(8, 1);
        assert!(all_reduce(
            &misplaced,
            &states,
            &buffers,
            None,
            0,
            world_size,
            AllReduceAlgo::OneShot,
            &stream
        )
        .is_err());

        // Algo::None is a caller bug, not a silent no-op.
        let tensor = bf16_tensor(8, 0);
        assert!(all_reduce(
            &tensor,
            &states,
            &buffers,
            None,
            0,
            world_size,
            AllReduceAlgo::None,
            &stream
        )
        .is_err());

        // HCM without a role row.
        assert!(all_reduce(
            &tensor,
            &states,
            &buffers,
            None,
            0,
            world_size,
            AllReduceAlgo::Hcm,
            &stream
        )
        .is_err());

        // World size out of range.
        assert!(all_reduce(
            &tensor,
            &states,
            &buffers,
            None,
            0,
            1,
            AllReduceAlgo::OneShot,
            &stream
        )
        .is_err());
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported());
    }
}
