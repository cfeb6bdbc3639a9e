//! Topology-aware intra-node all-reduce core.
//!
//! Three reduction strategies over a peer-to-peer device fabric:
//! - One-shot: every rank reads every peer's full vector (best when the
//!   handshake dominates)
//! - Two-shot: reduce-scatter over per-rank shards, then all-gather (best
//!   when bandwidth dominates)
//! - Hybrid cube mesh: 4-way neighbor reduction plus one relay exchange
//!   (8-rank meshes that are not fully connected)
//!
//! Cross-device consistency comes from coarse per-block signal pairs
//! (system-scope atomic increment to release, nonzero-guarded CAS decrement
//! to acquire) combined with cache-bypassing data traffic, instead of
//! per-access fences.

pub mod communicator;
pub mod dispatch;
pub mod hcm;
pub mod kernel;
pub mod one_shot;
pub mod packed;
pub mod signal;
pub mod topology;
pub mod two_shot;

pub use communicator::IntraNodeComm;
pub use dispatch::{
    all_reduce, init_p2p_state, intra_node_barrier, is_supported, select_all_reduce_algo,
    select_all_reduce_algo_with_config,
};
pub use packed::Bf16x8;
pub use signal::P2pState;
pub use topology::{detect_topology, init_topo_info, HcmTopoInfo, NvlMesh, Topology};

/// Maximum devices per intra-node group.
pub const MAX_DEVICES: usize = 8;
/// Maximum grid blocks per collective kernel.
pub const MAX_ALL_REDUCE_BLOCKS: usize = 24;
/// Threads per fully occupied block.
pub const THREADS_PER_BLOCK: usize = 1024;
/// Lanes per warp.
pub const WARP_SIZE: usize = 32;
/// Bytes moved per thread per step (one 128-bit packed vector).
pub const BYTES_PER_THREAD: usize = 16;
/// bf16 elements per thread per step.
pub const ELEMS_PER_THREAD: usize = BYTES_PER_THREAD / 2;

/// Peer-buffer capacity in bytes. The upper half doubles as the
/// hybrid-cube-mesh relay scratch, so usable payload for that kernel is
/// capped at `RELAY_SCRATCH_OFFSET`.
pub const MAX_INTRA_NODE_SIZE: usize = 20 * 1024 * 1024;
/// Byte offset of the relay-scratch region inside a peer buffer.
pub const RELAY_SCRATCH_OFFSET: usize = MAX_INTRA_NODE_SIZE / 2;

/// Payload ceiling (post-alignment bytes) for the hybrid-cube-mesh kernel.
pub const HCM_THRESH_BYTES: usize = 256 * 1024;
/// Payload ceiling (post-alignment bytes) for the one-shot kernel.
pub const ONE_SHOT_THRESH_BYTES: usize = 256 * 1024;
/// Payload ceiling (post-alignment bytes) for the two-shot kernel.
pub const TWO_SHOT_THRESH_BYTES: usize = 10 * 1024 * 1024;

/// Reduction algorithm chosen for a collective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllReduceAlgo {
    /// No intra-node algorithm applies; the caller must fall back.
    None,
    OneShot,
    TwoShot,
    Hcm,
}
