//! Per-rank communicator handle.
//!
//! Bundles the pieces the dispatcher consumes (peer signal rings, peer
//! buffers, topology role row, stream) behind one object per rank, plus a
//! single-process group constructor for local testing. Cross-process
//! rendezvous that distributes peer handles between address spaces belongs
//! to the hosting framework.

use std::sync::Arc;

use tracing::info;

use crate::fabric::memory::DeviceBuffer;
use crate::fabric::stream::Stream;
use crate::fabric::tensor::DeviceTensor;
use crate::utils::error::{CommError, Result};
use crate::utils::logging::rank_span;

use super::dispatch::{all_reduce, init_p2p_state, intra_node_barrier, select_all_reduce_algo};
use super::signal::P2pState;
use super::topology::{detect_topology, init_topo_info, HcmTopoInfo, NvlMesh, Topology};
use super::{AllReduceAlgo, MAX_DEVICES, MAX_INTRA_NODE_SIZE};

/// One rank's view of an intra-node group.
pub struct IntraNodeComm {
    rank: usize,
    world_size: usize,
    topology: Topology,
    states: Vec<Arc<P2pState>>,
    buffers: Vec<Arc<DeviceBuffer>>,
    topo_info: Option<Arc<HcmTopoInfo>>,
    stream: Stream,
}

impl IntraNodeComm {
    /// Create communicators for every rank of a single-process group.
    ///
    /// Allocates the shared signal rings and peer buffers once and hands
    /// each rank a handle over them, the in-process analogue of exchanging
    /// device handles at rendezvous.
    pub fn new_local_group(world_size: usize, mesh: &NvlMesh) -> Result<Vec<Self>> {
        if !(2..=MAX_DEVICES).contains(&world_size) {
            return Err(CommError::Configuration(format!(
                "World size {} outside [2, {}]",
                world_size, MAX_DEVICES
            )));
        }

        let topology = detect_topology(mesh, world_size);
        if topology == Topology::Unsupported {
            return Err(CommError::Configuration(
                "Fabric is neither fully connected nor a hybrid cube mesh".to_string(),
            ));
        }

        let states: Vec<Arc<P2pState>> = (0..world_size).map(|_| init_p2p_state()).collect();
        let buffers: Vec<Arc<DeviceBuffer>> = (0..world_size)
            .map(|_| Arc::new(DeviceBuffer::alloc(MAX_INTRA_NODE_SIZE)))
            .collect();

        info!(world_size, ?topology, "Initialized intra-node group");

        (0..world_size)
            .map(|rank| {
                Ok(Self {
                    rank,
                    world_size,
                    topology,
                    states: states.clone(),
                    buffers: buffers.clone(),
                    topo_info: init_topo_info(topology, mesh, rank)?,
                    stream: Stream::new(rank),
                })
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// The stream this rank's collectives are ordered on.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Algorithm the selector would use for `input` on this group.
    pub fn select_algo(&self, input: &DeviceTensor) -> AllReduceAlgo {
        select_all_reduce_algo(input, self.topology, self.world_size)
    }

    /// In-place all-reduce with automatic algorithm selection.
    ///
    /// Fails with a configuration error when no intra-node algorithm
    /// applies; the caller is expected to fall back to another transport.
    pub fn all_reduce<'a>(&self, input: &'a DeviceTensor) -> Result<&'a DeviceTensor> {
        let algo = self.select_algo(input);
        self.all_reduce_with_algo(input, algo)
    }

    /// In-place all-reduce with an explicit algorithm. Every rank must
    /// pass the same algorithm and element count.
    pub fn all_reduce_with_algo<'a>(
        &self,
        input: &'a DeviceTensor,
        algo: AllReduceAlgo,
    ) -> Result<&'a DeviceTensor> {
        let _span = rank_span(self.rank, self.world_size).entered();
        all_reduce(
            input,
            &self.states,
            &self.buffers,
            self.topo_info.as_ref(),
            self.rank,
            self.world_size,
            algo,
            &self.stream,
        )
    }

    /// Device-side barrier across the group, ordered on this rank's
    /// stream.
    pub fn barrier(&self) -> Result<()> {
        let _span = rank_span(self.rank, self.world_size).entered();
        intra_node_barrier(&self.states, self.rank, self.world_size, &self.stream)
    }

    /// Block until every collective enqueued so far has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    /// True when every counter in this rank's signal ring is back at its
    /// steady-state zero.
    pub fn signals_quiesced(&self) -> bool {
        self.states[self.rank].is_quiesced()
    }
}
