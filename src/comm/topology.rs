//! Fabric topology classification and hybrid-cube-mesh role assignment.
//!
//! The input is the peer-link adjacency matrix (link counts between device
//! pairs). Two shapes are usable: a fully connected clique, and the 8-rank
//! hybrid cube mesh where every rank has exactly four link neighbors and a
//! unique relay covering its three non-neighbors. Everything else is
//! reported as unsupported and the caller falls back to another transport.

use std::sync::Arc;

use tracing::debug;

use crate::utils::error::{CommError, Result};

use super::MAX_DEVICES;

/// Peer-link adjacency matrix: `nvl[i][j]` is the number of direct links
/// between devices `i` and `j`.
pub type NvlMesh = [[u32; MAX_DEVICES]; MAX_DEVICES];

/// Classified fabric shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    FullyConnected,
    HybridCubeMesh,
    Unsupported,
}

/// One rank's row of the hybrid-cube-mesh role table: three direct
/// neighbors (column-symmetric across ranks) and the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcmTopoInfo {
    pub neighbors: [usize; 3],
    pub relay: usize,
}

/// Classify the fabric for the first `world_size` devices.
pub fn detect_topology(mesh: &NvlMesh, world_size: usize) -> Topology {
    if !(2..=MAX_DEVICES).contains(&world_size) {
        return Topology::Unsupported;
    }

    let fully_connected = (0..world_size)
        .all(|i| neighbor_count(mesh, i, world_size) == world_size - 1);
    if fully_connected {
        debug!(world_size, "Detected fully connected topology");
        return Topology::FullyConnected;
    }

    if world_size == MAX_DEVICES && build_hcm_role_table(mesh).is_some() {
        debug!(world_size, "Detected hybrid cube mesh topology");
        return Topology::HybridCubeMesh;
    }

    Topology::Unsupported
}

/// Compute the role row for `rank` and hand it to the device side.
///
/// Returns `Ok(None)` for non-HCM topologies, where the kernels need no
/// role information.
pub fn init_topo_info(
    topology: Topology,
    mesh: &NvlMesh,
    rank: usize,
) -> Result<Option<Arc<HcmTopoInfo>>> {
    if topology != Topology::HybridCubeMesh {
        return Ok(None);
    }
    if rank >= MAX_DEVICES {
        return Err(CommError::Configuration(format!(
            "Rank {} out of range for an {}-device hybrid cube mesh",
            rank, MAX_DEVICES
        )));
    }
    let table = build_hcm_role_table(mesh).ok_or_else(|| {
        CommError::Configuration("Topology is not a hybrid cube mesh".to_string())
    })?;
    let row = table[rank];
    Ok(Some(Arc::new(HcmTopoInfo {
        neighbors: [row[0], row[1], row[2]],
        relay: row[3],
    })))
}

fn neighbor_count(mesh: &NvlMesh, rank: usize, world_size: usize) -> usize {
    (0..world_size)
        .filter(|&j| j != rank && mesh[rank][j] > 0)
        .count()
}

fn neighbor_mask(mesh: &NvlMesh, rank: usize) -> u32 {
    let mut mask = 0u32;
    for j in 0..MAX_DEVICES {
        if j != rank && mesh[rank][j] > 0 {
            mask |= 1 << j;
        }
    }
    mask
}

/// Recognize a hybrid cube mesh and produce the full role table, or `None`
/// when the mesh does not have the required structure.
///
/// Columns 0..2 hold the direct neighbors, symmetric across ranks
/// (`table[i][k] == j` iff `table[j][k] == i`); column 3 holds the relay.
/// Column assignment is a proper 3-edge-coloring of the direct-neighbor
/// graph (the link graph minus the relay matching); a mesh whose direct
/// graph admits no such decomposition is rejected here rather than
/// mis-assigned or panicked on, since the matrix is caller-supplied probe
/// data.
pub(crate) fn build_hcm_role_table(mesh: &NvlMesh) -> Option<[[usize; 4]; MAX_DEVICES]> {
    let masks: Vec<u32> = (0..MAX_DEVICES).map(|i| neighbor_mask(mesh, i)).collect();
    if masks.iter().any(|m| m.count_ones() != 4) {
        return None;
    }

    // The relay is the unique rank sharing no neighbors with the subject.
    let mut relay = [usize::MAX; MAX_DEVICES];
    for i in 0..MAX_DEVICES {
        let mut candidates = (0..MAX_DEVICES).filter(|&j| j != i && masks[i] & masks[j] == 0);
        let first = candidates.next()?;
        if candidates.next().is_some() {
            return None;
        }
        relay[i] = first;
    }
    for i in 0..MAX_DEVICES {
        // Involution and direct reachability of the relay; a mesh that has
        // unique zero-overlap partners but breaks these is not an HCM.
        if relay[relay[i]] != i || masks[i] & (1 << relay[i]) == 0 {
            return None;
        }
    }

    let mut table = [[usize::MAX; 4]; MAX_DEVICES];
    for (i, row) in table.iter_mut().enumerate() {
        row[3] = relay[i];
    }

    // Direct-neighbor edges: the link graph minus the relay matching.
    // 3-regular on any mesh that passed the checks above.
    let mut edges = Vec::with_capacity(12);
    for i in 0..MAX_DEVICES {
        for j in (i + 1)..MAX_DEVICES {
            if masks[i] & (1 << j) != 0 && relay[i] != j {
                edges.push((i, j));
            }
        }
    }

    let mut used = [[false; 3]; MAX_DEVICES];
    let mut colors = vec![usize::MAX; edges.len()];
    if !color_edges(&edges, 0, &mut used, &mut colors) {
        return None;
    }
    for (e, &(i, j)) in edges.iter().enumerate() {
        let k = colors[e];
        table[i][k] = j;
        table[j][k] = i;
    }

    Some(table)
}

/// Give every edge one of three colors so no rank sees a color twice:
/// each color class becomes one symmetric neighbor column. Backtracking
/// over at most twelve edges; returns false for graphs with no proper
/// 3-edge-coloring.
fn color_edges(
    edges: &[(usize, usize)],
    idx: usize,
    used: &mut [[bool; 3]; MAX_DEVICES],
    colors: &mut [usize],
) -> bool {
    let Some(&(i, j)) = edges.get(idx) else {
        return true;
    };
    for k in 0..3 {
        if !used[i][k] && !used[j][k] {
            used[i][k] = true;
            used[j][k] = true;
            colors[idx] = k;
            if color_edges(edges, idx + 1, used, colors) {
                return true;
            }
            used[i][k] = false;
            used[j][k] = false;
        }
    }
    false
}
