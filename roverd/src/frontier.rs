//! # frontier
//!
//! Frontier detection and clustering over a grid snapshot. A frontier cell
//! is a FREE cell with at least one 4-neighbour that is absent from the map
//! entirely (unknown, not merely undecided); driving to one expands the map.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::grid::FREE_THRESH;

const NEIGHBOURS_4: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// One 4-connected group of frontier cells.
#[derive(Debug, Clone)]
pub struct FrontierCluster {
    pub cells: Vec<(i32, i32)>,
    pub centroid_ix: f64,
    pub centroid_iz: f64,
}

impl FrontierCluster {
    /// Squared cell-index distance from the cluster centroid to a cell.
    pub fn dist2_to(&self, ix: i32, iz: i32) -> f64 {
        (self.centroid_ix - ix as f64).powi(2) + (self.centroid_iz - iz as f64).powi(2)
    }

    /// Nearest integer cell to the centroid, used as the plan target.
    pub fn centroid_cell(&self) -> (i32, i32) {
        (self.centroid_ix.round() as i32, self.centroid_iz.round() as i32)
    }
}

/// All frontier cells of a snapshot.
pub fn find_frontiers(cells: &HashMap<(i32, i32), f64>) -> Vec<(i32, i32)> {
    let mut out: Vec<(i32, i32)> = cells
        .iter()
        .filter(|&(_, &v)| v <= FREE_THRESH)
        .filter(|&(&(ix, iz), _)| {
            NEIGHBOURS_4
                .iter()
                .any(|&(dx, dz)| !cells.contains_key(&(ix + dx, iz + dz)))
        })
        .map(|(&c, _)| c)
        .collect();
    out.sort_unstable(); // deterministic across HashMap iteration orders
    out
}

/// 4-connected flood fill over the frontier set, largest cluster first.
pub fn cluster_frontiers(frontiers: &[(i32, i32)]) -> Vec<FrontierCluster> {
    let set: HashSet<(i32, i32)> = frontiers.iter().copied().collect();
    let mut seen: HashSet<(i32, i32)> = HashSet::new();
    let mut clusters = Vec::new();

    for &start in frontiers {
        if seen.contains(&start) {
            continue;
        }
        let mut cells = Vec::new();
        let mut queue = VecDeque::from([start]);
        seen.insert(start);
        while let Some((ix, iz)) = queue.pop_front() {
            cells.push((ix, iz));
            for &(dx, dz) in &NEIGHBOURS_4 {
                let n = (ix + dx, iz + dz);
                if set.contains(&n) && seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        let n = cells.len() as f64;
        let centroid_ix = cells.iter().map(|c| c.0 as f64).sum::<f64>() / n;
        let centroid_iz = cells.iter().map(|c| c.1 as f64).sum::<f64>() / n;
        clusters.push(FrontierCluster { cells, centroid_ix, centroid_iz });
    }

    clusters.sort_by(|a, b| b.cells.len().cmp(&a.cells.len()));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{L_OCC, NAV_BLOCK_THRESH};

    fn free() -> f64 {
        FREE_THRESH - 0.1
    }

    #[test]
    fn free_cell_next_to_unknown_is_frontier() {
        let mut cells = HashMap::new();
        cells.insert((0, 0), free());
        // All four neighbours absent: still one frontier cell
        assert_eq!(find_frontiers(&cells), vec![(0, 0)]);
    }

    #[test]
    fn fully_surrounded_map_has_no_frontiers() {
        // A 5×5 block: interior free, rim occupied. Every free cell's
        // neighbours are present, so exploration is complete.
        let mut cells = HashMap::new();
        for ix in 0..5 {
            for iz in 0..5 {
                let rim = ix == 0 || iz == 0 || ix == 4 || iz == 4;
                cells.insert((ix, iz), if rim { L_OCC * 2.0 } else { free() });
            }
        }
        assert!(find_frontiers(&cells).is_empty());
    }

    #[test]
    fn occupied_and_undecided_cells_are_not_frontiers() {
        let mut cells = HashMap::new();
        cells.insert((0, 0), NAV_BLOCK_THRESH); // occupied, open neighbours
        cells.insert((5, 5), 0.0); // present but undecided
        assert!(find_frontiers(&cells).is_empty());
    }

    #[test]
    fn clustering_splits_disconnected_groups() {
        // Two groups: a 3-cell strip and a lone cell far away
        let frontiers = vec![(0, 0), (1, 0), (2, 0), (10, 10)];
        let clusters = cluster_frontiers(&frontiers);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].cells.len(), 3); // largest first
        assert_eq!(clusters[1].cells.len(), 1);
        assert!((clusters[0].centroid_ix - 1.0).abs() < 1e-12);
        assert!((clusters[0].centroid_iz - 0.0).abs() < 1e-12);
    }

    #[test]
    fn diagonal_cells_do_not_join() {
        let frontiers = vec![(0, 0), (1, 1)];
        assert_eq!(cluster_frontiers(&frontiers).len(), 2);
    }
}
