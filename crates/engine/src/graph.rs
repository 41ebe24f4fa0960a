//! HNSW (Hierarchical Navigable Small World) graph
//!
//! The graph only holds topology. Distances come from a
//! [`DistanceComputer`] over the storage the graph was built on, so the
//! same graph can later be searched through a different storage holding the
//! same rows.
//!
//! ## Algorithm
//!
//! - Level 0 contains all nodes with up to 2*M connections each
//! - Higher levels contain a subset of nodes with up to M connections each
//! - Search starts at the top level and greedily descends to level 0
//! - At level 0 a beam search keeps the `ef` closest admissible nodes
//!
//! ## Determinism
//!
//! Level assignment uses a fixed seed and a monotonic counter, so identical
//! insert sequences produce identical graphs. Ties between equal distances
//! are broken by node id.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bit_vec::BitVec;
use serde::Serialize;

use crate::error::EngineResult;
use crate::selector::IdSelector;
use crate::storage::{CodecStorage, DistanceComputer};

/// Node id paired with a min-oriented distance
///
/// Orders by distance, then id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Min-oriented distance to the query
    pub distance: f32,
    /// Local node id
    pub id: u32,
}

impl Neighbor {
    /// Pair a node with its distance
    pub fn new(distance: f32, id: u32) -> Self {
        Self { distance, id }
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// One node evaluation recorded during a traced search
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VisitRecord {
    /// Graph level of the evaluation
    pub level: usize,
    /// Local node id
    pub node: u32,
    /// Min-oriented distance
    pub distance: f32,
}

/// Ordered log of the nodes a search expanded
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct VisitTrace {
    /// Expansions in visit order
    pub visits: Vec<VisitRecord>,
}

impl VisitTrace {
    fn record(trace: &mut Option<&mut VisitTrace>, level: usize, n: Neighbor) {
        if let Some(t) = trace.as_deref_mut() {
            t.visits.push(VisitRecord {
                level,
                node: n.id,
                distance: n.distance,
            });
        }
    }
}

/// Graph topology of one sub-index
#[derive(Debug, Clone, PartialEq)]
pub struct HnswGraph {
    pub(crate) m: usize,
    pub(crate) ef_construction: usize,
    /// `links[node][level]` = neighbor ids
    pub(crate) links: Vec<Vec<Vec<u32>>>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_level: usize,
    pub(crate) rng_seed: u64,
    pub(crate) rng_counter: u64,
}

impl HnswGraph {
    /// Create an empty graph
    pub fn new(m: usize, ef_construction: usize) -> Self {
        Self {
            m: m.max(2),
            ef_construction: ef_construction.max(1),
            links: Vec::new(),
            entry_point: None,
            max_level: 0,
            rng_seed: 42,
            rng_counter: 0,
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True if the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Entry node at the top level
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    /// Highest populated level
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Neighbors of `node` at `level`; empty if the node is not on that level
    pub fn neighbors(&self, node: u32, level: usize) -> &[u32] {
        self.links
            .get(node as usize)
            .and_then(|levels| levels.get(level))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn max_connections(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    // ========================================================================
    // Level Assignment
    // ========================================================================

    fn assign_level(&mut self) -> usize {
        self.rng_counter += 1;
        let hash = splitmix64(self.rng_seed.wrapping_add(self.rng_counter));

        // Convert to uniform [0, 1) and apply exponential distribution
        let uniform = ((hash as f64) / (u64::MAX as f64)).max(1e-15);
        let ml = 1.0 / (self.m as f64).ln();
        (-uniform.ln() * ml) as usize
    }

    // ========================================================================
    // Traversal Primitives
    // ========================================================================

    /// Greedy walk from `entry` through levels `from_level..=to_level`
    /// (descending), moving to the best neighbor until no improvement
    pub fn greedy_walk(
        &self,
        dc: &mut DistanceComputer<'_>,
        entry: Neighbor,
        from_level: usize,
        to_level: usize,
        mut trace: Option<&mut VisitTrace>,
    ) -> Neighbor {
        let mut current = entry;
        for level in (to_level..=from_level).rev() {
            loop {
                VisitTrace::record(&mut trace, level, current);
                let mut best = current;
                for &nb in self.neighbors(current.id, level) {
                    let candidate = Neighbor::new(dc.distance(nb), nb);
                    if candidate < best {
                        best = candidate;
                    }
                }
                if best.id == current.id {
                    break;
                }
                current = best;
            }
        }
        current
    }

    /// Best level-0 entry for `dc`'s query, or `None` for an empty graph
    pub fn greedy_descend(
        &self,
        dc: &mut DistanceComputer<'_>,
        trace: Option<&mut VisitTrace>,
    ) -> Option<Neighbor> {
        let ep = self.entry_point?;
        let entry = Neighbor::new(dc.distance(ep), ep);
        if self.max_level == 0 {
            return Some(entry);
        }
        Some(self.greedy_walk(dc, entry, self.max_level, 1, trace))
    }

    /// Unfiltered beam search at one level; results sorted ascending
    fn search_level(
        &self,
        dc: &mut DistanceComputer<'_>,
        entry: Neighbor,
        ef: usize,
        level: usize,
    ) -> Vec<Neighbor> {
        let mut visited = BitVec::from_elem(self.len(), false);
        visited.set(entry.id as usize, true);
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(entry));
        let mut results = BinaryHeap::new();
        results.push(entry);

        while let Some(Reverse(nearest)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && nearest.distance > worst.distance {
                    break;
                }
            }
            for &nb in self.neighbors(nearest.id, level) {
                if visited.get(nb as usize).unwrap_or(true) {
                    continue;
                }
                visited.set(nb as usize, true);
                let candidate = Neighbor::new(dc.distance(nb), nb);
                let admit = results.len() < ef
                    || results.peek().map_or(true, |w| candidate.distance < w.distance);
                if admit {
                    candidates.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_sorted_vec()
    }

    /// Filtered beam search at level 0; returns up to `ef` admissible nodes
    /// sorted ascending
    ///
    /// Non-members are traversed as waypoints but never returned. A
    /// non-member neighbor is only expanded once `k_alpha` accumulates to
    /// 1.0, so a heavily filtered walk skips fewer of them.
    pub fn filtered_beam_search(
        &self,
        dc: &mut DistanceComputer<'_>,
        entry: Neighbor,
        ef: usize,
        selector: Option<&dyn IdSelector>,
        k_alpha: f32,
        mut trace: Option<&mut VisitTrace>,
    ) -> Vec<Neighbor> {
        let is_member = |id: u32| selector.map_or(true, |s| s.is_member(id));
        let mut visited = BitVec::from_elem(self.len(), false);
        visited.set(entry.id as usize, true);
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(entry));
        let mut results: BinaryHeap<Neighbor> = BinaryHeap::new();
        if is_member(entry.id) {
            results.push(entry);
        }
        let mut accumulated_alpha = 0.0f32;

        while let Some(Reverse(nearest)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && nearest.distance > worst.distance {
                    break;
                }
            }
            VisitTrace::record(&mut trace, 0, nearest);
            for &nb in self.neighbors(nearest.id, 0) {
                if visited.get(nb as usize).unwrap_or(true) {
                    continue;
                }
                let member = is_member(nb);
                if !member {
                    accumulated_alpha += k_alpha;
                    if accumulated_alpha < 1.0 {
                        continue;
                    }
                    accumulated_alpha -= 1.0;
                }
                visited.set(nb as usize, true);
                let candidate = Neighbor::new(dc.distance(nb), nb);
                let admit = results.len() < ef
                    || results.peek().map_or(true, |w| candidate.distance < w.distance);
                if admit {
                    candidates.push(Reverse(candidate));
                    if member {
                        results.push(candidate);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }
        results.into_sorted_vec()
    }

    /// Admissible level-0 nodes with distance strictly below `radius`
    ///
    /// Seeds come from an unfiltered beam search of breadth `ef`; the walk
    /// then floods outward through every node inside the radius.
    pub fn range_search(
        &self,
        dc: &mut DistanceComputer<'_>,
        entry: Neighbor,
        radius: f32,
        ef: usize,
        selector: Option<&dyn IdSelector>,
        k_alpha: f32,
    ) -> Vec<Neighbor> {
        let is_member = |id: u32| selector.map_or(true, |s| s.is_member(id));
        let seeds = self.search_level(dc, entry, ef, 0);

        let mut visited = BitVec::from_elem(self.len(), false);
        let mut queue: Vec<Neighbor> = Vec::new();
        for seed in seeds.into_iter().filter(|s| s.distance < radius) {
            visited.set(seed.id as usize, true);
            queue.push(seed);
        }

        let mut accumulated_alpha = 0.0f32;
        let mut hits = Vec::new();
        while let Some(node) = queue.pop() {
            if is_member(node.id) {
                hits.push(node);
            }
            for &nb in self.neighbors(node.id, 0) {
                if visited.get(nb as usize).unwrap_or(true) {
                    continue;
                }
                if !is_member(nb) {
                    accumulated_alpha += k_alpha;
                    if accumulated_alpha < 1.0 {
                        continue;
                    }
                    accumulated_alpha -= 1.0;
                }
                visited.set(nb as usize, true);
                let d = dc.distance(nb);
                if d < radius {
                    queue.push(Neighbor::new(d, nb));
                }
            }
        }
        hits.sort();
        hits
    }

    // ========================================================================
    // Graph Building
    // ========================================================================

    /// Link the next stored vector into the graph
    ///
    /// Node ids are dense: the inserted node gets id `len()`, and `storage`
    /// must already hold that vector.
    pub(crate) fn insert(&mut self, storage: &CodecStorage) -> EngineResult<u32> {
        let id = self.links.len() as u32;
        let vector = storage.reconstruct_vec(id as usize)?;
        let level = self.assign_level();
        self.links.push(vec![Vec::new(); level + 1]);

        let ep = match self.entry_point {
            Some(ep) => ep,
            None => {
                self.entry_point = Some(id);
                self.max_level = level;
                return Ok(id);
            }
        };

        let mut dc = storage.distance_computer(&vector);
        let mut current = Neighbor::new(dc.distance(ep), ep);
        if self.max_level > level {
            current = self.greedy_walk(&mut dc, current, self.max_level, level + 1, None);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_level(&mut dc, current, self.ef_construction, layer);
            let selected = select_neighbors(&mut dc, &candidates, self.m);
            self.links[id as usize][layer] = selected.clone();

            let max_conn = self.max_connections(layer);
            for &nb in &selected {
                let links = &mut self.links[nb as usize][layer];
                links.push(id);
                if links.len() > max_conn {
                    self.prune_neighbors(nb, layer, max_conn, storage)?;
                }
            }

            if let Some(closest) = candidates.first() {
                current = *closest;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(id);
            self.max_level = level;
        }
        Ok(id)
    }

    fn prune_neighbors(
        &mut self,
        node: u32,
        level: usize,
        max_connections: usize,
        storage: &CodecStorage,
    ) -> EngineResult<()> {
        let vector = storage.reconstruct_vec(node as usize)?;
        let mut dc = storage.distance_computer(&vector);
        let mut scored: Vec<Neighbor> = self.links[node as usize][level]
            .iter()
            .map(|&nb| Neighbor::new(dc.distance(nb), nb))
            .collect();
        scored.sort();
        self.links[node as usize][level] = select_neighbors(&mut dc, &scored, max_connections);
        Ok(())
    }

    /// Bytes held by adjacency lists
    pub fn memory_usage(&self) -> usize {
        self.links
            .iter()
            .map(|levels| levels.iter().map(|l| l.len() * 4 + 24).sum::<usize>() + 24)
            .sum()
    }
}

/// Diversity heuristic: keep a candidate only if it is closer to the query
/// than to every already selected neighbor, then fill up with the closest
/// discarded candidates. `candidates` must be sorted ascending.
fn select_neighbors(
    dc: &mut DistanceComputer<'_>,
    candidates: &[Neighbor],
    max_connections: usize,
) -> Vec<u32> {
    let mut selected: Vec<u32> = Vec::with_capacity(max_connections);
    let mut discarded = Vec::new();
    for candidate in candidates {
        if selected.len() >= max_connections {
            break;
        }
        let diverse = selected
            .iter()
            .all(|&s| dc.pair_distance(candidate.id, s) > candidate.distance);
        if diverse {
            selected.push(candidate.id);
        } else {
            discarded.push(candidate.id);
        }
    }
    for id in discarded {
        if selected.len() >= max_connections {
            break;
        }
        selected.push(id);
    }
    selected
}

/// SplitMix64 hash function for deterministic PRNG
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratavec_core::MetricType;

    fn line_storage(n: usize) -> CodecStorage {
        let mut s = CodecStorage::flat(2, MetricType::L2);
        let data: Vec<f32> = (0..n).flat_map(|i| [i as f32, 0.0]).collect();
        s.add(&data).unwrap();
        s
    }

    fn build(storage: &CodecStorage, m: usize) -> HnswGraph {
        let mut g = HnswGraph::new(m, 32);
        for _ in 0..storage.ntotal() {
            g.insert(storage).unwrap();
        }
        g
    }

    struct EvenOnly;
    impl IdSelector for EvenOnly {
        fn is_member(&self, id: u32) -> bool {
            id % 2 == 0
        }
    }

    #[test]
    fn test_neighbor_ordering() {
        let mut v = vec![
            Neighbor::new(2.0, 1),
            Neighbor::new(1.0, 5),
            Neighbor::new(1.0, 3),
        ];
        v.sort();
        assert_eq!(v.iter().map(|n| n.id).collect::<Vec<_>>(), vec![3, 5, 1]);
    }

    #[test]
    fn test_empty_graph_has_no_entry() {
        let storage = line_storage(0);
        let g = HnswGraph::new(8, 16);
        let mut dc = storage.distance_computer(&[0.0, 0.0]);
        assert!(g.greedy_descend(&mut dc, None).is_none());
        assert!(g.is_empty());
    }

    #[test]
    fn test_degree_bounds() {
        let storage = line_storage(200);
        let g = build(&storage, 4);
        assert_eq!(g.len(), 200);
        for node in 0..200u32 {
            assert!(g.neighbors(node, 0).len() <= 8);
            for level in 1..=g.max_level() {
                assert!(g.neighbors(node, level).len() <= 4);
            }
        }
    }

    #[test]
    fn test_deterministic_build() {
        let storage = line_storage(100);
        assert_eq!(build(&storage, 6), build(&storage, 6));
    }

    #[test]
    fn test_beam_search_finds_nearest() {
        let storage = line_storage(300);
        let g = build(&storage, 8);
        let mut dc = storage.distance_computer(&[123.2, 0.0]);
        let entry = g.greedy_descend(&mut dc, None).unwrap();
        let hits = g.filtered_beam_search(&mut dc, entry, 16, None, 0.0, None);
        assert_eq!(hits[0].id, 123);
        assert!(hits.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_filtered_beam_search_only_members() {
        let storage = line_storage(300);
        let g = build(&storage, 8);
        let mut dc = storage.distance_computer(&[51.0, 0.0]);
        let entry = g.greedy_descend(&mut dc, None).unwrap();
        let mut trace = VisitTrace::default();
        let hits = g.filtered_beam_search(&mut dc, entry, 10, Some(&EvenOnly), 0.35, Some(&mut trace));
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|n| n.id % 2 == 0));
        assert!(hits[0].id == 50 || hits[0].id == 52);
        assert!(!trace.visits.is_empty());
    }

    #[test]
    fn test_range_search_inside_radius() {
        let storage = line_storage(100);
        let g = build(&storage, 8);
        let mut dc = storage.distance_computer(&[40.0, 0.0]);
        let entry = g.greedy_descend(&mut dc, None).unwrap();
        // squared distance < 9.5 -> |x - 40| <= 3
        let hits = g.range_search(&mut dc, entry, 9.5, 8, None, 0.0);
        let mut ids: Vec<u32> = hits.iter().map(|n| n.id).collect();
        ids.sort();
        assert_eq!(ids, vec![37, 38, 39, 40, 41, 42, 43]);
    }
}
