//! Incremental best-first iterator over one sub-index
//!
//! [`IncrementalIterator`] hands out results one at a time instead of a
//! fixed top-k. It is an explicit state machine polled with
//! [`IncrementalIterator::advance`]:
//!
//! ```text
//! NotStarted --descend--> Descending --seed batch--> Visiting --frontier empty--> Exhausted
//!      \____________________ empty graph ___________________________________/
//! ```
//!
//! The first poll descends the upper levels and runs one base-level beam
//! search of breadth `ef`; its admissible results form the first batch and
//! every other discovered node is parked in the frontier. Later polls pop the
//! frontier minimum and expand it. An admissible node goes back into the
//! frontier marked expanded and is emitted when it surfaces again, so every
//! neighbor it revealed that is closer than it is emitted first.
//!
//! Distances are tracked min-oriented and converted back to the metric's
//! own orientation at emission, where local offsets are also mapped to
//! labels.
//!
//! With a refine storage and a non-zero refine ratio, approximate candidates
//! are collected into a window and emitted in exact-distance order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use bit_vec::BitVec;
use stratavec_core::{BitsetView, IndexError, Result};
use stratavec_engine::{DistanceComputer, Neighbor, SubIndex};
use tracing::trace;

/// Filtered share above which filtered nodes are never pruned from the walk
pub const ITERATOR_FULL_EXPANSION_THRESHOLD: f32 = 0.93;
/// Alpha added per filtered neighbor
const K_ALPHA: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Descending(Neighbor),
    Visiting,
    Exhausted,
}

/// Discovered node awaiting expansion
#[derive(Debug, Clone, Copy)]
struct FrontierEntry {
    distance: f32,
    id: u32,
    /// Whether the node passes the filter and is still to be emitted
    emit: bool,
    /// Whether the node's neighbors are already in the walk
    expanded: bool,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // expanded entries first on equal distance
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| other.expanded.cmp(&self.expanded))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Where emitted labels come from
#[derive(Debug, Clone, Default)]
pub struct LabelMapping {
    /// Local offset → label of the partition, `None` for identity
    pub labels: Option<Arc<Vec<u32>>>,
    /// Label → global offset, empty for identity
    pub label_to_internal_offset: Arc<Vec<u32>>,
    /// First global offset of the partition
    pub base_offset: u32,
}

impl LabelMapping {
    fn label(&self, local: u32) -> Result<i64> {
        match &self.labels {
            Some(labels) => labels.get(local as usize).map(|&l| l as i64).ok_or_else(|| {
                IndexError::InnerEngine(format!("offset {} has no label", local))
            }),
            None => Ok(local as i64),
        }
    }

    fn local(&self, label: i64) -> Result<u32> {
        let unknown = || IndexError::UnknownLabel { label };
        let idx = usize::try_from(label).map_err(|_| unknown())?;
        if self.label_to_internal_offset.is_empty() {
            return u32::try_from(idx).map_err(|_| unknown());
        }
        let global = *self.label_to_internal_offset.get(idx).ok_or_else(unknown)?;
        global.checked_sub(self.base_offset).ok_or_else(unknown)
    }
}

/// Resumable best-first walk of one query over one sub-index
#[derive(Debug)]
pub struct IncrementalIterator {
    handle: Arc<SubIndex>,
    mapping: LabelMapping,
    query: Vec<f32>,
    filter: BitsetView,
    ef: usize,
    phase: Phase,
    visited: BitVec,
    frontier: BinaryHeap<Reverse<FrontierEntry>>,
    /// Approximate candidates ready to be emitted
    ready: BinaryHeap<Reverse<Neighbor>>,
    accumulated_alpha: f32,
    refine_window: usize,
    /// Candidates re-ranked with exact distances
    refined: BinaryHeap<Reverse<Neighbor>>,
}

impl IncrementalIterator {
    /// Iterator over `handle` for `query`
    ///
    /// `filter` must be addressed by the handle's local offsets. A refine
    /// window is only used when the handle carries a refine storage and
    /// `refine_ratio` is positive.
    pub fn new(
        handle: Arc<SubIndex>,
        mapping: LabelMapping,
        query: Vec<f32>,
        filter: BitsetView,
        ef: usize,
        refine_ratio: f32,
    ) -> Result<Self> {
        if query.len() != handle.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: handle.dim(),
                got: query.len(),
            });
        }
        let ntotal = handle.ntotal();
        let accumulated_alpha =
            if filter.count() as f32 >= ntotal as f32 * ITERATOR_FULL_EXPANSION_THRESHOLD {
                f32::MAX
            } else {
                1.0
            };
        let ef = ef.max(1);
        let refine_window = if handle.is_refined() && refine_ratio > 0.0 {
            ((ef as f32 * refine_ratio).ceil() as usize).max(1)
        } else {
            0
        };
        Ok(Self {
            visited: BitVec::from_elem(ntotal, false),
            handle,
            mapping,
            query,
            filter,
            ef,
            phase: Phase::NotStarted,
            frontier: BinaryHeap::new(),
            ready: BinaryHeap::new(),
            accumulated_alpha,
            refine_window,
            refined: BinaryHeap::new(),
        })
    }

    /// Same iterator, already exhausted
    pub(crate) fn into_exhausted(mut self) -> Self {
        self.phase = Phase::Exhausted;
        self
    }

    /// Whether no further result will be produced
    pub fn is_exhausted(&self) -> bool {
        self.phase == Phase::Exhausted && self.ready.is_empty() && self.refined.is_empty()
    }

    /// Next `(label, distance)`, or `None` once exhausted
    pub fn advance(&mut self) -> Option<Result<(i64, f32)>> {
        let handle = Arc::clone(&self.handle);
        let mut dc = handle.base().distance_computer(&self.query);

        let next = if self.refine_window == 0 {
            self.next_candidate(&mut dc)
        } else {
            let refine = handle.exact_storage();
            let mut exact = refine.distance_computer(&self.query);
            while self.refined.len() < self.refine_window {
                match self.next_candidate(&mut dc) {
                    Some(n) => self
                        .refined
                        .push(Reverse(Neighbor::new(exact.distance(n.id), n.id))),
                    None => break,
                }
            }
            self.refined.pop().map(|Reverse(n)| n)
        };

        let n = next?;
        let distance = handle.metric().from_min_oriented(n.distance);
        Some(self.mapping.label(n.id).map(|label| (label, distance)))
    }

    /// Exact distance between the query and an emitted `label`
    ///
    /// Only available with a refine storage; the value is in the metric's
    /// own orientation.
    pub fn raw_distance(&self, label: i64) -> Result<f32> {
        let refine = self.handle.refine().ok_or_else(|| {
            IndexError::invalid_args("raw distance needs a refine storage")
        })?;
        let local = self.mapping.local(label)?;
        if local as usize >= refine.ntotal() {
            return Err(IndexError::UnknownLabel { label });
        }
        Ok(refine.distance_computer(&self.query).raw_distance(local))
    }

    fn admissible(&self, id: u32) -> bool {
        !self.filter.test(id as usize)
    }

    fn next_candidate(&mut self, dc: &mut DistanceComputer<'_>) -> Option<Neighbor> {
        loop {
            if let Some(Reverse(n)) = self.ready.pop() {
                return Some(n);
            }
            match self.phase {
                Phase::NotStarted => {
                    self.phase = match self.handle.base().graph().greedy_descend(dc, None) {
                        Some(entry) => Phase::Descending(entry),
                        None => Phase::Exhausted,
                    };
                }
                Phase::Descending(entry) => {
                    self.seed(dc, entry);
                    self.phase = Phase::Visiting;
                }
                Phase::Visiting => {
                    if !self.visit(dc) {
                        trace!(target: "stratavec::index", "Iterator frontier exhausted");
                        self.phase = Phase::Exhausted;
                    }
                }
                Phase::Exhausted => return None,
            }
        }
    }

    /// Decide whether neighbor `id` enters the walk, marking it visited
    fn admit_neighbor(&mut self, id: u32) -> bool {
        if self.visited.get(id as usize).unwrap_or(true) {
            return false;
        }
        if !self.admissible(id) {
            self.accumulated_alpha += K_ALPHA;
            if self.accumulated_alpha < 1.0 {
                return false;
            }
            self.accumulated_alpha -= 1.0;
        }
        self.visited.set(id as usize, true);
        true
    }

    /// Base-level beam search from `entry`; fills `ready` and `frontier`
    fn seed(&mut self, dc: &mut DistanceComputer<'_>, entry: Neighbor) {
        let handle = Arc::clone(&self.handle);
        let graph = handle.base().graph();
        let ef = self.ef;

        self.visited.set(entry.id as usize, true);
        let mut expanded = BitVec::from_elem(self.visited.len(), false);
        let mut discovered = vec![entry];
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(entry));
        let mut results: BinaryHeap<Neighbor> = BinaryHeap::new();
        if self.admissible(entry.id) {
            results.push(entry);
        }

        while let Some(Reverse(nearest)) = candidates.pop() {
            if results.len() >= ef && results.peek().map_or(false, |w| nearest.distance > w.distance) {
                break;
            }
            expanded.set(nearest.id as usize, true);
            for &nb in graph.neighbors(nearest.id, 0) {
                if !self.admit_neighbor(nb) {
                    continue;
                }
                let candidate = Neighbor::new(dc.distance(nb), nb);
                discovered.push(candidate);
                let worth = results.len() < ef
                    || results.peek().map_or(true, |w| candidate.distance < w.distance);
                if worth {
                    candidates.push(Reverse(candidate));
                    if self.admissible(nb) {
                        results.push(candidate);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut in_batch = BitVec::from_elem(self.visited.len(), false);
        for n in results.into_iter() {
            in_batch.set(n.id as usize, true);
            self.ready.push(Reverse(n));
        }
        for n in discovered {
            let id = n.id as usize;
            let batched = in_batch.get(id).unwrap_or(false);
            let was_expanded = expanded.get(id).unwrap_or(false);
            let emit = !batched && self.admissible(n.id);
            if was_expanded && !emit {
                continue;
            }
            self.frontier.push(Reverse(FrontierEntry {
                distance: n.distance,
                id: n.id,
                emit,
                expanded: was_expanded,
            }));
        }
        trace!(
            target: "stratavec::index",
            batch = self.ready.len(),
            frontier = self.frontier.len(),
            "Iterator seeded"
        );
    }

    /// Pop frontier entries until one is emitted; false once the frontier is empty
    fn visit(&mut self, dc: &mut DistanceComputer<'_>) -> bool {
        let handle = Arc::clone(&self.handle);
        let graph = handle.base().graph();
        while let Some(Reverse(top)) = self.frontier.pop() {
            if top.expanded {
                self.ready.push(Reverse(Neighbor::new(top.distance, top.id)));
                return true;
            }
            for &nb in graph.neighbors(top.id, 0) {
                if self.admit_neighbor(nb) {
                    let distance = dc.distance(nb);
                    self.frontier.push(Reverse(FrontierEntry {
                        distance,
                        id: nb,
                        emit: self.admissible(nb),
                        expanded: false,
                    }));
                }
            }
            if top.emit {
                self.frontier.push(Reverse(FrontierEntry {
                    expanded: true,
                    ..top
                }));
            }
        }
        false
    }
}

impl Iterator for IncrementalIterator {
    type Item = Result<(i64, f32)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance()
    }
}
