//! Searchable HNSW handles
//!
//! - [`HnswSkeleton`]: graph under construction over a build storage
//! - [`HnswIndex`]: finished graph plus the storage it is searched through
//! - [`SubIndex`]: an index with or without an exact re-rank storage
//!
//! Quantized variants whose codes are too coarse to build a good graph
//! (PQ, PRQ) are built in two phases: the skeleton is built on fp32
//! storage, then the trained storage is attached with
//! [`HnswSkeleton::attach_storage`] or [`SubIndex::attach_storage`], which
//! take ownership of the new storage and hand back the old one.

use std::collections::BinaryHeap;

use stratavec_core::MetricType;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::graph::{HnswGraph, Neighbor, VisitTrace};
use crate::selector::IdSelector;
use crate::storage::{CodecKind, CodecStorage, DistanceComputer};

/// Graph construction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Max connections per upper level (2*M at level 0)
    pub m: usize,
    /// Build-time beam width
    pub ef_construction: usize,
}

/// Result of a top-k graph search
#[derive(Debug, Clone, Default)]
pub struct KnnOutcome {
    /// Hits sorted ascending by min-oriented distance
    pub hits: Vec<Neighbor>,
    /// Visit log, present when tracing was requested
    pub trace: Option<VisitTrace>,
}

/// Graph being built over a build storage
#[derive(Debug)]
pub struct HnswSkeleton {
    graph: HnswGraph,
    storage: CodecStorage,
}

impl HnswSkeleton {
    /// Start a skeleton over an empty storage
    pub fn new(params: HnswParams, storage: CodecStorage) -> EngineResult<Self> {
        if storage.ntotal() != 0 {
            return Err(EngineError::StorageMismatch(format!(
                "skeleton storage must start empty, holds {} vectors",
                storage.ntotal()
            )));
        }
        Ok(Self {
            graph: HnswGraph::new(params.m, params.ef_construction),
            storage,
        })
    }

    /// Number of linked vectors
    pub fn ntotal(&self) -> usize {
        self.storage.ntotal()
    }

    /// Encode and link row-major vectors
    pub fn add(&mut self, data: &[f32]) -> EngineResult<()> {
        let dim = self.storage.dim();
        if data.len() % dim != 0 {
            return Err(EngineError::DimensionMismatch {
                expected: dim,
                got: data.len() % dim,
            });
        }
        for row in data.chunks_exact(dim) {
            self.storage.add(row)?;
            self.graph.insert(&self.storage)?;
        }
        Ok(())
    }

    /// Finish with the build storage as search storage
    pub fn into_index(self) -> HnswIndex {
        HnswIndex {
            graph: self.graph,
            storage: self.storage,
        }
    }

    /// Finish with `storage` as search storage; it must hold the same rows
    pub fn attach_storage(self, storage: CodecStorage) -> EngineResult<HnswIndex> {
        let mut index = self.into_index();
        index.attach_storage(storage)?;
        Ok(index)
    }
}

/// HNSW graph plus the storage it is searched through
#[derive(Debug, Clone, PartialEq)]
pub struct HnswIndex {
    pub(crate) graph: HnswGraph,
    pub(crate) storage: CodecStorage,
}

impl HnswIndex {
    /// Graph topology
    pub fn graph(&self) -> &HnswGraph {
        &self.graph
    }

    /// Search storage
    pub fn storage(&self) -> &CodecStorage {
        &self.storage
    }

    /// Number of vectors
    pub fn ntotal(&self) -> usize {
        self.storage.ntotal()
    }

    /// Vector dimension
    pub fn dim(&self) -> usize {
        self.storage.dim()
    }

    /// Metric
    pub fn metric(&self) -> MetricType {
        self.storage.metric()
    }

    /// Distance computer over the search storage
    pub fn distance_computer(&self, query: &[f32]) -> DistanceComputer<'_> {
        self.storage.distance_computer(query)
    }

    /// Replace the search storage, returning the previous one
    pub fn attach_storage(&mut self, storage: CodecStorage) -> EngineResult<CodecStorage> {
        if storage.ntotal() != self.graph.len() {
            return Err(EngineError::StorageMismatch(format!(
                "storage holds {} vectors, graph has {} nodes",
                storage.ntotal(),
                self.graph.len()
            )));
        }
        if storage.dim() != self.storage.dim() || storage.metric() != self.storage.metric() {
            return Err(EngineError::StorageMismatch(format!(
                "storage is {}d {}, index is {}d {}",
                storage.dim(),
                storage.metric(),
                self.storage.dim(),
                self.storage.metric()
            )));
        }
        debug!(
            target: "stratavec::engine",
            from = ?self.storage.kind(),
            to = ?storage.kind(),
            ntotal = storage.ntotal(),
            "Attaching storage"
        );
        Ok(std::mem::replace(&mut self.storage, storage))
    }

    fn check_dim(&self, query: &[f32]) -> EngineResult<()> {
        if query.len() != self.dim() {
            return Err(EngineError::DimensionMismatch {
                expected: self.dim(),
                got: query.len(),
            });
        }
        Ok(())
    }

    /// Filtered top-k graph search
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        selector: Option<&dyn IdSelector>,
        k_alpha: f32,
        trace: bool,
    ) -> EngineResult<KnnOutcome> {
        self.check_dim(query)?;
        let mut dc = self.storage.distance_computer(query);
        let mut visit_trace = if trace { Some(VisitTrace::default()) } else { None };
        let entry = match self.graph.greedy_descend(&mut dc, visit_trace.as_mut()) {
            Some(entry) => entry,
            None => {
                return Ok(KnnOutcome {
                    hits: Vec::new(),
                    trace: visit_trace,
                })
            }
        };
        let mut hits = self.graph.filtered_beam_search(
            &mut dc,
            entry,
            ef.max(k),
            selector,
            k_alpha,
            visit_trace.as_mut(),
        );
        hits.truncate(k);
        Ok(KnnOutcome {
            hits,
            trace: visit_trace,
        })
    }

    /// Exhaustive filtered top-k scan
    pub fn brute_force_knn(
        &self,
        query: &[f32],
        k: usize,
        selector: Option<&dyn IdSelector>,
    ) -> EngineResult<Vec<Neighbor>> {
        self.check_dim(query)?;
        let mut dc = self.storage.distance_computer(query);
        let mut heap: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(k + 1);
        if k == 0 {
            return Ok(Vec::new());
        }
        for id in 0..self.ntotal() as u32 {
            if selector.map_or(false, |s| !s.is_member(id)) {
                continue;
            }
            let candidate = Neighbor::new(dc.distance(id), id);
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().map_or(false, |worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }
        Ok(heap.into_sorted_vec())
    }

    /// Filtered graph range search; `radius` is min-oriented and exclusive
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        ef: usize,
        selector: Option<&dyn IdSelector>,
        k_alpha: f32,
    ) -> EngineResult<Vec<Neighbor>> {
        self.check_dim(query)?;
        let mut dc = self.storage.distance_computer(query);
        match self.graph.greedy_descend(&mut dc, None) {
            Some(entry) => Ok(self
                .graph
                .range_search(&mut dc, entry, radius, ef, selector, k_alpha)),
            None => Ok(Vec::new()),
        }
    }

    /// Exhaustive filtered range scan; `radius` is min-oriented and exclusive
    pub fn brute_force_range(
        &self,
        query: &[f32],
        radius: f32,
        selector: Option<&dyn IdSelector>,
    ) -> EngineResult<Vec<Neighbor>> {
        self.check_dim(query)?;
        let mut dc = self.storage.distance_computer(query);
        let mut hits: Vec<Neighbor> = (0..self.ntotal() as u32)
            .filter(|&id| selector.map_or(true, |s| s.is_member(id)))
            .filter_map(|id| {
                let d = dc.distance(id);
                (d < radius).then(|| Neighbor::new(d, id))
            })
            .collect();
        hits.sort();
        Ok(hits)
    }
}

/// Sub-index variant: `{Flat, SQ, PQ, PRQ} x {Unrefined, Refined}`
///
/// The codec of the base storage gives the first axis, the presence of a
/// refine storage the second.
#[derive(Debug, Clone, PartialEq)]
pub enum SubIndex {
    /// Searched and ranked through the base storage only
    Unrefined(HnswIndex),
    /// Candidates from the base storage are re-ranked through `refine`
    Refined {
        /// Approximate index
        base: HnswIndex,
        /// Exact (or finer) storage of the same rows
        refine: CodecStorage,
    },
}

impl SubIndex {
    /// Wrap `base` with an optional refine storage
    pub fn new(base: HnswIndex, refine: Option<CodecStorage>) -> EngineResult<Self> {
        match refine {
            None => Ok(SubIndex::Unrefined(base)),
            Some(refine) => {
                if refine.ntotal() != base.ntotal() || refine.dim() != base.dim() {
                    return Err(EngineError::StorageMismatch(format!(
                        "refine storage holds {}x{}, base holds {}x{}",
                        refine.ntotal(),
                        refine.dim(),
                        base.ntotal(),
                        base.dim()
                    )));
                }
                Ok(SubIndex::Refined { base, refine })
            }
        }
    }

    /// Approximate index
    pub fn base(&self) -> &HnswIndex {
        match self {
            SubIndex::Unrefined(base) | SubIndex::Refined { base, .. } => base,
        }
    }

    /// Refine storage, if any
    pub fn refine(&self) -> Option<&CodecStorage> {
        match self {
            SubIndex::Unrefined(_) => None,
            SubIndex::Refined { refine, .. } => Some(refine),
        }
    }

    /// Storage giving the most exact distances available
    pub fn exact_storage(&self) -> &CodecStorage {
        self.refine().unwrap_or_else(|| self.base().storage())
    }

    /// Codec of the base storage
    pub fn kind(&self) -> CodecKind {
        self.base().storage().kind()
    }

    /// Whether a refine storage is attached
    pub fn is_refined(&self) -> bool {
        matches!(self, SubIndex::Refined { .. })
    }

    /// Number of vectors
    pub fn ntotal(&self) -> usize {
        self.base().ntotal()
    }

    /// Vector dimension
    pub fn dim(&self) -> usize {
        self.base().dim()
    }

    /// Metric
    pub fn metric(&self) -> MetricType {
        self.base().metric()
    }

    /// Replace the base search storage, keeping any refine storage
    pub fn attach_storage(&mut self, storage: CodecStorage) -> EngineResult<CodecStorage> {
        match self {
            SubIndex::Unrefined(base) | SubIndex::Refined { base, .. } => {
                base.attach_storage(storage)
            }
        }
    }

    /// Re-rank `candidates` through the refine storage and keep the best `k`
    ///
    /// Without a refine storage the candidates are returned truncated.
    pub fn refine_rerank(&self, query: &[f32], mut candidates: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
        if let Some(refine) = self.refine() {
            let mut dc = refine.distance_computer(query);
            for c in candidates.iter_mut() {
                c.distance = dc.distance(c.id);
            }
            candidates.sort();
        }
        candidates.truncate(k);
        candidates
    }

    /// Bytes held by graph and storages
    pub fn memory_usage(&self) -> usize {
        self.base().graph().memory_usage()
            + self.base().storage().memory_usage()
            + self.refine().map_or(0, |r| r.memory_usage())
    }
}
