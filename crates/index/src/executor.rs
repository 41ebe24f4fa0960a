//! Filtered batch search over a partitioned store
//!
//! Every batch is routed once: the caller filter is prepared, routed to one
//! partition and narrowed to that partition's local offsets. Rows then fan
//! out over the search pool, one task per row.
//!
//! ## Strategy
//!
//! Top-k search scans exhaustively when the filter leaves too few rows for
//! a graph walk to be worthwhile. Otherwise the graph is searched first,
//! and the row is re-run exhaustively if the walk came back short while
//! enough admissible rows exist. Range search picks one strategy up front.

use std::sync::Arc;

use serde::Serialize;
use stratavec_core::{
    BitsetView, ComputePool, DataSet, HnswConfig, IndexError, KnnResult, MetricType, RangeResult,
    Result,
};
use stratavec_engine::{EngineResult, IdSelector, Neighbor, SubIndex, VisitTrace};
use tracing::{debug, error};

use crate::iterator::{IncrementalIterator, LabelMapping};
use crate::store::{PartitionedIndexStore, Route};

/// Filtered share of a partition above which top-k scans exhaustively
pub const KNN_BF_FILTER_THRESHOLD: f32 = 0.93;
/// Share of admissible rows that `k` may reach before top-k scans exhaustively
pub const KNN_BF_TOPK_THRESHOLD: f32 = 0.5;
/// Filtered share of a partition above which range search scans exhaustively
pub const RANGE_BF_FILTER_THRESHOLD: f32 = 0.97;
/// Filter ratio → graph pruning alpha
const ALPHA_SCALE: f32 = 0.7;

/// Caller filter as an engine selector over local offsets
struct FilterSelector<'a>(&'a BitsetView);

impl IdSelector for FilterSelector<'_> {
    fn is_member(&self, id: u32) -> bool {
        !self.0.test(id as usize)
    }
}

/// Partition a batch was routed to
struct Target<'a> {
    partition: usize,
    handle: &'a Arc<SubIndex>,
    filter: BitsetView,
}

impl Target<'_> {
    fn selector(&self) -> Option<FilterSelector<'_>> {
        if self.filter.empty() {
            None
        } else {
            Some(FilterSelector(&self.filter))
        }
    }

    /// Ids of the partition the filter admits
    fn admissible(&self) -> usize {
        self.filter.size() - self.filter.count()
    }

    fn k_alpha(&self) -> f32 {
        self.filter.filter_ratio() * ALPHA_SCALE
    }
}

/// Whether a top-`k` search over `ntotal` rows should skip the graph
pub fn knn_needs_brute_force(ntotal: usize, filter: &BitsetView, k: usize) -> bool {
    let filtered_out = filter.count() as f32;
    filtered_out >= ntotal as f32 * KNN_BF_FILTER_THRESHOLD
        || k as f32 >= (ntotal as f32 - filtered_out) * KNN_BF_TOPK_THRESHOLD
}

/// Whether a range search over `ntotal` rows should skip the graph
pub fn range_needs_brute_force(ntotal: usize, filter: &BitsetView) -> bool {
    !filter.empty() && filter.count() as f32 >= ntotal as f32 * RANGE_BF_FILTER_THRESHOLD
}

/// Keep the hits of one row that lie between `radius` and `range_filter`
///
/// Distance metrics keep `range_filter <= d < radius`, similarity metrics
/// keep `radius < d <= range_filter`. Both bounds are in the metric's own
/// orientation.
pub fn filter_range_result(
    metric: MetricType,
    radius: f32,
    range_filter: f32,
    ids: &mut Vec<i64>,
    distances: &mut Vec<f32>,
) {
    let keep = |d: f32| {
        if metric.is_similarity() {
            radius < d && d <= range_filter
        } else {
            range_filter <= d && d < radius
        }
    };
    let mut w = 0;
    for r in 0..ids.len() {
        if keep(distances[r]) {
            ids[w] = ids[r];
            distances[w] = distances[r];
            w += 1;
        }
    }
    ids.truncate(w);
    distances.truncate(w);
}

/// Convert an engine failure, logging it first
fn engine<T>(result: EngineResult<T>) -> Result<T> {
    result.map_err(|e| {
        error!(target: "stratavec::index", error = %e, "Engine failure during search");
        IndexError::from(e)
    })
}

#[derive(Serialize)]
struct TraceVisit {
    level: usize,
    id: i64,
    distance: f32,
}

#[derive(Serialize)]
struct TraceJson {
    visits: Vec<TraceVisit>,
}

/// Runs batches of queries against one [`PartitionedIndexStore`]
pub struct FilteredSearchExecutor<'a> {
    store: &'a PartitionedIndexStore,
    pool: &'a ComputePool,
}

impl<'a> FilteredSearchExecutor<'a> {
    /// Executor over `store`, fanning rows out on `pool`
    pub fn new(store: &'a PartitionedIndexStore, pool: &'a ComputePool) -> Self {
        Self { store, pool }
    }

    /// Route `filter`; `None` when it excludes every row
    fn target(&self, filter: &BitsetView) -> Result<Option<Target<'a>>> {
        let prepared = self.store.prepare_filter(filter);
        match self.store.route_for_filter(&prepared)? {
            Route::AllFiltered => Ok(None),
            Route::Partition(p) => Ok(Some(Target {
                partition: p,
                handle: self.store.handle(p)?,
                filter: self.store.partition_filter(prepared, p)?,
            })),
        }
    }

    fn check_dim(&self, queries: &DataSet) -> Result<()> {
        if queries.dim() != self.store.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dim(),
                got: queries.dim(),
            });
        }
        Ok(())
    }

    /// Top-k search of every query row
    ///
    /// Rows with fewer than `k` admissible hits are padded with id `-1` and
    /// the metric's worst distance.
    pub fn search(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<KnnResult> {
        let k = cfg.require_k()?;
        let rows = queries.rows();
        let trace = cfg.trace_visit();
        if trace && rows != 1 {
            return Err(IndexError::invalid_args("a single query vector is required"));
        }
        self.check_dim(queries)?;

        let metric = self.store.metric();
        let mut result = KnnResult {
            rows,
            k,
            ids: vec![-1; rows * k],
            distances: vec![metric.worst_distance(); rows * k],
            trace_json: None,
        };
        let target = match self.target(filter)? {
            Some(target) => target,
            None => return Ok(result),
        };

        let handle = target.handle;
        let base = handle.base();
        let brute_force = knn_needs_brute_force(handle.ntotal(), &target.filter, k);
        let refine = cfg.refine_k.is_some() && handle.is_refined();
        let fetch = if refine {
            ((k as f32 * cfg.refine_k()).ceil() as usize).max(k)
        } else {
            k
        };
        let ef = cfg.search_ef(fetch);
        let k_alpha = target.k_alpha();
        let admissible = target.admissible();
        debug!(
            target: "stratavec::index",
            partition = target.partition,
            rows,
            k,
            brute_force,
            refine,
            filtered_out = target.filter.count(),
            "Top-k search"
        );

        let data = queries.to_f32();
        let dim = queries.dim();
        let target = &target;
        let tasks: Vec<_> = data
            .chunks_exact(dim.max(1))
            .take(rows)
            .map(|query| {
                move || -> Result<(Vec<Neighbor>, Option<VisitTrace>)> {
                    let selector = target.selector();
                    let selector = selector.as_ref().map(|s| s as &dyn IdSelector);
                    let finish = |hits: Vec<Neighbor>| {
                        if refine {
                            handle.refine_rerank(query, hits, k)
                        } else {
                            let mut hits = hits;
                            hits.truncate(k);
                            hits
                        }
                    };

                    if brute_force {
                        let hits = engine(base.brute_force_knn(query, fetch, selector))?;
                        return Ok((finish(hits), None));
                    }
                    let outcome = engine(base.search_knn(query, fetch, ef, selector, k_alpha, trace))?;
                    let hits = finish(outcome.hits);
                    if hits.len() < k && hits.len() < admissible {
                        debug!(
                            target: "stratavec::index",
                            found = hits.len(),
                            admissible,
                            "Graph search came back short, scanning"
                        );
                        let hits = engine(base.brute_force_knn(query, fetch, selector))?;
                        return Ok((finish(hits), outcome.trace));
                    }
                    Ok((hits, outcome.trace))
                }
            })
            .collect();
        let outcomes = self.pool.run_rows(tasks)?;

        for (row, (hits, visit_trace)) in outcomes.into_iter().enumerate() {
            for (slot, n) in hits.iter().enumerate() {
                result.ids[row * k + slot] = self.store.offset_to_label(target.partition, n.id)?;
                result.distances[row * k + slot] = metric.from_min_oriented(n.distance);
            }
            if trace {
                result.trace_json = Some(self.trace_json(target.partition, metric, visit_trace)?);
            }
        }
        Ok(result)
    }

    fn trace_json(
        &self,
        partition: usize,
        metric: MetricType,
        trace: Option<VisitTrace>,
    ) -> Result<String> {
        let visits = trace
            .unwrap_or_default()
            .visits
            .into_iter()
            .map(|v| {
                Ok(TraceVisit {
                    level: v.level,
                    id: self.store.offset_to_label(partition, v.node)?,
                    distance: metric.from_min_oriented(v.distance),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_string(&TraceJson { visits })?)
    }

    /// Range search of every query row, hits sorted best first
    ///
    /// `radius` is exclusive. A refine storage, when present, re-checks
    /// every hit with exact distances.
    pub fn range_search(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<RangeResult> {
        let ef = cfg.require_ef()?;
        let radius = cfg.require_radius()?;
        self.check_dim(queries)?;
        let rows = queries.rows();
        let metric = self.store.metric();
        let range_filter = cfg.range_filter_or_default(metric);

        let target = match self.target(filter)? {
            Some(target) => target,
            None => return Ok(RangeResult::from_rows(vec![(Vec::new(), Vec::new()); rows])),
        };
        let handle = target.handle;
        let base = handle.base();
        let brute_force = range_needs_brute_force(handle.ntotal(), &target.filter);
        let radius_min = metric.to_min_oriented(radius);
        let k_alpha = target.k_alpha();
        debug!(
            target: "stratavec::index",
            partition = target.partition,
            rows,
            radius,
            brute_force,
            "Range search"
        );

        let data = queries.to_f32();
        let dim = queries.dim();
        let target = &target;
        let tasks: Vec<_> = data
            .chunks_exact(dim.max(1))
            .take(rows)
            .map(|query| {
                move || -> Result<Vec<Neighbor>> {
                    let selector = target.selector();
                    let selector = selector.as_ref().map(|s| s as &dyn IdSelector);
                    let hits = if brute_force {
                        engine(base.brute_force_range(query, radius_min, selector))?
                    } else {
                        engine(base.range_search(query, radius_min, ef, selector, k_alpha))?
                    };
                    let refine = match handle.refine() {
                        Some(refine) => refine,
                        None => return Ok(hits),
                    };
                    let mut dc = refine.distance_computer(query);
                    let mut exact: Vec<Neighbor> = hits
                        .into_iter()
                        .filter_map(|n| {
                            let d = dc.distance(n.id);
                            (d < radius_min).then(|| Neighbor::new(d, n.id))
                        })
                        .collect();
                    exact.sort();
                    Ok(exact)
                }
            })
            .collect();
        let outcomes = self.pool.run_rows(tasks)?;

        let filter_bounds = range_filter != metric.default_range_filter();
        let mut per_row = Vec::with_capacity(rows);
        for hits in outcomes {
            let mut ids = Vec::with_capacity(hits.len());
            let mut distances = Vec::with_capacity(hits.len());
            for n in hits {
                ids.push(self.store.offset_to_label(target.partition, n.id)?);
                distances.push(metric.from_min_oriented(n.distance));
            }
            if filter_bounds {
                filter_range_result(metric, radius, range_filter, &mut ids, &mut distances);
            }
            per_row.push((ids, distances));
        }
        Ok(RangeResult::from_rows(per_row))
    }

    /// Distances between every query row and every label, row-major
    ///
    /// Every label must live in the partition the filter routes to. Values
    /// are in the metric's own orientation, computed on the most exact
    /// storage available.
    pub fn calc_dist_by_ids(
        &self,
        queries: &DataSet,
        filter: &BitsetView,
        labels: &[i64],
    ) -> Result<Vec<f32>> {
        self.check_dim(queries)?;
        let target = self.target(filter)?.ok_or_else(|| {
            IndexError::invalid_args("partition key value not correctly set")
        })?;

        let locals = labels
            .iter()
            .map(|&label| {
                let (p, local) = self.store.label_to_offset(label)?;
                if p != target.partition {
                    return Err(IndexError::invalid_args(format!(
                        "label {} lives in partition {}, filter selects partition {}",
                        label, p, target.partition
                    )));
                }
                Ok(local)
            })
            .collect::<Result<Vec<u32>>>()?;

        let storage = target.handle.exact_storage();
        let data = queries.to_f32();
        let dim = queries.dim();
        let locals = &locals;
        let tasks: Vec<_> = data
            .chunks_exact(dim.max(1))
            .take(queries.rows())
            .map(|query| {
                move || -> Result<Vec<f32>> {
                    let mut dc = storage.distance_computer(query);
                    Ok(locals.iter().map(|&local| dc.raw_distance(local)).collect())
                }
            })
            .collect();
        Ok(self.pool.run_rows(tasks)?.concat())
    }

    /// One incremental iterator per query row
    ///
    /// Seeding is submitted to the search pool and awaited here, so call
    /// this from outside that pool. Waiting from one of its own workers can
    /// block the slot a seeding task needs.
    pub fn ann_iterators(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<Vec<IncrementalIterator>> {
        self.check_dim(queries)?;
        let (partition, filter, exhausted) = match self.target(filter)? {
            Some(target) => (target.partition, target.filter, false),
            None => (0, BitsetView::default(), true),
        };
        let handle = Arc::clone(self.store.handle(partition)?);
        let mapping = LabelMapping {
            labels: self.store.labels(partition)?.cloned(),
            label_to_internal_offset: Arc::clone(self.store.label_to_internal_offset()),
            base_offset: self.store.index_rows_sum()[partition],
        };
        let ef = cfg.iterator_ef();
        let ratio = cfg.iterator_refine_ratio(handle.is_refined());
        debug!(
            target: "stratavec::index",
            partition,
            rows = queries.rows(),
            ef,
            refine_ratio = ratio,
            "Creating iterators"
        );

        let data = queries.to_f32();
        let dim = queries.dim();
        let handles: Vec<_> = data
            .chunks_exact(dim.max(1))
            .take(queries.rows())
            .map(|query| {
                let handle = Arc::clone(&handle);
                let mapping = mapping.clone();
                let filter = filter.clone();
                let query = query.to_vec();
                self.pool.submit(move || {
                    let it = IncrementalIterator::new(handle, mapping, query, filter, ef, ratio)?;
                    Ok(if exhausted { it.into_exhausted() } else { it })
                })
            })
            .collect();
        stratavec_core::await_all(handles)
    }
}
