//! Partitioned index store
//!
//! The store owns an ordered sequence of partitions. Each partition holds one
//! sub-index handle and, when the build was scalar partitioned, the label of
//! every local offset. Global internal offsets are laid out partition after
//! partition; `index_rows_sum[p]..index_rows_sum[p + 1]` is the range of
//! partition `p`.
//!
//! ## Invariants
//!
//! - `index_rows_sum` starts at 0, is strictly increasing, and its last entry
//!   equals the total row count
//! - with more than one partition, `label_to_internal_offset` maps every label
//!   to a unique global offset and `labels[p][o - index_rows_sum[p]]` maps it
//!   back; with a single partition labels are the local offsets themselves
//! - a partition handle is replaced at most once ([`PartitionedIndexStore::finalize`])

use std::sync::Arc;

use stratavec_core::{BitsetView, IndexError, MetricType, Result};
use stratavec_engine::{CodecStorage, SubIndex};
use tracing::{debug, warn};

/// Outcome of routing a filter to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Search this partition
    Partition(usize),
    /// The filter excludes every row; the query has no results
    AllFiltered,
}

/// Persisted tables of a partitioned store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreLayout {
    /// Per partition, local offset → label; empty when not partitioned
    pub labels: Vec<Vec<u32>>,
    /// Cumulative partition sizes, `partitions + 1` entries
    pub index_rows_sum: Vec<u32>,
    /// Label → global offset; empty when not partitioned
    pub label_to_internal_offset: Vec<u32>,
}

impl StoreLayout {
    /// Layout of a store with a single partition of `rows` rows
    pub fn single(rows: usize) -> Self {
        Self {
            labels: Vec::new(),
            index_rows_sum: vec![0, rows as u32],
            label_to_internal_offset: Vec::new(),
        }
    }

    /// Layout of a scalar-partitioned store
    ///
    /// `partition_labels[p]` lists the labels placed in partition `p`, in
    /// local offset order. Labels must cover `0..total` exactly once.
    pub fn partitioned(partition_labels: Vec<Vec<u32>>) -> Result<Self> {
        let total: usize = partition_labels.iter().map(Vec::len).sum();
        let mut index_rows_sum = Vec::with_capacity(partition_labels.len() + 1);
        index_rows_sum.push(0u32);
        let mut label_to_internal_offset = vec![u32::MAX; total];
        for labels in &partition_labels {
            let base = *index_rows_sum.last().unwrap_or(&0);
            for (local, &label) in labels.iter().enumerate() {
                let slot = label_to_internal_offset
                    .get_mut(label as usize)
                    .ok_or(IndexError::UnknownLabel {
                        label: label as i64,
                    })?;
                if *slot != u32::MAX {
                    return Err(IndexError::invalid_args(format!(
                        "label {} is placed in more than one partition",
                        label
                    )));
                }
                *slot = base + local as u32;
            }
            index_rows_sum.push(base + labels.len() as u32);
        }
        Ok(Self {
            labels: partition_labels,
            index_rows_sum,
            label_to_internal_offset,
        })
    }
}

#[derive(Debug)]
struct Partition {
    handle: Arc<SubIndex>,
    labels: Option<Arc<Vec<u32>>>,
    finalized: bool,
}

/// Ordered partitions plus their offset and label tables
#[derive(Debug)]
pub struct PartitionedIndexStore {
    partitions: Vec<Partition>,
    index_rows_sum: Vec<u32>,
    label_to_internal_offset: Arc<Vec<u32>>,
    /// Global offset → outermost external id, used by filters carrying ids
    internal_offset_to_most_external_id: Option<Arc<Vec<u32>>>,
}

impl PartitionedIndexStore {
    /// Assemble a store from its tables and one handle per partition
    ///
    /// Every invariant of the layout is checked against the handles.
    pub fn from_layout(layout: StoreLayout, handles: Vec<SubIndex>) -> Result<Self> {
        let StoreLayout {
            labels,
            index_rows_sum,
            label_to_internal_offset,
        } = layout;

        if handles.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if index_rows_sum.len() != handles.len() + 1 || index_rows_sum.first() != Some(&0) {
            return Err(IndexError::invalid_args(format!(
                "offset table has {} entries for {} partitions",
                index_rows_sum.len(),
                handles.len()
            )));
        }
        for (p, handle) in handles.iter().enumerate() {
            let rows = (index_rows_sum[p + 1] as usize).checked_sub(index_rows_sum[p] as usize);
            if rows != Some(handle.ntotal()) || (handles.len() > 1 && handle.ntotal() == 0) {
                return Err(IndexError::invalid_args(format!(
                    "partition {} holds {} rows, offset table says {:?}",
                    p,
                    handle.ntotal(),
                    rows
                )));
            }
            if handle.dim() != handles[0].dim() || handle.metric() != handles[0].metric() {
                return Err(IndexError::invalid_args(format!(
                    "partition {} is {}d {}, partition 0 is {}d {}",
                    p,
                    handle.dim(),
                    handle.metric(),
                    handles[0].dim(),
                    handles[0].metric()
                )));
            }
        }

        let partitioned = handles.len() > 1;
        if partitioned {
            let total = index_rows_sum[handles.len()] as usize;
            if labels.len() != handles.len() || label_to_internal_offset.len() != total {
                return Err(IndexError::invalid_args(format!(
                    "{} label arrays and {} label offsets for {} partitions of {} rows",
                    labels.len(),
                    label_to_internal_offset.len(),
                    handles.len(),
                    total
                )));
            }
            for (p, part_labels) in labels.iter().enumerate() {
                let base = index_rows_sum[p];
                for (local, &label) in part_labels.iter().enumerate() {
                    if label_to_internal_offset.get(label as usize) != Some(&(base + local as u32)) {
                        return Err(IndexError::invalid_args(format!(
                            "label {} of partition {} does not map back to offset {}",
                            label,
                            p,
                            base as usize + local
                        )));
                    }
                }
            }
        } else if !labels.is_empty() || !label_to_internal_offset.is_empty() {
            return Err(IndexError::invalid_args(
                "label tables are only kept for partitioned stores",
            ));
        }

        let mut labels = labels.into_iter();
        let partitions = handles
            .into_iter()
            .map(|handle| Partition {
                handle: Arc::new(handle),
                labels: if partitioned {
                    labels.next().map(Arc::new)
                } else {
                    None
                },
                finalized: false,
            })
            .collect();

        Ok(Self {
            partitions,
            index_rows_sum,
            label_to_internal_offset: Arc::new(label_to_internal_offset),
            internal_offset_to_most_external_id: None,
        })
    }

    /// Store with a single, unpartitioned handle
    pub fn single(handle: SubIndex) -> Self {
        let rows = handle.ntotal();
        Self {
            partitions: vec![Partition {
                handle: Arc::new(handle),
                labels: None,
                finalized: false,
            }],
            index_rows_sum: vec![0, rows as u32],
            label_to_internal_offset: Arc::new(Vec::new()),
            internal_offset_to_most_external_id: None,
        }
    }

    /// Copy of the persisted tables
    pub fn layout(&self) -> StoreLayout {
        StoreLayout {
            labels: self
                .partitions
                .iter()
                .filter_map(|p| p.labels.as_ref().map(|l| l.as_ref().clone()))
                .collect(),
            index_rows_sum: self.index_rows_sum.clone(),
            label_to_internal_offset: self.label_to_internal_offset.as_ref().clone(),
        }
    }

    // ========================================================================
    // Shape
    // ========================================================================

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the store was built with scalar partitioning
    pub fn is_partitioned(&self) -> bool {
        self.partitions.len() > 1
    }

    /// Total number of rows
    pub fn count(&self) -> usize {
        self.index_rows_sum.last().copied().unwrap_or(0) as usize
    }

    /// Vector dimension
    pub fn dim(&self) -> usize {
        self.partitions[0].handle.dim()
    }

    /// Metric of every partition
    pub fn metric(&self) -> MetricType {
        self.partitions[0].handle.metric()
    }

    /// Number of rows in partition `p`
    pub fn partition_rows(&self, p: usize) -> Result<usize> {
        self.partition(p).map(|part| part.handle.ntotal())
    }

    /// Cumulative offset table
    pub fn index_rows_sum(&self) -> &[u32] {
        &self.index_rows_sum
    }

    /// Sub-index of partition `p`
    pub fn handle(&self, p: usize) -> Result<&Arc<SubIndex>> {
        self.partition(p).map(|part| &part.handle)
    }

    /// Local offset → label array of partition `p`, `None` when unpartitioned
    pub fn labels(&self, p: usize) -> Result<Option<&Arc<Vec<u32>>>> {
        self.partition(p).map(|part| part.labels.as_ref())
    }

    /// Label → global offset table, empty when unpartitioned
    pub fn label_to_internal_offset(&self) -> &Arc<Vec<u32>> {
        &self.label_to_internal_offset
    }

    /// Bytes held by handles and tables
    pub fn memory_usage(&self) -> usize {
        let tables = (self.index_rows_sum.len() + self.label_to_internal_offset.len()) * 4;
        self.partitions
            .iter()
            .map(|p| p.handle.memory_usage() + p.labels.as_ref().map_or(0, |l| l.len() * 4))
            .sum::<usize>()
            + tables
    }

    fn partition(&self, p: usize) -> Result<&Partition> {
        self.partitions.get(p).ok_or_else(|| {
            IndexError::invalid_args(format!(
                "partition {} out of range ({} partitions)",
                p,
                self.partitions.len()
            ))
        })
    }

    /// Partition owning global offset `offset`
    fn owning_partition(&self, offset: usize) -> Option<usize> {
        // upper_bound(index_rows_sum, offset) - 1
        let upper = self
            .index_rows_sum
            .partition_point(|&sum| sum as usize <= offset);
        if upper == 0 || upper == self.index_rows_sum.len() {
            None
        } else {
            Some(upper - 1)
        }
    }

    // ========================================================================
    // Id mapping
    // ========================================================================

    /// Partition and local offset of `label`
    pub fn label_to_offset(&self, label: i64) -> Result<(usize, u32)> {
        let unknown = IndexError::UnknownLabel { label };
        let idx = usize::try_from(label).map_err(|_| unknown)?;
        if !self.is_partitioned() {
            return if idx < self.count() {
                Ok((0, idx as u32))
            } else {
                Err(IndexError::UnknownLabel { label })
            };
        }
        let offset = *self
            .label_to_internal_offset
            .get(idx)
            .ok_or(IndexError::UnknownLabel { label })?;
        let p = self
            .owning_partition(offset as usize)
            .ok_or(IndexError::UnknownLabel { label })?;
        Ok((p, offset - self.index_rows_sum[p]))
    }

    /// Label of local offset `local` in partition `p`
    pub fn offset_to_label(&self, p: usize, local: u32) -> Result<i64> {
        let part = self.partition(p)?;
        match &part.labels {
            Some(labels) => labels.get(local as usize).map(|&l| l as i64).ok_or_else(|| {
                IndexError::InnerEngine(format!(
                    "offset {} out of range for partition {} ({} rows)",
                    local,
                    p,
                    labels.len()
                ))
            }),
            None => Ok(local as i64),
        }
    }

    /// Global offset → label for every row
    ///
    /// Identity with one partition, otherwise the concatenated label arrays.
    pub fn internal_id_to_external_id_map(&self) -> Vec<u32> {
        if !self.is_partitioned() {
            return (0..self.count() as u32).collect();
        }
        let mut map = Vec::with_capacity(self.count());
        for part in &self.partitions {
            if let Some(labels) = &part.labels {
                map.extend_from_slice(labels);
            }
        }
        map
    }

    /// Install the global offset → outermost external id map
    pub fn set_internal_id_to_most_external_id_map(&mut self, map: Vec<u32>) -> Result<()> {
        if map.len() != self.count() {
            return Err(IndexError::invalid_args(format!(
                "external id map has {} entries, store holds {} rows",
                map.len(),
                self.count()
            )));
        }
        self.internal_offset_to_most_external_id = Some(Arc::new(map));
        Ok(())
    }

    // ========================================================================
    // Filtering and routing
    // ========================================================================

    /// Attach the outermost external id map to a caller filter, if one is set
    pub fn prepare_filter(&self, filter: &BitsetView) -> BitsetView {
        let mut view = filter.clone();
        if let Some(map) = &self.internal_offset_to_most_external_id {
            if !view.empty() {
                view.set_out_ids(Arc::clone(map), map.len(), None);
            }
        }
        view
    }

    /// Partition a prepared filter must be searched in
    ///
    /// With several partitions the filter must select the partition key: the
    /// first admissible id decides the partition. A filter that admits
    /// everything therefore lands in the partition of the first row.
    pub fn route_for_filter(&self, filter: &BitsetView) -> Result<Route> {
        if !self.is_partitioned() {
            return Ok(Route::Partition(0));
        }
        if filter.empty() {
            return Err(IndexError::invalid_args(
                "partition key value not correctly set",
            ));
        }
        if filter.count() >= filter.size() {
            debug!(target: "stratavec::index", size = filter.size(), "Filter excludes every row");
            return Ok(Route::AllFiltered);
        }
        if filter.count() == 0 {
            warn!(
                target: "stratavec::index",
                partitions = self.partitions.len(),
                "Filter admits every row, searching the first row's partition only"
            );
        }

        let first_valid = filter.get_first_valid_index();
        let offset = if filter.has_out_ids() {
            Some(first_valid)
        } else {
            self.label_to_internal_offset
                .get(first_valid)
                .map(|&o| o as usize)
        };
        let partition = offset.and_then(|o| self.owning_partition(o)).ok_or_else(|| {
            warn!(target: "stratavec::index", first_valid, "No partition owns the first admissible id");
            IndexError::invalid_args("fail to find the partition for the filter")
        })?;
        debug!(target: "stratavec::index", partition, first_valid, "Routed filter");
        Ok(Route::Partition(partition))
    }

    /// Filter view addressed by partition `p`'s local offsets
    ///
    /// The filtered-out count is narrowed to the partition: every admitted id
    /// is assumed to belong to it.
    pub fn partition_filter(&self, filter: BitsetView, p: usize) -> Result<BitsetView> {
        let part = self.partition(p)?;
        let labels = match (&part.labels, self.is_partitioned()) {
            (Some(labels), true) => labels,
            _ => return Ok(filter),
        };
        let mut view = filter;
        let num_ids = labels.len();
        let admitted = view.size() - view.count();
        let filtered_out = num_ids.saturating_sub(admitted);
        if !view.has_out_ids() {
            view.set_out_ids(Arc::clone(labels), num_ids, Some(filtered_out));
        } else {
            let map = self
                .internal_offset_to_most_external_id
                .as_ref()
                .ok_or_else(|| {
                    IndexError::invalid_args("filter carries external ids but no external id map is set")
                })?;
            view.set_out_ids(Arc::clone(map), num_ids, Some(filtered_out));
            view.set_id_offset(self.index_rows_sum[p] as usize);
        }
        Ok(view)
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Replace partition `p`'s search storage, keeping any refine storage
    ///
    /// Allowed once per partition and only while no search holds the handle.
    pub fn finalize(&mut self, p: usize, storage: CodecStorage) -> Result<()> {
        let count = self.partitions.len();
        let part = self.partitions.get_mut(p).ok_or_else(|| {
            IndexError::invalid_args(format!("partition {} out of range ({} partitions)", p, count))
        })?;
        if part.finalized {
            return Err(IndexError::invalid_args(format!(
                "partition {} is already finalized",
                p
            )));
        }
        let handle = Arc::get_mut(&mut part.handle).ok_or_else(|| {
            IndexError::invalid_args(format!("partition {} is in use by a search", p))
        })?;
        let kind = storage.kind();
        handle.attach_storage(storage)?;
        part.finalized = true;
        debug!(target: "stratavec::index", partition = p, storage = ?kind, "Finalized partition");
        Ok(())
    }

    /// Mark every partition final, as after loading from bytes
    pub(crate) fn seal(&mut self) {
        for part in &mut self.partitions {
            part.finalized = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratavec_engine::{Codec, HnswParams, HnswSkeleton, ScalarQuantizer, SqKind};

    fn sub_index(rows: &[f32], dim: usize) -> SubIndex {
        let params = HnswParams {
            m: 4,
            ef_construction: 16,
        };
        let mut skeleton = HnswSkeleton::new(params, CodecStorage::flat(dim, MetricType::L2)).unwrap();
        skeleton.add(rows).unwrap();
        SubIndex::new(skeleton.into_index(), None).unwrap()
    }

    /// Labels 0..9 split into partitions {1,3,5,7,9}, {0,2}, {4,6,8}
    fn three_way() -> PartitionedIndexStore {
        let parts = vec![vec![1, 3, 5, 7, 9], vec![0, 2], vec![4, 6, 8]];
        let handles = parts
            .iter()
            .map(|labels| {
                let rows: Vec<f32> = labels.iter().map(|&l| l as f32).collect();
                sub_index(&rows, 1)
            })
            .collect();
        PartitionedIndexStore::from_layout(StoreLayout::partitioned(parts).unwrap(), handles).unwrap()
    }

    #[test]
    fn test_layout_tables() {
        let store = three_way();
        assert_eq!(store.index_rows_sum(), &[0, 5, 7, 10]);
        assert_eq!(store.count(), 10);
        assert_eq!(store.partition_count(), 3);
        assert_eq!(store.label_to_internal_offset()[0], 5);
        assert_eq!(store.label_to_internal_offset()[9], 4);
    }

    #[test]
    fn test_label_offset_bijection() {
        let store = three_way();
        for label in 0..10i64 {
            let (p, local) = store.label_to_offset(label).unwrap();
            assert_eq!(store.offset_to_label(p, local).unwrap(), label);
        }
        assert!(matches!(
            store.label_to_offset(10),
            Err(IndexError::UnknownLabel { label: 10 })
        ));
        assert!(matches!(
            store.label_to_offset(-1),
            Err(IndexError::UnknownLabel { label: -1 })
        ));
    }

    #[test]
    fn test_single_partition_identity() {
        let store = PartitionedIndexStore::single(sub_index(&[0.0, 1.0, 2.0], 1));
        assert_eq!(store.label_to_offset(2).unwrap(), (0, 2));
        assert_eq!(store.offset_to_label(0, 1).unwrap(), 1);
        assert_eq!(store.internal_id_to_external_id_map(), vec![0, 1, 2]);
        assert_eq!(
            store.route_for_filter(&BitsetView::default()).unwrap(),
            Route::Partition(0)
        );
    }

    #[test]
    fn test_route_to_owning_partition() {
        let store = three_way();
        let filter = BitsetView::admitting_only(10, [6, 8]);
        assert_eq!(store.route_for_filter(&filter).unwrap(), Route::Partition(2));
        let filter = BitsetView::admitting_only(10, [2]);
        assert_eq!(store.route_for_filter(&filter).unwrap(), Route::Partition(1));
    }

    #[test]
    fn test_route_requires_filter() {
        let store = three_way();
        let err = store.route_for_filter(&BitsetView::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid args: partition key value not correctly set"
        );
    }

    #[test]
    fn test_route_all_filtered() {
        let store = three_way();
        let filter = BitsetView::admitting_only(10, std::iter::empty());
        assert_eq!(store.route_for_filter(&filter).unwrap(), Route::AllFiltered);
    }

    #[test]
    fn test_fully_open_filter_routes_to_first_row() {
        // label 0 lives in partition 1
        let store = three_way();
        let filter = BitsetView::from_filtered_ids(10, std::iter::empty());
        assert_eq!(store.route_for_filter(&filter).unwrap(), Route::Partition(1));
    }

    #[test]
    fn test_partition_filter_narrows_counts() {
        let store = three_way();
        let filter = BitsetView::admitting_only(10, [4, 8]);
        let view = store.partition_filter(filter, 2).unwrap();
        assert_eq!(view.size(), 3);
        assert_eq!(view.count(), 1);
        // local 0 -> label 4, local 1 -> label 6, local 2 -> label 8
        assert!(!view.test(0));
        assert!(view.test(1));
        assert!(!view.test(2));
    }

    #[test]
    fn test_most_external_ids() {
        let mut store = three_way();
        // global offset o -> outer id 100 + o
        let outer: Vec<u32> = (0..10).map(|o| 100 + o).collect();
        store.set_internal_id_to_most_external_id_map(outer).unwrap();

        // admit outer id 106 only: global offset 6, partition 1 local 1
        let filter = BitsetView::admitting_only(110, [106]);
        let prepared = store.prepare_filter(&filter);
        assert!(prepared.has_out_ids());
        assert_eq!(store.route_for_filter(&prepared).unwrap(), Route::Partition(1));

        let view = store.partition_filter(prepared, 1).unwrap();
        assert_eq!(view.size(), 2);
        assert_eq!(view.count(), 1);
        assert!(view.test(0));
        assert!(!view.test(1));

        assert!(store
            .set_internal_id_to_most_external_id_map(vec![1, 2])
            .is_err());
    }

    #[test]
    fn test_finalize_once() {
        let rows: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut store = PartitionedIndexStore::single(sub_index(&rows, 1));
        let sq = ScalarQuantizer::train(SqKind::Sq8, 1, &rows).unwrap();
        let mut storage = CodecStorage::new(1, MetricType::L2, Codec::Sq(sq));
        storage.add(&rows).unwrap();

        store.finalize(0, storage.clone()).unwrap();
        assert_eq!(store.handle(0).unwrap().kind(), stratavec_engine::CodecKind::Sq);
        assert!(store.finalize(0, storage).is_err());
    }

    #[test]
    fn test_finalize_refused_while_shared() {
        let rows: Vec<f32> = (0..4).map(|i| i as f32).collect();
        let mut store = PartitionedIndexStore::single(sub_index(&rows, 1));
        let held = Arc::clone(store.handle(0).unwrap());
        let mut storage = CodecStorage::flat(1, MetricType::L2);
        storage.add(&rows).unwrap();
        let err = store.finalize(0, storage).unwrap_err();
        assert!(err.to_string().contains("in use"));
        drop(held);
    }

    #[test]
    fn test_layout_rejects_inconsistent_tables() {
        let parts = vec![vec![0, 1], vec![2]];
        let mut layout = StoreLayout::partitioned(parts).unwrap();
        layout.label_to_internal_offset.swap(0, 2);
        let handles = vec![sub_index(&[0.0, 1.0], 1), sub_index(&[2.0], 1)];
        assert!(PartitionedIndexStore::from_layout(layout, handles).is_err());

        assert!(StoreLayout::partitioned(vec![vec![0, 1], vec![1]]).is_err());
    }
}
