//! HNSW index node
//!
//! [`HnswIndexNode`] is the entry point callers hold: it trains codecs,
//! adds rows partition by partition, serves searches through the
//! [`FilteredSearchExecutor`], and persists the store into a [`BinarySet`].
//!
//! ## Lifecycle
//!
//! ```text
//! Empty --train--> Trained --add--> Ready
//!   \_______________deserialize_______/
//! ```
//!
//! Training plans partitions from the dataset's scalar info and trains one
//! set of codecs per partition. Adding builds each partition's graph over a
//! build storage; PQ and PRQ partitions are then finalized with their
//! trained storage.

use std::path::Path;

use stratavec_core::{
    BinarySet, BitsetView, DataFormat, DataSet, HnswConfig, IndexError, KnnResult, MetricType,
    RangeResult, RefineType, Result, ScopedComputeThreads, SqType, Tensor, ThreadPools,
};
use stratavec_engine::{
    Codec, CodecStorage, EngineResult, HnswParams, HnswSkeleton, ProductQuantizer,
    ResidualQuantizer, ScalarQuantizer, SqKind, SubIndex,
};
use tracing::{debug, error, info};

use crate::codec::{read_store, write_store};
use crate::executor::FilteredSearchExecutor;
use crate::iterator::IncrementalIterator;
use crate::planner::{combine_partitions, min_partition_rows, TrainingNeed};
use crate::store::{PartitionedIndexStore, StoreLayout};

/// Storage family of an HNSW node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HnswVariant {
    /// Uncompressed (fp32, or the input's own 16/8-bit encoding)
    Flat,
    /// Scalar quantized
    Sq,
    /// Product quantized
    Pq,
    /// Residual product quantized
    Prq,
}

impl HnswVariant {
    /// Name used for the persisted blob
    pub fn type_name(&self) -> &'static str {
        match self {
            HnswVariant::Flat => "HNSW",
            HnswVariant::Sq => "HNSW_SQ",
            HnswVariant::Pq => "HNSW_PQ",
            HnswVariant::Prq => "HNSW_PRQ",
        }
    }

    /// What training this variant needs
    pub fn training_need(&self) -> TrainingNeed {
        match self {
            HnswVariant::Flat | HnswVariant::Sq => TrainingNeed::Scalar,
            HnswVariant::Pq | HnswVariant::Prq => TrainingNeed::Codebook,
        }
    }
}

fn sq_kind(sq_type: SqType) -> SqKind {
    match sq_type {
        SqType::Sq8 => SqKind::Sq8,
        SqType::Fp16 => SqKind::Fp16,
        SqType::Bf16 => SqKind::Bf16,
        SqType::Int8 => SqKind::Int8,
    }
}

/// Codecs trained for one partition
#[derive(Debug)]
struct PartitionCodecs {
    /// Storage the graph is built over
    build: Codec,
    /// Storage swapped in after the graph is built (PQ, PRQ)
    search: Option<Codec>,
    refine: Option<Codec>,
}

/// State between `train` and `add`
#[derive(Debug)]
struct TrainedIndex {
    layout: StoreLayout,
    dim: usize,
    metric: MetricType,
    params: HnswParams,
    partitions: Vec<PartitionCodecs>,
}

impl TrainedIndex {
    fn rows(&self) -> usize {
        self.layout.index_rows_sum.last().copied().unwrap_or(0) as usize
    }
}

#[derive(Debug)]
enum NodeState {
    Empty,
    Trained(TrainedIndex),
    Ready(PartitionedIndexStore),
}

/// Rows of `data` (row-major, `dim` columns) listed in `labels`, in order
fn gather_rows(data: &[f32], dim: usize, labels: &[u32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(labels.len() * dim);
    for &label in labels {
        let start = label as usize * dim;
        out.extend_from_slice(&data[start..start + dim]);
    }
    out
}

/// Partitioned HNSW index over one vector field
#[derive(Debug)]
pub struct HnswIndexNode {
    variant: HnswVariant,
    data_format: DataFormat,
    pools: ThreadPools,
    state: NodeState,
}

impl HnswIndexNode {
    /// Empty node running on `pools`
    pub fn new(variant: HnswVariant, data_format: DataFormat, pools: ThreadPools) -> Self {
        Self {
            variant,
            data_format,
            pools,
            state: NodeState::Empty,
        }
    }

    /// Empty node running on the process-wide pools
    pub fn with_global_pools(variant: HnswVariant, data_format: DataFormat) -> Result<Self> {
        Ok(Self::new(variant, data_format, ThreadPools::global()?))
    }

    /// Blob name of this node's variant
    pub fn type_name(&self) -> &'static str {
        self.variant.type_name()
    }

    /// Storage family
    pub fn variant(&self) -> HnswVariant {
        self.variant
    }

    /// Element encoding of indexed rows
    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    fn check_format(&self, dataset: &DataSet) -> Result<()> {
        if dataset.data_format() != self.data_format {
            return Err(IndexError::invalid_args(format!(
                "node indexes {} data, dataset holds {}",
                self.data_format,
                dataset.data_format()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Plan partitions and train codecs on `dataset`
    pub fn train(&mut self, dataset: &DataSet, cfg: &HnswConfig) -> Result<()> {
        if !matches!(self.state, NodeState::Empty) {
            return Err(IndexError::AlreadyTrained);
        }
        self.check_format(dataset)?;
        let layout = self.plan(dataset, cfg)?;
        let variant = self.variant;
        let data_format = self.data_format;

        let trained = self.pools.build().run(|| {
            let _threads = ScopedComputeThreads::new(cfg.num_build_thread());
            let data = dataset.to_f32();
            let dim = dataset.dim();
            let partitions = if layout.labels.is_empty() {
                vec![train_codecs(variant, data_format, cfg, dim, &data)?]
            } else {
                layout
                    .labels
                    .iter()
                    .map(|labels| {
                        let rows = gather_rows(&data, dim, labels);
                        train_codecs(variant, data_format, cfg, dim, &rows)
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            Ok(TrainedIndex {
                layout,
                dim,
                metric: cfg.metric(),
                params: HnswParams {
                    m: cfg.m(),
                    ef_construction: cfg.ef_construction(),
                },
                partitions,
            })
        })?;

        info!(
            target: "stratavec::index",
            variant = variant.type_name(),
            rows = dataset.rows(),
            partitions = trained.partitions.len(),
            metric = %trained.metric,
            "Trained index"
        );
        self.state = NodeState::Trained(trained);
        Ok(())
    }

    /// Partition layout for `dataset`
    fn plan(&self, dataset: &DataSet, cfg: &HnswConfig) -> Result<StoreLayout> {
        let scalar_info = dataset.scalar_info();
        if scalar_info.len() > 1 {
            return Err(IndexError::invalid_args(
                "vector index build with multiple scalar info is not supported",
            ));
        }
        let groups = match scalar_info.values().next() {
            Some(groups) if groups.len() > 1 => groups,
            _ => return Ok(StoreLayout::single(dataset.rows())),
        };

        let covered: usize = groups.iter().map(Vec::len).sum();
        if covered != dataset.rows() {
            return Err(IndexError::invalid_args(format!(
                "scalar groups cover {} ids, dataset holds {} rows",
                covered,
                dataset.rows()
            )));
        }

        let base_rows = min_partition_rows(self.variant.training_need(), cfg);
        let buckets = combine_partitions(groups, base_rows);
        debug!(
            target: "stratavec::index",
            groups = groups.len(),
            buckets = buckets.len(),
            base_rows,
            "Planned partitions"
        );
        if buckets.len() < 2 {
            return Ok(StoreLayout::single(dataset.rows()));
        }
        let labels = buckets
            .iter()
            .map(|bucket| {
                bucket
                    .iter()
                    .flat_map(|&g| groups[g].iter().copied())
                    .collect()
            })
            .collect();
        StoreLayout::partitioned(labels)
    }

    /// Build every partition's graph over the trained codecs
    pub fn add(&mut self, dataset: &DataSet) -> Result<()> {
        let trained = match &self.state {
            NodeState::Empty => return Err(IndexError::NotTrained),
            NodeState::Ready(_) => {
                return Err(IndexError::invalid_args("rows can only be added once"))
            }
            NodeState::Trained(trained) => trained,
        };
        self.check_format(dataset)?;
        if dataset.dim() != trained.dim {
            return Err(IndexError::DimensionMismatch {
                expected: trained.dim,
                got: dataset.dim(),
            });
        }
        if dataset.rows() != trained.rows() {
            return Err(IndexError::invalid_args(format!(
                "index was trained for {} rows, dataset holds {}",
                trained.rows(),
                dataset.rows()
            )));
        }

        let store = self.pools.build().run(|| {
            let data = dataset.to_f32();
            let rows: Vec<Vec<f32>> = if trained.layout.labels.is_empty() {
                vec![data.to_vec()]
            } else {
                trained
                    .layout
                    .labels
                    .iter()
                    .map(|labels| gather_rows(&data, trained.dim, labels))
                    .collect()
            };

            let handles = rows
                .iter()
                .zip(&trained.partitions)
                .map(|(rows, codecs)| build_partition(trained, codecs, rows))
                .collect::<Result<Vec<_>>>()?;
            let mut store = PartitionedIndexStore::from_layout(trained.layout.clone(), handles)?;

            for (p, (rows, codecs)) in rows.iter().zip(&trained.partitions).enumerate() {
                if let Some(codec) = &codecs.search {
                    let storage = engine(encode(trained.dim, trained.metric, codec.clone(), rows))?;
                    store.finalize(p, storage)?;
                }
            }
            Ok(store)
        })?;

        info!(
            target: "stratavec::index",
            variant = self.variant.type_name(),
            rows = store.count(),
            partitions = store.partition_count(),
            "Added rows"
        );
        self.state = NodeState::Ready(store);
        Ok(())
    }

    /// Train and add in one call
    pub fn build(&mut self, dataset: &DataSet, cfg: &HnswConfig) -> Result<()> {
        self.train(dataset, cfg)?;
        self.add(dataset)
    }

    // ========================================================================
    // Search
    // ========================================================================

    fn store(&self) -> Result<&PartitionedIndexStore> {
        match &self.state {
            NodeState::Ready(store) => Ok(store),
            _ => Err(IndexError::EmptyIndex),
        }
    }

    fn executor(&self, cfg: Option<&HnswConfig>) -> Result<FilteredSearchExecutor<'_>> {
        let store = self.store()?;
        if let Some(requested) = cfg.and_then(|c| c.metric_type) {
            if requested != store.metric() {
                return Err(IndexError::InvalidMetricType(format!(
                    "index was built with {}, search requested {}",
                    store.metric(),
                    requested
                )));
            }
        }
        Ok(FilteredSearchExecutor::new(store, self.pools.search()))
    }

    /// Top-k search; see [`FilteredSearchExecutor::search`]
    pub fn search(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<KnnResult> {
        self.executor(Some(cfg))?.search(queries, cfg, filter)
    }

    /// Range search; see [`FilteredSearchExecutor::range_search`]
    pub fn range_search(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<RangeResult> {
        self.executor(Some(cfg))?.range_search(queries, cfg, filter)
    }

    /// One incremental iterator per query row
    ///
    /// Blocks until every iterator is seeded on the search pool; do not
    /// call it from a search-pool worker.
    pub fn ann_iterators(
        &self,
        queries: &DataSet,
        cfg: &HnswConfig,
        filter: &BitsetView,
    ) -> Result<Vec<IncrementalIterator>> {
        if !self.data_format.supports_iterator() {
            return Err(IndexError::invalid_args(format!(
                "iterators are not supported for {} data",
                self.data_format
            )));
        }
        self.executor(Some(cfg))?.ann_iterators(queries, cfg, filter)
    }

    /// Distances between every query row and every label, row-major
    pub fn calc_dist_by_ids(
        &self,
        queries: &DataSet,
        filter: &BitsetView,
        labels: &[i64],
    ) -> Result<Vec<f32>> {
        self.executor(None)?.calc_dist_by_ids(queries, filter, labels)
    }

    /// Stored vectors of `labels`, in the node's data format
    ///
    /// Only available when the most exact storage reproduces the input
    /// exactly.
    pub fn get_vector_by_ids(&self, labels: &[i64]) -> Result<DataSet> {
        let store = self.store()?;
        let dim = store.dim();
        let mut values = Vec::with_capacity(labels.len() * dim);
        for &label in labels {
            let (p, local) = store.label_to_offset(label)?;
            let storage = store.handle(p)?.exact_storage();
            if !storage.is_lossless_for(self.data_format) {
                return Err(IndexError::NotImplemented(format!(
                    "{} with {:?} storage cannot return raw {} vectors",
                    self.type_name(),
                    storage.kind(),
                    self.data_format
                )));
            }
            values.extend(engine(storage.reconstruct_vec(local as usize))?);
        }
        DataSet::new(labels.len(), dim, Tensor::from_f32(self.data_format, &values))
    }

    /// Whether [`HnswIndexNode::get_vector_by_ids`] can succeed
    pub fn has_raw_data(&self) -> bool {
        match self.store() {
            Ok(store) => store
                .handle(0)
                .map_or(false, |h| h.exact_storage().is_lossless_for(self.data_format)),
            Err(_) => self.variant == HnswVariant::Flat,
        }
    }

    /// Number of indexed rows
    pub fn count(&self) -> usize {
        self.store().map_or(0, |s| s.count())
    }

    /// Vector dimension, 0 before training
    pub fn dim(&self) -> usize {
        match &self.state {
            NodeState::Empty => 0,
            NodeState::Trained(trained) => trained.dim,
            NodeState::Ready(store) => store.dim(),
        }
    }

    /// Bytes held by graphs, storages and tables
    pub fn size(&self) -> usize {
        self.store().map_or(0, |s| s.memory_usage())
    }

    /// Global offset → label for every row
    pub fn internal_id_to_external_id_map(&self) -> Result<Vec<u32>> {
        Ok(self.store()?.internal_id_to_external_id_map())
    }

    /// Install the global offset → outermost external id map
    pub fn set_internal_id_to_most_external_id_map(&mut self, map: Vec<u32>) -> Result<()> {
        match &mut self.state {
            NodeState::Ready(store) => store.set_internal_id_to_most_external_id_map(map),
            _ => Err(IndexError::EmptyIndex),
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Encode the store under [`HnswIndexNode::type_name`]
    pub fn serialize(&self) -> Result<BinarySet> {
        let bytes = write_store(self.store()?)?;
        let mut set = BinarySet::new();
        set.append(self.type_name(), bytes);
        Ok(set)
    }

    /// Replace the node's contents with a serialized store
    pub fn deserialize(&mut self, set: &BinarySet) -> Result<()> {
        let blob = set.get_by_name(self.type_name()).ok_or_else(|| {
            IndexError::InvalidSerializedBlob(format!("no blob named {}", self.type_name()))
        })?;
        self.load(&blob)
    }

    /// Replace the node's contents with a store read from `path`
    pub fn deserialize_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = std::fs::read(path.as_ref())?;
        self.load(&bytes)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let store = read_store(bytes)?;
        info!(
            target: "stratavec::index",
            variant = self.type_name(),
            rows = store.count(),
            partitions = store.partition_count(),
            bytes = bytes.len(),
            "Loaded index"
        );
        self.state = NodeState::Ready(store);
        Ok(())
    }
}

fn engine<T>(result: EngineResult<T>) -> Result<T> {
    result.map_err(|e| {
        error!(target: "stratavec::index", error = %e, "Engine failure during build");
        IndexError::from(e)
    })
}

fn encode(dim: usize, metric: MetricType, codec: Codec, rows: &[f32]) -> EngineResult<CodecStorage> {
    let mut storage = CodecStorage::new(dim, metric, codec);
    storage.add(rows)?;
    Ok(storage)
}

/// Train the codecs of one partition on its rows
fn train_codecs(
    variant: HnswVariant,
    data_format: DataFormat,
    cfg: &HnswConfig,
    dim: usize,
    rows: &[f32],
) -> Result<PartitionCodecs> {
    let (build, search) = match variant {
        HnswVariant::Flat => {
            let build = match data_format {
                DataFormat::Fp32 => Codec::Flat,
                DataFormat::Fp16 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Fp16, dim, rows))?),
                DataFormat::Bf16 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Bf16, dim, rows))?),
                DataFormat::Int8 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Int8, dim, rows))?),
            };
            (build, None)
        }
        HnswVariant::Sq => {
            let sq = engine(ScalarQuantizer::train(sq_kind(cfg.sq_type()), dim, rows))?;
            (Codec::Sq(sq), None)
        }
        HnswVariant::Pq => {
            let pq = engine(ProductQuantizer::train(dim, cfg.require_pq_m()?, cfg.nbits(), rows))?;
            (Codec::Flat, Some(Codec::Pq(pq)))
        }
        HnswVariant::Prq => {
            let rq = engine(ResidualQuantizer::train(
                dim,
                cfg.require_pq_m()?,
                cfg.nbits(),
                cfg.nrq(),
                rows,
            ))?;
            (Codec::Flat, Some(Codec::Prq(rq)))
        }
    };

    let refine = if variant != HnswVariant::Flat && cfg.refine_enabled() {
        let codec = match cfg.refine_type() {
            RefineType::Fp32 => Codec::Flat,
            RefineType::Fp16 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Fp16, dim, rows))?),
            RefineType::Bf16 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Bf16, dim, rows))?),
            RefineType::Sq8 => Codec::Sq(engine(ScalarQuantizer::train(SqKind::Sq8, dim, rows))?),
        };
        Some(codec)
    } else {
        None
    };

    Ok(PartitionCodecs {
        build,
        search,
        refine,
    })
}

/// Graph plus refine storage of one partition
fn build_partition(
    trained: &TrainedIndex,
    codecs: &PartitionCodecs,
    rows: &[f32],
) -> Result<SubIndex> {
    let storage = CodecStorage::new(trained.dim, trained.metric, codecs.build.clone());
    let mut skeleton = engine(HnswSkeleton::new(trained.params, storage))?;
    engine(skeleton.add(rows))?;
    let refine = codecs
        .refine
        .as_ref()
        .map(|codec| engine(encode(trained.dim, trained.metric, codec.clone(), rows)))
        .transpose()?;
    engine(SubIndex::new(skeleton.into_index(), refine))
}
