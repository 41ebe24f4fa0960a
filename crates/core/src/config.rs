//! Typed index configuration
//!
//! Every knob is optional so that a single config type serves build,
//! search, range search and iteration. Accessors apply defaults; the
//! `require_*` accessors report missing mandatory parameters.
//!
//! # Example
//!
//! ```
//! use stratavec_core::config::HnswConfig;
//!
//! let cfg = HnswConfig::from_json(r#"{"metric_type": "IP", "M": 32, "k": 10}"#).unwrap();
//! assert_eq!(cfg.m(), 32);
//! assert_eq!(cfg.require_k().unwrap(), 10);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::metric::MetricType;

/// Default graph fan-out
pub const DEFAULT_M: usize = 16;
/// Default build-time search breadth
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Lower bound of the query-time search breadth when `ef` is unset
pub const MIN_SEARCH_EF: usize = 16;
/// Default quantizer bit-width
pub const DEFAULT_NBITS: usize = 8;
/// Default number of residual stages
pub const DEFAULT_NRQ: usize = 2;
/// Default refine amplification factor
pub const DEFAULT_REFINE_K: f32 = 1.0;
/// Default search breadth of the incremental iterator
pub const ITERATOR_SEED_EF: usize = 40;
/// Default iterator refine ratio when refine storage exists
pub const DEFAULT_ITERATOR_REFINE_RATIO: f32 = 0.5;

/// Scalar quantizer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqType {
    /// 8-bit per-dimension uniform quantizer
    #[serde(rename = "SQ8")]
    Sq8,
    /// IEEE half precision
    #[serde(rename = "FP16")]
    Fp16,
    /// bfloat16
    #[serde(rename = "BF16")]
    Bf16,
    /// signed 8-bit integer, no training
    #[serde(rename = "INT8")]
    Int8,
}

/// Storage kind of the exact re-rank stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefineType {
    /// Full-precision copy of the data
    #[serde(rename = "FP32")]
    Fp32,
    /// Half precision copy
    #[serde(rename = "FP16")]
    Fp16,
    /// bfloat16 copy
    #[serde(rename = "BF16")]
    Bf16,
    /// 8-bit scalar-quantized copy
    #[serde(rename = "SQ8")]
    Sq8,
}

/// Configuration of an HNSW index node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Metric kind
    pub metric_type: Option<MetricType>,
    /// Graph fan-out
    #[serde(rename = "M")]
    pub m: Option<usize>,
    /// Build-time search breadth
    #[serde(rename = "efConstruction")]
    pub ef_construction: Option<usize>,
    /// Query-time search breadth
    pub ef: Option<usize>,
    /// Number of results per query
    pub k: Option<usize>,
    /// Quantizer bit-width (PQ/PRQ)
    pub nbits: Option<usize>,
    /// Sub-vector count (PQ/PRQ)
    #[serde(rename = "m")]
    pub pq_m: Option<usize>,
    /// Number of residual stages (PRQ)
    pub nrq: Option<usize>,
    /// Scalar quantizer kind (SQ)
    pub sq_type: Option<SqType>,
    /// Enable exact re-ranking storage
    pub refine: Option<bool>,
    /// Storage kind of the re-rank stage
    pub refine_type: Option<RefineType>,
    /// Re-rank amplification factor
    pub refine_k: Option<f32>,
    /// Range search radius
    pub radius: Option<f32>,
    /// Range search second bound
    pub range_filter: Option<f32>,
    /// Record the graph walk of a single query
    pub trace_visit: Option<bool>,
    /// Fraction of iterator candidates re-ranked exactly
    pub iterator_refine_ratio: Option<f32>,
    /// Compute threads available to one build unit
    pub num_build_thread: Option<usize>,
}

impl HnswConfig {
    /// Parse a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Metric kind, L2 when unset
    pub fn metric(&self) -> MetricType {
        self.metric_type.unwrap_or(MetricType::L2)
    }

    /// Graph fan-out
    pub fn m(&self) -> usize {
        self.m.unwrap_or(DEFAULT_M).max(2)
    }

    /// Build-time search breadth
    pub fn ef_construction(&self) -> usize {
        self.ef_construction.unwrap_or(DEFAULT_EF_CONSTRUCTION).max(1)
    }

    /// Quantizer bit-width
    pub fn nbits(&self) -> usize {
        self.nbits.unwrap_or(DEFAULT_NBITS)
    }

    /// Sub-vector count of product quantizers
    pub fn require_pq_m(&self) -> Result<usize> {
        match self.pq_m {
            Some(0) => Err(IndexError::invalid_args("m must be > 0")),
            Some(m) => Ok(m),
            None => Err(IndexError::invalid_args("m parameter is missing")),
        }
    }

    /// Number of residual stages
    pub fn nrq(&self) -> usize {
        self.nrq.unwrap_or(DEFAULT_NRQ).max(1)
    }

    /// Scalar quantizer kind, SQ8 when unset
    pub fn sq_type(&self) -> SqType {
        self.sq_type.unwrap_or(SqType::Sq8)
    }

    /// Whether exact re-ranking storage is requested
    pub fn refine_enabled(&self) -> bool {
        self.refine.unwrap_or(false)
    }

    /// Re-rank storage kind, FP32 when unset
    pub fn refine_type(&self) -> RefineType {
        self.refine_type.unwrap_or(RefineType::Fp32)
    }

    /// Re-rank amplification factor
    pub fn refine_k(&self) -> f32 {
        self.refine_k.unwrap_or(DEFAULT_REFINE_K).max(1.0)
    }

    /// Whether a visit trace is requested
    pub fn trace_visit(&self) -> bool {
        self.trace_visit.unwrap_or(false)
    }

    /// Number of results per query
    pub fn require_k(&self) -> Result<usize> {
        match self.k {
            Some(0) => Err(IndexError::invalid_args("k must be > 0")),
            Some(k) => Ok(k),
            None => Err(IndexError::invalid_args("k parameter is missing")),
        }
    }

    /// Query-time search breadth, mandatory for range search
    pub fn require_ef(&self) -> Result<usize> {
        self.ef
            .ok_or_else(|| IndexError::invalid_args("ef parameter is missing"))
    }

    /// Range search radius
    pub fn require_radius(&self) -> Result<f32> {
        self.radius
            .ok_or_else(|| IndexError::invalid_args("radius parameter is missing"))
    }

    /// Query-time search breadth for a top-`k` search, never below `k`
    pub fn search_ef(&self, k: usize) -> usize {
        self.ef.unwrap_or_else(|| k.max(MIN_SEARCH_EF)).max(k)
    }

    /// Search breadth of the incremental iterator
    pub fn iterator_ef(&self) -> usize {
        self.ef.unwrap_or(ITERATOR_SEED_EF).max(1)
    }

    /// Iterator refine ratio; zero when no refine storage exists
    pub fn iterator_refine_ratio(&self, has_refine: bool) -> f32 {
        if !has_refine {
            return 0.0;
        }
        self.iterator_refine_ratio
            .unwrap_or(DEFAULT_ITERATOR_REFINE_RATIO)
            .clamp(0.0, 1.0)
    }

    /// Second range bound for `metric`, or the metric default
    pub fn range_filter_or_default(&self, metric: MetricType) -> f32 {
        self.range_filter
            .unwrap_or_else(|| metric.default_range_filter())
    }

    /// Compute threads available to one build unit
    pub fn num_build_thread(&self) -> usize {
        self.num_build_thread
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}
