//! stratavec - partitioned HNSW vector index
//!
//! stratavec builds one HNSW graph per scalar partition and answers filtered
//! top-k, range and distance queries through a single logical index.
//!
//! # Quick Start
//!
//! ```ignore
//! use stratavec::{BitsetView, DataFormat, DataSet, HnswConfig, HnswIndexNode, HnswVariant};
//!
//! let data = DataSet::from_f32(rows, dim, vectors)?;
//! let mut node = HnswIndexNode::with_global_pools(HnswVariant::Flat, DataFormat::Fp32)?;
//! node.build(&data, &HnswConfig::from_json(r#"{"metric_type": "L2", "M": 16}"#)?)?;
//!
//! let hits = node.search(&queries, &HnswConfig::from_json(r#"{"k": 10}"#)?, &BitsetView::default())?;
//! ```
//!
//! # Architecture
//!
//! - `stratavec-core`: errors, metrics, datasets, filters, config, pools
//! - `stratavec-engine`: single-graph HNSW over pluggable vector codecs
//! - `stratavec-index`: partition planning, routing and the index node
//!
//! Only the node-level API is re-exported here. The engine stays reachable
//! through [`engine`] for callers that drive sub-indexes directly.

pub use stratavec_core::*;
pub use stratavec_index::*;

/// Single-graph engine
pub use stratavec_engine as engine;
