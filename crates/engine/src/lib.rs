//! HNSW engine for stratavec
//!
//! This crate is the single-graph layer under the partitioned index:
//! - HnswGraph: topology, greedy descent, filtered beam and range search
//! - CodecStorage: fp32, scalar, product and residual quantized codes
//! - HnswIndex / SubIndex: searchable handles with optional exact re-rank
//! - io: native fourcc-tagged serialization of one sub-index
//!
//! The engine knows nothing about partitions, labels or bitsets. Callers
//! pass an [`IdSelector`] over local node ids and map results themselves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod distance;
pub mod error;
pub mod graph;
pub mod index;
pub mod io;
pub mod quantizer;
pub mod selector;
pub mod storage;

pub use error::{EngineError, EngineResult};
pub use graph::{HnswGraph, Neighbor, VisitRecord, VisitTrace};
pub use index::{HnswIndex, HnswParams, HnswSkeleton, KnnOutcome, SubIndex};
pub use io::{read_sub_index, write_sub_index};
pub use quantizer::{ProductQuantizer, ResidualQuantizer, ScalarQuantizer, SqKind};
pub use selector::IdSelector;
pub use storage::{Codec, CodecKind, CodecStorage, DistanceComputer};
