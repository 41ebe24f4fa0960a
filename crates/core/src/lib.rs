//! Core types for stratavec
//!
//! This crate defines the foundational types shared by the engine and the
//! index layer:
//! - IndexError: error taxonomy of the index layer
//! - MetricType: distance/similarity metrics
//! - DataFormat, Tensor: element encodings and fp32 widening
//! - DataSet, KnnResult, RangeResult: inputs and outputs
//! - BitsetView: filter view with optional alternate ids
//! - BinarySet: named-blob container for persisted indexes
//! - HnswConfig: typed configuration
//! - ThreadPools, ComputePool: build/search pools

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binary_set;
pub mod bitset;
pub mod config;
pub mod dataset;
pub mod error;
pub mod format;
pub mod metric;
pub mod pool;

pub use binary_set::BinarySet;
pub use bitset::BitsetView;
pub use config::{HnswConfig, RefineType, SqType};
pub use dataset::{DataSet, KnnResult, RangeResult};
pub use error::{IndexError, Result};
pub use format::{DataFormat, Tensor};
pub use metric::MetricType;
pub use pool::{
    await_all, max_compute_threads, ComputePool, ScopedComputeThreads, TaskHandle, ThreadPools,
};
