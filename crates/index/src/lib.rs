//! Partitioned HNSW index for stratavec
//!
//! This crate turns single-graph engine indexes into one logical index:
//! - planner: merges scalar groups into trainable partitions
//! - store: partitions, label tables, filter routing
//! - executor: batched filtered top-k, range and distance queries
//! - iterator: resumable best-first result streams
//! - codec: single and multi-partition serialization
//! - node: the `HnswIndexNode` lifecycle (train, add, search, persist)
//!
//! A scalar-partitioned store answers a query from exactly one partition.
//! The filter decides which one: its first admissible id picks the
//! partition, so filters are expected to select a single partition key.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod executor;
pub mod iterator;
pub mod node;
pub mod planner;
pub mod store;

pub use codec::{read_store, write_store, MV_MAGIC, MV_VERSION};
pub use executor::{filter_range_result, FilteredSearchExecutor};
pub use iterator::{IncrementalIterator, LabelMapping};
pub use node::{HnswIndexNode, HnswVariant};
pub use planner::{combine_partitions, min_partition_rows, TrainingNeed};
pub use store::{PartitionedIndexStore, Route, StoreLayout};
