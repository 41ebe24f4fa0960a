//! Named-blob container for persisted indexes

use std::collections::BTreeMap;
use std::sync::Arc;

/// Map from blob name to bytes
#[derive(Debug, Clone, Default)]
pub struct BinarySet {
    blobs: BTreeMap<String, Arc<Vec<u8>>>,
}

impl BinarySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a blob
    pub fn append(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.insert(name.into(), Arc::new(bytes));
    }

    /// Look up a blob by name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.blobs.get(name).cloned()
    }

    /// Blob names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blobs.keys().map(String::as_str)
    }

    /// Sum of all blob sizes
    pub fn total_size(&self) -> usize {
        self.blobs.values().map(|b| b.len()).sum()
    }
}
