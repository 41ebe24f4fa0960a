//! Input and output datasets

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::error::{IndexError, Result};
use crate::format::{DataFormat, Tensor};

/// Row-major vectors plus optional scalar partition info
///
/// `scalar_info` maps a scalar field id to the id groups of that field: one
/// group per distinct scalar value, each listing the row indices carrying it.
#[derive(Debug, Clone)]
pub struct DataSet {
    rows: usize,
    dim: usize,
    tensor: Tensor,
    scalar_info: BTreeMap<i64, Vec<Vec<u32>>>,
}

impl DataSet {
    /// Wrap a tensor holding `rows * dim` elements
    pub fn new(rows: usize, dim: usize, tensor: Tensor) -> Result<Self> {
        if dim == 0 {
            return Err(IndexError::invalid_args("dimension must be > 0"));
        }
        let expected = rows.checked_mul(dim).ok_or_else(|| {
            IndexError::invalid_args(format!("{} rows x {} dim overflows", rows, dim))
        })?;
        if tensor.len() != expected {
            return Err(IndexError::invalid_args(format!(
                "tensor holds {} elements, expected {} rows x {} dim",
                tensor.len(),
                rows,
                dim
            )));
        }
        Ok(Self {
            rows,
            dim,
            tensor,
            scalar_info: BTreeMap::new(),
        })
    }

    /// Convenience constructor for fp32 data
    pub fn from_f32(rows: usize, dim: usize, data: Vec<f32>) -> Result<Self> {
        Self::new(rows, dim, Tensor::Fp32(data))
    }

    /// Attach the id groups of one scalar field
    pub fn with_scalar_info(mut self, field_id: i64, groups: Vec<Vec<u32>>) -> Self {
        self.scalar_info.insert(field_id, groups);
        self
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Vector dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Element encoding
    pub fn data_format(&self) -> DataFormat {
        self.tensor.format()
    }

    /// Underlying tensor
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// All rows widened to fp32
    pub fn to_f32(&self) -> Cow<'_, [f32]> {
        self.tensor.to_f32()
    }

    /// Scalar partition info, keyed by field id
    pub fn scalar_info(&self) -> &BTreeMap<i64, Vec<Vec<u32>>> {
        &self.scalar_info
    }
}

/// Top-k results, `rows * k` entries in row-major order
///
/// Unfilled slots hold id `-1` and the metric's worst distance.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnResult {
    /// Number of query rows
    pub rows: usize,
    /// Slots per row
    pub k: usize,
    /// External labels
    pub ids: Vec<i64>,
    /// Distances in the metric's own orientation
    pub distances: Vec<f32>,
    /// JSON visit trace, present when tracing was requested
    pub trace_json: Option<String>,
}

impl KnnResult {
    /// Ids of row `i`
    pub fn row_ids(&self, i: usize) -> &[i64] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    /// Distances of row `i`
    pub fn row_distances(&self, i: usize) -> &[f32] {
        &self.distances[i * self.k..(i + 1) * self.k]
    }

    /// Valid (`id >= 0`) hits of row `i`
    pub fn valid_hits(&self, i: usize) -> impl Iterator<Item = (i64, f32)> + '_ {
        self.row_ids(i)
            .iter()
            .copied()
            .zip(self.row_distances(i).iter().copied())
            .filter(|(id, _)| *id >= 0)
    }
}

/// Variable-length range search results
///
/// Row `i` occupies `lims[i]..lims[i + 1]` of `ids` and `distances`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeResult {
    /// Offsets into `ids`/`distances`, `rows + 1` entries
    pub lims: Vec<usize>,
    /// External labels
    pub ids: Vec<i64>,
    /// Distances in the metric's own orientation
    pub distances: Vec<f32>,
}

impl RangeResult {
    /// Assemble from per-row hit lists
    pub fn from_rows(rows: Vec<(Vec<i64>, Vec<f32>)>) -> Self {
        let mut out = RangeResult {
            lims: Vec::with_capacity(rows.len() + 1),
            ..Default::default()
        };
        out.lims.push(0);
        for (ids, distances) in rows {
            out.ids.extend(ids);
            out.distances.extend(distances);
            out.lims.push(out.ids.len());
        }
        out
    }

    /// Number of query rows
    pub fn rows(&self) -> usize {
        self.lims.len().saturating_sub(1)
    }

    /// Ids of row `i`
    pub fn row_ids(&self, i: usize) -> &[i64] {
        &self.ids[self.lims[i]..self.lims[i + 1]]
    }

    /// Distances of row `i`
    pub fn row_distances(&self, i: usize) -> &[f32] {
        &self.distances[self.lims[i]..self.lims[i + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_length() {
        let err = DataSet::from_f32(2, 3, vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgs(_)));
    }

    #[test]
    fn test_rejects_overflowing_shape() {
        let err = DataSet::from_f32(usize::MAX, 2, vec![0.0; 4]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgs(ref m) if m.contains("overflows")));
    }

    #[test]
    fn test_rejects_zero_dim() {
        assert!(DataSet::from_f32(0, 0, vec![]).is_err());
    }

    #[test]
    fn test_scalar_info() {
        let ds = DataSet::from_f32(3, 1, vec![0.0, 1.0, 2.0])
            .unwrap()
            .with_scalar_info(7, vec![vec![0, 2], vec![1]]);
        assert_eq!(ds.scalar_info().len(), 1);
        assert_eq!(ds.scalar_info()[&7], vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_knn_rows() {
        let res = KnnResult {
            rows: 2,
            k: 2,
            ids: vec![3, -1, 5, 6],
            distances: vec![0.1, f32::INFINITY, 0.2, 0.3],
            trace_json: None,
        };
        assert_eq!(res.row_ids(1), &[5, 6]);
        assert_eq!(res.valid_hits(0).collect::<Vec<_>>(), vec![(3, 0.1)]);
    }

    #[test]
    fn test_range_from_rows() {
        let res = RangeResult::from_rows(vec![
            (vec![1, 2], vec![0.1, 0.2]),
            (vec![], vec![]),
            (vec![9], vec![0.9]),
        ]);
        assert_eq!(res.lims, vec![0, 2, 2, 3]);
        assert_eq!(res.rows(), 3);
        assert!(res.row_ids(1).is_empty());
        assert_eq!(res.row_distances(2), &[0.9]);
    }
}
