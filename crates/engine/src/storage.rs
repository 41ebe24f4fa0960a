//! Encoded vector storage
//!
//! [`CodecStorage`] holds the codes of every vector of one sub-index in a
//! single contiguous buffer, like the heap of a flat index. The codec is a
//! closed enum; dispatch is a `match`, never a downcast.
//!
//! Cosine storage keeps one inverse norm per vector so that codes can be
//! computed on the raw data and distances stay exact cosine values.

use byteorder::{ByteOrder, LittleEndian};
use stratavec_core::{DataFormat, MetricType};

use crate::distance::{inner_product, inverse_norm, l2_sqr, metric_value, normalized};
use crate::error::{EngineError, EngineResult};
use crate::quantizer::{ProductQuantizer, ResidualQuantizer, ScalarQuantizer, SqKind};

/// Encoding applied to stored vectors
#[derive(Debug, Clone, PartialEq)]
pub enum Codec {
    /// Full-precision fp32
    Flat,
    /// Scalar quantized
    Sq(ScalarQuantizer),
    /// Product quantized
    Pq(ProductQuantizer),
    /// Residual product quantized
    Prq(ResidualQuantizer),
}

/// Discriminant of [`Codec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// Full-precision fp32
    Flat,
    /// Scalar quantized
    Sq,
    /// Product quantized
    Pq,
    /// Residual product quantized
    Prq,
}

impl Codec {
    /// Discriminant
    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Flat => CodecKind::Flat,
            Codec::Sq(_) => CodecKind::Sq,
            Codec::Pq(_) => CodecKind::Pq,
            Codec::Prq(_) => CodecKind::Prq,
        }
    }

    fn code_size(&self, dim: usize) -> usize {
        match self {
            Codec::Flat => dim * 4,
            Codec::Sq(sq) => sq.code_size(),
            Codec::Pq(pq) => pq.code_size(),
            Codec::Prq(rq) => rq.code_size(),
        }
    }

    fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        match self {
            Codec::Flat => {
                for &x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Codec::Sq(sq) => sq.encode(v, out),
            Codec::Pq(pq) => pq.encode(v, out),
            Codec::Prq(rq) => rq.encode(v, out),
        }
    }

    fn decode(&self, code: &[u8], out: &mut [f32]) {
        match self {
            Codec::Flat => LittleEndian::read_f32_into(code, out),
            Codec::Sq(sq) => sq.decode(code, out),
            Codec::Pq(pq) => pq.decode(code, out),
            Codec::Prq(rq) => rq.decode(code, out),
        }
    }
}

/// Contiguous encoded storage of one sub-index
#[derive(Debug, Clone, PartialEq)]
pub struct CodecStorage {
    pub(crate) dim: usize,
    pub(crate) metric: MetricType,
    pub(crate) codec: Codec,
    pub(crate) codes: Vec<u8>,
    pub(crate) ntotal: usize,
    /// Inverse norms, cosine only
    pub(crate) inv_norms: Vec<f32>,
}

impl CodecStorage {
    /// Empty storage with the given codec
    pub fn new(dim: usize, metric: MetricType, codec: Codec) -> Self {
        Self {
            dim,
            metric,
            codec,
            codes: Vec::new(),
            ntotal: 0,
            inv_norms: Vec::new(),
        }
    }

    /// Empty fp32 storage
    pub fn flat(dim: usize, metric: MetricType) -> Self {
        Self::new(dim, metric, Codec::Flat)
    }

    /// Vector dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Metric
    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Number of stored vectors
    pub fn ntotal(&self) -> usize {
        self.ntotal
    }

    /// Codec in use
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Codec discriminant
    pub fn kind(&self) -> CodecKind {
        self.codec.kind()
    }

    /// Bytes per stored vector
    pub fn code_size(&self) -> usize {
        self.codec.code_size(self.dim)
    }

    /// Bytes held by codes and norms
    pub fn memory_usage(&self) -> usize {
        self.codes.len() + self.inv_norms.len() * 4
    }

    /// Append row-major vectors
    pub fn add(&mut self, data: &[f32]) -> EngineResult<()> {
        if data.len() % self.dim != 0 {
            return Err(EngineError::DimensionMismatch {
                expected: self.dim,
                got: data.len() % self.dim,
            });
        }
        for row in data.chunks_exact(self.dim) {
            self.codec.encode(row, &mut self.codes);
            if self.metric == MetricType::Cosine {
                self.inv_norms.push(inverse_norm(row));
            }
            self.ntotal += 1;
        }
        Ok(())
    }

    /// Decode vector `i` into `out`
    pub fn reconstruct(&self, i: usize, out: &mut [f32]) -> EngineResult<()> {
        if i >= self.ntotal {
            return Err(EngineError::InvalidParameter(format!(
                "vector {} out of range ({} stored)",
                i, self.ntotal
            )));
        }
        let cs = self.code_size();
        self.codec.decode(&self.codes[i * cs..(i + 1) * cs], out);
        Ok(())
    }

    /// Decode vector `i` into a new buffer
    pub fn reconstruct_vec(&self, i: usize) -> EngineResult<Vec<f32>> {
        let mut out = vec![0.0f32; self.dim];
        self.reconstruct(i, &mut out)?;
        Ok(out)
    }

    /// Whether decoding reproduces input of `format` exactly
    pub fn is_lossless_for(&self, format: DataFormat) -> bool {
        match (&self.codec, format) {
            (Codec::Flat, _) => true,
            (Codec::Sq(sq), DataFormat::Fp16) => sq.kind() == SqKind::Fp16,
            (Codec::Sq(sq), DataFormat::Bf16) => sq.kind() == SqKind::Bf16,
            (Codec::Sq(sq), DataFormat::Int8) => sq.kind() == SqKind::Int8,
            _ => false,
        }
    }

    /// Distance computer bound to `query`
    pub fn distance_computer(&self, query: &[f32]) -> DistanceComputer<'_> {
        DistanceComputer::new(self, query)
    }

    fn code(&self, i: usize) -> &[u8] {
        let cs = self.code_size();
        &self.codes[i * cs..(i + 1) * cs]
    }
}

/// Query-bound distance evaluator over a [`CodecStorage`]
///
/// [`DistanceComputer::distance`] is min-oriented: similarity metrics are
/// negated so that smaller always means closer.
pub struct DistanceComputer<'a> {
    storage: &'a CodecStorage,
    query: Vec<f32>,
    /// Per sub-space lookup table (PQ only)
    lut: Option<Vec<f32>>,
    scratch: Vec<f32>,
    scratch_other: Vec<f32>,
}

impl<'a> DistanceComputer<'a> {
    fn new(storage: &'a CodecStorage, query: &[f32]) -> Self {
        let query = if storage.metric == MetricType::Cosine {
            normalized(query)
        } else {
            query.to_vec()
        };
        let lut = match &storage.codec {
            Codec::Pq(pq) => Some(pq_lookup_table(pq, &query, storage.metric)),
            _ => None,
        };
        Self {
            storage,
            lut,
            scratch: vec![0.0; storage.dim],
            scratch_other: vec![0.0; storage.dim],
            query,
        }
    }

    /// Number of vectors reachable through this computer
    pub fn ntotal(&self) -> usize {
        self.storage.ntotal
    }

    /// Metric value between the query and vector `i`
    pub fn raw_distance(&mut self, i: u32) -> f32 {
        let i = i as usize;
        let storage = self.storage;
        let value = match (&self.lut, &storage.codec) {
            (Some(lut), Codec::Pq(pq)) => {
                let ksub = 1usize << pq.nbits;
                storage
                    .code(i)
                    .iter()
                    .enumerate()
                    .map(|(j, &c)| lut[j * ksub + c as usize])
                    .sum()
            }
            _ => {
                storage.codec.decode(storage.code(i), &mut self.scratch);
                match storage.metric {
                    MetricType::L2 => l2_sqr(&self.query, &self.scratch),
                    MetricType::InnerProduct | MetricType::Cosine => {
                        inner_product(&self.query, &self.scratch)
                    }
                }
            }
        };
        if storage.metric == MetricType::Cosine {
            value * storage.inv_norms[i]
        } else {
            value
        }
    }

    /// Min-oriented distance between the query and vector `i`
    #[inline]
    pub fn distance(&mut self, i: u32) -> f32 {
        let raw = self.raw_distance(i);
        self.storage.metric.to_min_oriented(raw)
    }

    /// Min-oriented distance between stored vectors `i` and `j`
    pub fn pair_distance(&mut self, i: u32, j: u32) -> f32 {
        let storage = self.storage;
        storage
            .codec
            .decode(storage.code(i as usize), &mut self.scratch);
        storage
            .codec
            .decode(storage.code(j as usize), &mut self.scratch_other);
        let raw = match storage.metric {
            MetricType::Cosine => {
                inner_product(&self.scratch, &self.scratch_other)
                    * storage.inv_norms[i as usize]
                    * storage.inv_norms[j as usize]
            }
            metric => metric_value(&self.scratch, &self.scratch_other, metric),
        };
        storage.metric.to_min_oriented(raw)
    }
}

fn pq_lookup_table(pq: &ProductQuantizer, query: &[f32], metric: MetricType) -> Vec<f32> {
    let dsub = pq.dim / pq.m;
    let ksub = 1usize << pq.nbits;
    let mut lut = Vec::with_capacity(pq.m * ksub);
    for j in 0..pq.m {
        let q = &query[j * dsub..(j + 1) * dsub];
        for c in 0..ksub {
            let start = (j * ksub + c) * dsub;
            let centroid = &pq.centroids[start..start + dsub];
            lut.push(match metric {
                MetricType::L2 => l2_sqr(q, centroid),
                MetricType::InnerProduct | MetricType::Cosine => inner_product(q, centroid),
            });
        }
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_with(rows: &[[f32; 2]], metric: MetricType) -> CodecStorage {
        let mut s = CodecStorage::flat(2, metric);
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        s.add(&data).unwrap();
        s
    }

    #[test]
    fn test_flat_reconstruct() {
        let s = flat_with(&[[1.0, 2.0], [3.0, 4.0]], MetricType::L2);
        assert_eq!(s.ntotal(), 2);
        assert_eq!(s.reconstruct_vec(1).unwrap(), vec![3.0, 4.0]);
        assert!(s.reconstruct_vec(2).is_err());
        assert!(s.is_lossless_for(DataFormat::Fp32));
    }

    #[test]
    fn test_add_rejects_ragged_rows() {
        let mut s = CodecStorage::flat(3, MetricType::L2);
        assert!(matches!(
            s.add(&[1.0, 2.0]),
            Err(EngineError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_l2_distance_min_oriented() {
        let s = flat_with(&[[0.0, 0.0], [3.0, 4.0]], MetricType::L2);
        let mut dc = s.distance_computer(&[0.0, 0.0]);
        assert_eq!(dc.distance(0), 0.0);
        assert_eq!(dc.distance(1), 25.0);
        assert_eq!(dc.pair_distance(0, 1), 25.0);
    }

    #[test]
    fn test_ip_distance_negated() {
        let s = flat_with(&[[1.0, 0.0], [2.0, 0.0]], MetricType::InnerProduct);
        let mut dc = s.distance_computer(&[1.0, 0.0]);
        assert_eq!(dc.raw_distance(1), 2.0);
        assert_eq!(dc.distance(1), -2.0);
        assert!(dc.distance(1) < dc.distance(0));
    }

    #[test]
    fn test_cosine_uses_inverse_norms() {
        let s = flat_with(&[[10.0, 0.0], [0.0, 3.0]], MetricType::Cosine);
        let mut dc = s.distance_computer(&[2.0, 0.0]);
        assert!((dc.raw_distance(0) - 1.0).abs() < 1e-6);
        assert!(dc.raw_distance(1).abs() < 1e-6);
        assert!((dc.pair_distance(0, 1)).abs() < 1e-6);
    }

    #[test]
    fn test_pq_lut_matches_decoded_distance() {
        let data: Vec<f32> = (0..64).map(|i| ((i * 37) % 17) as f32 / 17.0).collect();
        let pq = ProductQuantizer::train(4, 2, 3, &data).unwrap();
        let mut s = CodecStorage::new(4, MetricType::L2, Codec::Pq(pq));
        s.add(&data).unwrap();
        let query = [0.1, 0.2, 0.3, 0.4];
        let mut dc = s.distance_computer(&query);
        for i in 0..s.ntotal() {
            let decoded = s.reconstruct_vec(i).unwrap();
            let expected = l2_sqr(&query, &decoded);
            assert!((dc.distance(i as u32) - expected).abs() < 1e-4);
        }
        assert!(!s.is_lossless_for(DataFormat::Fp32));
    }

    #[test]
    fn test_sq_lossless_pairs() {
        let sq = ScalarQuantizer::train(SqKind::Bf16, 2, &[]).unwrap();
        let s = CodecStorage::new(2, MetricType::L2, Codec::Sq(sq));
        assert!(s.is_lossless_for(DataFormat::Bf16));
        assert!(!s.is_lossless_for(DataFormat::Fp16));
        assert!(!s.is_lossless_for(DataFormat::Fp32));
    }
}
