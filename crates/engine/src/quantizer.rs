//! Vector quantizers: scalar, product and residual product
//!
//! Quantizers are trained once on a sample and then encode each vector to a
//! fixed-size code. Decoding is approximate except for the lossless scalar
//! kinds paired with matching input encodings.

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use stratavec_core::max_compute_threads;
use tracing::debug;

use crate::distance::l2_sqr;
use crate::error::{EngineError, EngineResult};

/// Number of Lloyd iterations used to train codebooks
pub const KMEANS_ITERATIONS: usize = 10;
/// Seed of the codebook initialization
pub const KMEANS_SEED: u64 = 1234;

/// Scalar quantizer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqKind {
    /// 8 bits per dimension, per-dimension min/max range
    Sq8,
    /// IEEE half precision
    Fp16,
    /// bfloat16
    Bf16,
    /// signed 8-bit integer, values stored as-is
    Int8,
}

impl SqKind {
    /// Bytes per dimension
    pub fn bytes_per_dim(&self) -> usize {
        match self {
            SqKind::Sq8 | SqKind::Int8 => 1,
            SqKind::Fp16 | SqKind::Bf16 => 2,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            SqKind::Sq8 => 0,
            SqKind::Fp16 => 1,
            SqKind::Bf16 => 2,
            SqKind::Int8 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> EngineResult<Self> {
        match tag {
            0 => Ok(SqKind::Sq8),
            1 => Ok(SqKind::Fp16),
            2 => Ok(SqKind::Bf16),
            3 => Ok(SqKind::Int8),
            other => Err(EngineError::Corrupt(format!("unknown scalar quantizer tag {}", other))),
        }
    }
}

/// Per-dimension scalar quantizer
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarQuantizer {
    pub(crate) kind: SqKind,
    pub(crate) dim: usize,
    /// Per-dimension lower bound (SQ8 only)
    pub(crate) vmin: Vec<f32>,
    /// Per-dimension range (SQ8 only)
    pub(crate) vdiff: Vec<f32>,
}

impl ScalarQuantizer {
    /// Train on `data` (row-major, `dim` columns); only SQ8 needs data
    pub fn train(kind: SqKind, dim: usize, data: &[f32]) -> EngineResult<Self> {
        let (vmin, vdiff) = match kind {
            SqKind::Sq8 => {
                if data.is_empty() {
                    return Err(EngineError::Training(
                        "SQ8 needs at least one training row".into(),
                    ));
                }
                let mut vmin = vec![f32::INFINITY; dim];
                let mut vmax = vec![f32::NEG_INFINITY; dim];
                for row in data.chunks_exact(dim) {
                    for (d, &x) in row.iter().enumerate() {
                        vmin[d] = vmin[d].min(x);
                        vmax[d] = vmax[d].max(x);
                    }
                }
                let vdiff = vmin.iter().zip(&vmax).map(|(lo, hi)| hi - lo).collect();
                (vmin, vdiff)
            }
            _ => (Vec::new(), Vec::new()),
        };
        Ok(Self {
            kind,
            dim,
            vmin,
            vdiff,
        })
    }

    /// Quantizer kind
    pub fn kind(&self) -> SqKind {
        self.kind
    }

    /// Bytes per encoded vector
    pub fn code_size(&self) -> usize {
        self.dim * self.kind.bytes_per_dim()
    }

    /// Append the code of `v` to `out`
    pub fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        match self.kind {
            SqKind::Sq8 => {
                for (d, &x) in v.iter().enumerate() {
                    let diff = self.vdiff[d];
                    let q = if diff > 0.0 {
                        ((x - self.vmin[d]) / diff * 255.0).round().clamp(0.0, 255.0)
                    } else {
                        0.0
                    };
                    out.push(q as u8);
                }
            }
            SqKind::Fp16 => {
                for &x in v {
                    out.extend_from_slice(&f16::from_f32(x).to_le_bytes());
                }
            }
            SqKind::Bf16 => {
                for &x in v {
                    out.extend_from_slice(&bf16::from_f32(x).to_le_bytes());
                }
            }
            SqKind::Int8 => {
                for &x in v {
                    out.push(x.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8);
                }
            }
        }
    }

    /// Decode `code` into `out`
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        match self.kind {
            SqKind::Sq8 => {
                for (d, (o, &c)) in out.iter_mut().zip(code).enumerate() {
                    *o = self.vmin[d] + (c as f32 / 255.0) * self.vdiff[d];
                }
            }
            SqKind::Fp16 => {
                for (o, b) in out.iter_mut().zip(code.chunks_exact(2)) {
                    *o = f16::from_le_bytes([b[0], b[1]]).to_f32();
                }
            }
            SqKind::Bf16 => {
                for (o, b) in out.iter_mut().zip(code.chunks_exact(2)) {
                    *o = bf16::from_le_bytes([b[0], b[1]]).to_f32();
                }
            }
            SqKind::Int8 => {
                for (o, &c) in out.iter_mut().zip(code) {
                    *o = c as i8 as f32;
                }
            }
        }
    }
}

/// Product quantizer: `m` sub-spaces, `2^nbits` centroids each
#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    pub(crate) dim: usize,
    pub(crate) m: usize,
    pub(crate) nbits: usize,
    /// `m * ksub * dsub` centroid coordinates
    pub(crate) centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// Train codebooks on `data` (row-major, `dim` columns)
    pub fn train(dim: usize, m: usize, nbits: usize, data: &[f32]) -> EngineResult<Self> {
        if m == 0 || dim % m != 0 {
            return Err(EngineError::InvalidParameter(format!(
                "sub-vector count {} must divide dimension {}",
                m, dim
            )));
        }
        if nbits == 0 || nbits > 8 {
            return Err(EngineError::InvalidParameter(format!(
                "nbits must be in 1..=8, got {}",
                nbits
            )));
        }
        let n = data.len() / dim;
        let ksub = 1usize << nbits;
        if n < ksub {
            return Err(EngineError::Training(format!(
                "{} rows are not enough to train {} centroids",
                n, ksub
            )));
        }

        let dsub = dim / m;
        let mut centroids = Vec::with_capacity(m * ksub * dsub);
        let mut sub = vec![0.0f32; n * dsub];
        for j in 0..m {
            for (i, row) in data.chunks_exact(dim).enumerate() {
                sub[i * dsub..(i + 1) * dsub].copy_from_slice(&row[j * dsub..(j + 1) * dsub]);
            }
            centroids.extend(kmeans(&sub, dsub, ksub, KMEANS_ITERATIONS, KMEANS_SEED + j as u64));
        }
        debug!(target: "stratavec::engine", dim, m, nbits, rows = n, "Trained product quantizer");

        Ok(Self {
            dim,
            m,
            nbits,
            centroids,
        })
    }

    fn dsub(&self) -> usize {
        self.dim / self.m
    }

    fn ksub(&self) -> usize {
        1 << self.nbits
    }

    /// Bytes per encoded vector
    pub fn code_size(&self) -> usize {
        self.m
    }

    fn centroid(&self, j: usize, c: usize) -> &[f32] {
        let dsub = self.dsub();
        let start = (j * self.ksub() + c) * dsub;
        &self.centroids[start..start + dsub]
    }

    /// Append the code of `v` to `out`
    pub fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        let dsub = self.dsub();
        for j in 0..self.m {
            let x = &v[j * dsub..(j + 1) * dsub];
            let best = (0..self.ksub())
                .map(|c| (l2_sqr(x, self.centroid(j, c)), c))
                .fold((f32::INFINITY, 0), |acc, cur| if cur.0 < acc.0 { cur } else { acc });
            out.push(best.1 as u8);
        }
    }

    /// Decode `code` into `out`
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        let dsub = self.dsub();
        for (j, &c) in code.iter().take(self.m).enumerate() {
            out[j * dsub..(j + 1) * dsub].copy_from_slice(self.centroid(j, c as usize));
        }
    }
}

/// Residual product quantizer: each stage quantizes the previous residual
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualQuantizer {
    pub(crate) stages: Vec<ProductQuantizer>,
}

impl ResidualQuantizer {
    /// Train `nrq` stages on `data`
    pub fn train(
        dim: usize,
        m: usize,
        nbits: usize,
        nrq: usize,
        data: &[f32],
    ) -> EngineResult<Self> {
        if nrq == 0 {
            return Err(EngineError::InvalidParameter("nrq must be > 0".into()));
        }
        let mut residual = data.to_vec();
        let mut decoded = vec![0.0f32; dim];
        let mut code = Vec::with_capacity(m);
        let mut stages = Vec::with_capacity(nrq);
        for _ in 0..nrq {
            let pq = ProductQuantizer::train(dim, m, nbits, &residual)?;
            for row in residual.chunks_exact_mut(dim) {
                code.clear();
                pq.encode(row, &mut code);
                pq.decode(&code, &mut decoded);
                for (r, d) in row.iter_mut().zip(&decoded) {
                    *r -= d;
                }
            }
            stages.push(pq);
        }
        Ok(Self { stages })
    }

    /// Bytes per encoded vector
    pub fn code_size(&self) -> usize {
        self.stages.iter().map(|s| s.code_size()).sum()
    }

    /// Append the code of `v` to `out`
    pub fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        let mut residual = v.to_vec();
        let mut decoded = vec![0.0f32; v.len()];
        for stage in &self.stages {
            let start = out.len();
            stage.encode(&residual, out);
            stage.decode(&out[start..], &mut decoded);
            for (r, d) in residual.iter_mut().zip(&decoded) {
                *r -= d;
            }
        }
    }

    /// Decode `code` into `out`
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        out.iter_mut().for_each(|x| *x = 0.0);
        let mut partial = vec![0.0f32; out.len()];
        let mut offset = 0;
        for stage in &self.stages {
            stage.decode(&code[offset..offset + stage.code_size()], &mut partial);
            for (o, p) in out.iter_mut().zip(&partial) {
                *o += p;
            }
            offset += stage.code_size();
        }
    }
}

/// Lloyd's k-means over `data` (row-major, `d` columns); returns `k * d`
/// centroid coordinates
///
/// Assignment runs in parallel unless the current unit is limited to a
/// single compute thread.
pub fn kmeans(data: &[f32], d: usize, k: usize, iterations: usize, seed: u64) -> Vec<f32> {
    let n = data.len() / d;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = Vec::with_capacity(k * d);
    for i in rand::seq::index::sample(&mut rng, n, k.min(n)).into_iter() {
        centroids.extend_from_slice(&data[i * d..(i + 1) * d]);
    }

    let parallel = max_compute_threads().map_or(true, |t| t > 1);
    let nearest = |row: &[f32], centroids: &[f32]| -> usize {
        centroids
            .chunks_exact(d)
            .enumerate()
            .map(|(c, centroid)| (l2_sqr(row, centroid), c))
            .fold((f32::INFINITY, 0), |acc, cur| if cur.0 < acc.0 { cur } else { acc })
            .1
    };

    for _ in 0..iterations {
        let assignment: Vec<usize> = if parallel {
            data.par_chunks_exact(d).map(|row| nearest(row, &centroids)).collect()
        } else {
            data.chunks_exact(d).map(|row| nearest(row, &centroids)).collect()
        };

        let mut sums = vec![0.0f32; k * d];
        let mut counts = vec![0usize; k];
        for (row, &c) in data.chunks_exact(d).zip(&assignment) {
            counts[c] += 1;
            for (s, x) in sums[c * d..(c + 1) * d].iter_mut().zip(row) {
                *s += x;
            }
        }
        for c in 0..k {
            // empty clusters keep their previous centroid
            if counts[c] > 0 {
                for x in 0..d {
                    centroids[c * d + x] = sums[c * d + x] / counts[c] as f32;
                }
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_sq8_roundtrip_error_bounded() {
        let data = random_rows(50, 4, 1);
        let sq = ScalarQuantizer::train(SqKind::Sq8, 4, &data).unwrap();
        let mut code = Vec::new();
        sq.encode(&data[0..4], &mut code);
        assert_eq!(code.len(), sq.code_size());
        let mut out = [0.0f32; 4];
        sq.decode(&code, &mut out);
        for (a, b) in out.iter().zip(&data[0..4]) {
            assert!((a - b).abs() <= 2.0 / 255.0 + 1e-6);
        }
    }

    #[test]
    fn test_sq8_needs_data() {
        assert!(ScalarQuantizer::train(SqKind::Sq8, 4, &[]).is_err());
    }

    #[test]
    fn test_fp16_exact_for_representable_values() {
        let sq = ScalarQuantizer::train(SqKind::Fp16, 3, &[]).unwrap();
        let mut code = Vec::new();
        sq.encode(&[0.5, -1.25, 8.0], &mut code);
        let mut out = [0.0f32; 3];
        sq.decode(&code, &mut out);
        assert_eq!(out, [0.5, -1.25, 8.0]);
    }

    #[test]
    fn test_int8_exact() {
        let sq = ScalarQuantizer::train(SqKind::Int8, 2, &[]).unwrap();
        let mut code = Vec::new();
        sq.encode(&[-7.0, 100.0], &mut code);
        let mut out = [0.0f32; 2];
        sq.decode(&code, &mut out);
        assert_eq!(out, [-7.0, 100.0]);
    }

    #[test]
    fn test_pq_requires_enough_rows() {
        let data = random_rows(10, 4, 2);
        assert!(matches!(
            ProductQuantizer::train(4, 2, 4, &data),
            Err(EngineError::Training(_))
        ));
    }

    #[test]
    fn test_pq_rejects_bad_split() {
        let data = random_rows(64, 6, 3);
        assert!(matches!(
            ProductQuantizer::train(6, 4, 4, &data),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_pq_reconstructs_training_points_exactly_when_k_equals_n() {
        // with one centroid per training row, every row is its own centroid
        let data = random_rows(16, 4, 4);
        let pq = ProductQuantizer::train(4, 2, 4, &data).unwrap();
        let mut code = Vec::new();
        pq.encode(&data[4..8], &mut code);
        let mut out = [0.0f32; 4];
        pq.decode(&code, &mut out);
        for (a, b) in out.iter().zip(&data[4..8]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_residual_reduces_error() {
        let data = random_rows(256, 8, 5);
        let one = ResidualQuantizer::train(8, 4, 4, 1, &data).unwrap();
        let two = ResidualQuantizer::train(8, 4, 4, 2, &data).unwrap();
        assert_eq!(two.code_size(), 2 * one.code_size());

        let err = |rq: &ResidualQuantizer| -> f32 {
            let mut total = 0.0;
            let mut out = vec![0.0f32; 8];
            for row in data.chunks_exact(8) {
                let mut code = Vec::new();
                rq.encode(row, &mut code);
                rq.decode(&code, &mut out);
                total += l2_sqr(row, &out);
            }
            total
        };
        assert!(err(&two) < err(&one));
    }
}
