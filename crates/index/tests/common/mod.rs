//! Shared fixtures for stratavec-index integration tests
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stratavec_core::{DataFormat, DataSet, HnswConfig, ThreadPools};
use stratavec_index::{HnswIndexNode, HnswVariant};

pub const DIM: usize = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn pools() -> ThreadPools {
    ThreadPools::new(2, 4).unwrap()
}

pub fn cfg(json: &str) -> HnswConfig {
    HnswConfig::from_json(json).unwrap()
}

/// Uniform rows in [-1, 1)
pub fn random_rows(rows: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

pub fn row(data: &[f32], dim: usize, i: usize) -> &[f32] {
    &data[i * dim..(i + 1) * dim]
}

/// Dataset holding the given stored rows as queries
pub fn queries(data: &[f32], dim: usize, rows: &[usize]) -> DataSet {
    let values = rows.iter().flat_map(|&i| row(data, dim, i).to_vec()).collect();
    DataSet::from_f32(rows.len(), dim, values).unwrap()
}

pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn ip(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Label `i` carries scalar value `i % 3`
pub fn mod3_groups(rows: usize) -> Vec<Vec<u32>> {
    (0..3u32)
        .map(|g| (0..rows as u32).filter(|i| i % 3 == g).collect())
        .collect()
}

/// Flat node over `rows` random rows split into three scalar partitions
pub fn partitioned_node(rows: usize, seed: u64) -> (HnswIndexNode, Vec<f32>) {
    let data = random_rows(rows, DIM, seed);
    let dataset = DataSet::from_f32(rows, DIM, data.clone())
        .unwrap()
        .with_scalar_info(100, mod3_groups(rows));
    let mut node = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    node.build(&dataset, &cfg(r#"{"M": 8, "efConstruction": 64}"#))
        .unwrap();
    (node, data)
}

/// Single-partition node of `variant` over random rows
pub fn single_node(
    variant: HnswVariant,
    rows: usize,
    seed: u64,
    build_cfg: &HnswConfig,
) -> (HnswIndexNode, Vec<f32>) {
    let data = random_rows(rows, DIM, seed);
    let dataset = DataSet::from_f32(rows, DIM, data.clone()).unwrap();
    let mut node = HnswIndexNode::new(variant, DataFormat::Fp32, pools());
    node.build(&dataset, build_cfg).unwrap();
    (node, data)
}

/// Exact top-k over admitted rows, ascending L2
pub fn linear_scan(data: &[f32], dim: usize, query: &[f32], k: usize, admit: impl Fn(usize) -> bool) -> Vec<i64> {
    let mut scored: Vec<(f32, usize)> = (0..data.len() / dim)
        .filter(|&i| admit(i))
        .map(|i| (l2(row(data, dim, i), query), i))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, i)| i as i64).collect()
}
