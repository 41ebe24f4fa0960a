//! Persistence tests for HnswIndexNode
//!
//! Serialized nodes must answer queries exactly like the node they were
//! written from.

mod common;

use std::io::Write;

use common::*;
use stratavec_core::{BinarySet, BitsetView, DataFormat, HnswConfig, IndexError};
use stratavec_index::{HnswIndexNode, HnswVariant, MV_MAGIC};

fn reload(node: &HnswIndexNode) -> HnswIndexNode {
    let set = node.serialize().unwrap();
    let mut loaded = HnswIndexNode::new(node.variant(), node.data_format(), pools());
    loaded.deserialize(&set).unwrap();
    loaded
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_single_partition_round_trip() {
    init_tracing();
    let (node, data) = single_node(HnswVariant::Flat, 200, 30, &HnswConfig::default());
    let blob = node.serialize().unwrap().get_by_name("HNSW").unwrap();
    assert_ne!(&blob[..4], &MV_MAGIC);

    let loaded = reload(&node);
    assert_eq!(loaded.count(), 200);
    assert_eq!(loaded.dim(), DIM);
    let q = queries(&data, DIM, &[1, 2, 3]);
    let k = cfg(r#"{"k": 7}"#);
    assert_eq!(
        node.search(&q, &k, &BitsetView::default()).unwrap(),
        loaded.search(&q, &k, &BitsetView::default()).unwrap()
    );
}

#[test]
fn test_partitioned_round_trip() {
    let (node, data) = partitioned_node(420, 31);
    let blob = node.serialize().unwrap().get_by_name("HNSW").unwrap();
    assert_eq!(&blob[..4], &MV_MAGIC);

    let loaded = reload(&node);
    assert_eq!(
        loaded.internal_id_to_external_id_map().unwrap(),
        node.internal_id_to_external_id_map().unwrap()
    );
    let q = queries(&data, DIM, &[5, 8]);
    let k = cfg(r#"{"k": 6}"#);
    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 2));
    assert_eq!(
        node.search(&q, &k, &filter).unwrap(),
        loaded.search(&q, &k, &filter).unwrap()
    );
    assert_eq!(
        loaded.get_vector_by_ids(&[7, 419]).unwrap().to_f32().to_vec(),
        [row(&data, DIM, 7), row(&data, DIM, 419)].concat()
    );
}

#[test]
fn test_refined_round_trip() {
    let build = cfg(r#"{"sq_type": "SQ8", "refine": true}"#);
    let (node, data) = single_node(HnswVariant::Sq, 150, 32, &build);
    let loaded = reload(&node);
    assert!(loaded.has_raw_data());
    let q = queries(&data, DIM, &[11]);
    let k = cfg(r#"{"k": 4, "refine_k": 2.0}"#);
    assert_eq!(
        node.search(&q, &k, &BitsetView::default()).unwrap(),
        loaded.search(&q, &k, &BitsetView::default()).unwrap()
    );
}

#[test]
fn test_file_round_trip() {
    let (node, data) = partitioned_node(420, 33);
    let blob = node.serialize().unwrap().get_by_name("HNSW").unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&blob).unwrap();
    file.flush().unwrap();

    let mut loaded = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    loaded.deserialize_from_file(file.path()).unwrap();
    assert_eq!(loaded.count(), 420);

    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 0));
    let dists = loaded
        .calc_dist_by_ids(&queries(&data, DIM, &[0]), &filter, &[3])
        .unwrap();
    assert!((dists[0] - l2(row(&data, DIM, 0), row(&data, DIM, 3))).abs() < 1e-5);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    let err = node
        .deserialize_from_file(dir.path().join("absent.idx"))
        .unwrap_err();
    assert!(matches!(err, IndexError::Io(_)));
    assert_eq!(node.count(), 0);
}

#[test]
fn test_unrecognized_blob_type() {
    let mut set = BinarySet::new();
    set.append("HNSW", b"XXXX\0\0\0\0\0\0\0\0".to_vec());
    let mut node = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    let err = node.deserialize(&set).unwrap_err();
    assert!(matches!(err, IndexError::UnrecognizedIndexType(_)));
}

#[test]
fn test_blob_named_after_variant() {
    let (node, _) = single_node(HnswVariant::Sq, 100, 34, &HnswConfig::default());
    let set = node.serialize().unwrap();
    assert!(set.get_by_name("HNSW_SQ").is_some());

    let mut flat = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    assert!(matches!(
        flat.deserialize(&set),
        Err(IndexError::InvalidSerializedBlob(_))
    ));
}

#[test]
fn test_truncated_partitioned_blob() {
    let (node, _) = partitioned_node(420, 35);
    let blob = node.serialize().unwrap().get_by_name("HNSW").unwrap();
    let mut set = BinarySet::new();
    set.append("HNSW", blob[..blob.len() / 2].to_vec());
    let mut loaded = HnswIndexNode::new(HnswVariant::Flat, DataFormat::Fp32, pools());
    let err = loaded.deserialize(&set).unwrap_err();
    assert!(
        matches!(err, IndexError::InvalidSerializedBlob(_) | IndexError::InnerEngine(_)),
        "unexpected error: {err}"
    );
    assert_eq!(loaded.count(), 0);
}
