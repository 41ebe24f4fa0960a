//! Filtered search tests for HnswIndexNode
//!
//! Covers top-k search with and without filters, exhaustive fallback,
//! partition routing, refine re-ranking, range search bounds and
//! distance queries by label.

mod common;

use std::collections::HashSet;

use common::*;
use stratavec_core::{BitsetView, DataFormat, DataSet, HnswConfig, IndexError};
use stratavec_index::{HnswIndexNode, HnswVariant};

// ============================================================================
// Unpartitioned top-k
// ============================================================================

#[test]
fn test_unfiltered_top5_distinct_and_sorted() {
    init_tracing();
    let (node, data) = single_node(HnswVariant::Flat, 100, 1, &HnswConfig::default());
    let res = node
        .search(&queries(&data, DIM, &[17]), &cfg(r#"{"k": 5}"#), &BitsetView::default())
        .unwrap();

    let ids = res.row_ids(0);
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 5);
    assert!(ids.iter().all(|&id| (0..100).contains(&id)));
    assert!(res.row_distances(0).windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ids[0], 17);
    assert_eq!(res.row_distances(0)[0], 0.0);
}

#[test]
fn test_heavily_filtered_matches_linear_scan() {
    let (node, data) = single_node(HnswVariant::Flat, 1000, 2, &HnswConfig::default());
    // 10 admissible rows out of 1000
    let admitted: Vec<usize> = (0..1000).filter(|i| i % 100 == 7).collect();
    let filter = BitsetView::admitting_only(1000, admitted.iter().copied());

    let q = queries(&data, DIM, &[3, 500]);
    let res = node.search(&q, &cfg(r#"{"k": 10}"#), &filter).unwrap();
    for (r, &qi) in [3usize, 500].iter().enumerate() {
        let expected = linear_scan(&data, DIM, row(&data, DIM, qi), 10, |i| i % 100 == 7);
        assert_eq!(res.row_ids(r), expected.as_slice());
    }
}

#[test]
fn test_moderately_filtered_fills_k() {
    let (node, data) = single_node(HnswVariant::Flat, 1000, 3, &HnswConfig::default());
    // 900 filtered out: below the exhaustive threshold, so the graph runs first
    let filter = BitsetView::admitting_only(1000, (0..1000).filter(|i| i % 10 == 0));
    let res = node
        .search(&queries(&data, DIM, &[1, 2, 3]), &cfg(r#"{"k": 10}"#), &filter)
        .unwrap();
    for r in 0..3 {
        let hits: Vec<(i64, f32)> = res.valid_hits(r).collect();
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|(id, _)| id % 10 == 0));
    }
}

#[test]
fn test_filter_excluding_everything_is_empty_result() {
    let (node, data) = single_node(HnswVariant::Flat, 100, 4, &HnswConfig::default());
    let filter = BitsetView::admitting_only(100, std::iter::empty());
    let res = node
        .search(&queries(&data, DIM, &[0, 1]), &cfg(r#"{"k": 4}"#), &filter)
        .unwrap();
    assert!(res.ids.iter().all(|&id| id == -1));
    assert!(res.distances.iter().all(|&d| d == f32::INFINITY));
}

#[test]
fn test_similarity_top1_and_padding() {
    let (node, data) = single_node(HnswVariant::Flat, 50, 5, &cfg(r#"{"metric_type": "IP"}"#));
    let query = queries(&data, DIM, &[9]);
    let res = node
        .search(&query, &cfg(r#"{"metric_type": "IP", "k": 60}"#), &BitsetView::default())
        .unwrap();
    let best = (0..50)
        .max_by(|&a, &b| {
            ip(row(&data, DIM, a), row(&data, DIM, 9)).total_cmp(&ip(row(&data, DIM, b), row(&data, DIM, 9)))
        })
        .unwrap();
    assert_eq!(res.row_ids(0)[0], best as i64);
    assert!(res.row_distances(0)[..50].windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(res.row_ids(0)[50..], [-1; 10]);
    assert!(res.row_distances(0)[50..].iter().all(|&d| d == f32::NEG_INFINITY));
}

// ============================================================================
// Partitioned top-k
// ============================================================================

#[test]
fn test_partition_key_filter_routes_search() {
    init_tracing();
    let (node, data) = partitioned_node(420, 6);
    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 1));
    let res = node
        .search(&queries(&data, DIM, &[4, 100]), &cfg(r#"{"k": 8}"#), &filter)
        .unwrap();
    for r in 0..2 {
        assert!(res.row_ids(r).iter().all(|id| id % 3 == 1));
    }
    assert_eq!(res.row_ids(0)[0], 4);
    assert_eq!(res.row_distances(0)[0], 0.0);
}

#[test]
fn test_partitioned_search_requires_filter() {
    let (node, data) = partitioned_node(420, 7);
    let err = node
        .search(&queries(&data, DIM, &[0]), &cfg(r#"{"k": 3}"#), &BitsetView::default())
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgs(ref m) if m == "partition key value not correctly set"));
}

#[test]
fn test_partitioned_all_filtered_is_empty_result() {
    let (node, data) = partitioned_node(420, 8);
    let filter = BitsetView::admitting_only(420, std::iter::empty());
    let res = node
        .search(&queries(&data, DIM, &[0]), &cfg(r#"{"k": 3}"#), &filter)
        .unwrap();
    assert_eq!(res.ids, vec![-1; 3]);
}

/// Known limitation: a filter admitting every row only searches the
/// partition of label 0
#[test]
fn test_fully_open_filter_searches_first_row_partition() {
    let (node, data) = partitioned_node(420, 9);
    let filter = BitsetView::from_filtered_ids(420, std::iter::empty());
    let res = node
        .search(&queries(&data, DIM, &[1]), &cfg(r#"{"k": 5}"#), &filter)
        .unwrap();
    assert!(res.row_ids(0).iter().all(|id| id % 3 == 0));
    assert!(!res.row_ids(0).contains(&1));
}

#[test]
fn test_outer_external_ids_route_filter() {
    let (mut node, data) = partitioned_node(420, 10);
    let outer: Vec<u32> = node
        .internal_id_to_external_id_map()
        .unwrap()
        .iter()
        .map(|label| label + 1000)
        .collect();
    node.set_internal_id_to_most_external_id_map(outer).unwrap();

    let filter = BitsetView::admitting_only(1420, [1004]);
    let res = node
        .search(&queries(&data, DIM, &[4]), &cfg(r#"{"k": 2}"#), &filter)
        .unwrap();
    assert_eq!(res.row_ids(0), &[4, -1]);
    assert_eq!(res.row_distances(0)[0], 0.0);
}

#[test]
fn test_trace_visit_lists_labels() {
    let (node, data) = partitioned_node(420, 11);
    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 2));
    let res = node
        .search(
            &queries(&data, DIM, &[2]),
            &cfg(r#"{"k": 3, "trace_visit": true}"#),
            &filter,
        )
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(res.trace_json.as_deref().unwrap()).unwrap();
    let visits = json["visits"].as_array().unwrap();
    assert!(!visits.is_empty());
    assert!(visits.iter().all(|v| v["id"].as_i64().unwrap() % 3 == 2));
}

// ============================================================================
// Quantized variants
// ============================================================================

#[test]
fn test_refine_restores_exact_distance() {
    let build = cfg(r#"{"sq_type": "SQ8", "refine": true, "refine_type": "FP32"}"#);
    let (node, data) = single_node(HnswVariant::Sq, 300, 12, &build);
    let res = node
        .search(
            &queries(&data, DIM, &[42]),
            &cfg(r#"{"k": 3, "refine_k": 3.0}"#),
            &BitsetView::default(),
        )
        .unwrap();
    assert_eq!(res.row_ids(0)[0], 42);
    assert_eq!(res.row_distances(0)[0], 0.0);
    let expected = l2(row(&data, DIM, 42), row(&data, DIM, res.row_ids(0)[1] as usize));
    assert!((res.row_distances(0)[1] - expected).abs() < 1e-5);
}

#[test]
fn test_pq_storage_replaces_build_storage() {
    let (flat, data) = single_node(HnswVariant::Flat, 300, 13, &HnswConfig::default());
    let (pq, _) = single_node(HnswVariant::Pq, 300, 13, &cfg(r#"{"m": 2, "nbits": 4}"#));
    assert!(pq.size() < flat.size());
    assert!(!pq.has_raw_data());
    assert!(matches!(pq.get_vector_by_ids(&[0]), Err(IndexError::NotImplemented(_))));

    let res = pq
        .search(&queries(&data, DIM, &[7]), &cfg(r#"{"k": 10}"#), &BitsetView::default())
        .unwrap();
    assert_eq!(res.valid_hits(0).count(), 10);
}

#[test]
fn test_prq_with_refine_keeps_raw_vectors() {
    let build = cfg(r#"{"m": 2, "nbits": 4, "nrq": 2, "refine": true}"#);
    let (node, data) = single_node(HnswVariant::Prq, 200, 14, &build);
    assert!(node.has_raw_data());
    let back = node.get_vector_by_ids(&[5, 6]).unwrap();
    assert_eq!(back.to_f32().to_vec(), [row(&data, DIM, 5), row(&data, DIM, 6)].concat());

    let res = node
        .search(
            &queries(&data, DIM, &[5]),
            &cfg(r#"{"k": 1, "refine_k": 10.0}"#),
            &BitsetView::default(),
        )
        .unwrap();
    assert_eq!(res.row_ids(0), &[5]);
}

#[test]
fn test_pq_requires_sub_vector_count() {
    let data = DataSet::from_f32(64, DIM, random_rows(64, DIM, 15)).unwrap();
    let mut node = HnswIndexNode::new(HnswVariant::Pq, DataFormat::Fp32, pools());
    let err = node.train(&data, &cfg(r#"{"nbits": 4}"#)).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgs(ref m) if m == "m parameter is missing"));
}

#[test]
fn test_partitioned_pq_trains_per_partition() {
    let rows = 300;
    let data = random_rows(rows, DIM, 16);
    let dataset = DataSet::from_f32(rows, DIM, data.clone())
        .unwrap()
        .with_scalar_info(1, mod3_groups(rows));
    let mut node = HnswIndexNode::new(HnswVariant::Pq, DataFormat::Fp32, pools());
    node.build(&dataset, &cfg(r#"{"m": 4, "nbits": 4}"#)).unwrap();
    assert_eq!(node.count(), rows);

    let map = node.internal_id_to_external_id_map().unwrap();
    assert_eq!(&map[..3], &[0, 3, 6]);

    let filter = BitsetView::admitting_only(rows, (0..rows).filter(|i| i % 3 == 0));
    let res = node
        .search(&queries(&data, DIM, &[0]), &cfg(r#"{"k": 5}"#), &filter)
        .unwrap();
    assert!(res.row_ids(0).iter().all(|&id| id >= 0 && id % 3 == 0));
}

// ============================================================================
// Range search
// ============================================================================

#[test]
fn test_range_search_distance_bounds() {
    let (node, data) = single_node(HnswVariant::Flat, 300, 17, &HnswConfig::default());
    let q = row(&data, DIM, 0);
    let res = node
        .range_search(
            &queries(&data, DIM, &[0]),
            &cfg(r#"{"ef": 64, "radius": 3.0, "range_filter": 1.0}"#),
            &BitsetView::default(),
        )
        .unwrap();
    let ids = res.row_ids(0);
    let dists = res.row_distances(0);
    assert!(!ids.contains(&0));
    for (&id, &d) in ids.iter().zip(dists) {
        assert!((1.0..3.0).contains(&d));
        assert!((l2(row(&data, DIM, id as usize), q) - d).abs() < 1e-5);
    }
    assert!(dists.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_range_search_similarity_exhaustive() {
    let (node, data) = single_node(HnswVariant::Flat, 200, 18, &cfg(r#"{"metric_type": "IP"}"#));
    let admitted = [3usize, 50, 77, 120, 199];
    let filter = BitsetView::admitting_only(200, admitted);
    let q = row(&data, DIM, 10);
    let (radius, range_filter) = (-0.5f32, 0.5f32);
    let res = node
        .range_search(
            &queries(&data, DIM, &[10]),
            &cfg(r#"{"metric_type": "IP", "ef": 16, "radius": -0.5, "range_filter": 0.5}"#),
            &filter,
        )
        .unwrap();

    let mut expected: Vec<(f32, i64)> = admitted
        .iter()
        .map(|&i| (ip(row(&data, DIM, i), q), i as i64))
        .filter(|&(s, _)| radius < s && s <= range_filter)
        .collect();
    expected.sort_by(|a, b| b.0.total_cmp(&a.0));
    let expected_ids: Vec<i64> = expected.iter().map(|&(_, i)| i).collect();
    assert_eq!(res.row_ids(0), expected_ids.as_slice());
}

#[test]
fn test_range_search_per_row_lengths() {
    let (node, data) = partitioned_node(420, 19);
    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 0));
    let res = node
        .range_search(
            &queries(&data, DIM, &[0, 3, 6]),
            &cfg(r#"{"ef": 32, "radius": 0.8}"#),
            &filter,
        )
        .unwrap();
    assert_eq!(res.rows(), 3);
    for r in 0..3 {
        assert!(res.row_ids(r).iter().all(|id| id % 3 == 0));
        assert_eq!(res.row_ids(r)[0], 3 * r as i64);
    }
}

// ============================================================================
// Distances and vectors by label
// ============================================================================

#[test]
fn test_calc_dist_by_ids_in_routed_partition() {
    let (node, data) = partitioned_node(420, 20);
    let filter = BitsetView::admitting_only(420, (0..420).filter(|i| i % 3 == 1));
    let q = queries(&data, DIM, &[0, 9]);
    let labels = [1i64, 4, 400];
    let dists = node.calc_dist_by_ids(&q, &filter, &labels).unwrap();
    assert_eq!(dists.len(), 6);
    for (r, &qi) in [0usize, 9].iter().enumerate() {
        for (j, &label) in labels.iter().enumerate() {
            let expected = l2(row(&data, DIM, qi), row(&data, DIM, label as usize));
            assert!((dists[r * 3 + j] - expected).abs() < 1e-5);
        }
    }

    let err = node.calc_dist_by_ids(&q, &filter, &[0]).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgs(_)));
    let err = node.calc_dist_by_ids(&q, &filter, &[420]).unwrap_err();
    assert!(matches!(err, IndexError::UnknownLabel { label: 420 }));
}

#[test]
fn test_get_vector_by_ids_across_partitions() {
    let (node, data) = partitioned_node(420, 21);
    let back = node.get_vector_by_ids(&[5, 0, 10]).unwrap();
    assert_eq!(back.rows(), 3);
    let expected = [row(&data, DIM, 5), row(&data, DIM, 0), row(&data, DIM, 10)].concat();
    assert_eq!(back.to_f32().to_vec(), expected);
    assert!(matches!(
        node.get_vector_by_ids(&[-1]),
        Err(IndexError::UnknownLabel { label: -1 })
    ));
}
