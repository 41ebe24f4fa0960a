//! Partition planning
//!
//! Scalar-partitioned builds get one id group per distinct scalar value.
//! Groups that are too small to train a quantizer on are merged, smallest
//! first, until every bucket holds at least the minimum trainable row count.

use stratavec_core::HnswConfig;

/// Minimum partition size of Flat and SQ variants
pub const DEFAULT_MIN_PARTITION_ROWS: usize = 128;

/// Group id groups into buckets holding at least `base_rows` ids each
///
/// Groups are visited in ascending size (ties keep their input order) and
/// accumulated into a running bucket that is sealed once it reaches
/// `base_rows`. A leftover tail joins the last sealed bucket, or becomes the
/// only bucket when nothing was sealed. Returns group indices per bucket.
///
/// ```
/// use stratavec_index::planner::combine_partitions;
///
/// let groups = vec![vec![1, 2], vec![3, 4, 5], vec![1]];
/// assert_eq!(combine_partitions(&groups, 3), vec![vec![2, 0], vec![1]]);
/// ```
pub fn combine_partitions(groups: &[Vec<u32>], base_rows: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by_key(|&i| groups[i].len());

    let mut buckets: Vec<Vec<usize>> = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;
    for i in order {
        current_size += groups[i].len();
        current.push(i);
        if current_size >= base_rows {
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        }
    }

    if !current.is_empty() {
        match buckets.last_mut() {
            Some(last) => last.extend(current),
            None => buckets.push(current),
        }
    }
    buckets
}

/// Quantizer families, as far as partition sizing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingNeed {
    /// No codebook (Flat, SQ)
    Scalar,
    /// k-means codebooks with `1 << nbits` centroids (PQ, PRQ)
    Codebook,
}

/// Smallest partition that can still be trained
///
/// Saturates when `nbits` is too wide for `usize`, which keeps the index
/// unpartitioned.
pub fn min_partition_rows(need: TrainingNeed, config: &HnswConfig) -> usize {
    match need {
        TrainingNeed::Scalar => DEFAULT_MIN_PARTITION_ROWS,
        TrainingNeed::Codebook => u32::try_from(config.nbits())
            .ok()
            .and_then(|bits| 1usize.checked_shl(bits))
            .unwrap_or(usize::MAX),
    }
}
