//! Scalar distance kernels
//!
//! All kernels are single-threaded and return values in the metric's own
//! orientation: squared L2 (smaller is closer), inner product and cosine
//! (larger is closer). Callers convert to the min-oriented convention with
//! [`MetricType::to_min_oriented`].

use stratavec_core::MetricType;

/// Metric value between two vectors
pub fn metric_value(a: &[f32], b: &[f32], metric: MetricType) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Dimension mismatch in distance computation");

    match metric {
        MetricType::L2 => l2_sqr(a, b),
        MetricType::InnerProduct => inner_product(a, b),
        MetricType::Cosine => cosine_similarity(a, b),
    }
}

/// Squared Euclidean distance
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Inner product
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm (Euclidean length)
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Inverse L2 norm, 0.0 for a zero vector
pub fn inverse_norm(v: &[f32]) -> f32 {
    let norm = l2_norm(v);
    if norm == 0.0 {
        0.0
    } else {
        1.0 / norm
    }
}

/// Copy of `v` scaled to unit length; zero vectors stay zero
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let inv = inverse_norm(v);
    v.iter().map(|x| x * inv).collect()
}

/// Cosine similarity: dot(a,b) / (||a|| * ||b||)
///
/// Returns 0.0 if either vector has zero norm.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        inner_product(a, b) / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = metric_value(&v, &v, MetricType::Cosine);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite_vectors() {
        let sim = metric_value(&[1.0, 0.0], &[-1.0, 0.0], MetricType::Cosine);
        assert!((sim - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(metric_value(&[0.0, 0.0], &[1.0, 0.0], MetricType::Cosine), 0.0);
    }

    #[test]
    fn test_l2_is_squared() {
        assert_eq!(metric_value(&[0.0, 0.0], &[3.0, 4.0], MetricType::L2), 25.0);
    }

    #[test]
    fn test_inner_product() {
        assert_eq!(
            metric_value(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], MetricType::InnerProduct),
            32.0
        );
    }

    #[test]
    fn test_normalized() {
        let v = normalized(&[3.0, 4.0]);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        assert_eq!(normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(inverse_norm(&[0.0]), 0.0);
    }
}
