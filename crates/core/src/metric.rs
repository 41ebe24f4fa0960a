//! Distance metrics

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Metric used to compare vectors
///
/// `L2` is a distance (smaller is closer). `IP` and `COSINE` are
/// similarities (larger is closer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Squared Euclidean distance
    #[serde(rename = "L2")]
    L2,
    /// Inner product
    #[serde(rename = "IP")]
    InnerProduct,
    /// Cosine similarity
    #[serde(rename = "COSINE")]
    Cosine,
}

impl MetricType {
    /// True when larger values mean closer vectors
    pub fn is_similarity(&self) -> bool {
        matches!(self, MetricType::InnerProduct | MetricType::Cosine)
    }

    /// Distance reported for an unfilled result slot
    pub fn worst_distance(&self) -> f32 {
        if self.is_similarity() {
            f32::NEG_INFINITY
        } else {
            f32::INFINITY
        }
    }

    /// Default `range_filter` bound, meaning "no second bound"
    pub fn default_range_filter(&self) -> f32 {
        if self.is_similarity() {
            f32::INFINITY
        } else {
            f32::NEG_INFINITY
        }
    }

    /// Convert a metric value to the min-oriented internal convention
    #[inline]
    pub fn to_min_oriented(&self, value: f32) -> f32 {
        if self.is_similarity() {
            -value
        } else {
            value
        }
    }

    /// Inverse of [`MetricType::to_min_oriented`]
    #[inline]
    pub fn from_min_oriented(&self, value: f32) -> f32 {
        self.to_min_oriented(value)
    }

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::L2 => "L2",
            MetricType::InnerProduct => "IP",
            MetricType::Cosine => "COSINE",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(MetricType::L2),
            "IP" => Ok(MetricType::InnerProduct),
            "COSINE" => Ok(MetricType::Cosine),
            other => Err(IndexError::InvalidMetricType(other.to_string())),
        }
    }
}
