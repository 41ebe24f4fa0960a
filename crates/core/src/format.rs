//! Element encodings of vector data
//!
//! Rows arrive as fp32, fp16, bf16 or int8. The engine computes in fp32, so
//! every tensor can be widened with [`Tensor::to_f32`] and narrowed back with
//! [`Tensor::from_f32`] when vectors are handed out again.

use std::borrow::Cow;
use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element encoding of a vector set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// 32-bit float
    Fp32,
    /// IEEE half precision
    Fp16,
    /// bfloat16
    Bf16,
    /// signed 8-bit integer
    Int8,
}

impl DataFormat {
    /// Bytes per element
    pub fn element_size(&self) -> usize {
        match self {
            DataFormat::Fp32 => 4,
            DataFormat::Fp16 | DataFormat::Bf16 => 2,
            DataFormat::Int8 => 1,
        }
    }

    /// Whether incremental iteration is supported for this encoding
    pub fn supports_iterator(&self) -> bool {
        !matches!(self, DataFormat::Int8)
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataFormat::Fp32 => "fp32",
            DataFormat::Fp16 => "fp16",
            DataFormat::Bf16 => "bf16",
            DataFormat::Int8 => "int8",
        };
        f.write_str(name)
    }
}

/// Row-major vector data in one encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// fp32 elements
    Fp32(Vec<f32>),
    /// fp16 elements
    Fp16(Vec<f16>),
    /// bf16 elements
    Bf16(Vec<bf16>),
    /// int8 elements
    Int8(Vec<i8>),
}

impl Tensor {
    /// Encoding of this tensor
    pub fn format(&self) -> DataFormat {
        match self {
            Tensor::Fp32(_) => DataFormat::Fp32,
            Tensor::Fp16(_) => DataFormat::Fp16,
            Tensor::Bf16(_) => DataFormat::Bf16,
            Tensor::Int8(_) => DataFormat::Int8,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Tensor::Fp32(v) => v.len(),
            Tensor::Fp16(v) => v.len(),
            Tensor::Bf16(v) => v.len(),
            Tensor::Int8(v) => v.len(),
        }
    }

    /// True if there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen to fp32, borrowing when already fp32
    pub fn to_f32(&self) -> Cow<'_, [f32]> {
        match self {
            Tensor::Fp32(v) => Cow::Borrowed(v.as_slice()),
            Tensor::Fp16(v) => Cow::Owned(v.iter().map(|x| x.to_f32()).collect()),
            Tensor::Bf16(v) => Cow::Owned(v.iter().map(|x| x.to_f32()).collect()),
            Tensor::Int8(v) => Cow::Owned(v.iter().map(|&x| x as f32).collect()),
        }
    }

    /// Narrow fp32 values to `format`
    ///
    /// Int8 values are rounded and saturated to `[-128, 127]`.
    pub fn from_f32(format: DataFormat, values: &[f32]) -> Tensor {
        match format {
            DataFormat::Fp32 => Tensor::Fp32(values.to_vec()),
            DataFormat::Fp16 => Tensor::Fp16(values.iter().map(|&x| f16::from_f32(x)).collect()),
            DataFormat::Bf16 => Tensor::Bf16(values.iter().map(|&x| bf16::from_f32(x)).collect()),
            DataFormat::Int8 => Tensor::Int8(
                values
                    .iter()
                    .map(|&x| x.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
                    .collect(),
            ),
        }
    }
}
