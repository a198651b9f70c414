//! Tagged tensor values exchanged with graph sessions.
//!
//! The graphs in this pipeline mix `f32` activations with `i64` token ids
//! and step counters, so values are carried as a small tagged enum over
//! dynamic-rank [`ndarray`] arrays. Zero-length dimensions are legal and
//! used deliberately (empty `sequence` / `text_embeddings` inputs during
//! conditioning).

use ndarray::{ArrayD, IxDyn};
use std::fmt;

/// Element type of a [`TensorValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    I64,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::F32 => write!(f, "f32"),
            Dtype::I64 => write!(f, "i64"),
        }
    }
}

/// A dynamically-shaped tensor of either element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl TensorValue {
    /// Zero-filled tensor of the given dtype and dims.
    pub fn zeros(dtype: Dtype, dims: &[usize]) -> Self {
        match dtype {
            Dtype::F32 => TensorValue::F32(ArrayD::zeros(IxDyn(dims))),
            Dtype::I64 => TensorValue::I64(ArrayD::zeros(IxDyn(dims))),
        }
    }

    /// Constant-filled f32 tensor (used for the NaN bootstrap frame).
    pub fn full_f32(dims: &[usize], value: f32) -> Self {
        TensorValue::F32(ArrayD::from_elem(IxDyn(dims), value))
    }

    /// Build an f32 tensor from a flat buffer. The buffer length must equal
    /// the dim product; this is a structural invariant of every call site.
    pub fn from_f32(dims: &[usize], data: Vec<f32>) -> Self {
        TensorValue::F32(
            ArrayD::from_shape_vec(IxDyn(dims), data).expect("dims/product mismatch"),
        )
    }

    /// Build an i64 tensor from a flat buffer.
    pub fn from_i64(dims: &[usize], data: Vec<i64>) -> Self {
        TensorValue::I64(
            ArrayD::from_shape_vec(IxDyn(dims), data).expect("dims/product mismatch"),
        )
    }

    /// Scalar f32 with shape `[1, 1]` (the flow schedule's `s`/`t` shape).
    pub fn scalar_f32(value: f32) -> Self {
        Self::from_f32(&[1, 1], vec![value])
    }

    /// Empty f32 tensor `[batch, 0, dim]`.
    pub fn empty_f32(batch: usize, dim: usize) -> Self {
        Self::zeros(Dtype::F32, &[batch, 0, dim])
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            TensorValue::F32(_) => Dtype::F32,
            TensorValue::I64(_) => Dtype::I64,
        }
    }

    pub fn dims(&self) -> &[usize] {
        match self {
            TensorValue::F32(a) => a.shape(),
            TensorValue::I64(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorValue::F32(a) => a.len(),
            TensorValue::I64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous f32 view, if this is an f32 tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorValue::F32(a) => a.as_slice(),
            TensorValue::I64(_) => None,
        }
    }

    /// Contiguous i64 view, if this is an i64 tensor.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            TensorValue::I64(a) => a.as_slice(),
            TensorValue::F32(_) => None,
        }
    }

    /// Flat f32 copy regardless of stored dtype (i64 widens).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorValue::F32(a) => a.iter().copied().collect(),
            TensorValue::I64(a) => a.iter().map(|&v| v as f32).collect(),
        }
    }

    /// First element widened to f32 (scalar outputs such as `eos_logit`).
    pub fn first_f32(&self) -> Option<f32> {
        match self {
            TensorValue::F32(a) => a.iter().next().copied(),
            TensorValue::I64(a) => a.iter().next().map(|&v| v as f32),
        }
    }

    /// Reshape in place, preserving the element count.
    pub fn reshaped(self, dims: &[usize]) -> Self {
        match self {
            TensorValue::F32(a) => {
                let data: Vec<f32> = a.iter().copied().collect();
                Self::from_f32(dims, data)
            }
            TensorValue::I64(a) => {
                let data: Vec<i64> = a.iter().copied().collect();
                Self::from_i64(dims, data)
            }
        }
    }

    /// Convert to the requested dtype, element-wise.
    ///
    /// f32 → i64 rounds to nearest; i64 → f32 widens. Same-dtype conversion
    /// is a no-op.
    pub fn coerced(self, dtype: Dtype) -> Self {
        match (self, dtype) {
            (TensorValue::F32(a), Dtype::I64) => {
                TensorValue::I64(a.mapv(|v| v.round() as i64))
            }
            (TensorValue::I64(a), Dtype::F32) => TensorValue::F32(a.mapv(|v| v as f32)),
            (value, _) => value,
        }
    }
}
