//! Tensor contract checks shared across the runtime.
//!
//! Every predicate returns a typed [`ShapeDtypeError`] naming the violated
//! contract and the observed values; nothing is coerced silently except the
//! explicit [`to_device_dtype`] helper used by the weight loader.

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapeDtypeError {
    #[error("{context}: expected a CUDA tensor, got {got}")]
    NotCuda { context: String, got: String },

    #[error("{context}: tensor must be contiguous")]
    NotContiguous { context: String },

    #[error("{context}: expected dtype {expected:?}, got {got:?}")]
    DtypeMismatch {
        context: String,
        expected: DType,
        got: DType,
    },

    #[error("{context}: expected shape {expected}, got {got}")]
    ShapeMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("{context}: expected {expected} dims, got {got}")]
    RankMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Pretty-print a dim list the way error messages expect: `[2, 4, 16]`.
pub fn shape_str(dims: &[usize]) -> String {
    let inner = dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

fn pattern_str(dims: &[i64]) -> String {
    let inner = dims
        .iter()
        .map(|d| {
            if *d < 0 {
                "*".to_string()
            } else {
                d.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

pub fn require_cuda(t: &Tensor, context: &str) -> Result<(), ShapeDtypeError> {
    if t.device().is_cuda() {
        Ok(())
    } else {
        Err(ShapeDtypeError::NotCuda {
            context: context.to_string(),
            got: format!("{:?}", t.device()),
        })
    }
}

pub fn require_contiguous(t: &Tensor, context: &str) -> Result<(), ShapeDtypeError> {
    if t.is_contiguous() {
        Ok(())
    } else {
        Err(ShapeDtypeError::NotContiguous {
            context: context.to_string(),
        })
    }
}

pub fn require_dtype(t: &Tensor, dtype: DType, context: &str) -> Result<(), ShapeDtypeError> {
    if t.dtype() == dtype {
        Ok(())
    } else {
        Err(ShapeDtypeError::DtypeMismatch {
            context: context.to_string(),
            expected: dtype,
            got: t.dtype(),
        })
    }
}

pub fn require_rank(t: &Tensor, rank: usize, context: &str) -> Result<(), ShapeDtypeError> {
    if t.rank() == rank {
        Ok(())
    } else {
        Err(ShapeDtypeError::RankMismatch {
            context: context.to_string(),
            expected: rank,
            got: t.rank(),
        })
    }
}

/// Check a shape against a pattern where `-1` matches any extent.
pub fn require_shape(t: &Tensor, pattern: &[i64], context: &str) -> Result<(), ShapeDtypeError> {
    let dims = t.dims();
    let matches = dims.len() == pattern.len()
        && dims
            .iter()
            .zip(pattern.iter())
            .all(|(&d, &p)| p < 0 || d as i64 == p);
    if matches {
        Ok(())
    } else {
        Err(ShapeDtypeError::ShapeMismatch {
            context: context.to_string(),
            expected: pattern_str(pattern),
            got: shape_str(dims),
        })
    }
}

/// Convert a tensor to the given device and dtype, making it contiguous.
///
/// This is the single sanctioned coercion point; loaders call it before
/// assigning external tensors into parameter slots.
pub fn to_device_dtype(
    t: &Tensor,
    device: &Device,
    dtype: DType,
) -> Result<Tensor, ShapeDtypeError> {
    let t = if t.dtype() != dtype {
        t.to_dtype(dtype)?
    } else {
        t.clone()
    };
    let t = if !t.device().same_device(device) {
        t.to_device(device)?
    } else {
        t
    };
    Ok(if t.is_contiguous() { t } else { t.contiguous()? })
}
