//! Rounding of f32 storage to narrower element types
//!
//! Buffers always hold f32 values; kernels round their results to the output
//! dtype so that values observed on the host match native storage.

use common::types::DType;
use half::{bf16, f16};

/// Largest finite f8e4m3 magnitude
pub const F8E4M3_MAX: f32 = 448.0;

const F8E4M3_MANTISSA_BITS: i32 = 3;
const F8E4M3_MIN_EXPONENT: i32 = -6;

/// Rounds a single value to the nearest representable value of `dtype`
pub fn round_to(dtype: DType, value: f32) -> f32 {
    match dtype {
        DType::F32 => value,
        DType::F16 => f16::from_f32(value).to_f32(),
        DType::BF16 => bf16::from_f32(value).to_f32(),
        DType::F8E4M3 => round_f8e4m3(value),
    }
}

/// Rounds every element of `values` in place
pub fn round_slice(dtype: DType, values: &mut [f32]) {
    if dtype == DType::F32 {
        return;
    }
    for v in values.iter_mut() {
        *v = round_to(dtype, *v);
    }
}

fn round_f8e4m3(value: f32) -> f32 {
    if value.is_nan() {
        return value;
    }
    let clamped = value.clamp(-F8E4M3_MAX, F8E4M3_MAX);
    if clamped == 0.0 {
        return 0.0;
    }

    // Subnormals share the step of the smallest normal binade
    let exponent = clamped.abs().log2().floor() as i32;
    let exponent = exponent.max(F8E4M3_MIN_EXPONENT);
    let step = 2f32.powi(exponent - F8E4M3_MANTISSA_BITS);

    ((clamped / step).round() * step).clamp(-F8E4M3_MAX, F8E4M3_MAX)
}
