//! Q1.7 weight quantization
//!
//! Q1.7 is signed 8-bit fixed point with 7 fractional bits: codes `-128..=127` scaled by
//! `1/128`, covering `[-1.0, 127/128]`. Out-of-range values saturate.

use log::debug;
use nalgebra::DMatrix;

use crate::neural::SnnModel;

/// Number of fractional bits in Q1.7
pub const FRACTIONAL_BITS: i32 = 7;
/// 2^7
pub const SCALE: f32 = (1 << FRACTIONAL_BITS) as f32;
/// Smallest representable code
pub const CODE_MIN: f32 = -128.0;
/// Largest representable code
pub const CODE_MAX: f32 = 127.0;

/// Quantize a single value to the nearest Q1.7 lattice point (ties to even).
#[inline]
pub fn quantize_value(x: f32) -> f32 {
    (x * SCALE).round_ties_even().clamp(CODE_MIN, CODE_MAX) / SCALE
}

/// Raw signed 8-bit code for `x`.
#[inline]
pub fn to_q1_7_code(x: f32) -> i8 {
    (x * SCALE).round_ties_even().clamp(CODE_MIN, CODE_MAX) as i8
}

/// Value represented by a raw Q1.7 code.
#[inline]
pub fn from_q1_7_code(code: i8) -> f32 {
    code as f32 / SCALE
}

/// Quantize a whole tensor, keeping its shape.
pub fn quantize_q1_7(x: &DMatrix<f32>) -> DMatrix<f32> {
    x.map(quantize_value)
}

/// Project every trainable weight-like parameter of `model` onto the Q1.7 lattice in place.
///
/// Biases and normalization affine terms keep full precision. No gradient is involved; this
/// only rewrites parameter values. Returns the number of tensors projected.
pub fn apply_weight_quantization(model: &mut SnnModel) -> usize {
    let mut projected = 0;
    for param in model.params_mut().iter_mut() {
        if param.is_trainable() && param.role().is_weight_like() {
            param.value_mut().apply(|v| *v = quantize_value(*v));
            projected += 1;
        }
    }
    debug!("Projected {} weight tensors onto Q1.7", projected);
    projected
}

/// True when every element of `x` already sits on the Q1.7 lattice.
pub fn is_on_lattice(x: &DMatrix<f32>) -> bool {
    x.iter().all(|&v| {
        let code = v * SCALE;
        code == code.round() && (CODE_MIN..=CODE_MAX).contains(&code)
    })
}
