//! Kernel library of the reference device
//!
//! Every kernel has a shape rule (`output_spec`) shared by the device, the
//! tracer and the compiler's validator, and an implementation (`run`) that
//! writes into a preallocated output buffer.

use std::fmt;

use common::error::{Error, Result};
use common::types::{AttentionKernel, DType, Shape};
use serde::{Deserialize, Serialize};

use crate::precision;
use crate::tensor::TensorSpec;

/// Elementwise binary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
}

impl BinaryOp {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Maximum => a.max(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
        }
    }
}

/// Elementwise unary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Exp,
    Tanh,
    Gelu,
    Silu,
    Relu,
    Square,
    Rsqrt,
    Sqrt,
}

impl UnaryOp {
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Gelu => {
                // tanh approximation
                const C: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (C * (x + 0.044_715 * x * x * x)).tanh())
            }
            UnaryOp::Silu => x / (1.0 + (-x).exp()),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Square => x * x,
            UnaryOp::Rsqrt => 1.0 / x.sqrt(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Gelu => "gelu",
            UnaryOp::Silu => "silu",
            UnaryOp::Relu => "relu",
            UnaryOp::Square => "square",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Sqrt => "sqrt",
        }
    }
}

/// One step of a fused pointwise chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PointwiseStep {
    Unary(UnaryOp),
    Scale(f32),
}

impl PointwiseStep {
    fn apply(self, x: f32) -> f32 {
        match self {
            PointwiseStep::Unary(op) => op.apply(x),
            PointwiseStep::Scale(factor) => x * factor,
        }
    }
}

/// A device kernel together with its static parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Kernel {
    /// Writes a constant into every element of the output
    Fill { value: f32, spec: TensorSpec },

    /// Copies the input into the output
    Copy,

    /// Elementwise binary op; the right operand broadcasts over a shape suffix
    Binary(BinaryOp),

    /// Elementwise unary op
    Unary(UnaryOp),

    /// Multiplication by a constant
    Scale { factor: f32 },

    /// Fused chain of single-input elementwise steps
    Pointwise { steps: Vec<PointwiseStep> },

    /// Batched matrix multiply, `[.., m, k] x [k, n]`
    ///
    /// `row_tile` only affects iteration order over output rows. Every output
    /// element is reduced over `k` in the same order, so results do not
    /// depend on the tile.
    Matmul {
        transpose_rhs: bool,
        row_tile: Option<usize>,
    },

    /// Softmax over the last axis
    Softmax,

    /// Root-mean-square normalization over the last axis
    RmsNorm { eps: f32 },

    /// Scaled dot-product attention over `[batch, heads, seq, dim]`
    Attention { kernel: AttentionKernel, scale: f32 },

    /// Axis permutation
    Permute { perm: Vec<usize> },

    /// Concatenation of two tensors along an axis
    Concat { axis: usize },

    /// Contiguous range along an axis
    Slice { axis: usize, start: usize, len: usize },

    /// Element type conversion
    Cast { dtype: DType },
}

impl Kernel {
    pub fn name(&self) -> String {
        match self {
            Kernel::Fill { .. } => "fill".to_string(),
            Kernel::Copy => "copy".to_string(),
            Kernel::Binary(op) => op.name().to_string(),
            Kernel::Unary(op) => op.name().to_string(),
            Kernel::Scale { .. } => "scale".to_string(),
            Kernel::Pointwise { steps } => {
                let names: Vec<&str> = steps
                    .iter()
                    .map(|s| match s {
                        PointwiseStep::Unary(op) => op.name(),
                        PointwiseStep::Scale(_) => "scale",
                    })
                    .collect();
                format!("pointwise[{}]", names.join(","))
            }
            Kernel::Matmul { .. } => "matmul".to_string(),
            Kernel::Softmax => "softmax".to_string(),
            Kernel::RmsNorm { .. } => "rms_norm".to_string(),
            Kernel::Attention { kernel, .. } => format!("attention_{}", kernel),
            Kernel::Permute { .. } => "permute".to_string(),
            Kernel::Concat { .. } => "concat".to_string(),
            Kernel::Slice { .. } => "slice".to_string(),
            Kernel::Cast { dtype } => format!("cast_{}", dtype),
        }
    }

    /// Number of input tensors the kernel consumes
    pub fn arity(&self) -> usize {
        match self {
            Kernel::Fill { .. } => 0,
            Kernel::Binary(_) | Kernel::Matmul { .. } | Kernel::Concat { .. } => 2,
            Kernel::Attention { .. } => 3,
            _ => 1,
        }
    }

    /// Returns true for single-input kernels that map each element independently
    pub fn is_elementwise_unary(&self) -> bool {
        matches!(
            self,
            Kernel::Unary(_) | Kernel::Scale { .. } | Kernel::Pointwise { .. }
        )
    }

    /// Steps of an elementwise unary kernel, if it is one
    pub fn pointwise_steps(&self) -> Option<Vec<PointwiseStep>> {
        match self {
            Kernel::Unary(op) => Some(vec![PointwiseStep::Unary(*op)]),
            Kernel::Scale { factor } => Some(vec![PointwiseStep::Scale(*factor)]),
            Kernel::Pointwise { steps } => Some(steps.clone()),
            _ => None,
        }
    }

    /// Computes the output spec from the input specs
    pub fn output_spec(&self, inputs: &[TensorSpec]) -> Result<TensorSpec> {
        if inputs.len() != self.arity() {
            return Err(Error::InvalidArgument(format!(
                "{} expects {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }

        match self {
            Kernel::Fill { spec, .. } => {
                if !spec.shape.is_valid() {
                    return Err(self.shape_error(&format!("invalid fill shape {}", spec.shape)));
                }
                Ok(spec.clone())
            }
            Kernel::Copy
            | Kernel::Unary(_)
            | Kernel::Scale { .. }
            | Kernel::Pointwise { .. }
            | Kernel::Softmax
            | Kernel::RmsNorm { .. } => Ok(inputs[0].clone()),
            Kernel::Binary(_) => {
                let (lhs, rhs) = (&inputs[0], &inputs[1]);
                let suffix = lhs.shape.dims().ends_with(rhs.shape.dims());
                if !suffix && rhs.numel() != 1 {
                    return Err(self.shape_error(&format!(
                        "cannot broadcast {} onto {}",
                        rhs.shape, lhs.shape
                    )));
                }
                Ok(lhs.clone())
            }
            Kernel::Matmul { transpose_rhs, .. } => {
                let (lhs, rhs) = (&inputs[0], &inputs[1]);
                let l = lhs.shape.dims();
                let r = rhs.shape.dims();
                if l.len() < 2 || r.len() < 2 {
                    return Err(self.shape_error("operands must have rank >= 2"));
                }
                if r.len() > 2 && r[..r.len() - 2] != l[..l.len() - 2] {
                    return Err(self.shape_error(&format!(
                        "batch dimensions of {} and {} differ",
                        lhs.shape, rhs.shape
                    )));
                }
                let k = l[l.len() - 1];
                let (rk, n) = if *transpose_rhs {
                    (r[r.len() - 1], r[r.len() - 2])
                } else {
                    (r[r.len() - 2], r[r.len() - 1])
                };
                if k != rk {
                    return Err(self.shape_error(&format!(
                        "contraction mismatch between {} and {}",
                        lhs.shape, rhs.shape
                    )));
                }
                let mut dims = l.to_vec();
                let last = dims.len() - 1;
                dims[last] = n;
                let dtype = if lhs.dtype.is_float8() {
                    DType::BF16
                } else {
                    lhs.dtype
                };
                Ok(TensorSpec::new(dims, dtype))
            }
            Kernel::Attention { .. } => {
                let (q, k, v) = (&inputs[0], &inputs[1], &inputs[2]);
                let (qd, kd, vd) = (q.shape.dims(), k.shape.dims(), v.shape.dims());
                if qd.len() != 4 || kd.len() != 4 || vd.len() != 4 {
                    return Err(self.shape_error("q, k and v must have rank 4"));
                }
                if qd[..2] != kd[..2] || kd[..3] != vd[..3] || qd[3] != kd[3] {
                    return Err(self.shape_error(&format!(
                        "incompatible q {} k {} v {}",
                        q.shape, k.shape, v.shape
                    )));
                }
                Ok(TensorSpec::new(vec![qd[0], qd[1], qd[2], vd[3]], q.dtype))
            }
            Kernel::Permute { perm } => {
                let dims = inputs[0].shape.dims();
                let mut seen = vec![false; dims.len()];
                if perm.len() != dims.len() {
                    return Err(self.shape_error("permutation rank mismatch"));
                }
                for &p in perm {
                    if p >= dims.len() || seen[p] {
                        return Err(self.shape_error(&format!("invalid permutation {:?}", perm)));
                    }
                    seen[p] = true;
                }
                let out: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
                Ok(TensorSpec::new(out, inputs[0].dtype))
            }
            Kernel::Concat { axis } => {
                let (a, b) = (&inputs[0], &inputs[1]);
                let (ad, bd) = (a.shape.dims(), b.shape.dims());
                if *axis >= ad.len() || ad.len() != bd.len() || a.dtype != b.dtype {
                    return Err(self.shape_error(&format!("cannot concat {} and {}", a, b)));
                }
                for i in 0..ad.len() {
                    if i != *axis && ad[i] != bd[i] {
                        return Err(self.shape_error(&format!("cannot concat {} and {}", a, b)));
                    }
                }
                let mut out = ad.to_vec();
                out[*axis] += bd[*axis];
                Ok(TensorSpec::new(out, a.dtype))
            }
            Kernel::Slice { axis, start, len } => {
                let dims = inputs[0].shape.dims();
                if *axis >= dims.len() || *len == 0 || start + len > dims[*axis] {
                    return Err(self.shape_error(&format!(
                        "slice {}..{} out of range for {}",
                        start,
                        start + len,
                        inputs[0].shape
                    )));
                }
                let mut out = dims.to_vec();
                out[*axis] = *len;
                Ok(TensorSpec::new(out, inputs[0].dtype))
            }
            Kernel::Cast { dtype } => Ok(TensorSpec::new(inputs[0].shape.clone(), *dtype)),
        }
    }

    fn shape_error(&self, detail: &str) -> Error {
        Error::InvalidArgument(format!("{}: {}", self.name(), detail))
    }

    /// Runs the kernel and rounds the result to the output dtype
    pub fn run(&self, inputs: &[(&TensorSpec, &[f32])], output: &TensorSpec, out: &mut [f32]) -> Result<()> {
        self.compute(inputs, output, out)?;
        precision::round_slice(output.dtype, out);
        Ok(())
    }

    fn compute(&self, inputs: &[(&TensorSpec, &[f32])], output: &TensorSpec, out: &mut [f32]) -> Result<()> {
        match self {
            Kernel::Fill { value, .. } => out.fill(*value),
            Kernel::Copy => out.copy_from_slice(inputs[0].1),
            Kernel::Binary(op) => {
                let (lhs, rhs) = (inputs[0].1, inputs[1].1);
                let r = rhs.len();
                for (i, o) in out.iter_mut().enumerate() {
                    *o = op.apply(lhs[i], rhs[i % r]);
                }
            }
            Kernel::Unary(op) => {
                for (o, &x) in out.iter_mut().zip(inputs[0].1) {
                    *o = op.apply(x);
                }
            }
            Kernel::Scale { factor } => {
                for (o, &x) in out.iter_mut().zip(inputs[0].1) {
                    *o = x * factor;
                }
            }
            Kernel::Pointwise { steps } => {
                // Round after every step so a fused chain matches the unfused one
                for (o, &x) in out.iter_mut().zip(inputs[0].1) {
                    let mut v = x;
                    for step in steps {
                        v = precision::round_to(output.dtype, step.apply(v));
                    }
                    *o = v;
                }
            }
            Kernel::Matmul {
                transpose_rhs,
                row_tile,
            } => matmul(inputs, output, out, *transpose_rhs, *row_tile),
            Kernel::Softmax => {
                let d = last_dim(&output.shape);
                for (row, o) in inputs[0].1.chunks(d).zip(out.chunks_mut(d)) {
                    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for (oi, &x) in o.iter_mut().zip(row) {
                        *oi = (x - max).exp();
                        sum += *oi;
                    }
                    for oi in o.iter_mut() {
                        *oi /= sum;
                    }
                }
            }
            Kernel::RmsNorm { eps } => {
                let d = last_dim(&output.shape);
                for (row, o) in inputs[0].1.chunks(d).zip(out.chunks_mut(d)) {
                    let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / d as f32;
                    let inv = 1.0 / (mean_sq + eps).sqrt();
                    for (oi, &x) in o.iter_mut().zip(row) {
                        *oi = x * inv;
                    }
                }
            }
            Kernel::Attention { kernel, scale } => attention(inputs, out, *kernel, *scale),
            Kernel::Permute { perm } => permute(inputs[0].0.shape.dims(), perm, inputs[0].1, out),
            Kernel::Concat { axis } => {
                let (a, b) = (inputs[0], inputs[1]);
                let inner: usize = a.0.shape.dims()[axis + 1..].iter().product();
                let a_chunk = a.0.shape.dims()[*axis] * inner;
                let b_chunk = b.0.shape.dims()[*axis] * inner;
                let outer: usize = a.0.shape.dims()[..*axis].iter().product();
                let mut offset = 0;
                for i in 0..outer {
                    out[offset..offset + a_chunk].copy_from_slice(&a.1[i * a_chunk..(i + 1) * a_chunk]);
                    offset += a_chunk;
                    out[offset..offset + b_chunk].copy_from_slice(&b.1[i * b_chunk..(i + 1) * b_chunk]);
                    offset += b_chunk;
                }
            }
            Kernel::Slice { axis, start, len } => {
                let dims = inputs[0].0.shape.dims();
                let inner: usize = dims[axis + 1..].iter().product();
                let outer: usize = dims[..*axis].iter().product();
                let src_chunk = dims[*axis] * inner;
                let dst_chunk = len * inner;
                for i in 0..outer {
                    let src = i * src_chunk + start * inner;
                    out[i * dst_chunk..(i + 1) * dst_chunk]
                        .copy_from_slice(&inputs[0].1[src..src + dst_chunk]);
                }
            }
            Kernel::Cast { .. } => out.copy_from_slice(inputs[0].1),
        }
        Ok(())
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn last_dim(shape: &Shape) -> usize {
    shape.dims().last().copied().unwrap_or(1)
}

fn matmul(
    inputs: &[(&TensorSpec, &[f32])],
    output: &TensorSpec,
    out: &mut [f32],
    transpose_rhs: bool,
    row_tile: Option<usize>,
) {
    let (lhs_spec, lhs) = inputs[0];
    let (rhs_spec, rhs) = inputs[1];
    let l = lhs_spec.shape.dims();
    let r = rhs_spec.shape.dims();
    let (m, k) = (l[l.len() - 2], l[l.len() - 1]);
    let n = last_dim(&output.shape);
    let batch = lhs.len() / (m * k);
    let rhs_batched = r.len() > 2;
    let tile = row_tile.unwrap_or(m).clamp(1, m);

    for b in 0..batch {
        let a_off = b * m * k;
        let b_off = if rhs_batched { b * k * n } else { 0 };
        let o_off = b * m * n;
        for row_start in (0..m).step_by(tile) {
            let row_end = (row_start + tile).min(m);
            for i in row_start..row_end {
                let a_row = &lhs[a_off + i * k..a_off + (i + 1) * k];
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for (p, &a) in a_row.iter().enumerate() {
                        let w = if transpose_rhs {
                            rhs[b_off + j * k + p]
                        } else {
                            rhs[b_off + p * n + j]
                        };
                        acc += a * w;
                    }
                    out[o_off + i * n + j] = acc;
                }
            }
        }
    }
}

fn attention(inputs: &[(&TensorSpec, &[f32])], out: &mut [f32], kernel: AttentionKernel, scale: f32) {
    let (q_spec, q) = inputs[0];
    let (k_spec, k) = inputs[1];
    let (v_spec, v) = inputs[2];
    let qd = q_spec.shape.dims();
    let (heads, sq, d) = (qd[0] * qd[1], qd[2], qd[3]);
    let sk = k_spec.shape.dims()[2];
    let dv = v_spec.shape.dims()[3];

    for h in 0..heads {
        let q_h = &q[h * sq * d..(h + 1) * sq * d];
        let k_h = &k[h * sk * d..(h + 1) * sk * d];
        let v_h = &v[h * sk * dv..(h + 1) * sk * dv];
        let o_h = &mut out[h * sq * dv..(h + 1) * sq * dv];

        for i in 0..sq {
            let q_row = &q_h[i * d..(i + 1) * d];
            let o_row = &mut o_h[i * dv..(i + 1) * dv];
            let score = |j: usize| -> f32 {
                let k_row = &k_h[j * d..(j + 1) * d];
                q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>() * scale
            };

            match kernel {
                AttentionKernel::Reference => {
                    let scores: Vec<f32> = (0..sk).map(score).collect();
                    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                    let sum: f32 = weights.iter().sum();
                    o_row.fill(0.0);
                    for (j, w) in weights.iter().enumerate() {
                        for (o, &x) in o_row.iter_mut().zip(&v_h[j * dv..(j + 1) * dv]) {
                            *o += w / sum * x;
                        }
                    }
                }
                AttentionKernel::Flash => {
                    // Online softmax, one pass over the keys
                    let mut running_max = f32::NEG_INFINITY;
                    let mut denom = 0.0f32;
                    o_row.fill(0.0);
                    for j in 0..sk {
                        let s = score(j);
                        let new_max = running_max.max(s);
                        let correction = (running_max - new_max).exp();
                        let p = (s - new_max).exp();
                        for (o, &x) in o_row.iter_mut().zip(&v_h[j * dv..(j + 1) * dv]) {
                            *o = *o * correction + p * x;
                        }
                        denom = denom * correction + p;
                        running_max = new_max;
                    }
                    for o in o_row.iter_mut() {
                        *o /= denom;
                    }
                }
            }
        }
    }
}

fn permute(dims: &[usize], perm: &[usize], input: &[f32], out: &mut [f32]) {
    let rank = dims.len();
    let mut strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
    let mut index = vec![0usize; rank];

    for o in out.iter_mut() {
        let src: usize = index
            .iter()
            .zip(perm)
            .map(|(&i, &p)| i * strides[p])
            .sum();
        *o = input[src];

        // Advance the output multi-index
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(dims.to_vec(), DType::F32)
    }

    fn run(kernel: &Kernel, inputs: &[(TensorSpec, Vec<f32>)]) -> (TensorSpec, Vec<f32>) {
        let specs: Vec<TensorSpec> = inputs.iter().map(|(s, _)| s.clone()).collect();
        let out_spec = kernel.output_spec(&specs).unwrap();
        let mut out = vec![0.0; out_spec.numel()];
        let refs: Vec<(&TensorSpec, &[f32])> = inputs.iter().map(|(s, d)| (s, d.as_slice())).collect();
        kernel.run(&refs, &out_spec, &mut out).unwrap();
        (out_spec, out)
    }

    #[test]
    fn test_binary_broadcast() {
        let kernel = Kernel::Binary(BinaryOp::Add);
        let (_, out) = run(
            &kernel,
            &[
                (spec(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                (spec(&[3]), vec![10.0, 20.0, 30.0]),
            ],
        );
        assert_eq!(out, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        assert!(kernel.output_spec(&[spec(&[2, 3]), spec(&[2])]).is_err());
    }

    #[test]
    fn test_matmul_tiles_are_bit_identical() {
        let lhs: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
        let rhs: Vec<f32> = (0..20).map(|i| (i as f32 * 0.11).cos()).collect();
        let inputs = [(spec(&[2, 3, 4]), lhs), (spec(&[4, 5]), rhs)];

        let (out_spec, untiled) = run(
            &Kernel::Matmul {
                transpose_rhs: false,
                row_tile: None,
            },
            &inputs,
        );
        assert_eq!(out_spec.shape.dims(), &[2, 3, 5]);

        for tile in [1, 2, 3, 8] {
            let (_, tiled) = run(
                &Kernel::Matmul {
                    transpose_rhs: false,
                    row_tile: Some(tile),
                },
                &inputs,
            );
            assert_eq!(tiled, untiled);
        }
    }

    #[test]
    fn test_matmul_transposed() {
        let (_, out) = run(
            &Kernel::Matmul {
                transpose_rhs: true,
                row_tile: None,
            },
            &[
                (spec(&[1, 2]), vec![1.0, 2.0]),
                (spec(&[3, 2]), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
            ],
        );
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_float8_matmul_outputs_bf16() {
        let kernel = Kernel::Matmul {
            transpose_rhs: false,
            row_tile: None,
        };
        let out = kernel
            .output_spec(&[
                TensorSpec::new(vec![2, 4], DType::F8E4M3),
                TensorSpec::new(vec![4, 4], DType::F8E4M3),
            ])
            .unwrap();
        assert_eq!(out.dtype, DType::BF16);
    }

    #[test]
    fn test_attention_kernels_agree() {
        let q: Vec<f32> = (0..16).map(|i| (i as f32 * 0.3).sin()).collect();
        let k: Vec<f32> = (0..24).map(|i| (i as f32 * 0.7).cos()).collect();
        let v: Vec<f32> = (0..24).map(|i| i as f32 * 0.1).collect();
        let inputs = [
            (spec(&[1, 2, 2, 4]), q),
            (spec(&[1, 2, 3, 4]), k),
            (spec(&[1, 2, 3, 4]), v),
        ];

        let (_, reference) = run(
            &Kernel::Attention {
                kernel: AttentionKernel::Reference,
                scale: 0.5,
            },
            &inputs,
        );
        let (_, flash) = run(
            &Kernel::Attention {
                kernel: AttentionKernel::Flash,
                scale: 0.5,
            },
            &inputs,
        );
        for (a, b) in reference.iter().zip(&flash) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pointwise_matches_chain() {
        let data = vec![-1.5, -0.2, 0.0, 0.7, 2.3, 4.0];
        let input = TensorSpec::new(vec![6], DType::BF16);

        let (_, gelu) = run(&Kernel::Unary(UnaryOp::Gelu), &[(input.clone(), data.clone())]);
        let (_, chained) = run(&Kernel::Scale { factor: 0.5 }, &[(input.clone(), gelu)]);

        let fused = Kernel::Pointwise {
            steps: vec![PointwiseStep::Unary(UnaryOp::Gelu), PointwiseStep::Scale(0.5)],
        };
        let (_, out) = run(&fused, &[(input, data)]);
        assert_eq!(out, chained);
        assert_eq!(fused.name(), "pointwise[gelu,scale]");
    }

    #[test]
    fn test_permute_concat_slice() {
        let (out_spec, out) = run(
            &Kernel::Permute { perm: vec![1, 0] },
            &[(spec(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])],
        );
        assert_eq!(out_spec.shape.dims(), &[3, 2]);
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let (out_spec, out) = run(
            &Kernel::Concat { axis: 1 },
            &[
                (spec(&[2, 1]), vec![1.0, 2.0]),
                (spec(&[2, 2]), vec![3.0, 4.0, 5.0, 6.0]),
            ],
        );
        assert_eq!(out_spec.shape.dims(), &[2, 3]);
        assert_eq!(out, vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

        let (_, out) = run(
            &Kernel::Slice {
                axis: 1,
                start: 1,
                len: 2,
            },
            &[(spec(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])],
        );
        assert_eq!(out, vec![2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let (_, out) = run(
            &Kernel::Softmax,
            &[(spec(&[2, 3]), vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0])],
        );
        let first: f32 = out[..3].iter().sum();
        let second: f32 = out[3..].iter().sum();
        assert!((first - 1.0).abs() < 1e-6);
        assert!((second - 1.0).abs() < 1e-6);
    }
}
