//! Building blocks shared by the reference stages

use common::error::{Error, Result};
use common::types::AttentionKernel;
use compiler::{OpBuilder, OpBuilderExt, ParameterStore, ValueId};

pub(crate) const NORM_EPS: f32 = 1e-6;

/// Query, key and value projections of `h` for the attention under `prefix`
///
/// Uses the fused `to_qkv` projection when present and slices its output.
pub(crate) fn qkv(
    ops: &mut dyn OpBuilder,
    parameters: &ParameterStore,
    h: ValueId,
    prefix: &str,
) -> Result<(ValueId, ValueId, ValueId)> {
    let fused = format!("{}.to_qkv.weight", prefix);
    match parameters.get(&fused) {
        Some(weight) => {
            let width = weight.spec.shape.dim(-1).unwrap_or(0) / 3;
            let projected = ops.linear(h, &fused, Some(&format!("{}.to_qkv.bias", prefix)))?;
            let axis = ops.spec(projected)?.shape.rank() - 1;
            let q = ops.slice(projected, axis, 0, width)?;
            let k = ops.slice(projected, axis, width, width)?;
            let v = ops.slice(projected, axis, 2 * width, width)?;
            Ok((q, k, v))
        }
        None => {
            let mut project = |name: &str| {
                ops.linear(
                    h,
                    &format!("{}.{}.weight", prefix, name),
                    Some(&format!("{}.{}.bias", prefix, name)),
                )
            };
            let q = project("to_q")?;
            let k = project("to_k")?;
            let v = project("to_v")?;
            Ok((q, k, v))
        }
    }
}

/// Multi-head attention over `[batch, seq, dim]` projections
pub(crate) fn multi_head_attention(
    ops: &mut dyn OpBuilder,
    kernel: AttentionKernel,
    heads: usize,
    (q, k, v): (ValueId, ValueId, ValueId),
) -> Result<ValueId> {
    let dims = ops.spec(q)?.shape.dims().to_vec();
    let &[batch, seq, dim] = dims.as_slice() else {
        return Err(Error::InvalidArgument(format!(
            "attention expects [batch, seq, dim] projections, got {:?}",
            dims
        )));
    };
    if heads == 0 || dim % heads != 0 {
        return Err(Error::InvalidArgument(format!(
            "{} features cannot be split into {} heads",
            dim, heads
        )));
    }

    let mut split = |x: ValueId| -> Result<ValueId> {
        let x = ops.reshape(x, &[batch, seq, heads, dim / heads])?;
        ops.permute(x, &[0, 2, 1, 3])
    };
    let (q, k, v) = (split(q)?, split(k)?, split(v)?);

    let attended = ops.attention(kernel, q, k, v)?;
    let merged = ops.permute(attended, &[0, 2, 1, 3])?;
    ops.reshape(merged, &[batch, seq, dim])
}
