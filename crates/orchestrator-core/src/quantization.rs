//! Precision reduction applied to stage parameters before export

use common::error::Result;
use common::types::DType;
use compiler::ParameterStore;
use device_runtime::precision::{round_to, F8E4M3_MAX};
use tracing::debug;

/// Rewrites the parameters of a stage to a lower precision
pub trait QuantizationPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Quantizes eligible parameters in place and returns how many changed
    fn apply(&self, stage: &str, parameters: &mut ParameterStore) -> Result<usize>;
}

/// Row-wise scaled 8-bit float weights
///
/// Each row of an eligible weight matrix is scaled so its largest magnitude
/// maps to the top of the f8e4m3 range, rounded onto the f8e4m3 grid and
/// scaled back. Storage keeps its declared dtype, so the compiled program
/// needs no 8-bit kernels.
#[derive(Debug, Clone)]
pub struct Float8RowwisePolicy {
    /// Smallest dimension a weight needs to be eligible
    pub min_dim: usize,
}

impl Default for Float8RowwisePolicy {
    fn default() -> Self {
        Self { min_dim: 16 }
    }
}

impl Float8RowwisePolicy {
    fn eligible(&self, name: &str, dims: &[usize], dtype: DType) -> bool {
        name.ends_with(".weight")
            && dims.len() == 2
            && dims.iter().all(|&d| d >= self.min_dim)
            && !dtype.is_float8()
    }
}

/// Rounds `row` onto a scaled f8e4m3 grid
fn quantize_row(row: &mut [f32]) {
    let amax = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if amax == 0.0 || !amax.is_finite() {
        return;
    }
    let scale = amax / F8E4M3_MAX;
    for v in row.iter_mut() {
        *v = round_to(DType::F8E4M3, *v / scale) * scale;
    }
}

impl QuantizationPolicy for Float8RowwisePolicy {
    fn name(&self) -> &str {
        "float8_rowwise"
    }

    fn apply(&self, stage: &str, parameters: &mut ParameterStore) -> Result<usize> {
        let mut quantized = 0;
        for (name, tensor) in parameters.iter_mut() {
            let dims = tensor.spec.shape.dims().to_vec();
            if !self.eligible(name, &dims, tensor.spec.dtype) {
                continue;
            }
            let cols = dims[1];
            for row in tensor.data.chunks_mut(cols) {
                quantize_row(row);
            }
            quantized += 1;
        }
        debug!("Quantized {} weights of {} to float8 rows", quantized, stage);
        Ok(quantized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::HostTensor;
    use device_runtime::TensorSpec;

    fn tensor(dims: Vec<usize>) -> HostTensor {
        let numel: usize = dims.iter().product();
        let data = (0..numel).map(|i| ((i * 37 % 101) as f32 - 50.0) / 7.0).collect();
        HostTensor::new(TensorSpec::new(dims, DType::F32), data).unwrap()
    }

    #[test]
    fn test_only_large_matrices_are_quantized() {
        let mut parameters = ParameterStore::new();
        parameters.insert("attn.to_qkv.weight", tensor(vec![32, 96]));
        parameters.insert("attn.to_qkv.bias", tensor(vec![96]));
        parameters.insert("time_embed.weight", tensor(vec![1, 32]));
        let original = parameters.clone();

        let policy = Float8RowwisePolicy::default();
        assert_eq!(policy.apply("transformer", &mut parameters).unwrap(), 1);
        assert_eq!(parameters.get("attn.to_qkv.bias"), original.get("attn.to_qkv.bias"));
        assert_eq!(parameters.get("time_embed.weight"), original.get("time_embed.weight"));

        let before = original.get("attn.to_qkv.weight").unwrap();
        let after = parameters.get("attn.to_qkv.weight").unwrap();
        assert_ne!(before.data, after.data);
        assert_eq!(before.spec, after.spec);

        for (b, a) in before.data.chunks(96).zip(after.data.chunks(96)) {
            let amax = b.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let scale = amax / F8E4M3_MAX;
            for (x, y) in b.iter().zip(a) {
                let q = y / scale;
                assert!((round_to(DType::F8E4M3, q) - q).abs() < 1e-3);
                assert!((x - y).abs() <= amax / 8.0);
            }
        }
    }

    #[test]
    fn test_zero_rows_are_untouched() {
        let mut row = vec![0.0; 4];
        quantize_row(&mut row);
        assert_eq!(row, vec![0.0; 4]);
    }
}
