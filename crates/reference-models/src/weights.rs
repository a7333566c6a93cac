//! Seeded parameter initialization and projection fusion

use common::error::{Error, Result};
use common::types::DType;
use compiler::{HostTensor, ParameterStore};
use device_runtime::TensorSpec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fills a parameter store with uniform values scaled by fan-in
pub(crate) struct WeightInit {
    rng: StdRng,
    parameters: ParameterStore,
}

impl WeightInit {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            parameters: ParameterStore::new(),
        }
    }

    /// `[fan_in, fan_out]` weight plus a `[fan_out]` bias under `prefix`
    pub fn linear(&mut self, prefix: &str, fan_in: usize, fan_out: usize) -> Result<()> {
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = self.uniform(vec![fan_in, fan_out], bound)?;
        let bias = self.uniform(vec![fan_out], bound)?;
        self.parameters.insert(format!("{}.weight", prefix), weight);
        self.parameters.insert(format!("{}.bias", prefix), bias);
        Ok(())
    }

    fn uniform(&mut self, dims: Vec<usize>, bound: f32) -> Result<HostTensor> {
        let numel = dims.iter().product();
        let data = (0..numel)
            .map(|_| self.rng.gen_range(-bound..bound))
            .collect();
        HostTensor::new(TensorSpec::new(dims, DType::F32), data)
    }

    pub fn finish(self) -> ParameterStore {
        self.parameters
    }
}

/// Merges `{prefix}.to_q`, `to_k` and `to_v` into `{prefix}.to_qkv`
///
/// The fused weight is the column-wise concatenation of the three weights,
/// so slicing its output recovers the separate projections. Returns false if
/// the group is already fused.
pub(crate) fn fuse_qkv(parameters: &mut ParameterStore, prefix: &str) -> Result<bool> {
    let fused_weight = format!("{}.to_qkv.weight", prefix);
    if parameters.contains(&fused_weight) {
        return Ok(false);
    }

    let names = ["to_q", "to_k", "to_v"];
    let mut weights = Vec::with_capacity(names.len());
    let mut biases = Vec::with_capacity(names.len());
    for name in names {
        weights.push(take(parameters, &format!("{}.{}.weight", prefix, name))?);
        biases.push(take(parameters, &format!("{}.{}.bias", prefix, name))?);
    }

    let weight = concat_columns(&weights)?;
    let bias = concat_columns(&biases)?;
    for name in names {
        parameters.remove(&format!("{}.{}.weight", prefix, name));
        parameters.remove(&format!("{}.{}.bias", prefix, name));
    }
    parameters.insert(fused_weight, weight);
    parameters.insert(format!("{}.to_qkv.bias", prefix), bias);
    Ok(true)
}

fn take(parameters: &ParameterStore, name: &str) -> Result<HostTensor> {
    parameters
        .get(name)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("parameter {}", name)))
}

/// Concatenates matrices (or vectors) along their last dimension
fn concat_columns(parts: &[HostTensor]) -> Result<HostTensor> {
    let first = parts
        .first()
        .ok_or_else(|| Error::Internal("nothing to concatenate".to_string()))?;
    let rank = first.spec.shape.rank();
    let rows = if rank == 2 { first.spec.shape.dims()[0] } else { 1 };

    let mut widths = Vec::with_capacity(parts.len());
    for part in parts {
        let dims = part.spec.shape.dims();
        let same_rows = rank == 1 || dims[0] == rows;
        if dims.len() != rank || !same_rows || part.spec.dtype != first.spec.dtype {
            return Err(Error::InvalidArgument(format!(
                "cannot fuse {} with {}",
                first.spec, part.spec
            )));
        }
        widths.push(dims[rank - 1]);
    }

    let total: usize = widths.iter().sum();
    let mut data = Vec::with_capacity(rows * total);
    for row in 0..rows {
        for (part, width) in parts.iter().zip(&widths) {
            data.extend_from_slice(&part.data[row * width..(row + 1) * width]);
        }
    }

    let dims = if rank == 2 { vec![rows, total] } else { vec![total] };
    HostTensor::new(TensorSpec::new(dims, first.spec.dtype), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_concatenates_columns() {
        let mut parameters = ParameterStore::new();
        for (i, name) in ["to_q", "to_k", "to_v"].iter().enumerate() {
            let base = i as f32 * 10.0;
            let weight = HostTensor::new(
                TensorSpec::new(vec![2, 2], DType::F32),
                vec![base, base + 1.0, base + 2.0, base + 3.0],
            )
            .unwrap();
            let bias = HostTensor::new(TensorSpec::new(vec![2], DType::F32), vec![base; 2]).unwrap();
            parameters.insert(format!("attn.{}.weight", name), weight);
            parameters.insert(format!("attn.{}.bias", name), bias);
        }

        assert!(fuse_qkv(&mut parameters, "attn").unwrap());
        assert_eq!(parameters.len(), 2);
        let weight = parameters.get("attn.to_qkv.weight").unwrap();
        assert_eq!(weight.spec.shape.dims(), &[2, 6]);
        assert_eq!(
            weight.data,
            vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0, 2.0, 3.0, 12.0, 13.0, 22.0, 23.0]
        );
        let bias = parameters.get("attn.to_qkv.bias").unwrap();
        assert_eq!(bias.data, vec![0.0, 0.0, 10.0, 10.0, 20.0, 20.0]);

        assert!(!fuse_qkv(&mut parameters, "attn").unwrap());
    }

    #[test]
    fn test_fuse_missing_projection() {
        let mut init = WeightInit::new(0);
        init.linear("attn.to_q", 4, 4).unwrap();
        let mut parameters = init.finish();
        assert!(matches!(
            fuse_qkv(&mut parameters, "attn"),
            Err(Error::NotFound(_))
        ));
        assert!(parameters.contains("attn.to_q.weight"));
    }
}
