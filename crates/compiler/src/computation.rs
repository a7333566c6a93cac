//! Computations and the builder interface they are expressed against
//!
//! A computation never touches the device directly. Its `forward` emits
//! operations into an [`OpBuilder`], which either records them into a graph
//! (tracing) or launches them on a stream (eager execution). Running the same
//! forward through both builders is what makes a traced artifact equivalent to
//! the eager computation it came from.

use std::collections::BTreeMap;

use common::error::{Error, Result};
use common::types::{AttentionKernel, DType, MemoryLayout, Shape};
use device_runtime::{ArgKey, BinaryOp, Kernel, TensorSpec, UnaryOp};
use serde::{Deserialize, Serialize};

use crate::ir::ValueId;

/// Sink for the operations of a computation
pub trait OpBuilder {
    /// Tensor call argument under `key`
    fn input(&mut self, key: &ArgKey) -> Result<ValueId>;

    /// Named parameter of the computation
    fn parameter(&mut self, name: &str) -> Result<ValueId>;

    /// Applies a kernel to operand values
    fn apply(&mut self, kernel: Kernel, operands: &[ValueId]) -> Result<ValueId>;

    /// Reinterprets a value with a new shape of the same element count
    fn view(&mut self, value: ValueId, shape: Shape) -> Result<ValueId>;

    /// Shape and dtype of a value
    fn spec(&self, value: ValueId) -> Result<TensorSpec>;

    /// Numeric non-tensor argument
    ///
    /// Options are fixed for the lifetime of a traced artifact.
    fn option(&mut self, name: &str) -> Result<Option<f64>>;

    /// Reads the first element of a value on the host
    ///
    /// Any decision taken on the result makes the computation data dependent.
    fn read_scalar(&mut self, value: ValueId) -> Result<f32>;
}

/// Convenience operations on top of [`OpBuilder`]
pub trait OpBuilderExt: OpBuilder {
    fn named_input(&mut self, name: &str) -> Result<ValueId> {
        self.input(&ArgKey::Named(name.to_string()))
    }

    fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.apply(Kernel::Binary(op), &[lhs, rhs])
    }

    fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    fn unary(&mut self, op: UnaryOp, x: ValueId) -> Result<ValueId> {
        self.apply(Kernel::Unary(op), &[x])
    }

    fn scale(&mut self, x: ValueId, factor: f32) -> Result<ValueId> {
        self.apply(Kernel::Scale { factor }, &[x])
    }

    fn matmul(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.apply(
            Kernel::Matmul {
                transpose_rhs: false,
                row_tile: None,
            },
            &[lhs, rhs],
        )
    }

    /// `x @ weight (+ bias)` with parameters looked up by name
    fn linear(&mut self, x: ValueId, weight: &str, bias: Option<&str>) -> Result<ValueId> {
        let w = self.parameter(weight)?;
        let y = self.matmul(x, w)?;
        match bias {
            Some(bias) => {
                let b = self.parameter(bias)?;
                self.add(y, b)
            }
            None => Ok(y),
        }
    }

    fn softmax(&mut self, x: ValueId) -> Result<ValueId> {
        self.apply(Kernel::Softmax, &[x])
    }

    fn rms_norm(&mut self, x: ValueId, eps: f32) -> Result<ValueId> {
        self.apply(Kernel::RmsNorm { eps }, &[x])
    }

    fn attention(
        &mut self,
        kernel: AttentionKernel,
        q: ValueId,
        k: ValueId,
        v: ValueId,
    ) -> Result<ValueId> {
        let head_dim = self.spec(q)?.shape.dim(-1).unwrap_or(1);
        let scale = 1.0 / (head_dim as f32).sqrt();
        self.apply(Kernel::Attention { kernel, scale }, &[q, k, v])
    }

    fn permute(&mut self, x: ValueId, perm: &[usize]) -> Result<ValueId> {
        self.apply(
            Kernel::Permute {
                perm: perm.to_vec(),
            },
            &[x],
        )
    }

    fn reshape(&mut self, x: ValueId, dims: &[usize]) -> Result<ValueId> {
        self.view(x, Shape::new(dims.to_vec()))
    }

    fn concat(&mut self, a: ValueId, b: ValueId, axis: usize) -> Result<ValueId> {
        self.apply(Kernel::Concat { axis }, &[a, b])
    }

    fn slice(&mut self, x: ValueId, axis: usize, start: usize, len: usize) -> Result<ValueId> {
        self.apply(Kernel::Slice { axis, start, len }, &[x])
    }

    fn cast(&mut self, x: ValueId, dtype: DType) -> Result<ValueId> {
        self.apply(Kernel::Cast { dtype }, &[x])
    }
}

impl<T: OpBuilder + ?Sized> OpBuilderExt for T {}

/// Host copy of a parameter tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub spec: TensorSpec,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(spec: TensorSpec, data: Vec<f32>) -> Result<Self> {
        if !spec.shape.is_valid() || data.len() != spec.numel() {
            return Err(Error::InvalidArgument(format!(
                "host tensor {} cannot hold {} elements",
                spec,
                data.len()
            )));
        }
        Ok(Self { spec, data })
    }

    pub fn size_in_bytes(&self) -> u64 {
        (self.spec.numel() * self.spec.dtype.size_in_bytes()) as u64
    }
}

/// Named parameters owned by a computation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    tensors: BTreeMap<String, HostTensor>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) -> Option<HostTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HostTensor> {
        self.tensors.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<HostTensor> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HostTensor)> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut HostTensor)> {
        self.tensors.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Storage size of all parameters at their declared dtypes
    pub fn total_bytes(&self) -> u64 {
        self.tensors.values().map(HostTensor::size_in_bytes).sum()
    }
}

/// A unit of work that can be traced or executed eagerly
pub trait Computation: Send + Sync {
    fn name(&self) -> &str;

    fn parameters(&self) -> &ParameterStore;

    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Emits the computation into `ops` and returns its outputs
    fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>>;

    /// Structural rewrites supported by this computation, if any
    fn rewrites(&mut self) -> Option<&mut dyn StructuralRewrites> {
        None
    }
}

/// Structure-changing rewrites that keep the calling contract
pub trait StructuralRewrites {
    /// Merges projection groups that share an input into one wider projection
    ///
    /// Returns the number of groups fused.
    fn fuse_projections(&mut self) -> Result<usize>;

    /// Selects the attention kernel; returns false if the computation has no attention
    fn set_attention_kernel(&mut self, kernel: AttentionKernel) -> bool;

    /// Selects the activation memory layout; returns false if not applicable
    fn set_memory_layout(&mut self, layout: MemoryLayout) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_store() {
        let mut store = ParameterStore::new();
        let w = HostTensor::new(TensorSpec::new(vec![2, 2], DType::BF16), vec![0.0; 4]).unwrap();
        store.insert("w", w);
        assert!(store.contains("w"));
        assert_eq!(store.total_bytes(), 8);
        assert!(HostTensor::new(TensorSpec::new(vec![3], DType::F32), vec![0.0; 2]).is_err());
    }
}
