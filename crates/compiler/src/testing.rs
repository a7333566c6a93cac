//! Small computations shared by the compiler tests

use std::sync::Arc;

use common::error::Result;
use common::types::{DType, Shape};
use device_runtime::{CallArgs, Device};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::computation::{Computation, HostTensor, OpBuilder, OpBuilderExt, ParameterStore};
use crate::ir::ValueId;
use device_runtime::{TensorSpec, UnaryOp};

pub const IN_FEATURES: usize = 4;
pub const HIDDEN: usize = 8;

/// Two-layer perceptron with a fusable activation chain
pub struct Mlp {
    dtype: DType,
    parameters: ParameterStore,
}

impl Mlp {
    pub fn new(dtype: DType) -> Self {
        let mut rng = StdRng::seed_from_u64(7);
        let mut parameters = ParameterStore::new();
        let mut add = |name: &str, dims: Vec<usize>, dtype: DType| {
            let numel = dims.iter().product();
            let data = (0..numel).map(|_| rng.gen_range(-0.5..0.5)).collect();
            parameters.insert(
                name,
                HostTensor::new(TensorSpec::new(dims, dtype), data).unwrap(),
            );
        };
        add("fc1.weight", vec![IN_FEATURES, HIDDEN], dtype);
        add("fc1.bias", vec![HIDDEN], DType::F32);
        add("fc2.weight", vec![HIDDEN, IN_FEATURES], dtype);
        add("unused", vec![2], DType::F32);
        Self { dtype, parameters }
    }
}

impl Computation for Mlp {
    fn name(&self) -> &str {
        "mlp"
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>> {
        let mut x = ops.named_input("x")?;
        if self.dtype != DType::F32 {
            x = ops.cast(x, self.dtype)?;
        }
        let h = ops.linear(x, "fc1.weight", Some("fc1.bias"))?;
        let h = ops.unary(UnaryOp::Gelu, h)?;
        let h = ops.scale(h, 0.5)?;
        let h = ops.unary(UnaryOp::Tanh, h)?;
        let gain = ops.option("gain")?.unwrap_or(1.0);
        let y = ops.linear(h, "fc2.weight", None)?;
        let y = ops.scale(y, gain as f32)?;
        Ok(vec![y])
    }
}

/// `x: f32[batch, 4]` plus a `gain` option
pub fn example_args(device: &Arc<Device>, batch: usize, dtype: DType) -> CallArgs {
    let data = (0..batch * IN_FEATURES).map(|i| (i as f32 * 0.1).sin()).collect();
    let x = device
        .tensor_from_vec(Shape::new(vec![batch, IN_FEATURES]), dtype, data)
        .unwrap();
    CallArgs::new().kwarg("x", x).kwarg("gain", 2.0)
}
