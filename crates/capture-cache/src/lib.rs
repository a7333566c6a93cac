//! Shape-keyed graph capture for Fastpath
//!
//! [`CapturingExecutor`] wraps any [`Executable`](device_runtime::Executable)
//! and keeps one captured device graph per [`ShapeSignature`].

pub mod executor;
pub mod signature;

pub use executor::{CaptureOptions, CaptureStats, CapturingExecutor};
pub use signature::{ShapeSignature, SignatureEntry};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::error::Result;
    use common::types::{DType, Shape};
    use compiler::{Computation, EagerExecutable, HostTensor, OpBuilder, OpBuilderExt, ParameterStore, ValueId};
    use device_runtime::{CallArgs, Device, Executable, TensorSpec, UnaryOp};

    use super::*;

    /// `silu(x) * w`, with `w` uploaded on first use
    struct Gate {
        parameters: ParameterStore,
    }

    impl Gate {
        fn new() -> Self {
            let mut parameters = ParameterStore::new();
            parameters.insert(
                "w",
                HostTensor::new(TensorSpec::new(vec![4], DType::F32), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            );
            Self { parameters }
        }
    }

    impl Computation for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn parameters(&self) -> &ParameterStore {
            &self.parameters
        }

        fn parameters_mut(&mut self) -> &mut ParameterStore {
            &mut self.parameters
        }

        fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>> {
            let x = ops.named_input("x")?;
            let w = ops.parameter("w")?;
            let h = ops.unary(UnaryOp::Silu, x)?;
            Ok(vec![ops.mul(h, w)?])
        }
    }

    #[test]
    fn test_capture_absorbs_first_use_uploads() {
        let device = Device::host();
        let stream = device.new_stream();
        let reference = EagerExecutable::new(Arc::new(Gate::new()));
        let eager: Arc<dyn Executable> = Arc::new(EagerExecutable::new(Arc::new(Gate::new())));
        let captured = CapturingExecutor::new(eager, CaptureOptions::default());

        let data: Vec<f32> = (0..8).map(|i| i as f32 - 4.0).collect();
        let x = device
            .tensor_from_vec(Shape::new(vec![2, 4]), DType::F32, data)
            .unwrap();
        let args = CallArgs::new().kwarg("x", x);

        let expected = stream.read(&reference.call(&stream, &args).unwrap()[0]).unwrap();
        for _ in 0..3 {
            let out = captured.call(&stream, &args).unwrap();
            assert_eq!(stream.read(&out[0]).unwrap(), expected);
        }

        let stats = captured.stats();
        assert_eq!(stats.captures, 1);
        assert_eq!(stats.replays, 2);
        assert!(stream.graph_launch_count() >= 3);
    }
}
