//! Exporter: traces a computation into a shape-specialized graph

use std::collections::BTreeMap;

use common::error::{Error, Result};
use common::types::Shape;
use device_runtime::{ArgKey, ArgValue, CallArgs, Kernel, TensorSpec};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::computation::{Computation, OpBuilder, ParameterStore};
use crate::ir::{Graph, NodeKind, ValueId};

/// A computation specialized to one set of example input shapes
///
/// Traces are immutable once exported and are consumed by the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedTrace {
    /// Name of the traced computation
    pub name: String,

    /// Dataflow graph
    pub graph: Graph,

    /// Tensor arguments in canonical order
    pub inputs: Vec<(ArgKey, TensorSpec)>,

    /// Parameters referenced by the graph
    pub parameters: ParameterStore,

    /// Options read while tracing and the values baked in; `None` records
    /// an option that was absent
    pub options: BTreeMap<String, Option<f64>>,
}

struct Tracer<'a> {
    args: &'a CallArgs,
    parameters: &'a ParameterStore,
    graph: Graph,
    inputs: BTreeMap<ArgKey, ValueId>,
    params: BTreeMap<String, ValueId>,
    options: BTreeMap<String, Option<f64>>,
}

impl<'a> Tracer<'a> {
    fn new(args: &'a CallArgs, parameters: &'a ParameterStore) -> Self {
        Self {
            args,
            parameters,
            graph: Graph::new(),
            inputs: BTreeMap::new(),
            params: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    fn node_spec(&self, id: ValueId) -> Result<TensorSpec> {
        self.graph
            .node(id)
            .map(|n| n.spec.clone())
            .ok_or_else(|| Error::Trace(format!("reference to undefined value {}", id)))
    }
}

impl<'a> OpBuilder for Tracer<'a> {
    fn input(&mut self, key: &ArgKey) -> Result<ValueId> {
        if let Some(id) = self.inputs.get(key) {
            return Ok(*id);
        }
        let value = self
            .args
            .get(key)
            .ok_or_else(|| Error::Trace(format!("argument {} is not among the example inputs", key)))?;
        let tensor = value.as_tensor().ok_or_else(|| {
            Error::Trace(format!(
                "argument {} is a {}, not a tensor",
                key,
                value.type_name()
            ))
        })?;
        let id = self
            .graph
            .push(NodeKind::Input { key: key.clone() }, tensor.spec());
        self.inputs.insert(key.clone(), id);
        Ok(id)
    }

    fn parameter(&mut self, name: &str) -> Result<ValueId> {
        if let Some(id) = self.params.get(name) {
            return Ok(*id);
        }
        let host = self
            .parameters
            .get(name)
            .ok_or_else(|| Error::Trace(format!("unknown parameter {}", name)))?;
        let id = self.graph.push(
            NodeKind::Parameter {
                name: name.to_string(),
            },
            host.spec.clone(),
        );
        self.params.insert(name.to_string(), id);
        Ok(id)
    }

    fn apply(&mut self, kernel: Kernel, operands: &[ValueId]) -> Result<ValueId> {
        let specs = operands
            .iter()
            .map(|id| self.node_spec(*id))
            .collect::<Result<Vec<_>>>()?;
        let spec = kernel
            .output_spec(&specs)
            .map_err(|e| Error::Trace(format!("{} at node {}: {}", kernel, self.graph.len(), e)))?;
        Ok(self.graph.push(
            NodeKind::Kernel {
                kernel,
                operands: operands.to_vec(),
            },
            spec,
        ))
    }

    fn view(&mut self, value: ValueId, shape: Shape) -> Result<ValueId> {
        let source = self.node_spec(value)?;
        if source.shape.numel() != shape.numel() || !shape.is_valid() {
            return Err(Error::Trace(format!(
                "cannot view {} as {}",
                source.shape, shape
            )));
        }
        Ok(self.graph.push(
            NodeKind::View { source: value },
            TensorSpec::new(shape, source.dtype),
        ))
    }

    fn spec(&self, value: ValueId) -> Result<TensorSpec> {
        self.node_spec(value)
    }

    fn option(&mut self, name: &str) -> Result<Option<f64>> {
        let value = match self.args.get(&ArgKey::Named(name.to_string())) {
            None | Some(ArgValue::None) => None,
            Some(ArgValue::Bool(v)) => Some(if *v { 1.0 } else { 0.0 }),
            Some(other) => Some(other.as_float().ok_or_else(|| {
                Error::Trace(format!(
                    "option {} of type {} cannot be baked into a trace",
                    name,
                    other.type_name()
                ))
            })?),
        };
        self.options.insert(name.to_string(), value);
        Ok(value)
    }

    fn read_scalar(&mut self, value: ValueId) -> Result<f32> {
        Err(Error::Trace(format!(
            "value-dependent control flow: {} is read on the host during tracing",
            value
        )))
    }
}

/// Traces computations into [`ExportedTrace`]s
#[derive(Debug, Default, Clone)]
pub struct Exporter;

impl Exporter {
    pub fn new() -> Self {
        Self
    }

    /// Traces `computation` against `example_inputs`
    ///
    /// The computation is traced twice and both graphs must agree. Values
    /// that do not feed an output are dropped.
    pub fn export(&self, computation: &dyn Computation, example_inputs: &CallArgs) -> Result<ExportedTrace> {
        if example_inputs.is_empty() {
            return Err(Error::Trace(format!(
                "cannot export {} without example inputs",
                computation.name()
            )));
        }
        if let Some((key, _)) = example_inputs.iter().find(|(_, v)| v.has_nested_tensor()) {
            return Err(Error::Trace(format!(
                "argument {} nests tensors inside a map",
                key
            )));
        }

        let first = Self::trace_once(computation, example_inputs)?;
        let second = Self::trace_once(computation, example_inputs)?;
        if first.graph != second.graph || first.options != second.options {
            return Err(Error::Trace(format!(
                "{} traced to different graphs on identical inputs",
                computation.name()
            )));
        }

        let mut tracer = first;
        if tracer.graph.outputs.is_empty() {
            return Err(Error::Trace(format!("{} produced no outputs", computation.name())));
        }
        let removed = tracer.graph.eliminate_dead_code();
        if removed > 0 {
            debug!("Removed {} dead nodes from {}", removed, computation.name());
        }

        let inputs: Vec<(ArgKey, TensorSpec)> = example_inputs
            .tensors()
            .into_iter()
            .map(|(key, tensor)| (key, tensor.spec()))
            .collect();

        let mut parameters = ParameterStore::new();
        for node in &tracer.graph.nodes {
            if let NodeKind::Parameter { name } = &node.kind {
                if let Some(host) = computation.parameters().get(name) {
                    parameters.insert(name.clone(), host.clone());
                }
            }
        }

        info!(
            "Exported {}: {} nodes, {} kernels, {} inputs, {} parameters",
            computation.name(),
            tracer.graph.len(),
            tracer.graph.kernel_count(),
            inputs.len(),
            parameters.len()
        );

        Ok(ExportedTrace {
            name: computation.name().to_string(),
            graph: tracer.graph,
            inputs,
            parameters,
            options: tracer.options,
        })
    }

    fn trace_once<'a>(computation: &'a dyn Computation, args: &'a CallArgs) -> Result<Tracer<'a>> {
        let mut tracer = Tracer::new(args, computation.parameters());
        let outputs = computation.forward(&mut tracer).map_err(|e| match e {
            Error::Trace(_) => e,
            other => Error::Trace(format!("tracing {} failed: {}", computation.name(), other)),
        })?;
        for output in &outputs {
            tracer.node_spec(*output)?;
        }
        tracer.graph.outputs = outputs;
        Ok(tracer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::computation::OpBuilderExt;
    use crate::testing::{example_args, Mlp};
    use common::types::DType;
    use device_runtime::{Device, UnaryOp};

    /// Applies `exp` to `x`, optionally branching on its first element
    struct Branchy {
        parameters: ParameterStore,
        host_read: bool,
        calls: AtomicUsize,
        vary: bool,
    }

    impl Branchy {
        fn new(host_read: bool, vary: bool) -> Self {
            Self {
                parameters: ParameterStore::new(),
                host_read,
                calls: AtomicUsize::new(0),
                vary,
            }
        }
    }

    impl Computation for Branchy {
        fn name(&self) -> &str {
            "branchy"
        }

        fn parameters(&self) -> &ParameterStore {
            &self.parameters
        }

        fn parameters_mut(&mut self) -> &mut ParameterStore {
            &mut self.parameters
        }

        fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>> {
            let x = ops.named_input("x")?;
            if self.host_read && ops.read_scalar(x)? > 0.0 {
                return Ok(vec![x]);
            }
            let mut y = ops.unary(UnaryOp::Exp, x)?;
            if self.vary && self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                y = ops.unary(UnaryOp::Neg, y)?;
            }
            // Dead branch
            ops.unary(UnaryOp::Tanh, x)?;
            Ok(vec![y])
        }
    }

    fn x_args() -> CallArgs {
        let device = Device::host();
        let x = device.full(Shape::new(vec![2, 2]), DType::F32, 1.0).unwrap();
        CallArgs::new().kwarg("x", x)
    }

    #[test]
    fn test_export_mlp() {
        let device = Device::host();
        let mlp = Mlp::new(DType::F32);
        let trace = Exporter::new()
            .export(&mlp, &example_args(&device, 2, DType::F32))
            .unwrap();

        assert_eq!(trace.name, "mlp");
        assert_eq!(trace.inputs.len(), 1);
        assert_eq!(trace.inputs[0].0, ArgKey::Named("x".to_string()));
        assert_eq!(trace.options.get("gain"), Some(&Some(2.0)));
        // Only referenced parameters are carried
        assert!(!trace.parameters.contains("unused"));
        assert_eq!(trace.parameters.len(), 3);
        assert_eq!(trace.graph.outputs.len(), 1);
    }

    #[test]
    fn test_host_read_is_a_trace_error() {
        let err = Exporter::new()
            .export(&Branchy::new(true, false), &x_args())
            .unwrap_err();
        assert!(matches!(err, Error::Trace(_)));
    }

    #[test]
    fn test_nondeterministic_forward_is_rejected() {
        let err = Exporter::new()
            .export(&Branchy::new(false, true), &x_args())
            .unwrap_err();
        assert!(matches!(err, Error::Trace(_)));
    }

    #[test]
    fn test_dead_values_are_dropped() {
        let trace = Exporter::new()
            .export(&Branchy::new(false, false), &x_args())
            .unwrap();
        assert_eq!(trace.graph.kernel_count(), 1);
    }

    #[test]
    fn test_invalid_example_inputs() {
        let exporter = Exporter::new();
        let mlp = Mlp::new(DType::F32);

        assert!(matches!(
            exporter.export(&mlp, &CallArgs::new()),
            Err(Error::Trace(_))
        ));
        assert!(matches!(
            exporter.export(&mlp, &CallArgs::new().kwarg("gain", 1.0)),
            Err(Error::Trace(_))
        ));

        let device = Device::host();
        let x = device.full(Shape::new(vec![2, 4]), DType::F32, 0.0).unwrap();
        let nested = BTreeMap::from([("x".to_string(), ArgValue::from(x))]);
        assert!(matches!(
            exporter.export(&mlp, &CallArgs::new().kwarg("extra", ArgValue::Map(nested))),
            Err(Error::Trace(_))
        ));
    }
}
