//! Uncompiled execution of a computation, one kernel launch per operation

use std::collections::BTreeMap;
use std::sync::Arc;

use common::error::{Error, Result};
use common::types::Shape;
use device_runtime::{ArgKey, ArgValue, CallArgs, Executable, Kernel, Stream, Tensor, TensorSpec};
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::computation::{Computation, HostTensor, OpBuilder};
use crate::ir::ValueId;

/// Uploads host parameters to the stream's device
pub(crate) fn upload_parameters<'a, I>(stream: &Stream, parameters: I) -> Result<BTreeMap<String, Tensor>>
where
    I: IntoIterator<Item = (&'a String, &'a HostTensor)>,
{
    let mut uploaded = BTreeMap::new();
    for (name, host) in parameters {
        let tensor = stream
            .device()
            .allocate(host.spec.shape.clone(), host.spec.dtype)?;
        stream.upload(&tensor, &host.data)?;
        uploaded.insert(name.clone(), tensor);
    }
    Ok(uploaded)
}

/// Reads a numeric option out of the call arguments
pub(crate) fn numeric_option(args: &CallArgs, name: &str) -> Result<Option<f64>> {
    match args.get(&ArgKey::Named(name.to_string())) {
        None | Some(ArgValue::None) => Ok(None),
        Some(ArgValue::Bool(v)) => Ok(Some(if *v { 1.0 } else { 0.0 })),
        Some(value) => value.as_float().map(Some).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "option {} must be numeric, got {}",
                name,
                value.type_name()
            ))
        }),
    }
}

struct EagerBuilder<'a> {
    stream: &'a Stream,
    args: &'a CallArgs,
    parameters: &'a BTreeMap<String, Tensor>,
    values: Vec<Tensor>,
}

impl<'a> EagerBuilder<'a> {
    fn value(&self, id: ValueId) -> Result<&Tensor> {
        self.values
            .get(id.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown value {}", id)))
    }

    fn push(&mut self, tensor: Tensor) -> ValueId {
        self.values.push(tensor);
        ValueId(self.values.len() - 1)
    }
}

impl<'a> OpBuilder for EagerBuilder<'a> {
    fn input(&mut self, key: &ArgKey) -> Result<ValueId> {
        let tensor = self
            .args
            .tensor(key)
            .ok_or_else(|| Error::InvalidArgument(format!("missing tensor argument {}", key)))?
            .clone();
        Ok(self.push(tensor))
    }

    fn parameter(&mut self, name: &str) -> Result<ValueId> {
        let tensor = self
            .parameters
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("parameter {}", name)))?
            .clone();
        Ok(self.push(tensor))
    }

    fn apply(&mut self, kernel: Kernel, operands: &[ValueId]) -> Result<ValueId> {
        let inputs = operands
            .iter()
            .map(|id| self.value(*id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = inputs.iter().collect();
        let output = self.stream.launch_new(kernel, &refs)?;
        Ok(self.push(output))
    }

    fn view(&mut self, value: ValueId, shape: Shape) -> Result<ValueId> {
        let viewed = self.value(value)?.view(shape)?;
        Ok(self.push(viewed))
    }

    fn spec(&self, value: ValueId) -> Result<TensorSpec> {
        Ok(self.value(value)?.spec())
    }

    fn option(&mut self, name: &str) -> Result<Option<f64>> {
        numeric_option(self.args, name)
    }

    fn read_scalar(&mut self, value: ValueId) -> Result<f32> {
        let tensor = self.value(value)?.clone();
        self.stream.read_scalar(&tensor)
    }
}

/// Runs a computation operation by operation on the device
///
/// Parameters are uploaded on the first call.
pub struct EagerExecutable {
    name: String,
    computation: Arc<dyn Computation>,
    weights: OnceCell<BTreeMap<String, Tensor>>,
}

impl EagerExecutable {
    pub fn new(computation: Arc<dyn Computation>) -> Self {
        Self {
            name: format!("eager:{}", computation.name()),
            computation,
            weights: OnceCell::new(),
        }
    }

    pub fn computation(&self) -> &Arc<dyn Computation> {
        &self.computation
    }
}

impl Executable for EagerExecutable {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        let parameters = self.weights.get_or_try_init(|| {
            debug!(
                "Uploading {} parameters for {}",
                self.computation.parameters().len(),
                self.name
            );
            upload_parameters(stream, self.computation.parameters().iter())
        })?;

        let mut builder = EagerBuilder {
            stream,
            args,
            parameters,
            values: Vec::new(),
        };
        let outputs = self.computation.forward(&mut builder)?;
        outputs
            .into_iter()
            .map(|id| builder.value(id).cloned())
            .collect()
    }
}
