//! Callable units of device work

use std::sync::Arc;

use common::error::Result;

use crate::args::CallArgs;
use crate::stream::Stream;
use crate::tensor::Tensor;

/// Something that can be called with arguments on a stream
///
/// Every stage of the pipeline (eager computation, loaded artifact, capture
/// cache) exposes this same contract.
pub trait Executable: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Runs the executable and returns its output tensors
    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>>;
}

impl<T: Executable + ?Sized> Executable for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        (**self).call(stream, args)
    }
}

/// Executable backed by a closure
pub struct FnExecutable<F> {
    name: String,
    f: F,
}

impl<F> FnExecutable<F>
where
    F: Fn(&Stream, &CallArgs) -> Result<Vec<Tensor>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Executable for FnExecutable<F>
where
    F: Fn(&Stream, &CallArgs) -> Result<Vec<Tensor>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        (self.f)(stream, args)
    }
}
