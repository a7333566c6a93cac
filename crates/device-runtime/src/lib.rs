//! Reference accelerator runtime for Fastpath
//!
//! The device modeled here behaves like a discrete accelerator: memory is a
//! set of identity-bearing buffers, work is launched asynchronously onto
//! streams, and a stream can be switched into capture mode where launches are
//! recorded into an execution graph instead of being run. Captured graphs are
//! instantiated once and replayed against the same buffers.

pub mod args;
pub mod buffer;
pub mod device;
pub mod executable;
pub mod graph;
pub mod kernels;
pub mod precision;
pub mod stream;
pub mod tensor;

// Re-export commonly used types
pub use args::{ArgKey, ArgValue, CallArgs};
pub use buffer::{BufferId, DeviceBuffer};
pub use device::{Device, DeviceCapabilities};
pub use executable::{Executable, FnExecutable};
pub use graph::{ExecGraph, GraphExec};
pub use kernels::{BinaryOp, Kernel, PointwiseStep, UnaryOp};
pub use stream::{Launch, ScheduleEntry, Stream};
pub use tensor::{Tensor, TensorSpec};
