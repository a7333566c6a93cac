//! Streams: ordered, asynchronous work queues on a device
//!
//! Eager launches are queued and executed when the queue is drained, either
//! on `synchronize`, on a host transfer, or when the queue grows past its
//! limit. In capture mode launches are recorded instead of queued, and host
//! transfers are rejected.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::device::Device;
use crate::graph::{ExecGraph, GraphExec};
use crate::kernels::Kernel;
use crate::precision;
use crate::tensor::{Tensor, TensorSpec};

/// Queue depth at which eager work is flushed
const DEFAULT_MAX_PENDING: usize = 64;

/// A kernel bound to concrete device buffers
#[derive(Debug, Clone)]
pub struct Launch {
    pub kernel: Kernel,
    pub inputs: Vec<Tensor>,
    pub output: Tensor,
}

impl Launch {
    /// Buffer-independent description of the launch
    pub fn schedule_entry(&self) -> ScheduleEntry {
        ScheduleEntry {
            kernel: self.kernel.clone(),
            inputs: self.inputs.iter().map(Tensor::spec).collect(),
            output: self.output.spec(),
        }
    }

    pub(crate) fn execute(&self) -> Result<()> {
        let specs: Vec<TensorSpec> = self.inputs.iter().map(Tensor::spec).collect();
        let guards: Vec<_> = self.inputs.iter().map(|t| t.buffer().read()).collect();
        let refs: Vec<(&TensorSpec, &[f32])> = specs
            .iter()
            .zip(guards.iter())
            .map(|(s, g)| (s, g.as_slice()))
            .collect();
        let mut out = self.output.buffer().write();
        self.kernel.run(&refs, &self.output.spec(), &mut out)
    }
}

/// Kernel and tensor specs of one launch, used to compare schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub kernel: Kernel,
    pub inputs: Vec<TensorSpec>,
    pub output: TensorSpec,
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(|s| s.to_string()).collect();
        write!(f, "{}({}) -> {}", self.kernel, inputs.join(", "), self.output)
    }
}

enum Mode {
    Eager,
    Capturing(Vec<Launch>),
}

enum Work {
    Launch(Launch),
    Graph(GraphExec),
}

struct StreamState {
    mode: Mode,
    pending: VecDeque<Work>,
    journal: Option<Vec<ScheduleEntry>>,
}

/// An ordered work queue on a device
pub struct Stream {
    device: Arc<Device>,
    state: Mutex<StreamState>,
    max_pending: usize,
    kernel_launches: AtomicU64,
    graph_launches: AtomicU64,
}

impl Stream {
    pub(crate) fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            state: Mutex::new(StreamState {
                mode: Mode::Eager,
                pending: VecDeque::new(),
                journal: None,
            }),
            max_pending: DEFAULT_MAX_PENDING,
            kernel_launches: AtomicU64::new(0),
            graph_launches: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Launches `kernel` writing into an existing output tensor
    pub fn launch(&self, kernel: Kernel, inputs: &[&Tensor], output: &Tensor) -> Result<()> {
        let specs: Vec<TensorSpec> = inputs.iter().map(|t| t.spec()).collect();
        let expected = kernel.output_spec(&specs)?;
        if output.spec() != expected {
            return Err(Error::InvalidArgument(format!(
                "{} produces {}, output tensor is {}",
                kernel,
                expected,
                output.spec()
            )));
        }
        for tensor in inputs.iter().copied().chain(std::iter::once(output)) {
            if tensor.device_id() != self.device.id() {
                return Err(Error::Device(format!(
                    "{} on device {} used on stream of device {}",
                    tensor.buffer().id(),
                    tensor.device_id(),
                    self.device.id()
                )));
            }
        }
        if inputs.iter().any(|t| t.same_storage(output)) {
            return Err(Error::InvalidArgument(format!(
                "{} output {} aliases one of its inputs",
                kernel,
                output.buffer().id()
            )));
        }

        let launch = Launch {
            kernel,
            inputs: inputs.iter().map(|t| (*t).clone()).collect(),
            output: output.clone(),
        };
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(journal) = state.journal.as_mut() {
            journal.push(launch.schedule_entry());
        }
        if let Mode::Capturing(recorded) = &mut state.mode {
            trace!("Recorded {}", launch.kernel);
            recorded.push(launch);
            return Ok(());
        }

        state.pending.push_back(Work::Launch(launch));
        if state.pending.len() >= self.max_pending {
            Self::drain(state)?;
        }
        Ok(())
    }

    /// Allocates the output and launches `kernel` into it
    pub fn launch_new(&self, kernel: Kernel, inputs: &[&Tensor]) -> Result<Tensor> {
        let specs: Vec<TensorSpec> = inputs.iter().map(|t| t.spec()).collect();
        let spec = kernel.output_spec(&specs)?;
        let output = self.device.allocate(spec.shape, spec.dtype)?;
        self.launch(kernel, inputs, &output)?;
        Ok(output)
    }

    /// Launches an instantiated graph
    pub fn launch_graph(&self, exec: &GraphExec) -> Result<()> {
        let mut state = self.state.lock();
        if let Mode::Capturing(_) = state.mode {
            return Err(Error::CaptureViolation(
                "cannot launch a graph while the stream is capturing".to_string(),
            ));
        }
        self.graph_launches.fetch_add(1, Ordering::Relaxed);
        state.pending.push_back(Work::Graph(exec.clone()));
        if state.pending.len() >= self.max_pending {
            Self::drain(&mut state)?;
        }
        Ok(())
    }

    /// Blocks until all queued work has executed
    pub fn synchronize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Mode::Capturing(_) = state.mode {
            return Err(Error::CaptureViolation(
                "cannot synchronize a capturing stream".to_string(),
            ));
        }
        Self::drain(&mut state)
    }

    fn drain(state: &mut StreamState) -> Result<()> {
        while let Some(work) = state.pending.pop_front() {
            match work {
                Work::Launch(launch) => launch.execute()?,
                Work::Graph(exec) => exec.run()?,
            }
        }
        Ok(())
    }

    /// Copies host data into a device tensor
    pub fn upload(&self, tensor: &Tensor, data: &[f32]) -> Result<()> {
        let mut state = self.state.lock();
        if let Mode::Capturing(_) = state.mode {
            return Err(Error::CaptureViolation(format!(
                "host-to-device copy into {} during capture",
                tensor.buffer().id()
            )));
        }
        if data.len() != tensor.numel() {
            return Err(Error::InvalidArgument(format!(
                "upload of {} elements into tensor of shape {}",
                data.len(),
                tensor.shape()
            )));
        }
        Self::drain(&mut state)?;

        let mut dst = tensor.buffer().write();
        dst.copy_from_slice(data);
        precision::round_slice(tensor.dtype(), &mut dst);
        Ok(())
    }

    /// Copies a device tensor back to the host
    pub fn read(&self, tensor: &Tensor) -> Result<Vec<f32>> {
        let mut state = self.state.lock();
        if let Mode::Capturing(_) = state.mode {
            return Err(Error::CaptureViolation(format!(
                "device-to-host copy from {} during capture",
                tensor.buffer().id()
            )));
        }
        Self::drain(&mut state)?;
        let data = tensor.buffer().read().clone();
        Ok(data)
    }

    /// Reads the first element of a tensor
    pub fn read_scalar(&self, tensor: &Tensor) -> Result<f32> {
        let data = self.read(tensor)?;
        data.first()
            .copied()
            .ok_or_else(|| Error::InvalidArgument("read_scalar on an empty tensor".to_string()))
    }

    /// Copies `src` into `dst` on the device
    pub fn copy(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.launch(Kernel::Copy, &[src], dst)
    }

    /// Allocates a new tensor holding a copy of `src`
    pub fn clone_tensor(&self, src: &Tensor) -> Result<Tensor> {
        self.launch_new(Kernel::Copy, &[src])
    }

    /// Fills a tensor with a constant
    pub fn fill(&self, tensor: &Tensor, value: f32) -> Result<()> {
        self.launch(
            Kernel::Fill {
                value,
                spec: tensor.spec(),
            },
            &[],
            tensor,
        )
    }

    /// Switches the stream into capture mode
    ///
    /// The stream must be idle.
    pub fn begin_capture(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Mode::Capturing(_) = state.mode {
            return Err(Error::Device("stream is already capturing".to_string()));
        }
        if !state.pending.is_empty() {
            return Err(Error::Device(format!(
                "cannot begin capture with {} pending operations",
                state.pending.len()
            )));
        }
        state.mode = Mode::Capturing(Vec::new());
        debug!("Stream entered capture mode");
        Ok(())
    }

    /// Leaves capture mode and returns the recorded graph
    pub fn end_capture(&self) -> Result<ExecGraph> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut state.mode, Mode::Eager) {
            Mode::Capturing(launches) => {
                debug!("Stream left capture mode with {} launches", launches.len());
                Ok(ExecGraph::new(launches))
            }
            Mode::Eager => Err(Error::Device("stream is not capturing".to_string())),
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state.lock().mode, Mode::Capturing(_))
    }

    /// Starts recording a schedule entry for every launch
    pub fn begin_journal(&self) {
        self.state.lock().journal = Some(Vec::new());
    }

    /// Stops recording and returns the journal
    pub fn end_journal(&self) -> Vec<ScheduleEntry> {
        self.state.lock().journal.take().unwrap_or_default()
    }

    /// Returns true if no work is queued
    pub fn is_idle(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Number of individual kernel launches issued from the host
    pub fn launch_count(&self) -> u64 {
        self.kernel_launches.load(Ordering::Relaxed)
    }

    /// Number of graph launches issued from the host
    pub fn graph_launch_count(&self) -> u64 {
        self.graph_launches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device.id())
            .field("kernel_launches", &self.launch_count())
            .field("graph_launches", &self.graph_launch_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::UnaryOp;
    use common::types::{DType, Shape};

    #[test]
    fn test_eager_work_is_deferred_until_sync() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device
            .tensor_from_vec(Shape::new(vec![3]), DType::F32, vec![1.0, 2.0, 3.0])
            .unwrap();

        let y = stream.launch_new(Kernel::Unary(UnaryOp::Square), &[&x]).unwrap();
        assert!(!stream.is_idle());

        assert_eq!(stream.read(&y).unwrap(), vec![1.0, 4.0, 9.0]);
        assert!(stream.is_idle());
    }

    #[test]
    fn test_capture_records_instead_of_running() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device
            .tensor_from_vec(Shape::new(vec![2]), DType::F32, vec![2.0, 3.0])
            .unwrap();
        let y = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();

        stream.begin_capture().unwrap();
        stream.launch(Kernel::Unary(UnaryOp::Square), &[&x], &y).unwrap();
        let graph = stream.end_capture().unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(stream.read(&y).unwrap(), vec![0.0, 0.0]);

        let exec = graph.instantiate();
        stream.launch_graph(&exec).unwrap();
        assert_eq!(stream.read(&y).unwrap(), vec![4.0, 9.0]);

        stream.upload(&x, &[5.0, 6.0]).unwrap();
        stream.launch_graph(&exec).unwrap();
        assert_eq!(stream.read(&y).unwrap(), vec![25.0, 36.0]);
        assert_eq!(stream.graph_launch_count(), 2);
    }

    #[test]
    fn test_host_transfers_rejected_during_capture() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();

        stream.begin_capture().unwrap();
        assert!(matches!(
            stream.upload(&x, &[1.0, 2.0]),
            Err(Error::CaptureViolation(_))
        ));
        assert!(matches!(stream.read(&x), Err(Error::CaptureViolation(_))));
        assert!(matches!(stream.synchronize(), Err(Error::CaptureViolation(_))));
        stream.end_capture().unwrap();
        assert!(!stream.is_capturing());
    }

    #[test]
    fn test_capture_requires_idle_stream() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        stream.fill(&x, 1.0).unwrap();

        assert!(matches!(stream.begin_capture(), Err(Error::Device(_))));
        stream.synchronize().unwrap();
        stream.begin_capture().unwrap();
        assert!(matches!(stream.begin_capture(), Err(Error::Device(_))));
        stream.end_capture().unwrap();
        assert!(stream.end_capture().is_err());
    }

    #[test]
    fn test_launch_validation() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        let wrong = device.allocate(Shape::new(vec![3]), DType::F32).unwrap();

        assert!(stream.launch(Kernel::Copy, &[&x], &wrong).is_err());
        assert!(stream.launch(Kernel::Unary(UnaryOp::Neg), &[&x], &x).is_err());

        let other = Device::host();
        let foreign = other.allocate(Shape::new(vec![2]), DType::F32).unwrap();
        assert!(matches!(
            stream.launch(Kernel::Copy, &[&foreign], &x),
            Err(Error::Device(_))
        ));
    }

    #[test]
    fn test_journal_records_schedule() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device.allocate(Shape::new(vec![2]), DType::F32).unwrap();

        stream.begin_journal();
        let y = stream.clone_tensor(&x).unwrap();
        stream.launch_new(Kernel::Scale { factor: 2.0 }, &[&y]).unwrap();
        let journal = stream.end_journal();

        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].kernel, Kernel::Copy);
        assert_eq!(journal[1].to_string(), "scale(f32[2]) -> f32[2]");
        assert!(stream.end_journal().is_empty());
    }
}
