//! Recorded execution graphs

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::error::Result;

use crate::buffer::BufferId;
use crate::stream::{Launch, ScheduleEntry};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Launches recorded by a stream in capture mode
#[derive(Debug)]
pub struct ExecGraph {
    launches: Vec<Launch>,
}

impl ExecGraph {
    pub(crate) fn new(launches: Vec<Launch>) -> Self {
        Self { launches }
    }

    pub fn len(&self) -> usize {
        self.launches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launches.is_empty()
    }

    /// Buffer-independent schedule of the recorded launches
    pub fn schedule(&self) -> Vec<ScheduleEntry> {
        self.launches.iter().map(Launch::schedule_entry).collect()
    }

    /// Turns the recorded graph into a launchable executable
    pub fn instantiate(self) -> GraphExec {
        GraphExec {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            launches: self.launches.into(),
        }
    }
}

/// An instantiated graph
///
/// The graph keeps every buffer it touches alive. Replaying it reads and
/// writes exactly those buffers.
#[derive(Debug, Clone)]
pub struct GraphExec {
    id: u64,
    launches: Arc<[Launch]>,
}

impl GraphExec {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.launches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.launches.is_empty()
    }

    /// Identities of every buffer read or written by the graph
    pub fn buffers(&self) -> BTreeSet<BufferId> {
        self.launches
            .iter()
            .flat_map(|l| l.inputs.iter().chain(std::iter::once(&l.output)))
            .map(|t| t.buffer().id())
            .collect()
    }

    pub(crate) fn run(&self) -> Result<()> {
        for launch in self.launches.iter() {
            launch.execute()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::kernels::{Kernel, UnaryOp};
    use common::types::{DType, Shape};

    #[test]
    fn test_graph_buffers() {
        let device = Device::host();
        let stream = device.new_stream();
        let x = device.allocate(Shape::new(vec![4]), DType::F32).unwrap();

        stream.begin_capture().unwrap();
        let y = stream.launch_new(Kernel::Unary(UnaryOp::Exp), &[&x]).unwrap();
        let z = stream.launch_new(Kernel::Scale { factor: 2.0 }, &[&y]).unwrap();
        let graph = stream.end_capture().unwrap();

        let schedule = graph.schedule();
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule[0].kernel, Kernel::Unary(UnaryOp::Exp));

        let exec = graph.instantiate();
        let buffers = exec.buffers();
        assert_eq!(buffers.len(), 3);
        assert!(buffers.contains(&x.buffer().id()));
        assert!(buffers.contains(&z.buffer().id()));
    }
}
