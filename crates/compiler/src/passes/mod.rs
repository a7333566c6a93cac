//! Compiler passes
//!
//! Graph passes run on the traced IR before buffer planning; validation runs
//! on the planned program.

pub mod autotune;
pub mod fusion;
pub mod memory;
pub mod validate;

use common::error::Result;

use crate::ir::Graph;

pub use autotune::MatmulAutotuner;
pub use fusion::PointwiseFusionPass;
pub use memory::plan_buffers;
pub use validate::validate_program;

/// Result returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of rewrites applied.
    pub rewrites_applied: usize,
    /// Nodes removed by dead code elimination after rewriting.
    pub erased_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
        }
    }
}

/// Interface implemented by passes that rewrite a traced graph.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph) -> Result<PassResult>;
}
