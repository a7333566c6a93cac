//! Pointwise fusion: folds chains of single-input elementwise kernels

use std::collections::HashSet;

use common::error::Result;
use device_runtime::Kernel;
use tracing::debug;

use super::{GraphPass, PassResult};
use crate::ir::{Graph, NodeKind};

/// Folds a unary/scale kernel into its producer when the producer is an
/// elementwise kernel with no other reader.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointwiseFusionPass;

impl GraphPass for PointwiseFusionPass {
    fn name(&self) -> &'static str {
        "pointwise-fusion"
    }

    fn run(&self, graph: &mut Graph) -> Result<PassResult> {
        let uses = graph.use_counts();
        let outputs: HashSet<usize> = graph.outputs.iter().map(|o| o.0).collect();
        let mut fused = 0;

        for index in 0..graph.nodes.len() {
            let (steps, producer) = match &graph.nodes[index].kind {
                NodeKind::Kernel { kernel, operands } if kernel.is_elementwise_unary() => {
                    match kernel.pointwise_steps() {
                        Some(steps) => (steps, operands[0]),
                        None => continue,
                    }
                }
                _ => continue,
            };
            if uses[producer.0] != 1 || outputs.contains(&producer.0) {
                continue;
            }

            let (mut chain, source) = match &graph.nodes[producer.0].kind {
                NodeKind::Kernel { kernel, operands } => match kernel.pointwise_steps() {
                    Some(chain) => (chain, operands[0]),
                    None => continue,
                },
                _ => continue,
            };
            if graph.nodes[producer.0].spec.dtype != graph.nodes[index].spec.dtype {
                continue;
            }

            chain.extend(steps);
            graph.nodes[index].kind = NodeKind::Kernel {
                kernel: Kernel::Pointwise { steps: chain },
                operands: vec![source],
            };
            fused += 1;
        }

        let erased = if fused > 0 {
            graph.eliminate_dead_code()
        } else {
            0
        };
        debug!("{}: fused {} kernels", self.name(), fused);

        Ok(PassResult {
            changed: fused > 0,
            rewrites_applied: fused,
            erased_nodes: erased,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::DType;
    use device_runtime::{PointwiseStep, TensorSpec, UnaryOp};

    use crate::ir::ValueId;

    fn unary(graph: &mut Graph, kernel: Kernel, operand: ValueId) -> ValueId {
        let spec = graph.nodes[operand.0].spec.clone();
        graph.push(
            NodeKind::Kernel {
                kernel,
                operands: vec![operand],
            },
            spec,
        )
    }

    #[test]
    fn test_chain_collapses_into_one_kernel() {
        let mut graph = Graph::new();
        let x = graph.push(
            NodeKind::Input { key: "x".into() },
            TensorSpec::new(vec![4], DType::F32),
        );
        let a = unary(&mut graph, Kernel::Unary(UnaryOp::Exp), x);
        let b = unary(&mut graph, Kernel::Scale { factor: 2.0 }, a);
        let c = unary(&mut graph, Kernel::Unary(UnaryOp::Relu), b);
        graph.outputs = vec![c];

        let result = PointwiseFusionPass.run(&mut graph).unwrap();
        assert_eq!(result.rewrites_applied, 2);
        assert_eq!(result.erased_nodes, 2);
        assert_eq!(graph.kernel_count(), 1);
        assert_eq!(
            graph.nodes[1].kind,
            NodeKind::Kernel {
                kernel: Kernel::Pointwise {
                    steps: vec![
                        PointwiseStep::Unary(UnaryOp::Exp),
                        PointwiseStep::Scale(2.0),
                        PointwiseStep::Unary(UnaryOp::Relu),
                    ]
                },
                operands: vec![ValueId(0)],
            }
        );
    }

    #[test]
    fn test_shared_producer_is_not_fused() {
        let mut graph = Graph::new();
        let x = graph.push(
            NodeKind::Input { key: "x".into() },
            TensorSpec::new(vec![4], DType::F32),
        );
        let a = unary(&mut graph, Kernel::Unary(UnaryOp::Exp), x);
        let b = unary(&mut graph, Kernel::Unary(UnaryOp::Neg), a);
        graph.outputs = vec![a, b];

        let result = PointwiseFusionPass.run(&mut graph).unwrap();
        assert!(!result.changed);
        assert_eq!(graph.kernel_count(), 2);
    }
}
