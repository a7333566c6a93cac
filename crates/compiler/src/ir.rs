//! Graph intermediate representation produced by tracing

use std::fmt;

use device_runtime::{ArgKey, Kernel, TensorSpec};
use serde::{Deserialize, Serialize};

/// Identifier of a value in a traced graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// How a value is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Tensor call argument
    Input { key: ArgKey },

    /// Named parameter of the computation
    Parameter { name: String },

    /// Result of a kernel
    Kernel { kernel: Kernel, operands: Vec<ValueId> },

    /// Same storage as `source` with a different shape
    View { source: ValueId },
}

/// A value and how it is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub spec: TensorSpec,
}

impl Node {
    /// Values this node reads
    pub fn operands(&self) -> Vec<ValueId> {
        match &self.kind {
            NodeKind::Kernel { operands, .. } => operands.clone(),
            NodeKind::View { source } => vec![*source],
            NodeKind::Input { .. } | NodeKind::Parameter { .. } => Vec::new(),
        }
    }
}

/// Topologically ordered dataflow graph
///
/// Nodes only refer to earlier nodes, so node order is a valid schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: NodeKind, spec: TensorSpec) -> ValueId {
        self.nodes.push(Node { kind, spec });
        ValueId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: ValueId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of kernel nodes
    pub fn kernel_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Kernel { .. }))
            .count()
    }

    /// Number of readers of every value, graph outputs included
    pub fn use_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nodes.len()];
        for node in &self.nodes {
            for operand in node.operands() {
                counts[operand.0] += 1;
            }
        }
        for output in &self.outputs {
            counts[output.0] += 1;
        }
        counts
    }

    /// Removes nodes that do not contribute to an output
    ///
    /// Returns the number of removed nodes.
    pub fn eliminate_dead_code(&mut self) -> usize {
        let mut live = vec![false; self.nodes.len()];
        for output in &self.outputs {
            live[output.0] = true;
        }
        for index in (0..self.nodes.len()).rev() {
            if live[index] {
                for operand in self.nodes[index].operands() {
                    live[operand.0] = true;
                }
            }
        }

        let removed = live.iter().filter(|l| !**l).count();
        if removed == 0 {
            return 0;
        }

        let mut remap = vec![None; self.nodes.len()];
        let mut nodes = Vec::with_capacity(self.nodes.len() - removed);
        for (index, node) in self.nodes.drain(..).enumerate() {
            if !live[index] {
                continue;
            }
            let mut node = node;
            match &mut node.kind {
                NodeKind::Kernel { operands, .. } => {
                    for operand in operands.iter_mut() {
                        *operand = remap[operand.0].unwrap_or(*operand);
                    }
                }
                NodeKind::View { source } => {
                    *source = remap[source.0].unwrap_or(*source);
                }
                _ => {}
            }
            remap[index] = Some(ValueId(nodes.len()));
            nodes.push(node);
        }
        self.nodes = nodes;
        for output in self.outputs.iter_mut() {
            *output = remap[output.0].unwrap_or(*output);
        }
        removed
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, node) in self.nodes.iter().enumerate() {
            let id = ValueId(index);
            match &node.kind {
                NodeKind::Input { key } => writeln!(f, "{} = input {} : {}", id, key, node.spec)?,
                NodeKind::Parameter { name } => {
                    writeln!(f, "{} = param {} : {}", id, name, node.spec)?
                }
                NodeKind::Kernel { kernel, operands } => {
                    let ops: Vec<String> = operands.iter().map(|o| o.to_string()).collect();
                    writeln!(f, "{} = {}({}) : {}", id, kernel, ops.join(", "), node.spec)?
                }
                NodeKind::View { source } => writeln!(f, "{} = view {} : {}", id, source, node.spec)?,
            }
        }
        let outs: Vec<String> = self.outputs.iter().map(|o| o.to_string()).collect();
        write!(f, "return {}", outs.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::DType;
    use device_runtime::UnaryOp;

    #[test]
    fn test_dead_code_elimination() {
        let spec = TensorSpec::new(vec![4], DType::F32);
        let mut graph = Graph::new();
        let x = graph.push(NodeKind::Input { key: "x".into() }, spec.clone());
        let dead = graph.push(
            NodeKind::Kernel {
                kernel: Kernel::Unary(UnaryOp::Exp),
                operands: vec![x],
            },
            spec.clone(),
        );
        let y = graph.push(
            NodeKind::Kernel {
                kernel: Kernel::Unary(UnaryOp::Relu),
                operands: vec![x],
            },
            spec.clone(),
        );
        graph.outputs = vec![y];
        assert_eq!(graph.use_counts(), vec![2, 0, 1]);
        let _ = dead;

        assert_eq!(graph.eliminate_dead_code(), 1);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.outputs, vec![ValueId(1)]);
        assert_eq!(graph.nodes[1].operands(), vec![ValueId(0)]);
        assert_eq!(graph.eliminate_dead_code(), 0);
    }
}
