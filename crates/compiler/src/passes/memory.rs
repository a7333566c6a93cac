//! Buffer planning
//!
//! Intermediate values are assigned to slots by liveness. A slot is reused
//! once its current value has no remaining readers, but only for values of
//! the same element count and dtype. Views share the storage of their source
//! and keep it alive.

use std::collections::HashMap;

use common::error::{Error, Result};
use common::types::DType;
use device_runtime::{ArgKey, TensorSpec};

use crate::ir::{Graph, NodeKind};
use crate::program::{Instruction, Program, Slot, Storage, ValueRef};

/// Lowers a graph into a program with planned buffers
pub fn plan_buffers(name: &str, graph: &Graph, inputs: &[(ArgKey, TensorSpec)]) -> Result<Program> {
    let count = graph.nodes.len();

    // Storage root of every value
    let mut root = vec![0usize; count];
    for (index, node) in graph.nodes.iter().enumerate() {
        root[index] = match &node.kind {
            NodeKind::View { source } => root[source.0],
            _ => index,
        };
    }

    // Last instruction reading each root; outputs stay live to the end
    let mut last_use = vec![None; count];
    for (index, node) in graph.nodes.iter().enumerate() {
        for operand in node.operands() {
            last_use[root[operand.0]] = Some(index);
        }
    }
    for output in &graph.outputs {
        last_use[root[output.0]] = Some(usize::MAX);
    }

    let mut storage: Vec<Option<Storage>> = vec![None; count];
    let mut parameters: Vec<(String, TensorSpec)> = Vec::new();
    let mut slots: Vec<Slot> = Vec::new();
    let mut free: HashMap<(usize, DType), Vec<usize>> = HashMap::new();
    let mut instructions = Vec::new();

    for (index, node) in graph.nodes.iter().enumerate() {
        match &node.kind {
            NodeKind::Input { key } => {
                let position = inputs
                    .iter()
                    .position(|(k, _)| k == key)
                    .ok_or_else(|| Error::Compile(format!("input {} is not part of the contract", key)))?;
                storage[index] = Some(Storage::Input(position));
            }
            NodeKind::Parameter { name } => {
                storage[index] = Some(Storage::Parameter(parameters.len()));
                parameters.push((name.clone(), node.spec.clone()));
            }
            NodeKind::View { source } => {
                storage[index] = storage[source.0];
            }
            NodeKind::Kernel { kernel, operands } => {
                let operand_refs = operands
                    .iter()
                    .map(|o| value_ref(&storage, o.0, &graph.nodes[o.0].spec))
                    .collect::<Result<Vec<_>>>()?;

                // Allocate before releasing operands so output never aliases an input
                let key = (node.spec.numel(), node.spec.dtype);
                let slot = match free.get_mut(&key).and_then(Vec::pop) {
                    Some(slot) => slot,
                    None => {
                        slots.push(Slot {
                            numel: key.0,
                            dtype: key.1,
                        });
                        slots.len() - 1
                    }
                };
                storage[index] = Some(Storage::Slot(slot));

                instructions.push(Instruction {
                    kernel: kernel.clone(),
                    operands: operand_refs,
                    output: ValueRef {
                        storage: Storage::Slot(slot),
                        spec: node.spec.clone(),
                    },
                });

                let mut released: Vec<usize> = operands
                    .iter()
                    .map(|o| root[o.0])
                    .filter(|r| last_use[*r] == Some(index))
                    .collect();
                if last_use[index].is_none() {
                    released.push(index);
                }
                released.sort_unstable();
                released.dedup();
                for r in released {
                    if let Some(Storage::Slot(s)) = storage[r] {
                        let spec = &graph.nodes[r].spec;
                        free.entry((spec.numel(), spec.dtype)).or_default().push(s);
                    }
                }
            }
        }
    }

    let outputs = graph
        .outputs
        .iter()
        .map(|o| value_ref(&storage, o.0, &graph.nodes[o.0].spec))
        .collect::<Result<Vec<_>>>()?;

    Ok(Program {
        name: name.to_string(),
        inputs: inputs.to_vec(),
        parameters,
        slots,
        instructions,
        outputs,
        tuning: Vec::new(),
    })
}

fn value_ref(storage: &[Option<Storage>], index: usize, spec: &TensorSpec) -> Result<ValueRef> {
    let location = storage[index]
        .ok_or_else(|| Error::Compile(format!("value %{} used before definition", index)))?;
    Ok(ValueRef {
        storage: location,
        spec: spec.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_runtime::{Kernel, UnaryOp};

    #[test]
    fn test_slots_are_reused_after_last_use() {
        let spec = TensorSpec::new(vec![8], DType::F32);
        let mut graph = Graph::new();
        let x = graph.push(NodeKind::Input { key: "x".into() }, spec.clone());
        let mut last = x;
        for _ in 0..4 {
            last = graph.push(
                NodeKind::Kernel {
                    kernel: Kernel::Unary(UnaryOp::Exp),
                    operands: vec![last],
                },
                spec.clone(),
            );
        }
        graph.outputs = vec![last];

        let program = plan_buffers("chain", &graph, &[("x".into(), spec)]).unwrap();
        assert_eq!(program.instructions.len(), 4);
        assert_eq!(program.slots.len(), 2);
        for instruction in &program.instructions {
            assert!(!instruction.operands.contains(&instruction.output));
        }
        assert_eq!(program.outputs[0], program.instructions[3].output);
    }

    #[test]
    fn test_views_keep_source_alive() {
        let spec = TensorSpec::new(vec![2, 4], DType::F32);
        let mut graph = Graph::new();
        let x = graph.push(NodeKind::Input { key: "x".into() }, spec.clone());
        let a = graph.push(
            NodeKind::Kernel {
                kernel: Kernel::Unary(UnaryOp::Exp),
                operands: vec![x],
            },
            spec.clone(),
        );
        let v = graph.push(
            NodeKind::View { source: a },
            TensorSpec::new(vec![8], DType::F32),
        );
        let b = graph.push(
            NodeKind::Kernel {
                kernel: Kernel::Unary(UnaryOp::Neg),
                operands: vec![a],
            },
            spec.clone(),
        );
        graph.outputs = vec![v, b];

        let program = plan_buffers("views", &graph, &[("x".into(), spec)]).unwrap();
        assert_eq!(program.slots.len(), 2);
        assert_eq!(program.outputs[0].storage, program.instructions[0].output.storage);
        assert_ne!(program.outputs[0].storage, program.outputs[1].storage);
    }

    #[test]
    fn test_unknown_input_is_rejected() {
        let spec = TensorSpec::new(vec![2], DType::F32);
        let mut graph = Graph::new();
        let x = graph.push(NodeKind::Input { key: "x".into() }, spec.clone());
        graph.outputs = vec![x];
        assert!(matches!(
            plan_buffers("bad", &graph, &[("y".into(), spec)]),
            Err(Error::Compile(_))
        ));
    }
}
