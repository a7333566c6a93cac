//! Scheduled, buffer-planned programs

use std::fmt;

use common::types::DType;
use device_runtime::{ArgKey, Kernel, TensorSpec};
use serde::{Deserialize, Serialize};

/// Where a value lives at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Storage {
    /// Caller-provided tensor argument
    Input(usize),
    /// Uploaded parameter
    Parameter(usize),
    /// Planned intermediate buffer
    Slot(usize),
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Input(i) => write!(f, "in{}", i),
            Storage::Parameter(i) => write!(f, "p{}", i),
            Storage::Slot(i) => write!(f, "s{}", i),
        }
    }
}

/// A value as seen through its storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRef {
    pub storage: Storage,
    pub spec: TensorSpec,
}

/// A kernel launch of a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub kernel: Kernel,
    pub operands: Vec<ValueRef>,
    pub output: ValueRef,
}

/// Planned intermediate buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub numel: usize,
    pub dtype: DType,
}

/// Matmul tile chosen by autotuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    /// Problem description, e.g. `bf16[2, 64, 32] x bf16[32, 96]`
    pub problem: String,
    /// Candidate tile and its measured time in microseconds
    pub candidates: Vec<(usize, u64)>,
    pub chosen: usize,
}

/// Compiled form of a computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub inputs: Vec<(ArgKey, TensorSpec)>,
    pub parameters: Vec<(String, TensorSpec)>,
    pub slots: Vec<Slot>,
    pub instructions: Vec<Instruction>,
    pub outputs: Vec<ValueRef>,
    #[serde(default)]
    pub tuning: Vec<TuningRecord>,
}

impl Program {
    /// Total elements held by planned slots
    pub fn slot_elements(&self) -> usize {
        self.slots.iter().map(|s| s.numel).sum()
    }

    /// Total parameter elements
    pub fn parameter_elements(&self) -> usize {
        self.parameters.iter().map(|(_, s)| s.numel()).sum()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {}", self.name)?;
        for (index, instruction) in self.instructions.iter().enumerate() {
            let operands: Vec<String> = instruction
                .operands
                .iter()
                .map(|o| o.storage.to_string())
                .collect();
            writeln!(
                f,
                "  {:>3}: {} = {}({}) : {}",
                index,
                instruction.output.storage,
                instruction.kernel,
                operands.join(", "),
                instruction.output.spec
            )?;
        }
        let outputs: Vec<String> = self.outputs.iter().map(|o| o.storage.to_string()).collect();
        write!(f, "  return {}", outputs.join(", "))
    }
}
