//! Program validation

use common::error::{Error, Result};
use device_runtime::TensorSpec;

use crate::program::{Program, Storage, ValueRef};

/// Checks that a program is internally consistent
///
/// Every operand must be defined before it is read, outputs must go to
/// planned slots without aliasing an operand, and each kernel's shape rule
/// must reproduce the recorded output spec.
pub fn validate_program(program: &Program) -> Result<()> {
    let mut written = vec![false; program.slots.len()];

    for (index, instruction) in program.instructions.iter().enumerate() {
        let context = |detail: String| {
            Error::Compile(format!(
                "{} instruction {} ({}): {}",
                program.name, index, instruction.kernel, detail
            ))
        };

        for operand in &instruction.operands {
            check_storage(program, operand).map_err(&context)?;
            if let Storage::Slot(s) = operand.storage {
                if !written[s] {
                    return Err(context(format!("reads slot {} before it is written", s)));
                }
            }
        }

        check_storage(program, &instruction.output).map_err(&context)?;
        let slot = match instruction.output.storage {
            Storage::Slot(s) => s,
            other => return Err(context(format!("writes read-only storage {}", other))),
        };
        if instruction
            .operands
            .iter()
            .any(|o| o.storage == instruction.output.storage)
        {
            return Err(context(format!("output slot {} aliases an operand", slot)));
        }

        let specs: Vec<TensorSpec> = instruction.operands.iter().map(|o| o.spec.clone()).collect();
        let expected = instruction
            .kernel
            .output_spec(&specs)
            .map_err(|e| context(e.to_string()))?;
        if expected != instruction.output.spec {
            return Err(context(format!(
                "shape rule gives {}, program records {}",
                expected, instruction.output.spec
            )));
        }
        written[slot] = true;
    }

    for output in &program.outputs {
        check_storage(program, output)
            .map_err(|detail| Error::Compile(format!("{} output: {}", program.name, detail)))?;
        if let Storage::Slot(s) = output.storage {
            if !written[s] {
                return Err(Error::Compile(format!(
                    "{} returns slot {} which is never written",
                    program.name, s
                )));
            }
        }
    }
    Ok(())
}

fn check_storage(program: &Program, value: &ValueRef) -> std::result::Result<(), String> {
    let (numel, dtype) = match value.storage {
        Storage::Input(i) => program
            .inputs
            .get(i)
            .map(|(_, s)| (s.numel(), s.dtype))
            .ok_or_else(|| format!("input {} out of range", i))?,
        Storage::Parameter(i) => program
            .parameters
            .get(i)
            .map(|(_, s)| (s.numel(), s.dtype))
            .ok_or_else(|| format!("parameter {} out of range", i))?,
        Storage::Slot(i) => program
            .slots
            .get(i)
            .map(|s| (s.numel, s.dtype))
            .ok_or_else(|| format!("slot {} out of range", i))?,
    };
    if numel != value.spec.numel() || dtype != value.spec.dtype {
        return Err(format!(
            "{} cannot be viewed as {}",
            value.storage, value.spec
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::DType;
    use device_runtime::{Kernel, UnaryOp};

    use crate::program::{Instruction, Slot};

    fn program() -> Program {
        let spec = TensorSpec::new(vec![4], DType::F32);
        Program {
            name: "test".to_string(),
            inputs: vec![("x".into(), spec.clone())],
            parameters: Vec::new(),
            slots: vec![Slot {
                numel: 4,
                dtype: DType::F32,
            }],
            instructions: vec![Instruction {
                kernel: Kernel::Unary(UnaryOp::Exp),
                operands: vec![ValueRef {
                    storage: Storage::Input(0),
                    spec: spec.clone(),
                }],
                output: ValueRef {
                    storage: Storage::Slot(0),
                    spec: spec.clone(),
                },
            }],
            outputs: vec![ValueRef {
                storage: Storage::Slot(0),
                spec,
            }],
            tuning: Vec::new(),
        }
    }

    #[test]
    fn test_valid_program() {
        assert!(validate_program(&program()).is_ok());
    }

    #[test]
    fn test_rejects_read_before_write() {
        let mut p = program();
        p.instructions[0].operands[0].storage = Storage::Slot(0);
        assert!(matches!(validate_program(&p), Err(Error::Compile(_))));
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let mut p = program();
        p.instructions[0].kernel = Kernel::Slice {
            axis: 0,
            start: 0,
            len: 2,
        };
        assert!(matches!(validate_program(&p), Err(Error::Compile(_))));
    }

    #[test]
    fn test_rejects_write_to_input() {
        let mut p = program();
        p.instructions[0].output.storage = Storage::Input(0);
        assert!(validate_program(&p).is_err());
    }
}
