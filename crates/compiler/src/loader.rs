//! Artifact loader
//!
//! Deserializes a package into an executable for the current device. The
//! package must have been compiled for the device's architecture and must not
//! require a newer compute capability than the device offers. Weights are
//! uploaded on the first call.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::error::{Error, Result};
use common::types::Shape;
use device_runtime::{CallArgs, Device, Executable, Stream, Tensor};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::eager::numeric_option;
use crate::package::{self, Manifest};
use crate::passes::validate_program;
use crate::program::{Program, Storage, ValueRef};

/// Loads packaged artifacts onto a device
pub struct Loader {
    device: Arc<Device>,
}

impl Loader {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }

    /// Loads the package at `path`
    pub fn load(&self, path: &Path) -> Result<LoadedExecutable> {
        let package = package::read_package(path)?;

        // Check target compatibility before touching the program
        self.device
            .capabilities()
            .check_compatible(&package.manifest.target)
            .map_err(|reason| Error::ArtifactIncompatible {
                path: path.to_path_buf(),
                reason,
            })?;

        validate_program(&package.program).map_err(|e| Error::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!(
            "Loaded {} from {} ({} launches, compiled for {})",
            package.manifest.name,
            path.display(),
            package.program.instructions.len(),
            package.manifest.target
        );

        Ok(LoadedExecutable {
            name: format!("compiled:{}", package.manifest.name),
            path: path.to_path_buf(),
            device: self.device.clone(),
            manifest: package.manifest,
            program: package.program,
            host_weights: package.weights,
            weights: OnceCell::new(),
        })
    }
}

/// A compiled program ready to run on one device
pub struct LoadedExecutable {
    name: String,
    path: PathBuf,
    device: Arc<Device>,
    manifest: Manifest,
    program: Program,
    host_weights: Vec<Vec<f32>>,
    weights: OnceCell<Vec<Tensor>>,
}

impl LoadedExecutable {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn weights(&self, stream: &Stream) -> Result<&Vec<Tensor>> {
        self.weights.get_or_try_init(|| {
            debug!("Uploading {} parameters for {}", self.host_weights.len(), self.name);
            self.program
                .parameters
                .iter()
                .zip(&self.host_weights)
                .map(|((_, spec), data)| {
                    let tensor = self.device.allocate(spec.shape.clone(), spec.dtype)?;
                    stream.upload(&tensor, data)?;
                    Ok(tensor)
                })
                .collect()
        })
    }

    /// Rejects options whose value differs from the one compiled in
    fn check_options(&self, args: &CallArgs) -> Result<()> {
        for (name, compiled) in &self.manifest.options {
            let given = numeric_option(args, name)?;
            if given != *compiled {
                return Err(Error::InvalidArgument(format!(
                    "{} was compiled with {} = {}, got {}",
                    self.name,
                    name,
                    describe_option(*compiled),
                    describe_option(given)
                )));
            }
        }
        Ok(())
    }

    /// Binds call arguments to the program's input contract
    fn bind_inputs(&self, args: &CallArgs) -> Result<Vec<Tensor>> {
        let tensor_count = args.tensors().len();
        if tensor_count != self.program.inputs.len() {
            return Err(Error::InvalidArgument(format!(
                "{} takes {} tensor arguments, got {}",
                self.name,
                self.program.inputs.len(),
                tensor_count
            )));
        }

        self.program
            .inputs
            .iter()
            .map(|(key, spec)| {
                let tensor = args.tensor(key).ok_or_else(|| {
                    Error::InvalidArgument(format!("{} is missing tensor argument {}", self.name, key))
                })?;
                if &tensor.spec() != spec {
                    return Err(Error::InvalidArgument(format!(
                        "{} argument {} must be {}, got {}",
                        self.name,
                        key,
                        spec,
                        tensor.spec()
                    )));
                }
                if tensor.device_id() != self.device.id() {
                    return Err(Error::InvalidArgument(format!(
                        "{} argument {} lives on another device",
                        self.name, key
                    )));
                }
                Ok(tensor.clone())
            })
            .collect()
    }
}

fn describe_option(value: Option<f64>) -> String {
    value.map_or_else(|| "unset".to_string(), |v| v.to_string())
}

fn resolve(value: &ValueRef, inputs: &[Tensor], weights: &[Tensor], slots: &[Tensor]) -> Result<Tensor> {
    let base = match value.storage {
        Storage::Input(i) => &inputs[i],
        Storage::Parameter(i) => &weights[i],
        Storage::Slot(i) => &slots[i],
    };
    if base.shape() == &value.spec.shape {
        Ok(base.clone())
    } else {
        base.view(value.spec.shape.clone())
    }
}

impl Executable for LoadedExecutable {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        self.check_options(args)?;
        let inputs = self.bind_inputs(args)?;
        let weights = self.weights(stream)?;

        let slots = self
            .program
            .slots
            .iter()
            .map(|slot| self.device.allocate(Shape::new(vec![slot.numel]), slot.dtype))
            .collect::<Result<Vec<_>>>()?;

        for instruction in &self.program.instructions {
            let operands = instruction
                .operands
                .iter()
                .map(|o| resolve(o, &inputs, weights, &slots))
                .collect::<Result<Vec<_>>>()?;
            let output = resolve(&instruction.output, &inputs, weights, &slots)?;
            let refs: Vec<&Tensor> = operands.iter().collect();
            stream.launch(instruction.kernel.clone(), &refs, &output)?;
        }

        // Outputs backed by arguments, weights or an already returned slot are
        // copied so every returned tensor owns its storage
        let mut returned = HashSet::new();
        self.program
            .outputs
            .iter()
            .map(|o| {
                let tensor = resolve(o, &inputs, weights, &slots)?;
                match o.storage {
                    Storage::Slot(i) if returned.insert(i) => Ok(tensor),
                    _ => stream.clone_tensor(&tensor),
                }
            })
            .collect()
    }
}
