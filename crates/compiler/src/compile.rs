//! Ahead-of-time compiler
//!
//! Turns an exported trace into a packaged artifact for one accelerator
//! target. Compilation is expensive (autotuning benchmarks every distinct
//! matmul problem on the device) and is meant to run once per artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::error::{Error, Result};
use common::types::{AcceleratorTarget, DType};
use common::utils::{format_bytes, format_duration};
use device_runtime::{CallArgs, Device, Kernel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::computation::Computation;
use crate::export::{ExportedTrace, Exporter};
use crate::ir::{Graph, NodeKind};
use crate::package::{self, Manifest, FORMAT_VERSION};
use crate::passes::{plan_buffers, validate_program, GraphPass, MatmulAutotuner, PointwiseFusionPass};
use crate::program::Program;

/// Lowest compute capability with 8-bit float kernels
pub const MIN_FLOAT8_CAPABILITY: (u32, u32) = (8, 9);

/// Compiler options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Target accelerator; defaults to the compiling device
    pub target: Option<AcceleratorTarget>,

    /// Benchmark candidate matmul tiles on the device
    pub max_autotune: bool,

    /// Fold chains of elementwise kernels
    pub fuse_pointwise: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: None,
            max_autotune: true,
            fuse_pointwise: true,
        }
    }
}

/// A package written by the compiler
#[derive(Debug, Clone)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub manifest: Manifest,
    pub size_bytes: u64,
}

/// Ahead-of-time compiler bound to a tuning device
pub struct AotCompiler {
    device: Arc<Device>,
    options: CompileOptions,
    autotuner: MatmulAutotuner,
}

impl AotCompiler {
    pub fn new(device: Arc<Device>, options: CompileOptions) -> Self {
        Self {
            autotuner: MatmulAutotuner::new(device.clone()),
            device,
            options,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Target the compiler emits code for
    pub fn target(&self) -> AcceleratorTarget {
        self.options
            .target
            .clone()
            .unwrap_or_else(|| self.device.capabilities().target())
    }

    /// Lowers a trace into a validated program
    ///
    /// Returns the program and the number of kernels removed by fusion.
    pub fn lower(&self, trace: &ExportedTrace) -> Result<(Program, usize)> {
        let target = self.target();
        check_lowering(&target, &trace.graph)?;

        let mut graph = trace.graph.clone();
        let kernels_before = graph.kernel_count();

        if self.options.fuse_pointwise {
            let pass = PointwiseFusionPass;
            let result = pass.run(&mut graph)?;
            debug!(
                "{} on {}: {} rewrites, {} nodes erased",
                pass.name(),
                trace.name,
                result.rewrites_applied,
                result.erased_nodes
            );
        }

        let tuning = if self.options.max_autotune {
            self.autotuner.tune(&mut graph)?
        } else {
            Vec::new()
        };

        let mut program = plan_buffers(&trace.name, &graph, &trace.inputs)?;
        program.tuning = tuning;
        validate_program(&program)?;

        let fused = kernels_before - graph.kernel_count();
        Ok((program, fused))
    }

    /// Compiles a trace into a package at `path`
    ///
    /// The trace is consumed.
    pub fn compile(&self, trace: ExportedTrace, path: &Path) -> Result<PackagedArtifact> {
        let start = Instant::now();
        info!("Compiling {} for {}", trace.name, self.target());

        let (program, fused) = self.lower(&trace)?;
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            name: trace.name.clone(),
            target: self.target(),
            created_at: Utc::now(),
            inputs: trace.inputs.clone(),
            outputs: program.outputs.iter().map(|o| o.spec.clone()).collect(),
            instructions: program.instructions.len(),
            parameters: program.parameters.len(),
            options: trace.options.clone(),
            fused_kernels: fused,
            autotuned: self.options.max_autotune,
            checksums: Default::default(),
        };

        let (manifest, size_bytes) = package::write_package(path, manifest, &program, &trace.parameters)?;
        info!(
            "Compiled {} into {} ({} launches, {}) in {}",
            trace.name,
            path.display(),
            manifest.instructions,
            format_bytes(size_bytes),
            format_duration(start.elapsed())
        );

        Ok(PackagedArtifact {
            path: path.to_path_buf(),
            manifest,
            size_bytes,
        })
    }

    /// Exports `computation` against `example_inputs` and compiles the trace
    pub fn export_and_compile(
        &self,
        computation: &dyn Computation,
        example_inputs: &CallArgs,
        artifact_path: &Path,
    ) -> Result<PackagedArtifact> {
        let trace = Exporter::new().export(computation, example_inputs)?;
        self.compile(trace, artifact_path)
    }
}

/// Rejects graphs the target cannot lower
fn check_lowering(target: &AcceleratorTarget, graph: &Graph) -> Result<()> {
    if target.capability >= MIN_FLOAT8_CAPABILITY {
        return Ok(());
    }
    for node in &graph.nodes {
        let float8 = node.spec.dtype == DType::F8E4M3
            || matches!(
                node.kind,
                NodeKind::Kernel {
                    kernel: Kernel::Cast {
                        dtype: DType::F8E4M3
                    },
                    ..
                }
            );
        if float8 {
            return Err(Error::Compile(format!(
                "target {} has no 8-bit float kernels (requires capability {}.{})",
                target, MIN_FLOAT8_CAPABILITY.0, MIN_FLOAT8_CAPABILITY.1
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eager::EagerExecutable;
    use crate::loader::Loader;
    use crate::testing::{example_args, Mlp};
    use device_runtime::Executable;

    #[test]
    fn test_compiled_artifact_matches_eager() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::host();
        let stream = device.new_stream();
        let mlp = Arc::new(Mlp::new(DType::F32));
        let args = example_args(&device, 3, DType::F32);

        let compiler = AotCompiler::new(device.clone(), CompileOptions::default());
        let path = dir.path().join("exported_mlp.pkg");
        let artifact = compiler
            .export_and_compile(mlp.as_ref(), &args, &path)
            .unwrap();
        assert!(path.exists());
        assert!(artifact.manifest.autotuned);
        assert_eq!(artifact.manifest.inputs.len(), 1);

        let loaded = Loader::new(device.clone()).load(&path).unwrap();
        let compiled = loaded.call(&stream, &args).unwrap();
        let eager = EagerExecutable::new(mlp).call(&stream, &args).unwrap();

        assert_eq!(compiled.len(), eager.len());
        for (c, e) in compiled.iter().zip(&eager) {
            assert_eq!(c.spec(), e.spec());
            assert_eq!(stream.read(c).unwrap(), stream.read(e).unwrap());
        }
    }

    #[test]
    fn test_fusion_reduces_launches() {
        let device = Device::host();
        let mlp = Mlp::new(DType::F32);
        let args = example_args(&device, 2, DType::F32);
        let trace = Exporter::new().export(&mlp, &args).unwrap();

        let unfused = AotCompiler::new(
            device.clone(),
            CompileOptions {
                fuse_pointwise: false,
                max_autotune: false,
                target: None,
            },
        );
        let fused = AotCompiler::new(device.clone(), CompileOptions::default());

        let (plain, removed_plain) = unfused.lower(&trace).unwrap();
        let (optimized, removed) = fused.lower(&trace).unwrap();
        assert_eq!(removed_plain, 0);
        assert!(removed > 0);
        assert_eq!(
            optimized.instructions.len() + removed,
            plain.instructions.len()
        );

        // Each compiled call issues exactly one launch per program instruction
        let stream = device.new_stream();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fused.pkg");
        fused.compile(trace, &path).unwrap();
        let loaded = Loader::new(device.clone()).load(&path).unwrap();
        loaded.call(&stream, &args).unwrap();
        assert_eq!(stream.launch_count(), optimized.instructions.len() as u64);
    }

    #[test]
    fn test_float8_rejected_on_older_target() {
        let device = Device::host();
        let mlp = Mlp::new(DType::F8E4M3);
        let args = example_args(&device, 2, DType::F32);
        let trace = Exporter::new().export(&mlp, &args).unwrap();

        let compiler = AotCompiler::new(
            device,
            CompileOptions {
                target: Some(AcceleratorTarget {
                    arch: "host-sim".to_string(),
                    capability: (8, 0),
                }),
                ..CompileOptions::default()
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let err = compiler
            .compile(trace, &dir.path().join("fp8.pkg"))
            .unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert!(err.is_build_time());
    }
}
