//! Exporter, ahead-of-time compiler and loader
//!
//! A [`Computation`] is traced by the [`Exporter`] into an [`ExportedTrace`],
//! lowered by the [`AotCompiler`] into a packaged artifact, and brought back
//! as an [`Executable`](device_runtime::Executable) by the [`Loader`]. The
//! [`EagerExecutable`] runs the same computation without compilation.

pub mod compile;
pub mod computation;
pub mod eager;
pub mod export;
pub mod ir;
pub mod loader;
pub mod package;
pub mod passes;
pub mod program;

#[cfg(test)]
pub(crate) mod testing;

pub use compile::{AotCompiler, CompileOptions, PackagedArtifact, MIN_FLOAT8_CAPABILITY};
pub use computation::{Computation, HostTensor, OpBuilder, OpBuilderExt, ParameterStore, StructuralRewrites};
pub use eager::EagerExecutable;
pub use export::{ExportedTrace, Exporter};
pub use ir::{Graph, ValueId};
pub use loader::{LoadedExecutable, Loader};
pub use package::{read_manifest, Manifest, FORMAT_VERSION};
pub use program::Program;
