//! Command line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use common::types::PipelineVariant;
use pipeline_config::Settings;

/// Ahead-of-time compiled, graph-captured pipeline execution
#[derive(Debug, Parser)]
#[command(name = "fastpath", version)]
#[command(about = "Optimize a pipeline into compiled, graph-captured stages", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Optimize the reference pipeline and report per-stage timings
    Optimize(OptimizeArgs),

    /// Print the manifest of a packaged artifact
    Inspect {
        /// Path to an `exported_<stage>.pkg` file
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },
}

/// Overrides of the configured settings
#[derive(Debug, Clone, Default, Args)]
pub struct OptimizeArgs {
    /// Directory holding packaged artifacts
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Build artifacts locally instead of loading existing ones
    #[arg(long)]
    pub serialize: bool,

    /// Skip precision reduction
    #[arg(long)]
    pub lossless: bool,

    /// Pipeline variant (text_to_image or image_conditioned)
    #[arg(long, value_name = "VARIANT")]
    pub variant: Option<PipelineVariant>,

    /// Warmup calls through the capture cache
    #[arg(long, value_name = "N")]
    pub iterations: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl OptimizeArgs {
    /// Applies the flags that were given on top of `settings`
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = dir.clone();
        }
        if self.serialize {
            settings.serialize = true;
        }
        if self.lossless {
            settings.lossy = false;
        }
        if let Some(variant) = self.variant {
            settings.variant = variant;
        }
        if let Some(iterations) = self.iterations {
            settings.warmup_iterations = iterations;
        }
    }
}
