//! Pipelines before and after optimization

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capture_cache::{CaptureStats, CapturingExecutor};
use common::error::{Error, Result};
use compiler::Computation;
use device_runtime::{CallArgs, Executable, Stream, Tensor};

use crate::metrics::{OptimizationReport, StageOutcome};
use crate::state::StageState;

/// One computation of a pipeline with representative arguments
pub struct Stage {
    name: String,
    computation: Box<dyn Computation>,
    example_args: CallArgs,
}

impl Stage {
    /// Stage named after its computation
    pub fn new(computation: Box<dyn Computation>, example_args: CallArgs) -> Self {
        Self {
            name: computation.name().to_string(),
            computation,
            example_args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn example_args(&self) -> &CallArgs {
        &self.example_args
    }

    pub(crate) fn into_parts(self) -> (String, Box<dyn Computation>, CallArgs) {
        (self.name, self.computation, self.example_args)
    }
}

/// Stages to optimize, in call order
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}

/// A stage after optimization
///
/// Keeps the calling contract of the stage it replaces.
pub struct OptimizedStage {
    pub(crate) name: String,
    pub(crate) outcome: StageOutcome,
    pub(crate) artifact: Option<PathBuf>,
    pub(crate) executable: Arc<dyn Executable>,
    pub(crate) capture: Option<Arc<CapturingExecutor>>,
}

impl OptimizedStage {
    pub fn outcome(&self) -> StageOutcome {
        self.outcome
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    /// Live capture counters; `None` for stages served uncompiled
    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.capture.as_ref().map(|c| c.stats())
    }

    pub fn capture(&self) -> Option<&Arc<CapturingExecutor>> {
        self.capture.as_ref()
    }
}

impl Executable for OptimizedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        self.executable.call(stream, args)
    }
}

/// Result of [`Orchestrator::optimize`](crate::Orchestrator::optimize)
pub struct OptimizedPipeline {
    pub(crate) stages: Vec<OptimizedStage>,
    pub(crate) report: OptimizationReport,
    pub(crate) states: BTreeMap<String, StageState>,
}

impl OptimizedPipeline {
    pub fn stage(&self, name: &str) -> Option<&OptimizedStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stages(&self) -> &[OptimizedStage] {
        &self.stages
    }

    pub fn report(&self) -> &OptimizationReport {
        &self.report
    }

    /// Final lifecycle state of a stage
    pub fn state(&self, name: &str) -> Option<&StageState> {
        self.states.get(name)
    }

    /// Calls the stage named `name`
    pub fn call(&self, name: &str, stream: &Stream, args: &CallArgs) -> Result<Vec<Tensor>> {
        let stage = self
            .stage(name)
            .ok_or_else(|| Error::NotFound(format!("stage {}", name)))?;
        stage.call(stream, args)
    }
}
