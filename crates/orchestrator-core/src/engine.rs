//! Optimization engine
//!
//! [`Orchestrator::optimize`] takes every stage of a [`Pipeline`] through
//! structural rewrites, optional precision reduction, artifact build or load,
//! warmup and capture wrapping, and returns an [`OptimizedPipeline`] whose
//! stages keep their calling contract.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn, Instrument};

use artifact_store::{ArtifactSource, ArtifactStore, RemoteStore};
use capture_cache::{CaptureOptions, CapturingExecutor};
use common::error::{Error, Result};
use common::types::{AttentionKernel, MemoryLayout};
use compiler::{CompileOptions, Computation, EagerExecutable};
use device_runtime::{CallArgs, Device, Executable, Stream};
use pipeline_config::{BuildFailurePolicy, Settings};

use crate::coordinator::{remote_from_settings, ArtifactCoordinator};
use crate::lifecycle::StageLifecycle;
use crate::metrics::{OptimizationReport, RewriteSummary, StageOutcome, StageReport, StageTimings};
use crate::pipeline::{OptimizedPipeline, OptimizedStage, Pipeline, Stage};
use crate::quantization::{Float8RowwisePolicy, QuantizationPolicy};
use crate::state::StageState;

/// Options of [`Orchestrator::optimize`]
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeOptions {
    /// Directory holding `exported_<stage>.pkg` artifacts
    pub cache_dir: PathBuf,

    /// Apply the quantization policy before export
    pub lossy: bool,

    /// Build artifacts instead of loading existing ones
    pub serialize: bool,

    /// Calls through the capture cache after wrapping
    pub warmup_iterations: usize,

    /// Captured graphs kept per stage; 0 keeps every signature
    pub max_captured_graphs: usize,

    pub on_build_failure: BuildFailurePolicy,

    pub compile: CompileOptions,
}

impl OptimizeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cache_dir: settings.cache_dir.clone(),
            lossy: settings.lossy,
            serialize: settings.serialize,
            warmup_iterations: settings.warmup_iterations,
            max_captured_graphs: settings.max_captured_graphs,
            on_build_failure: settings.on_build_failure,
            compile: CompileOptions::default(),
        }
    }
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Stage served by an artifact, before wrapping
struct Provided {
    executable: Arc<dyn Executable>,
    outcome: StageOutcome,
    path: PathBuf,
}

/// Drives the optimization of pipelines on one device
pub struct Orchestrator {
    options: OptimizeOptions,
    artifacts: ArtifactCoordinator,
    quantization: Arc<dyn QuantizationPolicy>,
}

impl Orchestrator {
    /// Creates an orchestrator, creating the cache directory if needed
    pub fn new(device: Arc<Device>, options: OptimizeOptions) -> Result<Self> {
        let store = ArtifactStore::open(&options.cache_dir)?;
        let artifacts = ArtifactCoordinator::new(device, store, options.compile.clone());
        Ok(Self {
            options,
            artifacts,
            quantization: Arc::new(Float8RowwisePolicy::default()),
        })
    }

    /// Orchestrator configured from settings, including the remote store
    pub fn from_settings(device: Arc<Device>, settings: &Settings) -> Result<Self> {
        let mut orchestrator = Self::new(device, OptimizeOptions::from_settings(settings))?;
        if let Some((store_id, remote)) = remote_from_settings(&settings.remote)? {
            orchestrator = orchestrator.with_remote(store_id, remote);
        }
        Ok(orchestrator)
    }

    /// Fetches absent artifacts from `remote`
    pub fn with_remote(mut self, store_id: impl Into<String>, remote: Arc<dyn RemoteStore>) -> Self {
        self.artifacts = self.artifacts.with_remote(store_id, remote);
        self
    }

    /// Replaces the default [`Float8RowwisePolicy`]
    pub fn with_quantization(mut self, policy: Arc<dyn QuantizationPolicy>) -> Self {
        self.quantization = policy;
        self
    }

    pub fn options(&self) -> &OptimizeOptions {
        &self.options
    }

    pub fn store(&self) -> &ArtifactStore {
        self.artifacts.store()
    }

    /// Optimizes every stage of `pipeline`, warming each up on `stream`
    ///
    /// The pipeline is consumed. An [`OptimizedPipeline`] is a different type
    /// and cannot be optimized again. Under the abort policy the first stage
    /// error is returned; under the skip policy a stage whose artifact cannot
    /// be built, fetched or loaded is served uncompiled. A failed build never
    /// falls back to the remote store.
    pub async fn optimize(&self, pipeline: Pipeline, stream: &Stream) -> Result<OptimizedPipeline> {
        let started = Instant::now();
        let lifecycle = StageLifecycle::new();
        for name in pipeline.stage_names() {
            lifecycle.register(name)?;
        }

        info!(
            "Optimizing {} stages (serialize: {}, lossy: {}, cache: {})",
            pipeline.len(),
            self.options.serialize,
            self.options.lossy,
            self.store().root().display()
        );

        let mut stages = Vec::with_capacity(pipeline.len());
        let mut reports = Vec::with_capacity(pipeline.len());
        for stage in pipeline.into_stages() {
            let name = stage.name().to_string();
            let span = info_span!("stage", stage = %name);
            match self.optimize_stage(stage, stream, &lifecycle).instrument(span).await {
                Ok((optimized, report)) => {
                    stages.push(optimized);
                    reports.push(report);
                }
                Err(e) => {
                    error!("Optimization of {} failed: {}", name, e);
                    lifecycle.fail(&name, &e);
                    return Err(e);
                }
            }
        }

        let report = OptimizationReport {
            stages: reports,
            total: started.elapsed(),
        };
        info!("Pipeline optimized in {:?}", report.total);
        Ok(OptimizedPipeline {
            stages,
            report,
            states: lifecycle.snapshot(),
        })
    }

    async fn optimize_stage(
        &self,
        stage: Stage,
        stream: &Stream,
        lifecycle: &StageLifecycle,
    ) -> Result<(OptimizedStage, StageReport)> {
        let (name, mut computation, example_args) = stage.into_parts();
        let mut timings = StageTimings::default();

        let started = Instant::now();
        let rewrites = self.rewrite(&name, computation.as_mut())?;
        timings.rewrite = started.elapsed();
        lifecycle.transition(&name, StageState::Rewritten)?;
        let computation: Arc<dyn Computation> = Arc::from(computation);

        let provided = match self
            .provide(&name, &computation, &example_args, lifecycle, &mut timings)
            .await
        {
            Ok(provided) => provided,
            Err(e) if self.options.on_build_failure == BuildFailurePolicy::Skip => {
                warn!("Serving {} uncompiled: {}", name, e);
                let eager: Arc<dyn Executable> = Arc::new(EagerExecutable::new(computation));
                timings.warmup = warm_up(eager.as_ref(), stream, &example_args, 1)?;
                lifecycle.transition(&name, StageState::Ready)?;

                let report = StageReport {
                    stage: name.clone(),
                    outcome: StageOutcome::Skipped,
                    artifact: None,
                    artifact_bytes: None,
                    rewrites,
                    timings,
                    capture: None,
                    skip_reason: Some(e.to_string()),
                };
                let optimized = OptimizedStage {
                    name,
                    outcome: StageOutcome::Skipped,
                    artifact: None,
                    executable: eager,
                    capture: None,
                };
                return Ok((optimized, report));
            }
            Err(e) => return Err(e),
        };

        // First call absorbs lazy weight upload before anything is captured
        let started = Instant::now();
        warm_up(provided.executable.as_ref(), stream, &example_args, 1)?;

        let capture = Arc::new(CapturingExecutor::new(
            provided.executable,
            CaptureOptions {
                max_graphs: self.options.max_captured_graphs,
            },
        ));
        lifecycle.transition(&name, StageState::Wrapped)?;

        warm_up(capture.as_ref(), stream, &example_args, self.options.warmup_iterations)?;
        timings.warmup = started.elapsed();
        lifecycle.transition(&name, StageState::Ready)?;

        let report = StageReport {
            stage: name.clone(),
            outcome: provided.outcome,
            artifact: Some(provided.path.clone()),
            artifact_bytes: std::fs::metadata(&provided.path).ok().map(|m| m.len()),
            rewrites,
            timings,
            capture: Some(capture.stats()),
            skip_reason: None,
        };
        let optimized = OptimizedStage {
            name,
            outcome: provided.outcome,
            artifact: Some(provided.path),
            executable: capture.clone(),
            capture: Some(capture),
        };
        Ok((optimized, report))
    }

    /// Applies the structural rewrites and, if lossy, the quantization policy
    fn rewrite(&self, name: &str, computation: &mut dyn Computation) -> Result<RewriteSummary> {
        let mut summary = RewriteSummary::default();
        match computation.rewrites() {
            Some(rewrites) => {
                summary.fused_groups = rewrites.fuse_projections()?;
                if rewrites.set_attention_kernel(AttentionKernel::Flash) {
                    summary.attention_kernel = Some(AttentionKernel::Flash);
                }
                if rewrites.set_memory_layout(MemoryLayout::ChannelsLast) {
                    summary.memory_layout = Some(MemoryLayout::ChannelsLast);
                }
            }
            None => debug!("{} supports no structural rewrites", name),
        }

        if self.options.lossy {
            summary.quantized_tensors = self
                .quantization
                .apply(name, computation.parameters_mut())?;
            debug!(
                "Applied {} to {} parameters",
                self.quantization.name(),
                summary.quantized_tensors
            );
        }
        Ok(summary)
    }

    /// Builds or locates the stage artifact and loads it
    async fn provide(
        &self,
        name: &str,
        computation: &Arc<dyn Computation>,
        example_args: &CallArgs,
        lifecycle: &StageLifecycle,
        timings: &mut StageTimings,
    ) -> Result<Provided> {
        let started = Instant::now();
        let (path, outcome) = if self.options.serialize {
            let path = self
                .artifacts
                .build(name, computation.clone(), example_args.clone())
                .await?;
            lifecycle.transition(name, StageState::Built)?;
            (path, StageOutcome::Compiled)
        } else {
            let (path, source) = self.artifacts.locate(name).await?;
            lifecycle.transition(name, StageState::Fetched)?;
            let outcome = match source {
                ArtifactSource::Local => StageOutcome::Cached,
                ArtifactSource::Fetched => StageOutcome::Fetched,
            };
            (path, outcome)
        };
        timings.build = started.elapsed();

        let started = Instant::now();
        let executable = self.artifacts.load(&path)?;
        timings.load = started.elapsed();
        lifecycle.transition(name, StageState::Loaded)?;

        Ok(Provided {
            executable,
            outcome,
            path,
        })
    }
}

/// Calls `executable` `iterations` times and waits for the device
fn warm_up(
    executable: &dyn Executable,
    stream: &Stream,
    args: &CallArgs,
    iterations: usize,
) -> Result<Duration> {
    let started = Instant::now();
    for iteration in 0..iterations {
        executable.call(stream, args).map_err(|e| {
            debug!("Warmup {} of {} failed", iteration + 1, executable.name());
            e
        })?;
    }
    stream.synchronize()?;
    Ok(started.elapsed())
}
