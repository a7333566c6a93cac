//! Fastpath
//!
//! Wires the reference pipeline, the orchestrator and the configuration
//! together for the `fastpath` binary.

pub mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use common::types::PipelineVariant;
use common::utils::measure_execution_time;
use compiler::{Computation, EagerExecutable};
use device_runtime::{CallArgs, Device, Executable, Stream};
use orchestrator_core::{OptimizedPipeline, Orchestrator, Pipeline, Stage};
use pipeline_config::Settings;
use reference_models::{
    decoder_args, transformer_args, DecoderConfig, DecoderStage, TransformerConfig, TransformerStage,
    EXAMPLE_DTYPE,
};

const TRANSFORMER_SEED: u64 = 0;
const DECODER_SEED: u64 = 1;

fn reference_stages(
    device: &Arc<Device>,
    variant: PipelineVariant,
) -> Result<Vec<(Box<dyn Computation>, CallArgs)>> {
    let transformer: Box<dyn Computation> = Box::new(TransformerStage::new(
        TransformerConfig::for_variant(variant),
        TRANSFORMER_SEED,
    )?);
    let decoder: Box<dyn Computation> = Box::new(DecoderStage::new(DecoderConfig::default(), DECODER_SEED)?);
    Ok(vec![
        (transformer, transformer_args(device, variant, EXAMPLE_DTYPE)?),
        (decoder, decoder_args(device, variant, EXAMPLE_DTYPE)?),
    ])
}

/// Transformer and decoder stages of `variant` with their example arguments
pub fn reference_pipeline(device: &Arc<Device>, variant: PipelineVariant) -> Result<Pipeline> {
    let pipeline = reference_stages(device, variant)?
        .into_iter()
        .fold(Pipeline::new(), |pipeline, (computation, args)| {
            pipeline.with_stage(Stage::new(computation, args))
        });
    Ok(pipeline)
}

/// Latency of one stage before and after optimization
#[derive(Debug, Clone)]
pub struct CallTiming {
    pub stage: String,
    /// First uncompiled call, including parameter upload
    pub eager_first: Duration,
    /// Mean uncompiled call afterwards
    pub eager_steady: Duration,
    /// Mean call through the optimized stage
    pub optimized_steady: Duration,
}

fn timed_call(executable: &dyn Executable, stream: &Stream, args: &CallArgs) -> Result<Duration> {
    let (_, elapsed) = measure_execution_time(|| {
        executable.call(stream, args)?;
        stream.synchronize()
    })?;
    Ok(elapsed)
}

fn mean_call(executable: &dyn Executable, stream: &Stream, args: &CallArgs, iterations: u32) -> Result<Duration> {
    let mut total = Duration::ZERO;
    for _ in 0..iterations {
        total += timed_call(executable, stream, args)?;
    }
    Ok(total / iterations.max(1))
}

/// Compares uncompiled reference stages against the optimized ones
pub fn measure_calls(
    device: &Arc<Device>,
    stream: &Stream,
    variant: PipelineVariant,
    optimized: &OptimizedPipeline,
    iterations: u32,
) -> Result<Vec<CallTiming>> {
    let mut timings = Vec::new();
    for (computation, args) in reference_stages(device, variant)? {
        let name = computation.name().to_string();
        let stage = optimized
            .stage(&name)
            .with_context(|| format!("optimized pipeline has no stage {}", name))?;

        let eager = EagerExecutable::new(Arc::from(computation));
        let eager_first = timed_call(&eager, stream, &args)?;
        let eager_steady = mean_call(&eager, stream, &args, iterations)?;
        let optimized_steady = mean_call(stage, stream, &args, iterations)?;

        timings.push(CallTiming {
            stage: name,
            eager_first,
            eager_steady,
            optimized_steady,
        });
    }
    Ok(timings)
}

/// Optimizes the reference pipeline configured by `settings`
pub async fn optimize_reference(
    settings: &Settings,
    device: &Arc<Device>,
    stream: &Stream,
) -> Result<OptimizedPipeline> {
    let orchestrator = Orchestrator::from_settings(device.clone(), settings)
        .context("failed to set up the orchestrator")?;
    let pipeline = reference_pipeline(device, settings.variant)?;
    info!("Optimizing the {} pipeline", settings.variant);
    let optimized = orchestrator
        .optimize(pipeline, stream)
        .await
        .context("pipeline optimization failed")?;
    Ok(optimized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::StageOutcome;

    #[tokio::test]
    async fn test_optimize_and_measure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_dir: dir.path().to_path_buf(),
            serialize: true,
            warmup_iterations: 2,
            ..Settings::default()
        };
        let device = Device::host();
        let stream = device.new_stream();

        let optimized = optimize_reference(&settings, &device, &stream).await.unwrap();
        assert_eq!(optimized.stages().len(), 2);
        assert!(optimized
            .stages()
            .iter()
            .all(|s| s.outcome() == StageOutcome::Compiled));

        let timings = measure_calls(&device, &stream, settings.variant, &optimized, 2).unwrap();
        let names: Vec<_> = timings.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(names, vec!["transformer", "decoder"]);
    }

    #[test]
    fn test_reference_pipeline_stages() {
        let device = Device::host();
        let pipeline = reference_pipeline(&device, PipelineVariant::ImageConditioned).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["transformer", "decoder"]);
    }
}
