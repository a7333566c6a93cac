//! Optimization reports
//!
//! Per-stage durations, outcomes and capture counters collected while a
//! pipeline is optimized.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture_cache::CaptureStats;
use common::error::Result;
use common::types::{AttentionKernel, MemoryLayout};
use common::utils::{format_bytes, format_duration};

/// How a stage came to be served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Exported and compiled in this run
    Compiled,
    /// Loaded from an artifact already in the cache directory
    Cached,
    /// Loaded from an artifact fetched from the remote store
    Fetched,
    /// Served uncompiled after its artifact could not be provided
    Skipped,
}

impl StageOutcome {
    /// Returns true if the stage runs a compiled artifact
    pub fn is_compiled(&self) -> bool {
        !matches!(self, StageOutcome::Skipped)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Compiled => write!(f, "compiled"),
            StageOutcome::Cached => write!(f, "cached"),
            StageOutcome::Fetched => write!(f, "fetched"),
            StageOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Rewrites applied to a stage before export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteSummary {
    /// Projection groups fused
    pub fused_groups: usize,

    /// Attention kernel selected, if the stage has attention
    pub attention_kernel: Option<AttentionKernel>,

    /// Memory layout selected, if the stage has image-like activations
    pub memory_layout: Option<MemoryLayout>,

    /// Parameters reduced in precision
    pub quantized_tensors: usize,
}

/// Wall-clock time spent per phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub rewrite: Duration,
    /// Export and compile, or fetch
    pub build: Duration,
    pub load: Duration,
    /// Pre-wrap warmup plus the warmup iterations
    pub warmup: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.rewrite + self.build + self.load + self.warmup
    }
}

/// Result of optimizing one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,

    /// Artifact the stage was loaded from
    pub artifact: Option<PathBuf>,

    /// Artifact size on disk
    pub artifact_bytes: Option<u64>,

    pub rewrites: RewriteSummary,
    pub timings: StageTimings,

    /// Capture counters after warmup
    pub capture: Option<CaptureStats>,

    /// Why the stage was skipped
    pub skip_reason: Option<String>,
}

/// Result of optimizing a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub stages: Vec<StageReport>,
    pub total: Duration,
}

impl OptimizationReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Stages served uncompiled
    pub fn skipped(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|s| s.outcome == StageOutcome::Skipped)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for OptimizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in &self.stages {
            write!(
                f,
                "{:<12} {:<9} rewrite {} build {} load {} warmup {}",
                stage.stage,
                stage.outcome.to_string(),
                format_duration(stage.timings.rewrite),
                format_duration(stage.timings.build),
                format_duration(stage.timings.load),
                format_duration(stage.timings.warmup),
            )?;
            if let Some(bytes) = stage.artifact_bytes {
                write!(f, " artifact {}", format_bytes(bytes))?;
            }
            if let Some(capture) = &stage.capture {
                write!(
                    f,
                    " graphs {} replays {}",
                    capture.entries, capture.replays
                )?;
            }
            if let Some(reason) = &stage.skip_reason {
                write!(f, " ({})", reason)?;
            }
            writeln!(f)?;
        }
        write!(f, "total {}", format_duration(self.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> OptimizationReport {
        OptimizationReport {
            stages: vec![
                StageReport {
                    stage: "transformer".to_string(),
                    outcome: StageOutcome::Compiled,
                    artifact: Some(PathBuf::from("/cache/exported_transformer.pkg")),
                    artifact_bytes: Some(4096),
                    rewrites: RewriteSummary {
                        fused_groups: 2,
                        attention_kernel: Some(AttentionKernel::Flash),
                        memory_layout: None,
                        quantized_tensors: 5,
                    },
                    timings: StageTimings {
                        build: Duration::from_millis(120),
                        ..StageTimings::default()
                    },
                    capture: Some(CaptureStats {
                        captures: 1,
                        replays: 3,
                        ..CaptureStats::default()
                    }),
                    skip_reason: None,
                },
                StageReport {
                    stage: "decoder".to_string(),
                    outcome: StageOutcome::Skipped,
                    artifact: None,
                    artifact_bytes: None,
                    rewrites: RewriteSummary::default(),
                    timings: StageTimings::default(),
                    capture: None,
                    skip_reason: Some("compile failed".to_string()),
                },
            ],
            total: Duration::from_millis(150),
        }
    }

    #[test]
    fn test_lookup_and_skipped() {
        let report = report();
        assert_eq!(report.stage("transformer").unwrap().rewrites.fused_groups, 2);
        assert!(report.stage("vae").is_none());
        let skipped: Vec<_> = report.skipped().map(|s| s.stage.as_str()).collect();
        assert_eq!(skipped, vec!["decoder"]);
        assert!(!StageOutcome::Skipped.is_compiled());
    }

    #[test]
    fn test_render() {
        let report = report();
        let text = report.to_string();
        assert!(text.contains("transformer"));
        assert!(text.contains("replays 3"));
        assert!(text.contains("(compile failed)"));

        let json = report.to_json().unwrap();
        let parsed: OptimizationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
        assert!(json.contains("\"outcome\": \"skipped\""));
    }
}
