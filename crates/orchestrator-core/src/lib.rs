//! Optimization orchestration for Fastpath
//!
//! Turns a [`Pipeline`] of computations into an [`OptimizedPipeline`] of
//! compiled, capture-wrapped stages with the same calling contract.

pub mod coordinator;
pub mod engine;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod quantization;
pub mod state;

// Re-export commonly used types
pub use coordinator::{remote_from_settings, ArtifactCoordinator, DEFAULT_REMOTE_BASE_URL};
pub use engine::{OptimizeOptions, Orchestrator};
pub use lifecycle::StageLifecycle;
pub use metrics::{OptimizationReport, RewriteSummary, StageOutcome, StageReport, StageTimings};
pub use pipeline::{OptimizedPipeline, OptimizedStage, Pipeline, Stage};
pub use quantization::{Float8RowwisePolicy, QuantizationPolicy};
pub use state::StageState;
