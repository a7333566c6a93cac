//! Reference computations for Fastpath
//!
//! Two small stages shaped like an image generation pipeline: a
//! [`TransformerStage`] over joint text and image tokens and a
//! [`DecoderStage`] over spatial latents. Both support the structural
//! rewrites the orchestrator applies, and [`inputs`] provides example
//! arguments for each [`PipelineVariant`](common::types::PipelineVariant).

pub mod decoder;
pub mod inputs;
mod layers;
pub mod transformer;
mod weights;

pub use decoder::{DecoderConfig, DecoderStage};
pub use inputs::{decoder_args, transformer_args, ExampleShapes, EXAMPLE_DTYPE};
pub use transformer::{TransformerConfig, TransformerStage};

/// Stage name of the transformer
pub const TRANSFORMER: &str = "transformer";

/// Stage name of the decoder
pub const DECODER: &str = "decoder";
