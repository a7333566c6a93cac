//! Transformer stage
//!
//! Image tokens and text tokens are embedded into a shared width, joined into
//! one sequence and run through attention blocks conditioned on the timestep,
//! the pooled text embedding and, for image-conditioned pipelines, the
//! guidance scale. The output covers the image tokens only.

use common::error::Result;
use common::types::{AttentionKernel, MemoryLayout, PipelineVariant};
use compiler::{Computation, OpBuilder, OpBuilderExt, ParameterStore, StructuralRewrites, ValueId};
use device_runtime::UnaryOp;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layers::{multi_head_attention, qkv, NORM_EPS};
use crate::weights::{fuse_qkv, WeightInit};

/// Dimensions of the transformer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Channels of a packed latent token
    pub in_channels: usize,
    /// Width of the text encoder output
    pub context_dim: usize,
    /// Width of the pooled text embedding
    pub pooled_dim: usize,
    pub hidden: usize,
    pub heads: usize,
    pub mlp_ratio: usize,
    pub blocks: usize,
    /// Accept a `guidance` input
    pub guidance_embeds: bool,
}

impl TransformerConfig {
    pub fn for_variant(variant: PipelineVariant) -> Self {
        Self {
            in_channels: 16,
            context_dim: 24,
            pooled_dim: 12,
            hidden: 32,
            heads: 2,
            mlp_ratio: 2,
            blocks: 2,
            guidance_embeds: variant == PipelineVariant::ImageConditioned,
        }
    }
}

/// Transformer stage with fusable attention projections
pub struct TransformerStage {
    config: TransformerConfig,
    attention: AttentionKernel,
    parameters: ParameterStore,
}

impl TransformerStage {
    pub fn new(config: TransformerConfig, seed: u64) -> Result<Self> {
        let mut init = WeightInit::new(seed);
        let hidden = config.hidden;
        init.linear("x_embedder", config.in_channels, hidden)?;
        init.linear("context_embedder", config.context_dim, hidden)?;
        init.linear("time_embed", 1, hidden)?;
        init.linear("pooled_embed", config.pooled_dim, hidden)?;
        if config.guidance_embeds {
            init.linear("guidance_embed", 1, hidden)?;
        }
        for block in 0..config.blocks {
            let attn = format!("blocks.{}.attn", block);
            for name in ["to_q", "to_k", "to_v", "to_out"] {
                init.linear(&format!("{}.{}", attn, name), hidden, hidden)?;
            }
            let mlp = format!("blocks.{}.mlp", block);
            init.linear(&format!("{}.fc1", mlp), hidden, hidden * config.mlp_ratio)?;
            init.linear(&format!("{}.fc2", mlp), hidden * config.mlp_ratio, hidden)?;
        }
        init.linear("proj_out", hidden, config.in_channels)?;

        Ok(Self {
            config,
            attention: AttentionKernel::Reference,
            parameters: init.finish(),
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn attention_kernel(&self) -> AttentionKernel {
        self.attention
    }

    /// Sum of the conditioning embeddings as a `[hidden]` vector
    fn conditioning(&self, ops: &mut dyn OpBuilder) -> Result<ValueId> {
        let hidden = self.config.hidden;

        let timestep = ops.named_input("timestep")?;
        let timestep = ops.reshape(timestep, &[1, 1])?;
        let temb = ops.linear(timestep, "time_embed.weight", Some("time_embed.bias"))?;
        let temb = ops.unary(UnaryOp::Silu, temb)?;

        let pooled = ops.named_input("pooled_projections")?;
        let pooled = ops.linear(pooled, "pooled_embed.weight", Some("pooled_embed.bias"))?;
        let mut cond = ops.add(temb, pooled)?;

        if self.config.guidance_embeds {
            let guidance = ops.named_input("guidance")?;
            let guidance = ops.reshape(guidance, &[1, 1])?;
            let gemb = ops.linear(guidance, "guidance_embed.weight", Some("guidance_embed.bias"))?;
            cond = ops.add(cond, gemb)?;
        }
        ops.reshape(cond, &[hidden])
    }

    fn block(&self, ops: &mut dyn OpBuilder, x: ValueId, index: usize) -> Result<ValueId> {
        let attn = format!("blocks.{}.attn", index);
        let h = ops.rms_norm(x, NORM_EPS)?;
        let projections = qkv(ops, &self.parameters, h, &attn)?;
        let attended = multi_head_attention(ops, self.attention, self.config.heads, projections)?;
        let attended = ops.linear(
            attended,
            &format!("{}.to_out.weight", attn),
            Some(&format!("{}.to_out.bias", attn)),
        )?;
        let x = ops.add(x, attended)?;

        let mlp = format!("blocks.{}.mlp", index);
        let h = ops.rms_norm(x, NORM_EPS)?;
        let h = ops.linear(h, &format!("{}.fc1.weight", mlp), Some(&format!("{}.fc1.bias", mlp)))?;
        let h = ops.unary(UnaryOp::Gelu, h)?;
        let h = ops.linear(h, &format!("{}.fc2.weight", mlp), Some(&format!("{}.fc2.bias", mlp)))?;
        ops.add(x, h)
    }
}

impl Computation for TransformerStage {
    fn name(&self) -> &str {
        crate::TRANSFORMER
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>> {
        let img = ops.named_input("hidden_states")?;
        let txt = ops.named_input("encoder_hidden_states")?;
        let img = ops.linear(img, "x_embedder.weight", Some("x_embedder.bias"))?;
        let txt = ops.linear(txt, "context_embedder.weight", Some("context_embedder.bias"))?;
        let text_tokens = ops.spec(txt)?.shape.dim(1).unwrap_or(0);
        let image_tokens = ops.spec(img)?.shape.dim(1).unwrap_or(0);

        let mut x = ops.concat(txt, img, 1)?;
        let cond = self.conditioning(ops)?;
        x = ops.add(x, cond)?;

        for index in 0..self.config.blocks {
            x = self.block(ops, x, index)?;
        }

        let x = ops.rms_norm(x, NORM_EPS)?;
        let out = ops.linear(x, "proj_out.weight", Some("proj_out.bias"))?;
        let out = ops.slice(out, 1, text_tokens, image_tokens)?;
        Ok(vec![out])
    }

    fn rewrites(&mut self) -> Option<&mut dyn StructuralRewrites> {
        Some(self)
    }
}

impl StructuralRewrites for TransformerStage {
    fn fuse_projections(&mut self) -> Result<usize> {
        let mut fused = 0;
        for block in 0..self.config.blocks {
            if fuse_qkv(&mut self.parameters, &format!("blocks.{}.attn", block))? {
                fused += 1;
            }
        }
        debug!("Fused {} projection groups in {}", fused, crate::TRANSFORMER);
        Ok(fused)
    }

    fn set_attention_kernel(&mut self, kernel: AttentionKernel) -> bool {
        self.attention = kernel;
        true
    }

    /// Token sequences have no channel dimension to reorder
    fn set_memory_layout(&mut self, _layout: MemoryLayout) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::inputs::{transformer_args, EXAMPLE_DTYPE};
    use common::types::DType;
    use compiler::{EagerExecutable, Exporter};
    use device_runtime::{Device, Executable, Stream, Tensor};

    fn run(stage: TransformerStage, stream: &Stream, variant: PipelineVariant) -> Vec<f32> {
        let args = transformer_args(stream.device(), variant, DType::F32).unwrap();
        let outputs = EagerExecutable::new(Arc::new(stage)).call(stream, &args).unwrap();
        assert_eq!(outputs.len(), 1);
        stream.read(&outputs[0]).unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= tolerance, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_output_covers_image_tokens() {
        let device = Device::host();
        let stream = device.new_stream();
        for variant in [PipelineVariant::TextToImage, PipelineVariant::ImageConditioned] {
            let stage = TransformerStage::new(TransformerConfig::for_variant(variant), 0).unwrap();
            let args = transformer_args(&device, variant, EXAMPLE_DTYPE).unwrap();
            let outputs: Vec<Tensor> = EagerExecutable::new(Arc::new(stage)).call(&stream, &args).unwrap();
            let hidden_states = args.tensor(&"hidden_states".into()).unwrap();
            assert_eq!(outputs[0].shape(), hidden_states.shape());
        }
    }

    #[test]
    fn test_rewrites_keep_the_result() {
        let device = Device::host();
        let stream = device.new_stream();
        let variant = PipelineVariant::TextToImage;
        let config = TransformerConfig::for_variant(variant);

        let baseline = run(TransformerStage::new(config, 3).unwrap(), &stream, variant);

        let mut rewritten = TransformerStage::new(config, 3).unwrap();
        assert_eq!(rewritten.fuse_projections().unwrap(), 2);
        assert_eq!(rewritten.fuse_projections().unwrap(), 0);
        assert!(rewritten.set_attention_kernel(AttentionKernel::Flash));
        assert!(!rewritten.set_memory_layout(MemoryLayout::ChannelsLast));
        assert!(rewritten.parameters().contains("blocks.1.attn.to_qkv.weight"));
        assert!(!rewritten.parameters().contains("blocks.1.attn.to_q.weight"));

        let optimized = run(rewritten, &stream, variant);
        assert_close(&baseline, &optimized, 1e-3);
    }

    #[test]
    fn test_guidance_is_required_when_embedded() {
        let device = Device::host();
        let stage = TransformerStage::new(
            TransformerConfig::for_variant(PipelineVariant::ImageConditioned),
            0,
        )
        .unwrap();
        let args = transformer_args(&device, PipelineVariant::TextToImage, EXAMPLE_DTYPE).unwrap();
        let err = Exporter::new().export(&stage, &args).unwrap_err();
        assert!(err.is_build_time());
    }

    #[test]
    fn test_exports_without_data_dependence() {
        let device = Device::host();
        let variant = PipelineVariant::ImageConditioned;
        let mut stage = TransformerStage::new(TransformerConfig::for_variant(variant), 0).unwrap();
        stage.fuse_projections().unwrap();
        stage.set_attention_kernel(AttentionKernel::Flash);
        let args = transformer_args(&device, variant, EXAMPLE_DTYPE).unwrap();
        let trace = Exporter::new().export(&stage, &args).unwrap();
        assert_eq!(trace.inputs.len(), 5);
    }
}
