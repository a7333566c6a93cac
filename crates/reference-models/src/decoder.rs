//! Decoder stage
//!
//! Maps `[batch, channels, height, width]` latents to an image of the same
//! spatial size with pointwise convolutions around a single-head spatial
//! attention block. The memory layout decides where channel-last copies are
//! made: the contiguous layout converts around every convolution, while the
//! channels-last layout converts once on entry and once on exit.

use common::error::{Error, Result};
use common::types::{AttentionKernel, MemoryLayout};
use compiler::{Computation, OpBuilder, OpBuilderExt, ParameterStore, StructuralRewrites, ValueId};
use device_runtime::{ArgKey, UnaryOp};
use serde::{Deserialize, Serialize};

use crate::layers::{multi_head_attention, qkv, NORM_EPS};
use crate::weights::{fuse_qkv, WeightInit};

const TO_CHANNELS_LAST: [usize; 4] = [0, 2, 3, 1];
const TO_CHANNELS_FIRST: [usize; 4] = [0, 3, 1, 2];

/// Dimensions of the decoder stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub latent_channels: usize,
    pub hidden: usize,
    pub out_channels: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 16,
            hidden: 16,
            out_channels: 3,
        }
    }
}

/// Decoder stage with a selectable memory layout
pub struct DecoderStage {
    config: DecoderConfig,
    layout: MemoryLayout,
    parameters: ParameterStore,
}

impl DecoderStage {
    pub fn new(config: DecoderConfig, seed: u64) -> Result<Self> {
        let mut init = WeightInit::new(seed);
        init.linear("conv_in", config.latent_channels, config.hidden)?;
        for name in ["to_q", "to_k", "to_v", "to_out"] {
            init.linear(&format!("mid.attn.{}", name), config.hidden, config.hidden)?;
        }
        init.linear("conv_out", config.hidden, config.out_channels)?;

        Ok(Self {
            config,
            layout: MemoryLayout::Contiguous,
            parameters: init.finish(),
        })
    }

    pub fn memory_layout(&self) -> MemoryLayout {
        self.layout
    }

    /// Pointwise convolution of an activation in the current layout
    fn conv(&self, ops: &mut dyn OpBuilder, x: ValueId, name: &str) -> Result<ValueId> {
        let weight = format!("{}.weight", name);
        let bias = format!("{}.bias", name);
        match self.layout {
            MemoryLayout::ChannelsLast => ops.linear(x, &weight, Some(&bias)),
            MemoryLayout::Contiguous => {
                let x = ops.permute(x, &TO_CHANNELS_LAST)?;
                let y = ops.linear(x, &weight, Some(&bias))?;
                ops.permute(y, &TO_CHANNELS_FIRST)
            }
        }
    }

    fn mid_attention(&self, ops: &mut dyn OpBuilder, x: ValueId, hw: (usize, usize)) -> Result<ValueId> {
        let channels_last = match self.layout {
            MemoryLayout::ChannelsLast => x,
            MemoryLayout::Contiguous => ops.permute(x, &TO_CHANNELS_LAST)?,
        };
        let batch = ops.spec(x)?.shape.dim(0).unwrap_or(1);
        let (height, width) = hw;
        let hidden = self.config.hidden;

        let tokens = ops.reshape(channels_last, &[batch, height * width, hidden])?;
        let h = ops.rms_norm(tokens, NORM_EPS)?;
        let projections = qkv(ops, &self.parameters, h, "mid.attn")?;
        let attended = multi_head_attention(ops, AttentionKernel::Reference, 1, projections)?;
        let attended = ops.linear(attended, "mid.attn.to_out.weight", Some("mid.attn.to_out.bias"))?;
        let tokens = ops.add(tokens, attended)?;

        let out = ops.reshape(tokens, &[batch, height, width, hidden])?;
        match self.layout {
            MemoryLayout::ChannelsLast => Ok(out),
            MemoryLayout::Contiguous => ops.permute(out, &TO_CHANNELS_FIRST),
        }
    }
}

impl Computation for DecoderStage {
    fn name(&self) -> &str {
        crate::DECODER
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    fn forward(&self, ops: &mut dyn OpBuilder) -> Result<Vec<ValueId>> {
        let latents = ops.input(&ArgKey::Positional(0))?;
        let dims = ops.spec(latents)?.shape.dims().to_vec();
        let &[_, channels, height, width] = dims.as_slice() else {
            return Err(Error::InvalidArgument(format!(
                "decoder expects [batch, channels, height, width] latents, got {:?}",
                dims
            )));
        };
        if channels != self.config.latent_channels {
            return Err(Error::InvalidArgument(format!(
                "decoder expects {} latent channels, got {}",
                self.config.latent_channels, channels
            )));
        }

        let mut x = latents;
        if self.layout == MemoryLayout::ChannelsLast {
            x = ops.permute(x, &TO_CHANNELS_LAST)?;
        }
        let x = self.conv(ops, x, "conv_in")?;
        let x = ops.unary(UnaryOp::Silu, x)?;
        let x = self.mid_attention(ops, x, (height, width))?;
        let x = ops.unary(UnaryOp::Silu, x)?;
        let mut image = self.conv(ops, x, "conv_out")?;
        if self.layout == MemoryLayout::ChannelsLast {
            image = ops.permute(image, &TO_CHANNELS_FIRST)?;
        }
        Ok(vec![image])
    }

    fn rewrites(&mut self) -> Option<&mut dyn StructuralRewrites> {
        Some(self)
    }
}

impl StructuralRewrites for DecoderStage {
    fn fuse_projections(&mut self) -> Result<usize> {
        Ok(usize::from(fuse_qkv(&mut self.parameters, "mid.attn")?))
    }

    /// The spatial attention keeps the reference kernel
    fn set_attention_kernel(&mut self, _kernel: AttentionKernel) -> bool {
        false
    }

    fn set_memory_layout(&mut self, layout: MemoryLayout) -> bool {
        self.layout = layout;
        true
    }
}
