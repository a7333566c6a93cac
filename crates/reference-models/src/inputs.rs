//! Example call arguments per pipeline variant
//!
//! Image-conditioned pipelines carry the conditioning image as extra latent
//! tokens and decode a non-square latent, so their signatures differ from
//! the text-to-image shapes.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::error::Result;
use common::types::{DType, PipelineVariant, Shape};
use device_runtime::{ArgValue, CallArgs, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::decoder::DecoderConfig;
use crate::transformer::TransformerConfig;

/// Activation dtype of the example arguments
pub const EXAMPLE_DTYPE: DType = DType::BF16;

/// Shapes of the example arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExampleShapes {
    pub image_tokens: usize,
    pub text_tokens: usize,
    pub latent_height: usize,
    pub latent_width: usize,
}

impl ExampleShapes {
    pub fn for_variant(variant: PipelineVariant) -> Self {
        match variant {
            PipelineVariant::TextToImage => Self {
                image_tokens: 16,
                text_tokens: 8,
                latent_height: 8,
                latent_width: 8,
            },
            PipelineVariant::ImageConditioned => Self {
                image_tokens: 28,
                text_tokens: 8,
                latent_height: 6,
                latent_width: 10,
            },
        }
    }
}

fn random(device: &Arc<Device>, rng: &mut StdRng, dims: Vec<usize>, dtype: DType) -> Result<Tensor> {
    let shape = Shape::new(dims);
    let data = (0..shape.numel()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    device.tensor_from_vec(shape, dtype, data)
}

/// Keyword arguments of the transformer stage
pub fn transformer_args(device: &Arc<Device>, variant: PipelineVariant, dtype: DType) -> Result<CallArgs> {
    let shapes = ExampleShapes::for_variant(variant);
    let config = TransformerConfig::for_variant(variant);
    let mut rng = StdRng::seed_from_u64(11);

    let mut args = CallArgs::new()
        .kwarg(
            "hidden_states",
            random(device, &mut rng, vec![1, shapes.image_tokens, config.in_channels], dtype)?,
        )
        .kwarg("timestep", device.full(Shape::new(vec![1]), dtype, 1.0)?)
        .kwarg(
            "pooled_projections",
            random(device, &mut rng, vec![1, config.pooled_dim], dtype)?,
        )
        .kwarg(
            "encoder_hidden_states",
            random(device, &mut rng, vec![1, shapes.text_tokens, config.context_dim], dtype)?,
        )
        .kwarg("joint_attention_kwargs", ArgValue::Map(BTreeMap::new()))
        .kwarg("return_dict", false);
    if config.guidance_embeds {
        args = args.kwarg("guidance", device.full(Shape::new(vec![1]), dtype, 2.5)?);
    }
    Ok(args)
}

/// Positional latent argument of the decoder stage
pub fn decoder_args(device: &Arc<Device>, variant: PipelineVariant, dtype: DType) -> Result<CallArgs> {
    let shapes = ExampleShapes::for_variant(variant);
    let config = DecoderConfig::default();
    let mut rng = StdRng::seed_from_u64(13);
    let latents = random(
        device,
        &mut rng,
        vec![1, config.latent_channels, shapes.latent_height, shapes.latent_width],
        dtype,
    )?;
    Ok(CallArgs::new().arg(latents).kwarg("return_dict", false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_have_distinct_shapes() {
        let device = Device::host();
        let plain = transformer_args(&device, PipelineVariant::TextToImage, EXAMPLE_DTYPE).unwrap();
        let conditioned =
            transformer_args(&device, PipelineVariant::ImageConditioned, EXAMPLE_DTYPE).unwrap();

        assert_eq!(plain.tensors().len(), 4);
        assert_eq!(conditioned.tensors().len(), 5);
        let key = "hidden_states".into();
        assert_ne!(
            plain.tensor(&key).unwrap().shape(),
            conditioned.tensor(&key).unwrap().shape()
        );
        assert_eq!(plain.tensor(&key).unwrap().dtype(), EXAMPLE_DTYPE);
    }
}
