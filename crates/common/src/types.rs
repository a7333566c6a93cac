//! Common types for Fastpath
//!
//! This module defines the tensor descriptions and pipeline-level enums used
//! throughout the system.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 16-bit IEEE float
    F16,
    /// bfloat16
    BF16,
    /// 8-bit float, 4 exponent bits and 3 mantissa bits
    F8E4M3,
}

impl DType {
    /// Size in bytes of one element when stored natively on the device
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::F8E4M3 => 1,
        }
    }

    /// Returns true for 8-bit float types
    pub fn is_float8(&self) -> bool {
        matches!(self, DType::F8E4M3)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F8E4M3 => write!(f, "f8e4m3"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f16" | "float16" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f8e4m3" | "float8_e4m3fn" => Ok(DType::F8E4M3),
            _ => Err(format!("Unknown dtype: {}", s)),
        }
    }
}

/// Ordered tensor dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Dimension at `axis`, counting from the back when negative
    pub fn dim(&self, axis: isize) -> Option<usize> {
        let rank = self.0.len() as isize;
        let index = if axis < 0 { rank + axis } else { axis };
        if index < 0 || index >= rank {
            return None;
        }
        Some(self.0[index as usize])
    }

    /// Every dimension is strictly positive
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|&d| d > 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

/// Accelerator an artifact is compiled for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorTarget {
    /// Architecture family (e.g., "host-sim", "sm")
    pub arch: String,
    /// Minimum compute capability (major, minor)
    pub capability: (u32, u32),
}

impl fmt::Display for AcceleratorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.arch, self.capability.0, self.capability.1)
    }
}

/// Attention kernel implementation used by a computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttentionKernel {
    /// Materialized scores followed by softmax
    Reference,
    /// Single fused kernel with online softmax
    Flash,
}

impl fmt::Display for AttentionKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKernel::Reference => write!(f, "reference"),
            AttentionKernel::Flash => write!(f, "flash"),
        }
    }
}

/// Preferred memory layout for image-like activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLayout {
    /// Channels before spatial dimensions
    Contiguous,
    /// Channels as the innermost dimension
    ChannelsLast,
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLayout::Contiguous => write!(f, "contiguous"),
            MemoryLayout::ChannelsLast => write!(f, "channels_last"),
        }
    }
}

/// Pipeline variant, selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Prompt-only generation
    #[serde(alias = "schnell")]
    TextToImage,
    /// Generation conditioned on an input image
    #[serde(alias = "kontext")]
    ImageConditioned,
}

impl Default for PipelineVariant {
    fn default() -> Self {
        PipelineVariant::TextToImage
    }
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineVariant::TextToImage => write!(f, "text_to_image"),
            PipelineVariant::ImageConditioned => write!(f, "image_conditioned"),
        }
    }
}

impl FromStr for PipelineVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text_to_image" | "text-to-image" | "schnell" => Ok(PipelineVariant::TextToImage),
            "image_conditioned" | "image-conditioned" | "kontext" => {
                Ok(PipelineVariant::ImageConditioned)
            }
            _ => Err(format!("Unknown pipeline variant: {}", s)),
        }
    }
}
