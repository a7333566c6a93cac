//! Device tensors

use std::fmt;

use common::error::{Error, Result};
use common::types::{DType, Shape};
use serde::{Deserialize, Serialize};

use crate::buffer::DeviceBuffer;

/// Shape and element type of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Dimensions
    pub shape: Shape,

    /// Element type
    pub dtype: DType,
}

impl TensorSpec {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// A typed view over a device buffer
///
/// Cloning a tensor is shallow: the clone refers to the same buffer. Use
/// `Stream::clone_tensor` for a deep copy.
#[derive(Clone)]
pub struct Tensor {
    buffer: DeviceBuffer,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub(crate) fn from_parts(buffer: DeviceBuffer, shape: Shape, dtype: DType) -> Self {
        Self {
            buffer,
            shape,
            dtype,
        }
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn device_id(&self) -> u64 {
        self.buffer.device_id()
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec {
            shape: self.shape.clone(),
            dtype: self.dtype,
        }
    }

    /// Reinterprets the tensor with a new shape of the same element count
    pub fn view(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.numel() != self.numel() {
            return Err(Error::InvalidArgument(format!(
                "cannot view tensor of shape {} as {}",
                self.shape, shape
            )));
        }
        Ok(Tensor {
            buffer: self.buffer.clone(),
            shape,
            dtype: self.dtype,
        })
    }

    /// Returns true if both tensors refer to the same device memory
    pub fn same_storage(&self, other: &Tensor) -> bool {
        self.buffer.same_storage(&other.buffer)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("buffer", &self.buffer.id())
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn test_view_shares_storage() {
        let device = Device::host();
        let t = device
            .tensor_from_vec(Shape::new(vec![2, 3]), DType::F32, vec![1.0; 6])
            .unwrap();
        let v = t.view(vec![3, 2]).unwrap();
        assert!(v.same_storage(&t));
        assert_eq!(v.spec(), TensorSpec::new(vec![3, 2], DType::F32));
        assert!(t.view(vec![4]).is_err());
    }

    #[test]
    fn test_spec_display() {
        let spec = TensorSpec::new(vec![2, 3], DType::BF16);
        assert_eq!(spec.to_string(), "bf16[2, 3]");
    }
}
