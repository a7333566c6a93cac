//! Accelerator device description and memory allocation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::error::{Error, IncompatibilityReason, Result};
use common::types::{AcceleratorTarget, DType, Shape};
use common::utils::format_bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::DeviceBuffer;
use crate::precision;
use crate::stream::Stream;
use crate::tensor::Tensor;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Architecture string reported by the reference host device
pub const HOST_ARCH: &str = "host-sim";

/// Capabilities of an accelerator device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Human readable device name
    pub name: String,

    /// Architecture family
    pub arch: String,

    /// Compute capability (major, minor)
    pub compute_capability: (u32, u32),

    /// Device memory in bytes
    pub memory_bytes: u64,

    /// Whether 8-bit float kernels are available
    pub supports_float8: bool,
}

impl DeviceCapabilities {
    /// Capabilities of the reference host device
    pub fn host() -> Self {
        Self {
            name: "Reference host accelerator".to_string(),
            arch: HOST_ARCH.to_string(),
            compute_capability: (9, 0),
            memory_bytes: 8 * 1024 * 1024 * 1024,
            supports_float8: true,
        }
    }

    /// Compilation target matching this device exactly
    pub fn target(&self) -> AcceleratorTarget {
        AcceleratorTarget {
            arch: self.arch.clone(),
            capability: self.compute_capability,
        }
    }

    /// Checks whether code compiled for `target` can run on this device
    pub fn check_compatible(&self, target: &AcceleratorTarget) -> std::result::Result<(), IncompatibilityReason> {
        if target.arch != self.arch {
            return Err(IncompatibilityReason::Architecture {
                expected: target.arch.clone(),
                found: self.arch.clone(),
            });
        }
        if target.capability > self.compute_capability {
            return Err(IncompatibilityReason::Capability {
                required: target.capability,
                available: self.compute_capability,
            });
        }
        Ok(())
    }
}

/// An accelerator device
///
/// Devices are shared through `Arc`; tensors and streams keep their device
/// alive.
pub struct Device {
    id: u64,
    capabilities: DeviceCapabilities,
    allocated: Arc<AtomicU64>,
}

impl Device {
    /// Creates the reference host device
    pub fn host() -> Arc<Self> {
        Self::with_capabilities(DeviceCapabilities::host())
    }

    /// Creates a device with explicit capabilities
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Arc<Self> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Opened device {} ({} {}.{}, {})",
            id,
            capabilities.arch,
            capabilities.compute_capability.0,
            capabilities.compute_capability.1,
            format_bytes(capabilities.memory_bytes)
        );
        Arc::new(Self {
            id,
            capabilities,
            allocated: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Bytes currently held by live buffers
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Allocates a zero-initialized tensor
    pub fn allocate(self: &Arc<Self>, shape: Shape, dtype: DType) -> Result<Tensor> {
        if !shape.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "cannot allocate tensor with shape {}",
                shape
            )));
        }
        let len = shape.numel();
        let bytes = (len * dtype.size_in_bytes()) as u64;

        let previous = self.allocated.fetch_add(bytes, Ordering::SeqCst);
        if previous + bytes > self.capabilities.memory_bytes {
            self.allocated.fetch_sub(bytes, Ordering::SeqCst);
            return Err(Error::Device(format!(
                "out of device memory: requested {}, {} of {} in use",
                format_bytes(bytes),
                format_bytes(previous),
                format_bytes(self.capabilities.memory_bytes)
            )));
        }

        let buffer = DeviceBuffer::new(len, bytes, self.id, self.allocated.clone());
        Ok(Tensor::from_parts(buffer, shape, dtype))
    }

    /// Allocates a tensor and initializes it from host memory
    ///
    /// This is a synchronous host-to-device copy that bypasses every stream.
    pub fn tensor_from_vec(self: &Arc<Self>, shape: Shape, dtype: DType, data: Vec<f32>) -> Result<Tensor> {
        if data.len() != shape.numel() {
            return Err(Error::InvalidArgument(format!(
                "host data has {} elements, shape {} needs {}",
                data.len(),
                shape,
                shape.numel()
            )));
        }
        let tensor = self.allocate(shape, dtype)?;
        {
            let mut dst = tensor.buffer().write();
            dst.copy_from_slice(&data);
            precision::round_slice(dtype, &mut dst);
        }
        Ok(tensor)
    }

    /// Allocates a tensor filled with `value`
    pub fn full(self: &Arc<Self>, shape: Shape, dtype: DType, value: f32) -> Result<Tensor> {
        let numel = shape.numel();
        self.tensor_from_vec(shape, dtype, vec![value; numel])
    }

    /// Creates a new stream on this device
    pub fn new_stream(self: &Arc<Self>) -> Stream {
        Stream::new(self.clone())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("arch", &self.capabilities.arch)
            .field("compute_capability", &self.capabilities.compute_capability)
            .finish()
    }
}
