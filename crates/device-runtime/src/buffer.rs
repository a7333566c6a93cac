//! Device memory buffers
//!
//! A buffer has a stable identity for its whole lifetime. Captured graphs refer
//! to buffers by identity, so replacing a buffer (rather than overwriting its
//! contents) would make a replay read stale memory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

struct BufferStorage {
    id: BufferId,
    device_id: u64,
    bytes: u64,
    data: RwLock<Vec<f32>>,
    /// Shared with the owning device for memory accounting
    allocated: Arc<AtomicU64>,
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Handle to a region of device memory
///
/// Cloning the handle shares the storage; it never copies contents.
#[derive(Clone)]
pub struct DeviceBuffer {
    storage: Arc<BufferStorage>,
}

impl DeviceBuffer {
    pub(crate) fn new(len: usize, bytes: u64, device_id: u64, allocated: Arc<AtomicU64>) -> Self {
        Self {
            storage: Arc::new(BufferStorage {
                id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
                device_id,
                bytes,
                data: RwLock::new(vec![0.0; len]),
                allocated,
            }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.storage.id
    }

    pub fn device_id(&self) -> u64 {
        self.storage.device_id
    }

    /// Number of elements held by the buffer
    pub fn len(&self) -> usize {
        self.storage.data.read_recursive().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the allocation in bytes
    pub fn size_in_bytes(&self) -> u64 {
        self.storage.bytes
    }

    /// Returns true if both handles refer to the same storage
    pub fn same_storage(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.storage.data.read_recursive()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.storage.data.write()
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.storage.id)
            .field("bytes", &self.storage.bytes)
            .finish()
    }
}
