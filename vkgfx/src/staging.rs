//! Pool of reusable, host-visible transfer buffers handed out to
//! [`crate::command::CommandBuffer`] for `update_buffer_data`/`update_image_data`
//! (§4.11).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferType};
use crate::context::DeviceHandle;
use crate::error::BufferError;

/// Buffers are kept size-bucketed so a request can find the smallest buffer
/// that still fits it without scanning every free buffer.
pub struct StagingPool {
    device: Arc<DeviceHandle>,
    buffers: Mutex<BTreeMap<u64, Vec<Arc<Buffer>>>>,
}

impl StagingPool {
    pub(crate) fn new(device: Arc<DeviceHandle>) -> Self {
        Self {
            device,
            buffers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the smallest pooled buffer at least `size` bytes that is not
    /// currently referenced by another in-flight submission (strong count of
    /// 1, held only by the pool itself), else allocates a fresh one.
    pub(crate) fn request_buffer(&self, size: u64) -> Result<Arc<Buffer>, BufferError> {
        let mut guard = self.buffers.lock();
        for (_, bucket) in guard.range_mut(size..) {
            if let Some(index) = bucket.iter().position(|b| Arc::strong_count(b) == 1) {
                return Ok(bucket.remove(index));
            }
        }
        drop(guard);

        Ok(Arc::new(Buffer::new(
            self.device.clone(),
            size,
            BufferType::Storage,
            true,
        )?))
    }

    /// Returns buffers to the pool once the GPU work referencing them has
    /// completed. Called by the reclamation worker after its paired fence
    /// signals (§4.10).
    pub(crate) fn return_buffers(&self, buffers: Vec<Arc<Buffer>>) {
        let mut guard = self.buffers.lock();
        for buffer in buffers {
            guard.entry(buffer.size()).or_default().push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_lookup_picks_smallest_fitting_size() {
        let mut map: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        map.insert(64, vec![1]);
        map.insert(256, vec![2]);
        map.insert(1024, vec![3]);

        let found: Vec<_> = map.range_mut(100..).map(|(&k, _)| k).collect();
        assert_eq!(found, vec![256, 1024]);
    }
}
