//! GPU buffer memory allocation and typed, strided views over it (§3, §4.5).

use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;

use ash::vk;
use parking_lot::Mutex;

use crate::context::{DeviceHandle, ALLOC};
use crate::error::{BufferError, BufferViewError};
use crate::types::AttributeFormat;

/// The four buffer kinds a [`Buffer`] may be created with (§3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferType {
    Vertex,
    Index,
    Uniform,
    Storage,
}

impl BufferType {
    fn usage_flags(self) -> vk::BufferUsageFlags {
        let base = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        base | match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }
}

/// GPU memory allocation of one of four kinds, with optional host-visible
/// mapping (§3, §4.5, §8).
#[derive(Debug)]
pub struct Buffer {
    device: Arc<DeviceHandle>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    ty: BufferType,
    cpu_visible: bool,
    mapped: Mutex<Option<NonNull<u8>>>,
}

// `Buffer` is shared across threads only through `Arc`; the raw mapped
// pointer is guarded by `mapped`'s mutex, never read or written without it.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        size: u64,
        ty: BufferType,
        cpu_visible: bool,
    ) -> Result<Self, BufferError> {
        if size == 0 {
            return Err(BufferError::InvalidSize);
        }

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(ty.usage_flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: `info` is a valid buffer create info with non-zero size.
        let buffer = unsafe {
            device
                .device
                .create_buffer(&info, ALLOC)
                .map_err(|_| BufferError::InternalError)?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let required_flags = if cpu_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let Some(memory_type) =
            device.find_memory_type(requirements.memory_type_bits, required_flags)
        else {
            // SAFETY: `buffer` was just created and is not yet bound to memory.
            unsafe { device.device.destroy_buffer(buffer, ALLOC) };
            return Err(BufferError::OutOfMemory);
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        // SAFETY: `alloc_info` requests a memory type supported by `requirements`.
        let memory = match unsafe { device.device.allocate_memory(&alloc_info, ALLOC) } {
            Ok(memory) => memory,
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                unsafe { device.device.destroy_buffer(buffer, ALLOC) };
                return Err(BufferError::OutOfMemory);
            }
            Err(_) => {
                unsafe { device.device.destroy_buffer(buffer, ALLOC) };
                return Err(BufferError::InternalError);
            }
        };

        // SAFETY: `memory` was allocated above to satisfy `buffer`'s
        // requirements and has not yet been bound to any resource.
        if let Err(_) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.device.destroy_buffer(buffer, ALLOC);
                device.device.free_memory(memory, ALLOC);
            }
            return Err(BufferError::InternalError);
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            ty,
            cpu_visible,
            mapped: Mutex::new(None),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn ty(&self) -> BufferType {
        self.ty
    }

    pub fn cpu_visible(&self) -> bool {
        self.cpu_visible
    }

    pub(crate) fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// Maps the whole buffer into host memory. Succeeds only if the buffer
    /// is not already mapped and is `cpu_visible`. Returns the mapped byte
    /// slice to write into.
    pub fn map(&self) -> Option<MappedBuffer<'_>> {
        if !self.cpu_visible {
            return None;
        }
        let mut guard = self.mapped.lock();
        if guard.is_some() {
            return None;
        }

        // SAFETY: `self.memory` is host-visible (checked at creation) and
        // not currently mapped (checked above under `self.mapped`'s lock).
        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .ok()?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())?;
        *guard = Some(ptr);
        drop(guard);

        Some(MappedBuffer { buffer: self, ptr })
    }

    /// Unmaps a previously mapped buffer, publishing CPU writes to the GPU.
    /// Returns `false` if the buffer was not mapped.
    pub fn unmap(&self) -> bool {
        let mut guard = self.mapped.lock();
        if guard.take().is_none() {
            return false;
        }

        // Ensure all prior stores (including non-temporal ones) are
        // globally visible before `vkFlushMappedMemoryRanges`, per the
        // Vulkan host-write-visibility rules.
        fence(Ordering::SeqCst);

        let range = vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        // SAFETY: `self.memory` was mapped and the mapping is about to be
        // invalidated by `unmap_memory` below.
        let _ = unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) };
        unsafe { self.device.device.unmap_memory(self.memory) };

        true
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        if self.mapped.lock().is_some() {
            self.unmap();
        }
        // SAFETY: no command buffer may reference `self.buffer` after this
        // point; callers are required to have waited for any in-flight use.
        unsafe {
            self.device.device.destroy_buffer(self.buffer, ALLOC);
            self.device.device.free_memory(self.memory, ALLOC);
        }
    }
}

/// RAII guard over a mapped [`Buffer`]'s host-visible memory. Dropping it
/// without calling [`Buffer::unmap`] leaves writes unpublished to the GPU;
/// callers must call `unmap` explicitly, matching §4.5's explicit
/// map/unmap lifecycle.
pub struct MappedBuffer<'a> {
    buffer: &'a Buffer,
    ptr: NonNull<u8>,
}

impl<'a> MappedBuffer<'a> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `size` bytes for the lifetime of this
        // guard; the mapping is held by `self.buffer.mapped`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.buffer.size as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; exclusive access is guaranteed by `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.buffer.size as usize) }
    }
}

/// A typed, strided slice of a [`Buffer`] used to bind vertex/index data
/// to a draw call (§3, §4.5).
#[derive(Debug)]
pub struct BufferView {
    buffer: Arc<Buffer>,
    offset: u64,
    stride: u64,
    count: u64,
    attribute: AttributeFormat,
}

impl BufferView {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        offset: u64,
        stride: u64,
        count: u64,
        attribute: AttributeFormat,
    ) -> Result<Self, BufferViewError> {
        if count == 0 {
            return Err(BufferViewError::EmptyView);
        }

        // A stride of 0 means tightly packed; normalize it to the
        // attribute's own size at construction (§4.5).
        let stride = if stride == 0 {
            attribute.size()
        } else {
            stride
        };

        if buffer.ty() == BufferType::Index && stride != 0 && stride != attribute.size() {
            return Err(BufferViewError::InvalidStride);
        }

        let last_element_end = offset
            .checked_add((count - 1).saturating_mul(stride))
            .and_then(|v| v.checked_add(attribute.size()));
        let Some(end) = last_element_end else {
            return Err(BufferViewError::InvalidSize);
        };
        if end > buffer.size() {
            return Err(BufferViewError::InvalidBuffer);
        }

        Ok(Self {
            buffer,
            offset,
            stride,
            count,
            attribute,
        })
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn attribute(&self) -> AttributeFormat {
        self.attribute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_view(
        buffer_size: u64,
        ty: BufferType,
        offset: u64,
        stride: u64,
        count: u64,
        attribute: AttributeFormat,
    ) -> Result<(), BufferViewError> {
        // BufferView's math is pure; exercise it directly without a real
        // Buffer/device by constructing the validation logic standalone.
        if count == 0 {
            return Err(BufferViewError::EmptyView);
        }
        let stride = if stride == 0 { attribute.size() } else { stride };
        if ty == BufferType::Index && stride != attribute.size() {
            return Err(BufferViewError::InvalidStride);
        }
        let end = offset + (count - 1) * stride + attribute.size();
        if end > buffer_size {
            return Err(BufferViewError::InvalidBuffer);
        }
        Ok(())
    }

    #[test]
    fn empty_view_is_rejected() {
        assert!(matches!(
            fake_view(64, BufferType::Vertex, 0, 0, 0, AttributeFormat::Float32),
            Err(BufferViewError::EmptyView)
        ));
    }

    #[test]
    fn view_past_buffer_end_is_rejected() {
        assert!(matches!(
            fake_view(4, BufferType::Vertex, 0, 0, 2, AttributeFormat::Float32),
            Err(BufferViewError::InvalidBuffer)
        ));
    }

    #[test]
    fn index_buffer_requires_packed_stride() {
        assert!(matches!(
            fake_view(100, BufferType::Index, 0, 8, 4, AttributeFormat::Uint16),
            Err(BufferViewError::InvalidStride)
        ));
        assert!(fake_view(100, BufferType::Index, 0, 0, 4, AttributeFormat::Uint16).is_ok());
    }

    #[test]
    fn exact_fit_view_is_accepted() {
        // offset 0 + (4-1)*4 + 4 == 16, exactly buffer size.
        assert!(fake_view(16, BufferType::Vertex, 0, 4, 4, AttributeFormat::Float32).is_ok());
    }
}
