//! Owns the device, allocator, queues, staging pool and descriptor pool;
//! the factory for every other resource in this crate (§4.13).

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::buffer::{Buffer, BufferError, BufferType, BufferView, BufferViewError};
use crate::descriptor::{DescriptorSet, DescriptorSetDescriptor, DescriptorSetPool};
use crate::error::Error;
use crate::framebuffer::{Framebuffer, FramebufferDescriptor, FramebufferError};
use crate::image::{Image, ImageDescriptor, Sampler, SamplerDescriptor};
use crate::pipeline::{PipelineState, PipelineStateDescriptor};
use crate::queue::{CommandQueue, QueueRole};
use crate::staging::StagingPool;
use crate::swapchain::{Swapchain, SwapchainDescriptor};
use crate::types::AttributeFormat;

pub(crate) const ALLOC: Option<&vk::AllocationCallbacks> = None;

bitflags! {
    /// Optional device features/extensions actually negotiated at device
    /// creation, as opposed to the ones this crate always requires. Callers
    /// can use this to decide whether to take a fast path that depends on a
    /// non-load-bearing extension (§2, §6).
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct DeviceCapabilities: u32 {
        /// `VK_EXT_nested_command_buffer` is present on the device.
        const NESTED_COMMAND_BUFFER = 1 << 0;
    }
}

/// Configuration for [`Context::new`].
#[derive(Clone, Debug, Default)]
pub struct ContextConfig {
    /// Enables `VK_LAYER_KHRONOS_validation` and a debug-utils messenger.
    pub enable_validation: bool,
    /// Picks a specific physical device by index instead of the first
    /// device that satisfies the required feature set.
    pub preferred_device_index: Option<usize>,
}

/// Device-side state shared by every resource a [`Context`] creates.
/// Resources hold this `Arc` directly rather than a back-pointer to
/// `Context`, so a resource's `Drop` never needs to reach back into the
/// owning `Context` (REDESIGN FLAGS: "back-pointers from resources to
/// their Context").
pub(crate) struct DeviceHandle {
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) dynamic_rendering: ash::khr::dynamic_rendering::Device,
    pub(crate) push_descriptor: ash::khr::push_descriptor::Device,
    pub(crate) surface_instance: ash::khr::surface::Instance,
    pub(crate) swapchain_device: ash::khr::swapchain::Device,
    pub(crate) entry: ash::Entry,
    pub(crate) capabilities: DeviceCapabilities,
    _debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl DeviceHandle {
    pub(crate) fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&index| {
            let bit_set = type_bits & (1 << index) != 0;
            let supports = self.memory_properties.memory_types[index as usize]
                .property_flags
                .contains(required);
            bit_set && supports
        })
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        // SAFETY: every resource created from this `DeviceHandle` must have
        // been dropped before the owning `Context` (and therefore this
        // `Arc`'s last reference), per §3's Context lifetime invariant.
        unsafe {
            self.device.destroy_device(ALLOC);
            if let Some((instance_ext, messenger)) = self._debug_messenger.take() {
                instance_ext.destroy_debug_utils_messenger(messenger, ALLOC);
            }
            self.instance.destroy_instance(ALLOC);
        }
    }
}

/// The engine's single entry point: owns the device, three (possibly
/// aliased) queues, the staging-buffer pool, and the descriptor-set pool.
/// Every other handle type in this crate is created through `Context`.
pub struct Context {
    pub(crate) device: Arc<DeviceHandle>,
    pub(crate) staging_pool: Arc<StagingPool>,
    pub(crate) descriptor_pool: Arc<Mutex<DescriptorSetPool>>,
    graphics_queue: CommandQueue,
    compute_queue: CommandQueue,
    transfer_queue: CommandQueue,
}

impl Context {
    pub fn new(config: &ContextConfig) -> Result<Self, Error> {
        // SAFETY: loading the Vulkan loader from the default search paths;
        // no concurrent instance/device destruction is in progress.
        let entry = unsafe { ash::Entry::load().map_err(|_| Error::InternalError)? };

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_3);

        let mut layer_names: Vec<CString> = Vec::new();
        if config.enable_validation {
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|l| l.as_ptr()).collect();

        let mut extension_names: Vec<CString> =
            vec![CString::new("VK_KHR_surface").unwrap()];
        if config.enable_validation {
            extension_names.push(CString::new("VK_EXT_debug_utils").unwrap());
        }
        let extension_ptrs: Vec<*const c_char> =
            extension_names.iter().map(|e| e.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        // SAFETY: `instance_info` references `layer_ptrs`/`extension_ptrs`,
        // both kept alive for the duration of this call.
        let instance = unsafe { entry.create_instance(&instance_info, ALLOC)? };

        let debug_messenger = if config.enable_validation {
            tracing::info!("Vulkan validation layers enabled");
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            // SAFETY: `info` is a valid messenger create info; the instance
            // outlives the messenger (destroyed in `DeviceHandle::drop` first).
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&info, ALLOC)? };
            Some((debug_utils, messenger))
        } else {
            None
        };

        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        if physical_devices.is_empty() {
            return Err(Error::InternalError);
        }
        let physical_device_index = config.preferred_device_index.unwrap_or(0);
        let physical_device = *physical_devices
            .get(physical_device_index)
            .unwrap_or(&physical_devices[0]);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        tracing::info!(
            device = %unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            "selected physical device",
        );

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let graphics_family = queue_family_properties
            .iter()
            .position(|f| {
                f.queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .ok_or(Error::InternalError)? as u32;
        let available_queue_count = queue_family_properties[graphics_family as usize].queue_count;

        // Up to three dedicated queues; fewer available queues alias roles
        // per §4.13: 1 -> all three roles share one queue, 2 -> graphics and
        // compute share, transfer separate, 3+ -> one queue per role.
        let queue_count = available_queue_count.min(3).max(1);
        let mut queue_priorities = vec![1.0f32; queue_count as usize];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&mut queue_priorities);

        let mut dynamic_rendering_feature =
            vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);
        let mut sync2_feature =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true);

        let enabled_features =
            vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(true);

        let device_extensions: Vec<CString> = vec![
            CString::new("VK_KHR_swapchain").unwrap(),
            CString::new("VK_KHR_push_descriptor").unwrap(),
            CString::new("VK_KHR_dynamic_rendering").unwrap(),
            // Requested but not load-bearing for any operation this crate
            // exercises; degrade to a warning if the driver lacks it rather
            // than failing device creation (§6).
            CString::new("VK_EXT_nested_command_buffer").unwrap(),
        ];
        let has_nested_command_buffer =
            device_supports_extension(&instance, physical_device, "VK_EXT_nested_command_buffer");
        if !has_nested_command_buffer {
            tracing::warn!(
                "VK_EXT_nested_command_buffer is unavailable; continuing without it"
            );
        }
        let mut capabilities = DeviceCapabilities::empty();
        capabilities.set(DeviceCapabilities::NESTED_COMMAND_BUFFER, has_nested_command_buffer);
        let enabled_extension_names: Vec<*const c_char> = device_extensions
            .iter()
            .filter(|ext| {
                ext.to_str() != Ok("VK_EXT_nested_command_buffer") || has_nested_command_buffer
            })
            .map(|e| e.as_ptr())
            .collect();

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&enabled_features)
            .push_next(&mut dynamic_rendering_feature)
            .push_next(&mut sync2_feature)
            .push_next(&mut vk12_features);

        // SAFETY: `device_info` is a valid device create info referencing
        // data kept alive for the duration of this call.
        let device = unsafe { instance.create_device(physical_device, &device_info, ALLOC)? };

        let dynamic_rendering = ash::khr::dynamic_rendering::Device::new(&instance, &device);
        let push_descriptor = ash::khr::push_descriptor::Device::new(&instance, &device);
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);
        let swapchain_device = ash::khr::swapchain::Device::new(&instance, &device);

        let device_handle = Arc::new(DeviceHandle {
            instance,
            physical_device,
            device,
            properties,
            memory_properties,
            dynamic_rendering,
            push_descriptor,
            surface_instance,
            swapchain_device,
            entry,
            capabilities,
            _debug_messenger: debug_messenger,
        });

        // SAFETY: `queue_count` queues were requested from `graphics_family`
        // above; indices `0..queue_count` are therefore valid.
        let queue_handle = |index: u32| unsafe {
            device_handle
                .device
                .get_device_queue(graphics_family, index)
        };

        let (graphics_index, compute_index, transfer_index) = match queue_count {
            1 => (0, 0, 0),
            2 => (0, 0, 1),
            _ => (0, 1, 2),
        };

        let graphics_queue = CommandQueue::new(
            device_handle.clone(),
            QueueRole::Graphics,
            graphics_family,
            queue_handle(graphics_index),
        );
        let compute_queue = CommandQueue::new(
            device_handle.clone(),
            QueueRole::Compute,
            graphics_family,
            queue_handle(compute_index),
        );
        let transfer_queue = CommandQueue::new(
            device_handle.clone(),
            QueueRole::Transfer,
            graphics_family,
            queue_handle(transfer_index),
        );

        let staging_pool = Arc::new(StagingPool::new(device_handle.clone()));
        let descriptor_pool = Arc::new(Mutex::new(DescriptorSetPool::new(device_handle.clone())));

        Ok(Self {
            device: device_handle,
            staging_pool,
            descriptor_pool,
            graphics_queue,
            compute_queue,
            transfer_queue,
        })
    }

    /// Optional features actually negotiated with this device (§2, §6).
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.device.capabilities
    }

    pub fn graphics_queue(&self) -> &CommandQueue {
        &self.graphics_queue
    }

    pub fn compute_queue(&self) -> &CommandQueue {
        &self.compute_queue
    }

    pub fn transfer_queue(&self) -> &CommandQueue {
        &self.transfer_queue
    }

    pub fn create_buffer(
        &self,
        size: u64,
        ty: BufferType,
        cpu_visible: bool,
    ) -> Result<Buffer, BufferError> {
        Buffer::new(self.device.clone(), size, ty, cpu_visible)
    }

    pub fn create_buffer_view(
        &self,
        buffer: Arc<Buffer>,
        offset: u64,
        stride: u64,
        count: u64,
        attribute: AttributeFormat,
    ) -> Result<BufferView, BufferViewError> {
        BufferView::new(buffer, offset, stride, count, attribute)
    }

    pub fn create_image(&self, desc: ImageDescriptor) -> Result<Image, Error> {
        Image::new(self.device.clone(), desc)
    }

    pub fn create_sampler(&self, desc: SamplerDescriptor) -> Result<Sampler, Error> {
        Sampler::new(self.device.clone(), desc)
    }

    pub fn create_framebuffer(
        &self,
        desc: FramebufferDescriptor,
    ) -> Result<Framebuffer, FramebufferError> {
        Framebuffer::new(desc)
    }

    pub fn create_pipeline_state(
        &self,
        desc: PipelineStateDescriptor,
    ) -> Result<PipelineState, Error> {
        PipelineState::new(self.device.clone(), desc)
    }

    pub fn create_descriptor_set(
        &self,
        desc: DescriptorSetDescriptor,
    ) -> Result<DescriptorSet, Error> {
        DescriptorSet::new(self.device.clone(), &self.descriptor_pool, desc)
    }

    pub fn create_command_buffer(
        &self,
        queue: &CommandQueue,
    ) -> Result<crate::command::CommandBuffer, Error> {
        queue.create_command_buffer(self.staging_pool.clone())
    }

    pub fn create_swapchain(
        &self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        desc: SwapchainDescriptor,
    ) -> Result<Swapchain, Error> {
        Swapchain::new(self.device.clone(), display_handle, window_handle, desc)
    }

    pub fn create_fence(&self, signaled: bool) -> Result<crate::sync::Fence, Error> {
        crate::sync::Fence::new(self.device.clone(), signaled)
    }

    pub fn create_semaphore(&self) -> Result<crate::sync::Semaphore, Error> {
        crate::sync::Semaphore::new(self.device.clone())
    }
}

fn device_supports_extension(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    name: &str,
) -> bool {
    // SAFETY: read-only query against a valid physical device handle.
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(physical_device) })
    else {
        return false;
    };
    extensions.iter().any(|ext| {
        let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        ext_name.to_str() == Ok(name)
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: `data` is non-null and valid for the duration of the callback,
    // per the Vulkan debug-utils contract.
    let message = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vkgfx::validation", "{message}");
    } else {
        tracing::warn!(target: "vkgfx::validation", "{message}");
    }
    vk::FALSE
}
