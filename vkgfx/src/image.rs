//! 2D images with an optional mip chain, and the sampler parameters used to
//! read them in a shader (§3).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use ash::vk;
use parking_lot::Mutex;

use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;
use crate::types::PixelFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

impl FilterMode {
    pub(crate) fn to_vk(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }

    pub(crate) fn to_vk_mipmap(self) -> vk::SamplerMipmapMode {
        match self {
            Self::Nearest => vk::SamplerMipmapMode::NEAREST,
            Self::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

/// Texture wrap mode; `One`/`Zero` select a border color rather than
/// wrapping behavior (§3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WrapMode {
    ClampToEdge,
    Repeat,
    Mirror,
    One,
    Zero,
}

impl WrapMode {
    pub(crate) fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            Self::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            Self::Repeat => vk::SamplerAddressMode::REPEAT,
            Self::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
            Self::One | Self::Zero => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }

    pub(crate) fn border_color(self) -> Option<vk::BorderColor> {
        match self {
            Self::One => Some(vk::BorderColor::FLOAT_OPAQUE_WHITE),
            Self::Zero => Some(vk::BorderColor::FLOAT_TRANSPARENT_BLACK),
            _ => None,
        }
    }
}

/// Immutable sampler parameters (§3).
#[derive(Debug)]
pub struct Sampler {
    device: Arc<DeviceHandle>,
    sampler: vk::Sampler,
    min_filter: FilterMode,
    mag_filter: FilterMode,
    mipmap_filter: FilterMode,
    wrap_mode: WrapMode,
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub wrap_mode: WrapMode,
}

impl Sampler {
    pub(crate) fn new(device: Arc<DeviceHandle>, desc: SamplerDescriptor) -> Result<Self, Error> {
        let mut info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter.to_vk())
            .mag_filter(desc.mag_filter.to_vk())
            .mipmap_mode(desc.mipmap_filter.to_vk_mipmap())
            .address_mode_u(desc.wrap_mode.to_vk())
            .address_mode_v(desc.wrap_mode.to_vk())
            .address_mode_w(desc.wrap_mode.to_vk())
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(border) = desc.wrap_mode.border_color() {
            info = info.border_color(border);
        }

        // SAFETY: `info` is a valid sampler create info.
        let sampler = unsafe { device.device.create_sampler(&info, ALLOC)? };

        Ok(Self {
            device,
            sampler,
            min_filter: desc.min_filter,
            mag_filter: desc.mag_filter,
            mipmap_filter: desc.mipmap_filter,
            wrap_mode: desc.wrap_mode,
        })
    }

    pub fn min_filter(&self) -> FilterMode {
        self.min_filter
    }

    pub fn mag_filter(&self) -> FilterMode {
        self.mag_filter
    }

    pub fn mipmap_filter(&self) -> FilterMode {
        self.mipmap_filter
    }

    pub fn wrap_mode(&self) -> WrapMode {
        self.wrap_mode
    }

    pub(crate) fn raw(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: no pipeline/descriptor set referencing this sampler is
        // still in use by the GPU.
        unsafe {
            self.device.device.destroy_sampler(self.sampler, ALLOC);
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub has_mips: bool,
}

/// `floor(log2(max(w,h))) + 1` mip levels if requested, else `1` (§3, §8).
pub fn mip_level_count(width: u32, height: u32, has_mips: bool) -> u32 {
    if !has_mips {
        return 1;
    }
    let max_dim = width.max(height).max(1);
    32 - max_dim.leading_zeros()
}

/// A 2D image with an optional mip chain (§3).
///
/// A presentable image is owned by a [`crate::swapchain::Swapchain`]; its
/// layout lifecycle is driven exclusively by swapchain acquire/present, and
/// it cannot be cleared through [`crate::command::CommandBuffer::clear_image`].
#[derive(Debug)]
pub struct Image {
    device: Arc<DeviceHandle>,
    image: vk::Image,
    memory: Option<vk::DeviceMemory>,
    view: vk::ImageView,
    width: u32,
    height: u32,
    format: PixelFormat,
    mip_levels: u32,
    presentable: bool,
    owns_image: bool,
    /// Current layout of the whole mip chain, tracked host-side so
    /// `CommandBuffer` can compute the correct `old_layout` for barriers
    /// without a GPU round-trip.
    layout: Mutex<vk::ImageLayout>,
    generation: AtomicU32,
}

impl Image {
    pub(crate) fn new(device: Arc<DeviceHandle>, desc: ImageDescriptor) -> Result<Self, Error> {
        let mip_levels = mip_level_count(desc.width, desc.height, desc.has_mips);

        let usage = if desc.format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        };

        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format.to_vk())
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: `info` is a valid image create info.
        let image = unsafe { device.device.create_image(&info, ALLOC)? };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let Some(memory_type) = device.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            unsafe { device.device.destroy_image(image, ALLOC) };
            return Err(Error::OutOfMemory);
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        // SAFETY: `alloc_info` requests a type satisfying `requirements`.
        let memory = unsafe { device.device.allocate_memory(&alloc_info, ALLOC)? };
        // SAFETY: `memory` was sized/typed for `image` above and is unbound.
        unsafe { device.device.bind_image_memory(image, memory, 0)? };

        let view = match create_view(&device, image, desc.format, mip_levels) {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.device.destroy_image(image, ALLOC);
                    device.device.free_memory(memory, ALLOC);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device,
            image,
            memory: Some(memory),
            view,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            mip_levels,
            presentable: false,
            owns_image: true,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            generation: AtomicU32::new(0),
        })
    }

    /// Wraps a swapchain-owned `VkImage`. The `Swapchain` retains ownership
    /// and destroys the underlying images itself; this `Image` is a
    /// non-owning view exposed to clients (§3 ownership summary).
    ///
    /// The tracked layout starts `UNDEFINED`, matching the real layout
    /// `vkCreateSwapchainKHR` hands back before any acquire has run; the
    /// swapchain's own acquire-side barrier is the only thing that may treat
    /// `UNDEFINED` as the source layout for this image (§4.12).
    pub(crate) fn from_swapchain_image(
        device: Arc<DeviceHandle>,
        image: vk::Image,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, Error> {
        let view = create_view(&device, image, format, 1)?;
        Ok(Self {
            device,
            image,
            memory: None,
            view,
            width,
            height,
            format,
            mip_levels: 1,
            presentable: true,
            owns_image: false,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            generation: AtomicU32::new(0),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn presentable(&self) -> bool {
        self.presentable
    }

    pub(crate) fn raw(&self) -> vk::Image {
        self.image
    }

    pub(crate) fn view(&self) -> vk::ImageView {
        self.view
    }

    pub(crate) fn current_layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    pub(crate) fn set_layout(&self, layout: vk::ImageLayout) {
        *self.layout.lock() = layout;
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: no command buffer references `self.view`/`self.image` after
        // this point; callers must have synchronized any in-flight GPU use.
        unsafe {
            self.device.device.destroy_image_view(self.view, ALLOC);
            if self.owns_image {
                self.device.device.destroy_image(self.image, ALLOC);
                if let Some(memory) = self.memory {
                    self.device.device.free_memory(memory, ALLOC);
                }
            }
        }
    }
}

fn create_view(
    device: &Arc<DeviceHandle>,
    image: vk::Image,
    format: PixelFormat,
    mip_levels: u32,
) -> Result<vk::ImageView, Error> {
    let aspect_mask = if format.is_depth() {
        if format == PixelFormat::Depth24Stencil8 {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format.to_vk())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });
    // SAFETY: `image` is a live, fully bound 2D image with `mip_levels` levels.
    unsafe { Ok(device.device.create_image_view(&info, ALLOC)?) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_match_floor_log2_plus_one() {
        assert_eq!(mip_level_count(512, 512, true), 10);
        assert_eq!(mip_level_count(1, 1, true), 1);
        assert_eq!(mip_level_count(1024, 3, true), 11);
        assert_eq!(mip_level_count(512, 512, false), 1);
    }
}
