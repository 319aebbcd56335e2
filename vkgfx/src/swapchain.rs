//! Platform surface creation and the presentable-image/framebuffer/sync-object
//! ring that backs a windowed render target (§4.12).

use std::sync::Arc;
use std::thread;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command::CommandBuffer;
use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;
use crate::framebuffer::{Framebuffer, FramebufferDescriptor};
use crate::image::{Image, ImageDescriptor};
use crate::queue::CommandQueue;
use crate::staging::StagingPool;
use crate::sync::Semaphore;
use crate::types::PixelFormat;

/// How the presentation engine paces image handoff; `Fifo` is the only mode
/// every Vulkan implementation is required to support (§4.12).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentMode {
    Fifo,
    FifoRelaxed,
    Mailbox,
    Immediate,
}

impl PresentMode {
    fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SwapchainDescriptor {
    pub width: u32,
    pub height: u32,
    pub present_mode: PresentMode,
    pub image_count: u32,
    pub depth_format: Option<PixelFormat>,
}

/// One acquired swapchain image, ready to be recorded into and presented
/// (§4.12).
pub struct AcquiredImage<'a> {
    pub index: u32,
    pub framebuffer: &'a Framebuffer,
    /// Signaled once the swapchain's own acquire-side barrier (UNDEFINED →
    /// COLOR_ATTACHMENT_OPTIMAL) has executed; clients wait on this before
    /// recording a render pass into the image.
    pub image_ready: &'a Semaphore,
    pub suboptimal: bool,
}

/// The presentable images backing a window, plus a per-image framebuffer and
/// the acquire/present semaphore ring (§3, §4.12).
///
/// `acquire_next_swapchain_image` retries on `ERROR_OUT_OF_DATE_KHR` by
/// recreating the swapchain in place and trying again, bounded rather than
/// recursive, so a surface stuck reporting out-of-date never overflows the
/// stack.
///
/// All presentable-image layout transitions are performed here, via their
/// own transient command buffers, never by client-recorded command buffers
/// (§5): acquire transitions UNDEFINED → COLOR_ATTACHMENT_OPTIMAL, present
/// transitions COLOR_ATTACHMENT_OPTIMAL → PRESENT_SRC.
pub struct Swapchain {
    device: Arc<DeviceHandle>,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: PixelFormat,
    depth_format: Option<PixelFormat>,
    present_mode: PresentMode,
    width: u32,
    height: u32,
    images: Vec<Arc<Image>>,
    framebuffers: Vec<Framebuffer>,
    /// Signaled by `vkAcquireNextImageKHR`; waited on by the acquire-side
    /// transition submission.
    image_acquired: Vec<Semaphore>,
    /// Signaled by the acquire-side transition submission; the client's
    /// visible "safe to render" signal (exposed as `AcquiredImage::image_ready`).
    image_ready: Vec<Semaphore>,
    /// Signaled by the present-side transition submission; waited on by the
    /// platform present call.
    image_presentable: Vec<Semaphore>,
    frame_index: usize,
    /// Ring slot used by the most recent `acquire_next_swapchain_image`
    /// call, read back by `present` to find the matching sync objects.
    current_ring_slot: usize,
}

/// Plain output of [`Swapchain::build`] — everything a fresh swapchain needs
/// besides the device/surface it was built against, which the caller
/// already owns.
struct BuiltSwapchain {
    swapchain: vk::SwapchainKHR,
    format: PixelFormat,
    present_mode: PresentMode,
    width: u32,
    height: u32,
    images: Vec<Arc<Image>>,
    framebuffers: Vec<Framebuffer>,
    image_acquired: Vec<Semaphore>,
    image_ready: Vec<Semaphore>,
    image_presentable: Vec<Semaphore>,
}

const MAX_ACQUIRE_RETRIES: u32 = 3;

impl Swapchain {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        desc: SwapchainDescriptor,
    ) -> Result<Self, Error> {
        let surface = create_surface(&device, display_handle, window_handle)?;

        match Self::build(&device, surface, &desc, vk::SwapchainKHR::null()) {
            Ok(built) => Ok(Self {
                device,
                surface,
                swapchain: built.swapchain,
                format: built.format,
                depth_format: desc.depth_format,
                present_mode: built.present_mode,
                width: built.width,
                height: built.height,
                images: built.images,
                framebuffers: built.framebuffers,
                image_acquired: built.image_acquired,
                image_ready: built.image_ready,
                image_presentable: built.image_presentable,
                frame_index: 0,
                current_ring_slot: 0,
            }),
            Err(e) => {
                // SAFETY: `surface` was just created above and no swapchain
                // was created from it yet.
                unsafe {
                    device
                        .surface_instance
                        .destroy_surface(surface, ALLOC);
                }
                Err(e)
            }
        }
    }

    /// Builds a new `VkSwapchainKHR` (plus its images/framebuffers/semaphores)
    /// against an existing surface, without taking ownership of anything
    /// that outlives the call. Used by both initial construction and
    /// `recreate`, which reuses the surface and retires the prior swapchain
    /// itself.
    fn build(
        device: &Arc<DeviceHandle>,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDescriptor,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<BuiltSwapchain, Error> {
        // SAFETY: `surface` is a live surface created against this instance.
        let capabilities = unsafe {
            device
                .surface_instance
                .get_physical_device_surface_capabilities(device.physical_device, surface)?
        };
        let formats = unsafe {
            device
                .surface_instance
                .get_physical_device_surface_formats(device.physical_device, surface)?
        };
        let present_modes = unsafe {
            device
                .surface_instance
                .get_physical_device_surface_present_modes(device.physical_device, surface)?
        };

        let surface_format = select_surface_format(&formats)?;
        let present_mode = if present_modes.contains(&desc.present_mode.to_vk()) {
            desc.present_mode
        } else {
            PresentMode::Fifo
        };

        let extent = clamp_extent(desc.width, desc.height, &capabilities);
        let image_count = desc
            .image_count
            .max(capabilities.min_image_count)
            .min(if capabilities.max_image_count == 0 {
                u32::MAX
            } else {
                capabilities.max_image_count
            });

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode.to_vk())
            .clipped(true)
            .old_swapchain(old_swapchain);

        // SAFETY: `info` references `surface`, a live surface on this device;
        // `old_swapchain` (if any) was created from the same surface.
        let swapchain = unsafe { device.swapchain_device.create_swapchain(&info, ALLOC)? };

        let build_result = Self::wrap_images(
            device,
            swapchain,
            surface_format.format,
            desc.depth_format,
            extent,
        );
        let (format, images, framebuffers) = match build_result {
            Ok(v) => v,
            Err(e) => {
                // SAFETY: `swapchain` was just created above and has no
                // remaining consumer.
                unsafe { device.swapchain_device.destroy_swapchain(swapchain, ALLOC) };
                return Err(e);
            }
        };

        let mut image_acquired = Vec::with_capacity(images.len());
        let mut image_ready = Vec::with_capacity(images.len());
        let mut image_presentable = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            image_acquired.push(Semaphore::new_binary(device.clone())?);
            image_ready.push(Semaphore::new_binary(device.clone())?);
            image_presentable.push(Semaphore::new_binary(device.clone())?);
        }

        Ok(BuiltSwapchain {
            swapchain,
            format,
            present_mode,
            width: extent.width,
            height: extent.height,
            images,
            framebuffers,
            image_acquired,
            image_ready,
            image_presentable,
        })
    }

    fn wrap_images(
        device: &Arc<DeviceHandle>,
        swapchain: vk::SwapchainKHR,
        vk_format: vk::Format,
        depth_format: Option<PixelFormat>,
        extent: vk::Extent2D,
    ) -> Result<(PixelFormat, Vec<Arc<Image>>, Vec<Framebuffer>), Error> {
        let format = PixelFormat::from_vk(vk_format).ok_or(Error::InternalError)?;

        // SAFETY: `swapchain` was just created against this device.
        let raw_images = unsafe { device.swapchain_device.get_swapchain_images(swapchain)? };

        let mut images = Vec::with_capacity(raw_images.len());
        for raw in raw_images {
            images.push(Arc::new(Image::from_swapchain_image(
                device.clone(),
                raw,
                extent.width,
                extent.height,
                format,
            )?));
        }

        let depth_image = match depth_format {
            Some(depth_format) => Some(Arc::new(Image::new(
                device.clone(),
                ImageDescriptor {
                    width: extent.width,
                    height: extent.height,
                    format: depth_format,
                    has_mips: false,
                },
            )?)),
            None => None,
        };

        let mut framebuffers = Vec::with_capacity(images.len());
        for image in &images {
            framebuffers.push(
                Framebuffer::new(FramebufferDescriptor {
                    color_attachments: vec![image.clone()],
                    depth_attachment: depth_image.clone(),
                })
                .map_err(|_| Error::InternalError)?,
            );
        }

        Ok((format, images, framebuffers))
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

    /// Acquires the next presentable image, recreating the swapchain in
    /// place (bounded, not recursive) whenever the presentation engine
    /// reports it out of date (§4.12).
    ///
    /// Records and submits a dedicated transient command buffer performing
    /// the UNDEFINED → COLOR_ATTACHMENT_OPTIMAL transition on the acquired
    /// image (§5: clients never issue presentable-image layout transitions
    /// themselves). That submission waits on `vkAcquireNextImageKHR`'s
    /// binary semaphore and signals `image_ready`, which the caller waits on
    /// before recording its own render pass.
    pub fn acquire_next_swapchain_image(
        &mut self,
        queue: &CommandQueue,
        staging_pool: &Arc<StagingPool>,
    ) -> Result<AcquiredImage<'_>, Error> {
        for _ in 0..MAX_ACQUIRE_RETRIES {
            let slot = self.frame_index;
            let acquired_semaphore = &self.image_acquired[slot];
            // SAFETY: `self.swapchain` is live; `acquired_semaphore` is not
            // currently the wait target of a pending acquire.
            let result = unsafe {
                self.device.swapchain_device.acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    acquired_semaphore.raw(),
                    vk::Fence::null(),
                )
            };

            match result {
                Ok((index, suboptimal)) => {
                    let image = &self.images[index as usize];

                    let mut command_buffer = queue.create_command_buffer(staging_pool.clone())?;
                    command_buffer.begin()?;
                    command_buffer.transition_image_from(
                        image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        vk::PipelineStageFlags2::TOP_OF_PIPE,
                        vk::AccessFlags2::empty(),
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    );
                    command_buffer.end()?;

                    queue.submit(
                        crate::queue::CommandBufferSubmitInfo {
                            command_buffer: &command_buffer,
                            wait_semaphores: vec![(
                                &self.image_acquired[slot],
                                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                            )],
                            signal_semaphores: vec![&self.image_ready[slot]],
                        },
                        None,
                    )?;

                    self.current_ring_slot = slot;
                    self.frame_index = (self.frame_index + 1) % self.images.len();
                    return Ok(AcquiredImage {
                        index,
                        framebuffer: &self.framebuffers[index as usize],
                        image_ready: &self.image_ready[slot],
                        suboptimal,
                    });
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.recreate(self.width, self.height)?;
                    continue;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
        Err(Error::InternalError)
    }

    /// Presents `index` on `queue` after waiting on `wait_semaphores` (the
    /// render-finished semaphore of the command buffer that drew into it).
    ///
    /// Records and submits a dedicated transient command buffer performing
    /// the COLOR_ATTACHMENT_OPTIMAL → PRESENT_SRC transition (§5), signaling
    /// `image_presentable`; the platform `vkQueuePresentKHR` call then waits
    /// on that semaphore rather than on the caller's semaphores directly,
    /// since presentation requires a binary wait semaphore signaled by work
    /// that has itself completed the transition.
    pub fn present(
        &self,
        queue: &CommandQueue,
        staging_pool: &Arc<StagingPool>,
        index: u32,
        wait_semaphores: &[&Semaphore],
    ) -> Result<bool, Error> {
        let slot = self.current_ring_slot;
        let image = &self.images[index as usize];

        let mut command_buffer = queue.create_command_buffer(staging_pool.clone())?;
        command_buffer.begin()?;
        command_buffer.transition_image_from(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::empty(),
        );
        command_buffer.end()?;

        let mut submit_waits: Vec<(&Semaphore, vk::PipelineStageFlags)> = wait_semaphores
            .iter()
            .map(|s| (*s, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT))
            .collect();
        if submit_waits.is_empty() {
            // No render work to wait on (e.g. nothing drawn this frame); still
            // order the transition after the acquire-side transition.
            submit_waits.push((
                &self.image_ready[slot],
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ));
        }

        queue.submit(
            crate::queue::CommandBufferSubmitInfo {
                command_buffer: &command_buffer,
                wait_semaphores: submit_waits,
                signal_semaphores: vec![&self.image_presentable[slot]],
            },
            None,
        )?;

        let raw_waits = [self.image_presentable[slot].raw()];
        let swapchains = [self.swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&raw_waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        // SAFETY: `index` was returned by a prior `acquire_next_swapchain_image`
        // on this swapchain and has not yet been presented; `queue` supports
        // presentation on this surface's family.
        let result = unsafe {
            self.device
                .swapchain_device
                .queue_present(queue.raw_for_present(), &info)
        };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn recreate(&mut self, width: u32, height: u32) -> Result<(), Error> {
        // SAFETY: the caller must ensure no command buffer referencing this
        // swapchain's images is still executing (§4.12 acquire/present
        // lifetime invariant).
        unsafe { self.device.device.device_wait_idle()? };

        let desc = SwapchainDescriptor {
            width,
            height,
            present_mode: self.present_mode,
            image_count: self.images.len() as u32,
            depth_format: self.depth_format,
        };

        self.framebuffers.clear();
        self.images.clear();
        self.image_acquired.clear();
        self.image_ready.clear();
        self.image_presentable.clear();

        let device = self.device.clone();
        let rebuilt = Self::build(&device, self.surface, &desc, self.swapchain)?;

        // SAFETY: `self.swapchain` was just superseded by `rebuilt.swapchain`
        // via `old_swapchain` above and has no remaining consumer.
        unsafe {
            self.device
                .swapchain_device
                .destroy_swapchain(self.swapchain, ALLOC);
        }

        self.swapchain = rebuilt.swapchain;
        self.format = rebuilt.format;
        self.width = rebuilt.width;
        self.height = rebuilt.height;
        self.images = rebuilt.images;
        self.framebuffers = rebuilt.framebuffers;
        self.image_acquired = rebuilt.image_acquired;
        self.image_ready = rebuilt.image_ready;
        self.image_presentable = rebuilt.image_presentable;
        self.frame_index = 0;
        self.current_ring_slot = 0;
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: every acquired image must have finished presenting before
        // the owning `Swapchain` is torn down, per §4.12.
        unsafe {
            self.device
                .swapchain_device
                .destroy_swapchain(self.swapchain, ALLOC);
            self.device
                .surface_instance
                .destroy_surface(self.surface, ALLOC);
        }
    }
}

fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, Error> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM || f.format == vk::Format::R8G8B8A8_UNORM)
        .or_else(|| formats.first())
        .copied()
        .ok_or(Error::InternalError)
}

fn clamp_extent(
    width: u32,
    height: u32,
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Creates a `VkSurfaceKHR` for `window_handle`/`display_handle` using
/// whichever platform surface extension matches the handle kind (§4.12).
fn create_surface(
    device: &DeviceHandle,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR, Error> {
    match (display_handle, window_handle) {
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let instance = ash::khr::wayland_surface::Instance::new(&device.entry, &device.instance);
            let info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            // SAFETY: `display`/`window` reference a live Wayland display and
            // surface for the lifetime of the returned `VkSurfaceKHR`.
            unsafe { Ok(instance.create_wayland_surface(&info, ALLOC)?) }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let instance = ash::khr::xlib_surface::Instance::new(&device.entry, &device.instance);
            let info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(display.display.map(|v| v.as_ptr()).unwrap_or(std::ptr::null_mut()))
                .window(window.window);
            // SAFETY: `display`/`window` reference a live Xlib display and
            // window for the lifetime of the returned `VkSurfaceKHR`.
            unsafe { Ok(instance.create_xlib_surface(&info, ALLOC)?) }
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let instance = ash::khr::xcb_surface::Instance::new(&device.entry, &device.instance);
            let info = vk::XcbSurfaceCreateInfoKHR::default()
                .connection(
                    display
                        .connection
                        .map(|v| v.as_ptr())
                        .unwrap_or(std::ptr::null_mut()),
                )
                .window(window.window.get());
            // SAFETY: see the Xlib branch above.
            unsafe { Ok(instance.create_xcb_surface(&info, ALLOC)?) }
        }
        #[cfg(windows)]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let instance = ash::khr::win32_surface::Instance::new(&device.entry, &device.instance);
            let info = vk::Win32SurfaceCreateInfoKHR::default()
                .hinstance(window.hinstance.map(|v| v.get()).unwrap_or_default() as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            // SAFETY: `window` references a live Win32 window for the
            // lifetime of the returned `VkSurfaceKHR`.
            unsafe { Ok(instance.create_win32_surface(&info, ALLOC)?) }
        }
        _ => Err(Error::InternalError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_extent_honors_current_extent_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let extent = clamp_extent(1920, 1080, &caps);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn clamp_extent_clamps_to_bounds_when_current_is_unset() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = clamp_extent(2000, 10, &caps);
        assert_eq!((extent.width, extent.height), (1024, 64));
    }
}
