//! Command buffer recording: the state machine and the render/copy/barrier
//! operations it exposes (§4.9).

use std::sync::Arc;
use std::thread;

use ash::vk;
use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferView};
use crate::context::{DeviceHandle, ALLOC};
use crate::descriptor::{DescriptorResource, DescriptorSet};
use crate::error::Error;
use crate::framebuffer::Framebuffer;
use crate::image::{FilterMode, Image};
use crate::pipeline::PipelineState;
use crate::staging::StagingPool;
use crate::types::IndexFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

impl LoadOp {
    fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Load => vk::AttachmentLoadOp::LOAD,
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

impl StoreOp {
    fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            Self::Store => vk::AttachmentStoreOp::STORE,
            Self::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ColorAttachmentOp {
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: [f32; 4],
}

#[derive(Copy, Clone, Debug)]
pub struct DepthAttachmentOp {
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: f32,
}

pub struct RenderPassDescriptor<'a> {
    pub framebuffer: &'a Framebuffer,
    pub color_ops: Vec<ColorAttachmentOp>,
    pub depth_op: Option<DepthAttachmentOp>,
}

/// Whether `set_viewport`'s `y`/`height` describe a Y-up (OpenGL-style) or
/// Y-down (Vulkan-native) viewport; Y-up is implemented with Vulkan's
/// negative-viewport-height trick (§4.9, §6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewportOrientation {
    YUp,
    YDown,
}

/// Records Vulkan commands through an explicit Initial → Recording →
/// Executable → Pending lifecycle, mirroring `VkCommandBuffer`'s own state
/// machine (§3, §4.9). A command buffer that fails to record (e.g. a
/// rejected operation) moves to `Invalid` and can no longer be recorded
/// into or submitted.
pub struct CommandBuffer {
    device: Arc<DeviceHandle>,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    state: CommandBufferState,
    staging_pool: Arc<StagingPool>,
    staging_buffers: Mutex<Vec<Arc<Buffer>>>,
    bound_pipeline_layout: Option<vk::PipelineLayout>,
    /// Descriptors cached by [`Self::bind_descriptor`], pushed at set 0 via
    /// `VK_KHR_push_descriptor` on the next draw (§4.9).
    pending_descriptors: Vec<(u32, DescriptorResource)>,
}

impl CommandBuffer {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        pool: vk::CommandPool,
        command_buffer: vk::CommandBuffer,
        staging_pool: Arc<StagingPool>,
    ) -> Self {
        Self {
            device,
            pool,
            command_buffer,
            state: CommandBufferState::Initial,
            staging_pool,
            staging_buffers: Mutex::new(Vec::new()),
            bound_pipeline_layout: None,
            pending_descriptors: Vec::new(),
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub(crate) fn raw(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Takes ownership of the staging buffers this recording referenced, for
    /// the submitting `CommandQueue` to hand to its reclamation worker.
    pub(crate) fn take_staging_buffers(&self) -> Vec<Arc<Buffer>> {
        std::mem::take(&mut self.staging_buffers.lock())
    }

    pub fn begin(&mut self) -> Result<(), Error> {
        if !matches!(
            self.state,
            CommandBufferState::Initial | CommandBufferState::Executable
        ) {
            return Err(Error::InternalError);
        }
        if self.state == CommandBufferState::Executable {
            // SAFETY: the pool was created with RESET_COMMAND_BUFFER.
            unsafe {
                self.device
                    .device
                    .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            }
        }

        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: `self.command_buffer` is in the Initial state per the check above.
        let result = unsafe { self.device.device.begin_command_buffer(self.command_buffer, &info) };
        match result {
            Ok(()) => {
                self.state = CommandBufferState::Recording;
                Ok(())
            }
            Err(e) => {
                self.state = CommandBufferState::Invalid;
                Err(Error::from(e))
            }
        }
    }

    pub fn end(&mut self) -> Result<(), Error> {
        if self.state != CommandBufferState::Recording {
            return Err(Error::InternalError);
        }
        // SAFETY: `self.command_buffer` is in the Recording state.
        match unsafe { self.device.device.end_command_buffer(self.command_buffer) } {
            Ok(()) => {
                self.state = CommandBufferState::Executable;
                Ok(())
            }
            Err(e) => {
                self.state = CommandBufferState::Invalid;
                Err(Error::from(e))
            }
        }
    }

    fn require_recording(&self) -> Result<(), Error> {
        if self.state == CommandBufferState::Recording {
            Ok(())
        } else {
            Err(Error::InternalError)
        }
    }

    pub fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_>) -> Result<(), Error> {
        self.require_recording()?;
        if desc.color_ops.len() != desc.framebuffer.color_attachments().len() {
            return Err(Error::InternalError);
        }

        let mut color_attachments = Vec::with_capacity(desc.color_ops.len());
        for (image, op) in desc
            .framebuffer
            .color_attachments()
            .iter()
            .zip(&desc.color_ops)
        {
            // Presentable images are already COLOR_ATTACHMENT_OPTIMAL by the
            // time a client records into them: the swapchain performs that
            // transition itself on acquire, and clients never issue it (§5).
            if !image.presentable() {
                self.transition_image(
                    image,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                );
            }
            let [r, g, b, a] = op.clear_value;
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(image.view())
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(op.load_op.to_vk())
                    .store_op(op.store_op.to_vk())
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: [r, g, b, a] },
                    }),
            );
        }

        let mut depth_attachment = vk::RenderingAttachmentInfo::default();
        let has_depth = if let (Some(image), Some(op)) =
            (desc.framebuffer.depth_attachment(), &desc.depth_op)
        {
            self.transition_image(
                image,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );
            depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(image.view())
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(op.load_op.to_vk())
                .store_op(op.store_op.to_vk())
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: op.clear_value,
                        stencil: 0,
                    },
                });
            true
        } else {
            false
        };

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: desc.framebuffer.width(),
                height: desc.framebuffer.height(),
            },
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if has_depth {
            rendering_info = rendering_info.depth_attachment(&depth_attachment);
        }

        // SAFETY: `self.command_buffer` is recording; every referenced
        // attachment image was just transitioned into a matching layout.
        unsafe {
            self.device
                .dynamic_rendering
                .cmd_begin_rendering(self.command_buffer, &rendering_info);
        }
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<(), Error> {
        self.require_recording()?;
        // SAFETY: a matching `cmd_begin_rendering` call preceded this one.
        unsafe {
            self.device
                .dynamic_rendering
                .cmd_end_rendering(self.command_buffer);
        }
        // Presentable images stay in COLOR_ATTACHMENT_OPTIMAL here; the
        // swapchain's own present-side command buffer transitions them to
        // PRESENT_SRC_KHR (§4.12, §5).
        Ok(())
    }

    pub fn bind_pipeline(&mut self, pipeline: &PipelineState) -> Result<(), Error> {
        self.require_recording()?;
        // SAFETY: `self.command_buffer` is recording inside a render pass.
        unsafe {
            self.device.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw(),
            );
        }
        self.bound_pipeline_layout = Some(pipeline.layout());
        Ok(())
    }

    pub fn bind_descriptor_set(&mut self, set_index: u32, set: &DescriptorSet) -> Result<(), Error> {
        self.require_recording()?;
        let Some(layout) = self.bound_pipeline_layout else {
            return Err(Error::InternalError);
        };
        let sets = [set.raw()];
        // SAFETY: `layout` is the layout of the currently bound pipeline,
        // and `set` was allocated against a compatible descriptor set layout.
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &sets,
                &[],
            );
        }
        Ok(())
    }

    /// Caches `resource` at `binding`, replacing whatever was previously
    /// cached there. Nothing is pushed to the device until the next draw
    /// call, which pushes every cached binding at once via push descriptors
    /// (§4.9).
    pub fn bind_descriptor(&mut self, binding: u32, resource: DescriptorResource) -> Result<(), Error> {
        self.require_recording()?;
        if let Some(slot) = self.pending_descriptors.iter_mut().find(|(b, _)| *b == binding) {
            slot.1 = resource;
        } else {
            self.pending_descriptors.push((binding, resource));
        }
        Ok(())
    }

    /// Pushes every descriptor cached by [`Self::bind_descriptor`] to set 0
    /// of the bound pipeline's layout, which must have been built with a
    /// `PUSH_DESCRIPTOR_KHR` set 0 layout.
    fn flush_pending_descriptors(&mut self) -> Result<(), Error> {
        if self.pending_descriptors.is_empty() {
            return Ok(());
        }
        let Some(layout) = self.bound_pipeline_layout else {
            return Err(Error::InternalError);
        };

        let mut buffer_infos = Vec::with_capacity(self.pending_descriptors.len());
        let mut image_infos = Vec::with_capacity(self.pending_descriptors.len());
        for (binding, resource) in &self.pending_descriptors {
            match resource {
                DescriptorResource::UniformBuffer { buffer, offset, range }
                | DescriptorResource::StorageBuffer { buffer, offset, range } => {
                    buffer_infos.push((
                        *binding,
                        matches!(resource, DescriptorResource::StorageBuffer { .. }),
                        vk::DescriptorBufferInfo::default()
                            .buffer(buffer.raw())
                            .offset(*offset)
                            .range(*range),
                    ));
                }
                DescriptorResource::Sampler(sampler) => {
                    image_infos.push((
                        *binding,
                        vk::DescriptorType::SAMPLER,
                        vk::DescriptorImageInfo::default().sampler(sampler.raw()),
                    ));
                }
                DescriptorResource::SampledImage(image) => {
                    image_infos.push((
                        *binding,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        vk::DescriptorImageInfo::default()
                            .image_view(image.view())
                            .image_layout(image.current_layout()),
                    ));
                }
                DescriptorResource::CombinedImageSampler { image, sampler } => {
                    image_infos.push((
                        *binding,
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        vk::DescriptorImageInfo::default()
                            .image_view(image.view())
                            .image_layout(image.current_layout())
                            .sampler(sampler.raw()),
                    ));
                }
            }
        }

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
        for (binding, is_storage, info) in &buffer_infos {
            let descriptor_type = if *is_storage {
                vk::DescriptorType::STORAGE_BUFFER
            } else {
                vk::DescriptorType::UNIFORM_BUFFER
            };
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_binding(*binding)
                    .descriptor_type(descriptor_type)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (binding, descriptor_type, info) in &image_infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_binding(*binding)
                    .descriptor_type(*descriptor_type)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        // SAFETY: `self.command_buffer` is recording; `layout` is the bound
        // pipeline's layout, whose set 0 was built with PUSH_DESCRIPTOR_KHR;
        // every resource referenced by `writes` is kept alive by
        // `self.pending_descriptors` until this call returns.
        unsafe {
            self.device.push_descriptor.cmd_push_descriptor_set(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &writes,
            );
        }
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, view: &BufferView) -> Result<(), Error> {
        self.require_recording()?;
        let buffers = [view.buffer().raw()];
        let offsets = [view.offset()];
        // SAFETY: `view`'s buffer outlives this command buffer's execution;
        // callers are required to keep it alive until the GPU is done.
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.command_buffer, binding, &buffers, &offsets);
        }
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, view: &BufferView, format: IndexFormat) -> Result<(), Error> {
        self.require_recording()?;
        // SAFETY: see `bind_vertex_buffer`.
        unsafe {
            self.device.device.cmd_bind_index_buffer(
                self.command_buffer,
                view.buffer().raw(),
                view.offset(),
                format.to_vk(),
            );
        }
        Ok(())
    }

    /// `orientation` selects Y-up or Y-down viewport semantics; Y-up flips
    /// the Vulkan viewport via a negative height starting at `y + height`
    /// (§4.9, §6).
    pub fn set_viewport(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        orientation: ViewportOrientation,
    ) -> Result<(), Error> {
        self.require_recording()?;
        if width <= 0.0 || height <= 0.0 {
            return Err(Error::InternalError);
        }

        let viewport = match orientation {
            ViewportOrientation::YDown => vk::Viewport {
                x,
                y,
                width,
                height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            ViewportOrientation::YUp => vk::Viewport {
                x,
                y: y + height,
                width,
                height: -height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D {
                width: width as u32,
                height: height as u32,
            },
        };
        // SAFETY: `self.command_buffer` is recording; VIEWPORT/SCISSOR were
        // declared dynamic on the bound pipeline.
        unsafe {
            self.device
                .device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device
                .device
                .cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), Error> {
        self.require_recording()?;
        self.flush_pending_descriptors()?;
        // SAFETY: a pipeline, vertex buffers and an index buffer were bound
        // by the caller before this call, per the Vulkan draw preconditions.
        unsafe {
            self.device.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    /// Clears a non-presentable image to `color`. Presentable images are
    /// owned by a swapchain's acquire/present cycle and cannot be cleared
    /// outside a render pass (§4.9).
    pub fn clear_image(&mut self, image: &Image, color: [f32; 4]) -> Result<(), Error> {
        self.require_recording()?;
        if image.presentable() {
            return Err(Error::InternalError);
        }

        self.transition_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: image.mip_levels(),
            base_array_layer: 0,
            layer_count: 1,
        };
        let [r, g, b, a] = color;
        // SAFETY: `image` was just transitioned to TRANSFER_DST_OPTIMAL.
        unsafe {
            self.device.device.cmd_clear_color_image(
                self.command_buffer,
                image.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: [r, g, b, a] },
                &[range],
            );
        }
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), Error> {
        self.require_recording()?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        // SAFETY: offsets/size were validated by the caller against both
        // buffers' sizes; both outlive this recording.
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(self.command_buffer, src.raw(), dst.raw(), &[region]);
        }
        Ok(())
    }

    /// Copies the full extent of mip level 0 from `src` to `dst`, transitioning
    /// both images around the copy. Unlike [`Self::blit_image`] this requires
    /// `src` and `dst` to share the same dimensions and does not scale (§4.9).
    pub fn copy_image(&mut self, src: &Image, dst: &Image) -> Result<(), Error> {
        self.require_recording()?;
        if src.width() != dst.width() || src.height() != dst.height() {
            return Err(Error::InternalError);
        }

        self.transition_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        );
        self.transition_image(
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );

        let region = vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offset: vk::Offset3D::default(),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: src.width(),
                height: src.height(),
                depth: 1,
            },
        };
        // SAFETY: both images were just transitioned to matching transfer layouts.
        unsafe {
            self.device.device.cmd_copy_image(
                self.command_buffer,
                src.raw(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    /// Uploads `data` to `buffer` at `offset` via a pooled staging buffer.
    pub fn update_buffer_data(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        self.require_recording()?;
        let staging = self
            .staging_pool
            .request_buffer(data.len() as u64)
            .map_err(|_| Error::OutOfMemory)?;
        {
            let mut mapped = staging.map().ok_or(Error::InternalError)?;
            mapped.as_mut_slice()[..data.len()].copy_from_slice(data);
        }
        staging.unmap();

        self.copy_buffer(&staging, buffer, 0, offset, data.len() as u64)?;
        self.staging_buffers.lock().push(staging);
        Ok(())
    }

    /// Uploads `data` into mip level 0 of `image` via a pooled staging
    /// buffer, then generates the remaining mip levels by blitting
    /// successive levels down (§4.9).
    pub fn update_image_data(&mut self, image: &Arc<Image>, data: &[u8]) -> Result<(), Error> {
        self.require_recording()?;
        let staging = self
            .staging_pool
            .request_buffer(data.len() as u64)
            .map_err(|_| Error::OutOfMemory)?;
        {
            let mut mapped = staging.map().ok_or(Error::InternalError)?;
            mapped.as_mut_slice()[..data.len()].copy_from_slice(data);
        }
        staging.unmap();

        self.transition_image(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: image.width(),
                height: image.height(),
                depth: 1,
            },
        };
        // SAFETY: `image` was just transitioned to TRANSFER_DST_OPTIMAL and
        // `staging` holds exactly the bytes this region reads.
        unsafe {
            self.device.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                staging.raw(),
                image.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        self.staging_buffers.lock().push(staging);

        if image.mip_levels() > 1 {
            self.generate_mip_maps(image)
        } else {
            self.transition_image(
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            );
            Ok(())
        }
    }

    /// Blits mip level `n-1` into level `n` for every level after the first,
    /// leaving every level in `SHADER_READ_ONLY_OPTIMAL` (§4.9).
    pub fn generate_mip_maps(&mut self, image: &Arc<Image>) -> Result<(), Error> {
        self.require_recording()?;
        let levels = image.mip_levels();
        let mut src_width = image.width() as i32;
        let mut src_height = image.height() as i32;

        for level in 1..levels {
            self.transition_mip_level(
                image,
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            );
            self.transition_mip_level(
                image,
                level,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            );

            let dst_width = (src_width / 2).max(1);
            let dst_height = (src_height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_width,
                        y: src_height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_width,
                        y: dst_height,
                        z: 1,
                    },
                ],
            };
            // SAFETY: both mip levels were just transitioned to matching
            // transfer layouts above.
            unsafe {
                self.device.device.cmd_blit_image(
                    self.command_buffer,
                    image.raw(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.raw(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            self.transition_mip_level(
                image,
                level - 1,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            );

            src_width = dst_width;
            src_height = dst_height;
        }

        self.transition_mip_level(
            image,
            levels - 1,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        );
        image.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(())
    }

    pub fn blit_image(&mut self, src: &Image, dst: &Image, filter: FilterMode) -> Result<(), Error> {
        self.require_recording()?;
        self.transition_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        );
        self.transition_image(
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        );

        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src.width() as i32,
                    y: src.height() as i32,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst.width() as i32,
                    y: dst.height() as i32,
                    z: 1,
                },
            ],
        };
        // SAFETY: both images were just transitioned to matching transfer layouts.
        unsafe {
            self.device.device.cmd_blit_image(
                self.command_buffer,
                src.raw(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.raw(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                filter.to_vk(),
            );
        }
        Ok(())
    }

    /// Inserts a full-resource barrier from `image`'s tracked layout to
    /// `new_layout`, then updates the tracked layout (§4.9).
    fn transition_image(
        &self,
        image: &Image,
        new_layout: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.transition_image_from(
            image,
            image.current_layout(),
            new_layout,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_WRITE,
            dst_stage,
            dst_access,
        );
    }

    /// Inserts a full-resource barrier from an explicit `old_layout` (rather
    /// than `image`'s tracked layout) to `new_layout`, then updates the
    /// tracked layout. Used by the swapchain's own acquire/present command
    /// buffers, where the true old layout is dictated by the presentation
    /// engine rather than by host-side tracking (§4.12).
    pub(crate) fn transition_image_from(
        &self,
        image: &Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let aspect_mask = if image.format().is_depth() {
            if image.format() == crate::types::PixelFormat::Depth24Stencil8 {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            } else {
                vk::ImageAspectFlags::DEPTH
            }
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(image.raw())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: image.mip_levels(),
                base_array_layer: 0,
                layer_count: 1,
            });
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: `self.command_buffer` is recording and `image` is alive
        // for the duration of this call.
        unsafe {
            self.device
                .device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
        image.set_layout(new_layout);
    }

    fn transition_mip_level(
        &self,
        image: &Image,
        level: u32,
        new_layout: vk::ImageLayout,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        // Per-level layout is not separately tracked; `generate_mip_maps`
        // drives every level through the same transfer/shader-read sequence
        // in lockstep, so using the whole image's tracked layout as the old
        // layout for the first transition of each level is correct.
        let old_layout = if level == 0 {
            image.current_layout()
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(image.raw())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: level,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: see `transition_image`.
        unsafe {
            self.device
                .device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if thread::panicking() || self.state == CommandBufferState::Pending {
            return;
        }
        // SAFETY: `self.command_buffer` was allocated from `self.pool` and
        // is not in use by the GPU (Pending state is excluded above).
        unsafe {
            self.device
                .device
                .free_command_buffers(self.pool, &[self.command_buffer]);
        }
    }
}
