//! Fixed-function state, descriptor/pipeline layout and the dynamic-rendering
//! graphics pipeline built from a pair of reflected shader modules (§4.7).

use std::sync::Arc;
use std::thread;

use ash::vk;

use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;
use crate::framebuffer::FramebufferSignature;
use crate::reflect::{CompiledShaderModule, DescriptorKind};
use crate::shader::Stage;
use crate::types::AttributeFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

impl CullMode {
    fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

impl FrontFace {
    fn to_vk(self) -> vk::FrontFace {
        match self {
            Self::Clockwise => vk::FrontFace::CLOCKWISE,
            Self::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    fn to_vk(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
            Self::Point => vk::PolygonMode::POINT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

impl PrimitiveTopology {
    fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DepthTest {
    pub compare_op: CompareOp,
    pub write_enable: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StencilTest {
    pub compare_op: CompareOp,
    pub reference: u32,
    pub compare_mask: u32,
    pub write_mask: u32,
}

/// Straight alpha-blend or no blending; §4.7 does not ask for a general
/// blend-equation surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendState {
    AlphaBlend,
}

#[derive(Clone)]
pub struct PipelineStateDescriptor {
    pub vertex_shader: Arc<CompiledShaderModule>,
    pub fragment_shader: Arc<CompiledShaderModule>,
    pub framebuffer_signature: FramebufferSignature,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    pub topology: PrimitiveTopology,
    pub depth_test: Option<DepthTest>,
    pub stencil_test: Option<StencilTest>,
    pub blend: Option<BlendState>,
}

/// A linked graphics pipeline plus the descriptor set layouts its shaders'
/// reflected bindings require, rendered with dynamic rendering against a
/// matching [`FramebufferSignature`] (§3, §4.7).
pub struct PipelineState {
    device: Arc<DeviceHandle>,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    framebuffer_signature: FramebufferSignature,
}

impl PipelineState {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        desc: PipelineStateDescriptor,
    ) -> Result<Self, Error> {
        if desc.vertex_shader.stage() != Stage::Vertex {
            return Err(Error::InternalError);
        }
        if desc.fragment_shader.stage() != Stage::Fragment {
            return Err(Error::InternalError);
        }

        let merged_bindings = merge_descriptor_bindings(&desc)?;
        let descriptor_set_layouts =
            build_descriptor_set_layouts(&device, &merged_bindings)?;

        let set_layout_handles: Vec<vk::DescriptorSetLayout> =
            descriptor_set_layouts.clone();
        let layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layout_handles);
        // SAFETY: `layout_info` references `set_layout_handles`, which
        // outlives this call.
        let pipeline_layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, ALLOC)
                .map_err(|_| {
                    destroy_layouts(&device, &descriptor_set_layouts);
                    Error::InternalError
                })?
        };

        match Self::build_pipeline(&device, &desc, pipeline_layout) {
            Ok(pipeline) => Ok(Self {
                device,
                pipeline,
                pipeline_layout,
                descriptor_set_layouts,
                framebuffer_signature: desc.framebuffer_signature,
            }),
            Err(e) => {
                // SAFETY: `pipeline_layout`/`descriptor_set_layouts` were just
                // created above and are not referenced by anything else yet.
                unsafe {
                    device.device.destroy_pipeline_layout(pipeline_layout, ALLOC);
                }
                destroy_layouts(&device, &descriptor_set_layouts);
                Err(e)
            }
        }
    }

    fn build_pipeline(
        device: &Arc<DeviceHandle>,
        desc: &PipelineStateDescriptor,
        pipeline_layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, Error> {
        let vertex_module = create_shader_module(device, desc.vertex_shader.spirv_bytes())?;
        let fragment_module = create_shader_module(device, desc.fragment_shader.spirv_bytes())?;

        let result = (|| {
            let entry_point = std::ffi::CString::new("main").unwrap();
            let stages = [
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::VERTEX)
                    .module(vertex_module)
                    .name(&entry_point),
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment_module)
                    .name(&entry_point),
            ];

            let (bindings, attributes) =
                vertex_input_state(desc.vertex_shader.input_attribute_layout());
            let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes);

            let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(desc.topology.to_vk());

            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1);

            let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(desc.polygon_mode.to_vk())
                .cull_mode(desc.cull_mode.to_vk())
                .front_face(desc.front_face.to_vk())
                .line_width(1.0);

            let multisample = vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1);

            let mut depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default();
            if let Some(depth) = desc.depth_test {
                depth_stencil = depth_stencil
                    .depth_test_enable(true)
                    .depth_write_enable(depth.write_enable)
                    .depth_compare_op(depth.compare_op.to_vk());
            }
            if let Some(stencil) = desc.stencil_test {
                let face = vk::StencilOpState::default()
                    .compare_op(stencil.compare_op.to_vk())
                    .reference(stencil.reference)
                    .compare_mask(stencil.compare_mask)
                    .write_mask(stencil.write_mask)
                    .fail_op(vk::StencilOp::KEEP)
                    .pass_op(vk::StencilOp::REPLACE)
                    .depth_fail_op(vk::StencilOp::KEEP);
                depth_stencil = depth_stencil
                    .stencil_test_enable(true)
                    .front(face)
                    .back(face);
            }

            let blend_attachment = match desc.blend {
                Some(BlendState::AlphaBlend) => vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(true)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(vk::ColorComponentFlags::RGBA),
                None => vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA),
            };
            let color_attachment_count = desc.framebuffer_signature.color_formats.len();
            let blend_attachments = vec![blend_attachment; color_attachment_count];
            let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
                .attachments(&blend_attachments);

            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic_state =
                vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

            let color_formats: Vec<vk::Format> = desc
                .framebuffer_signature
                .color_formats
                .iter()
                .map(|f| f.to_vk())
                .collect();
            let depth_format = desc
                .framebuffer_signature
                .depth_stencil_format
                .map(|f| f.to_vk())
                .unwrap_or(vk::Format::UNDEFINED);
            let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
                .color_attachment_formats(&color_formats)
                .depth_attachment_format(depth_format);

            let create_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&stages)
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization)
                .multisample_state(&multisample)
                .depth_stencil_state(&depth_stencil)
                .color_blend_state(&color_blend)
                .dynamic_state(&dynamic_state)
                .layout(pipeline_layout)
                .push_next(&mut rendering_info);

            // SAFETY: every referenced create-info struct is fully populated
            // and kept alive for the duration of this call; `pipeline_layout`
            // was just created above.
            unsafe {
                device
                    .device
                    .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], ALLOC)
                    .map_err(|(_, e)| Error::from(e))
                    .map(|pipelines| pipelines[0])
            }
        })();

        // SAFETY: shader modules are only needed for pipeline creation; once
        // it has returned (success or failure) they can be destroyed.
        unsafe {
            device.device.destroy_shader_module(vertex_module, ALLOC);
            device.device.destroy_shader_module(fragment_module, ALLOC);
        }

        result
    }

    pub fn framebuffer_signature(&self) -> &FramebufferSignature {
        &self.framebuffer_signature
    }

    pub(crate) fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub(crate) fn descriptor_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.descriptor_set_layouts
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: no command buffer records with this pipeline after this
        // point; callers must have synchronized any in-flight use.
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, ALLOC);
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, ALLOC);
        }
        destroy_layouts(&self.device, &self.descriptor_set_layouts);
    }
}

fn destroy_layouts(device: &Arc<DeviceHandle>, layouts: &[vk::DescriptorSetLayout]) {
    // SAFETY: these layouts are owned solely by the `PipelineState` being
    // torn down and are not referenced by any live descriptor set.
    unsafe {
        for &layout in layouts {
            device.device.destroy_descriptor_set_layout(layout, ALLOC);
        }
    }
}

fn create_shader_module(device: &Arc<DeviceHandle>, spirv: &[u32]) -> Result<vk::ShaderModule, Error> {
    let info = vk::ShaderModuleCreateInfo::default().code(spirv);
    // SAFETY: `spirv` is a complete SPIR-V module as produced by the
    // compiler in `crate::shader::spirv`.
    unsafe { Ok(device.device.create_shader_module(&info, ALLOC)?) }
}

fn vertex_input_state(
    inputs: &[crate::reflect::InterfaceVariable],
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    // One binding per reflected input location, tightly packed; callers bind
    // a `BufferView` per vertex attribute at draw time (§4.9), so there is no
    // interleaved-vertex-buffer concept to reflect here.
    let mut bindings = Vec::with_capacity(inputs.len());
    let mut attributes = Vec::with_capacity(inputs.len());
    for input in inputs {
        let format = attribute_format_to_vk(input.format);
        bindings.push(
            vk::VertexInputBindingDescription::default()
                .binding(input.location)
                .stride(input.format.size() as u32)
                .input_rate(vk::VertexInputRate::VERTEX),
        );
        attributes.push(
            vk::VertexInputAttributeDescription::default()
                .location(input.location)
                .binding(input.location)
                .format(format)
                .offset(0),
        );
    }
    (bindings, attributes)
}

fn attribute_format_to_vk(format: AttributeFormat) -> vk::Format {
    match format {
        AttributeFormat::Uint16 => vk::Format::R16_UINT,
        AttributeFormat::Uint32 => vk::Format::R32_UINT,
        AttributeFormat::Sint16 => vk::Format::R16_SINT,
        AttributeFormat::Sint32 => vk::Format::R32_SINT,
        AttributeFormat::Float32 => vk::Format::R32_SFLOAT,
        AttributeFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        AttributeFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        AttributeFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

struct MergedBinding {
    set: u32,
    binding: u32,
    kind: DescriptorKind,
}

/// Unions the vertex and fragment shaders' reflected descriptor bindings;
/// a binding index shared by both stages must agree on its kind (§4.7).
fn merge_descriptor_bindings(desc: &PipelineStateDescriptor) -> Result<Vec<MergedBinding>, Error> {
    let mut merged: Vec<MergedBinding> = Vec::new();
    for shader in [&desc.vertex_shader, &desc.fragment_shader] {
        for binding in shader.descriptor_binding_layout() {
            if let Some(existing) = merged
                .iter()
                .find(|m| m.set == binding.set && m.binding == binding.binding)
            {
                if existing.kind != binding.kind {
                    return Err(Error::InternalError);
                }
                continue;
            }
            merged.push(MergedBinding {
                set: binding.set,
                binding: binding.binding,
                kind: binding.kind.clone(),
            });
        }
    }
    Ok(merged)
}

fn build_descriptor_set_layouts(
    device: &Arc<DeviceHandle>,
    merged: &[MergedBinding],
) -> Result<Vec<vk::DescriptorSetLayout>, Error> {
    let set_count = merged.iter().map(|m| m.set).max().map_or(0, |m| m + 1);
    let mut layouts = Vec::with_capacity(set_count as usize);

    for set in 0..set_count {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = merged
            .iter()
            .filter(|m| m.set == set)
            .map(|m| {
                let descriptor_type = match &m.kind {
                    DescriptorKind::UniformBlock(_) => vk::DescriptorType::UNIFORM_BUFFER,
                    DescriptorKind::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
                    DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
                    DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
                    DescriptorKind::CombinedImageSampler => {
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    }
                };
                vk::DescriptorSetLayoutBinding::default()
                    .binding(m.binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL_GRAPHICS)
            })
            .collect();

        // Set 0 is reserved for `CommandBuffer::bind_descriptor`'s push
        // descriptors (§4.9); it cannot also be allocated from a
        // `DescriptorSetPool` (`vkAllocateDescriptorSets` rejects a
        // PUSH_DESCRIPTOR_KHR layout).
        let flags = if set == 0 {
            vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR
        } else {
            vk::DescriptorSetLayoutCreateFlags::empty()
        };
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(flags);
        // SAFETY: `info` is a valid descriptor set layout create info.
        let layout = unsafe {
            device.device.create_descriptor_set_layout(&info, ALLOC).map_err(|e| {
                destroy_layouts(device, &layouts);
                Error::from(e)
            })?
        };
        layouts.push(layout);
    }

    Ok(layouts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cull_mode_maps_to_vk() {
        assert_eq!(CullMode::None.to_vk(), vk::CullModeFlags::NONE);
        assert_eq!(CullMode::Back.to_vk(), vk::CullModeFlags::BACK);
    }
}
