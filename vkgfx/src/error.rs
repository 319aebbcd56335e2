use thiserror::Error;

/// Error returned by [`Buffer`](crate::buffer::Buffer) creation.
#[derive(Copy, Clone, Debug, Error)]
pub enum BufferError {
    #[error("buffer size must be non-zero")]
    InvalidSize,
    #[error("out of device memory")]
    OutOfMemory,
    #[error("internal error")]
    InternalError,
}

/// Error returned by [`BufferView`](crate::buffer::BufferView) construction.
#[derive(Copy, Clone, Debug, Error)]
pub enum BufferViewError {
    #[error("buffer view does not fit inside its backing buffer")]
    InvalidBuffer,
    #[error("buffer view count must be non-zero")]
    InvalidSize,
    #[error("buffer view is empty")]
    EmptyView,
    #[error("index buffer view stride must be 0 or sizeof(attribute)")]
    InvalidStride,
}

#[derive(Copy, Clone, Debug, Error)]
pub enum FramebufferError {
    #[error("internal error")]
    InternalError,
    #[error("duplicate color attachments")]
    DuplicateColorAttachments,
    #[error("color attachment has a non-color pixel format")]
    InvalidColorAttachmentFormat,
    #[error("depth/stencil attachment has a non-depth pixel format")]
    InvalidDepthStencilAttachmentFormat,
}

/// Generic error kind shared by the resources whose only failure mode is an
/// opaque internal/driver failure (ShaderModule, PipelineState, DescriptorSet,
/// Fence, Semaphore, Image, Sampler, CommandBuffer, Swapchain, Context).
#[derive(Copy, Clone, Debug, Error)]
pub enum Error {
    #[error("internal error")]
    InternalError,
    #[error("out of device memory")]
    OutOfMemory,
    #[error("device is lost")]
    DeviceLost,
}

impl From<ash::vk::Result> for Error {
    fn from(value: ash::vk::Result) -> Self {
        match value {
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfMemory,
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            _ => Self::InternalError,
        }
    }
}

/// Error surfaced by the shader expression-graph compiler.
#[derive(Clone, Debug, Error)]
pub enum CompileError {
    #[error("shader program is missing a vertex module")]
    MissingVertexModule,
    #[error("shader program is missing a fragment module")]
    MissingFragmentModule,
    #[error("input attribute `{0}` has no matching output in the previous stage")]
    UnmatchedInputAttribute(String),
    #[error("GLSL to SPIR-V compilation failed: {0}")]
    ToolchainError(String),
}

/// Error surfaced by SPIR-V reflection.
#[derive(Clone, Debug, Error)]
pub enum ReflectError {
    #[error("module is not valid SPIR-V")]
    BadMagic,
    #[error("module contains no entry point")]
    NoEntryPoint,
    #[error("unsupported interface format on variable `{0}`")]
    UnsupportedFormat(String),
    #[error("unsupported block member type")]
    UnsupportedBlockMember,
    #[error("malformed SPIR-V: {0}")]
    Malformed(String),
}
