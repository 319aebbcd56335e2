//! Pixel/attribute/uniform format enums and their byte-layout rules.

/// Color and depth/stencil formats a [`crate::image::Image`] can be created with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R8Unorm,
    R8Uint,
    R8Sint,
    R16Unorm,
    R16Uint,
    R16Sint,
    R32Uint,
    R32Sint,
    R32Float,
    Rg8Unorm,
    Rg16Float,
    Rg32Float,
    Rgb8Unorm,
    Rgb32Float,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    Depth16,
    Depth24Stencil8,
    Depth32Float,
}

impl PixelFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16 | Self::Depth24Stencil8 | Self::Depth32Float
        )
    }

    pub fn is_color(self) -> bool {
        !self.is_depth()
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Self::Rgba8Srgb | Self::Bgra8Srgb)
    }

    /// Size of a single texel in bytes.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm | Self::R8Uint | Self::R8Sint => 1,
            Self::R16Unorm | Self::R16Uint | Self::R16Sint | Self::Rg8Unorm | Self::Depth16 => 2,
            Self::R32Uint
            | Self::R32Sint
            | Self::R32Float
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::Depth24Stencil8 => 4,
            Self::Rgb8Unorm => 3,
            Self::Rg32Float | Self::Rgba16Float => 8,
            Self::Rgb32Float => 12,
            Self::Rgba32Float => 16,
            Self::Depth32Float => 4,
        }
    }

    pub(crate) fn to_vk(self) -> ash::vk::Format {
        use ash::vk::Format;
        match self {
            Self::R8Unorm => Format::R8_UNORM,
            Self::R8Uint => Format::R8_UINT,
            Self::R8Sint => Format::R8_SINT,
            Self::R16Unorm => Format::R16_UNORM,
            Self::R16Uint => Format::R16_UINT,
            Self::R16Sint => Format::R16_SINT,
            Self::R32Uint => Format::R32_UINT,
            Self::R32Sint => Format::R32_SINT,
            Self::R32Float => Format::R32_SFLOAT,
            Self::Rg8Unorm => Format::R8G8_UNORM,
            Self::Rg16Float => Format::R16G16_SFLOAT,
            Self::Rg32Float => Format::R32G32_SFLOAT,
            Self::Rgb8Unorm => Format::R8G8B8_UNORM,
            Self::Rgb32Float => Format::R32G32B32_SFLOAT,
            Self::Rgba8Unorm => Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => Format::B8G8R8A8_SRGB,
            Self::Rgba16Float => Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => Format::R32G32B32A32_SFLOAT,
            Self::Depth16 => Format::D16_UNORM,
            Self::Depth24Stencil8 => Format::D24_UNORM_S8_UINT,
            Self::Depth32Float => Format::D32_SFLOAT,
        }
    }

    /// Reverse of [`Self::to_vk`], used to classify the formats a surface
    /// reports when building a swapchain (§4.12). Returns `None` for a
    /// `vk::Format` this crate never produces.
    pub(crate) fn from_vk(format: ash::vk::Format) -> Option<Self> {
        use ash::vk::Format;
        Some(match format {
            Format::R8_UNORM => Self::R8Unorm,
            Format::R8_UINT => Self::R8Uint,
            Format::R8_SINT => Self::R8Sint,
            Format::R16_UNORM => Self::R16Unorm,
            Format::R16_UINT => Self::R16Uint,
            Format::R16_SINT => Self::R16Sint,
            Format::R32_UINT => Self::R32Uint,
            Format::R32_SINT => Self::R32Sint,
            Format::R32_SFLOAT => Self::R32Float,
            Format::R8G8_UNORM => Self::Rg8Unorm,
            Format::R16G16_SFLOAT => Self::Rg16Float,
            Format::R32G32_SFLOAT => Self::Rg32Float,
            Format::R8G8B8_UNORM => Self::Rgb8Unorm,
            Format::R32G32B32_SFLOAT => Self::Rgb32Float,
            Format::R8G8B8A8_UNORM => Self::Rgba8Unorm,
            Format::R8G8B8A8_SRGB => Self::Rgba8Srgb,
            Format::B8G8R8A8_UNORM => Self::Bgra8Unorm,
            Format::B8G8R8A8_SRGB => Self::Bgra8Srgb,
            Format::R16G16B16A16_SFLOAT => Self::Rgba16Float,
            Format::R32G32B32A32_SFLOAT => Self::Rgba32Float,
            Format::D16_UNORM => Self::Depth16,
            Format::D24_UNORM_S8_UINT => Self::Depth24Stencil8,
            Format::D32_SFLOAT => Self::Depth32Float,
            _ => return None,
        })
    }
}

/// Format of a single [`crate::buffer::BufferView`] element (vertex/index data).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    Uint16,
    Uint32,
    Sint16,
    Sint32,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl AttributeFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::Uint16 | Self::Sint16 => 2,
            Self::Uint32 | Self::Sint32 | Self::Float32 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }

    pub(crate) fn to_vk(self) -> ash::vk::Format {
        use ash::vk::Format;
        match self {
            Self::Uint16 => Format::R16_UINT,
            Self::Uint32 => Format::R32_UINT,
            Self::Sint16 => Format::R16_SINT,
            Self::Sint32 => Format::R32_SINT,
            Self::Float32 => Format::R32_SFLOAT,
            Self::Float32x2 => Format::R32G32_SFLOAT,
            Self::Float32x3 => Format::R32G32B32_SFLOAT,
            Self::Float32x4 => Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// Index buffer element format, per §3/§4.9.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    pub(crate) fn to_vk(self) -> ash::vk::IndexType {
        match self {
            Self::U16 => ash::vk::IndexType::UINT16,
            Self::U32 => ash::vk::IndexType::UINT32,
        }
    }
}

/// Scalar/vector/matrix types a `UniformBlockBuilder` member may hold.
///
/// Byte layout (alignment, size-per-element, array-stride) follows the
/// std140 rules in §4.1: a lone member aligns to its natural size (vec3/
/// vec4/mat3/mat4 to 16 bytes); a member with `count > 1` is an array, and
/// every array's base alignment and stride round up to a vec4 (16 bytes)
/// regardless of the element type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UniformFormat {
    Bool,
    Int32,
    Float,
    Vec2I,
    Vec2F,
    Vec3I,
    Vec3F,
    Vec4I,
    Vec4F,
    Mat33F,
    Mat44F,
}

/// `(alignment, size, stride)` of a single `UniformFormat` member, per the
/// std140 rules: the base alignment/size/stride are `N` for scalars, `2N`
/// for vec2, `4N` for vec3/vec4 (vec3 only occupies `3N` of its `4N` slot),
/// and matrices are arrays of column vec4s.
pub(crate) struct Std140Layout {
    pub alignment: u32,
    pub size: u32,
    pub stride: u32,
}

impl UniformFormat {
    /// Number of scalar components, used when packing raw element bytes.
    pub(crate) fn component_count(self) -> u32 {
        match self {
            Self::Bool | Self::Int32 | Self::Float => 1,
            Self::Vec2I | Self::Vec2F => 2,
            Self::Vec3I | Self::Vec3F => 3,
            Self::Vec4I | Self::Vec4F => 4,
            Self::Mat33F => 9,
            Self::Mat44F => 16,
        }
    }

    pub(crate) fn std140_layout(self, count: u32) -> Std140Layout {
        const N: u32 = 4;
        let (base_alignment, base_size) = match self {
            Self::Bool | Self::Int32 | Self::Float => (N, N),
            Self::Vec2I | Self::Vec2F => (N * 2, N * 2),
            Self::Vec3I | Self::Vec3F => (N * 4, N * 3),
            Self::Vec4I | Self::Vec4F => (N * 4, N * 4),
            Self::Mat33F => (N * 4, N * 12),
            Self::Mat44F => (N * 4, N * 16),
        };

        if count <= 1 {
            return Std140Layout {
                alignment: base_alignment,
                size: base_size,
                stride: base_size,
            };
        }

        // std140: an array's base alignment (and therefore its per-element
        // stride) is the element's own alignment rounded up to a vec4,
        // regardless of the element's natural alignment.
        let vec4 = N * 4;
        let natural = base_alignment.max(base_size);
        let stride = (natural + vec4 - 1) / vec4 * vec4;
        Std140Layout {
            alignment: vec4,
            size: count * stride,
            stride,
        }
    }
}
