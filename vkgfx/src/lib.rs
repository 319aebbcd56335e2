//! A thin GPU graphics abstraction layer over Vulkan 1.3, plus a companion
//! embedded shader expression language compiled to GLSL and then SPIR-V.
//!
//! [`context`] is the entry point: [`context::Context::new`] brings up an
//! instance and device and hands back factory methods for every other
//! resource type in this crate.

pub mod buffer;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod framebuffer;
pub mod image;
pub mod pipeline;
pub mod queue;
pub mod reflect;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod types;
pub mod uniform;

pub use error::Error;
