//! Wraps the GLSL compiler, then hands each stage's source to the external
//! GLSL→SPIR-V toolchain (§4.4).

use crate::error::CompileError;

use super::glsl::{self, CompiledProgram, CompilerOptions};
use super::ShaderProgram;

/// Both stages' compiled SPIR-V, plus the textual GLSL that produced them
/// (kept around for diagnostics/asm dumps).
#[derive(Debug)]
pub struct CompiledSpirv {
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub glsl: CompiledProgram,
}

pub fn compile(
    program: &ShaderProgram,
    options: &CompilerOptions,
) -> Result<CompiledSpirv, CompileError> {
    let glsl = glsl::compile(program, options)?;

    let vertex_spirv = spirv_compiler::compile(
        &glsl.vertex_source,
        spirv_compiler::ShaderKind::Vertex,
        "vertex",
    )
    .map_err(|err| CompileError::ToolchainError(err.to_string()))?;

    let fragment_spirv = spirv_compiler::compile(
        &glsl.fragment_source,
        spirv_compiler::ShaderKind::Fragment,
        "fragment",
    )
    .map_err(|err| CompileError::ToolchainError(err.to_string()))?;

    Ok(CompiledSpirv {
        vertex_spirv,
        fragment_spirv,
        glsl,
    })
}
