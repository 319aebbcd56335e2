//! Thin wrapper around `shaderc` turning GLSL source into SPIR-V words for
//! Vulkan 1.3 / SPIR-V 1.3, matching the external-toolchain contract in §6:
//! source string, shader kind, filename, entry point `"main"`, target
//! `vulkan_1_3` / `spirv_1_3`, warnings-as-errors.

use std::fmt;

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    fn to_shaderc(self) -> shaderc::ShaderKind {
        match self {
            Self::Vertex => shaderc::ShaderKind::Vertex,
            Self::Fragment => shaderc::ShaderKind::Fragment,
        }
    }
}

#[derive(Clone, Debug, Error)]
pub struct Error(String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compiles `source` (GLSL 4.20) into a SPIR-V word array.
///
/// `filename` only shows up in diagnostic messages; it need not refer to a
/// real path on disk.
pub fn compile(source: &str, kind: ShaderKind, filename: &str) -> Result<Vec<u32>, Error> {
    let compiler = shaderc::Compiler::new().ok_or_else(|| {
        Error("failed to initialize the shaderc compiler instance".to_string())
    })?;

    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| Error("failed to initialize shaderc compile options".to_string()))?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_3 as u32);
    options.set_target_spirv(shaderc::SpirvVersion::V1_3);
    options.set_warnings_as_errors();
    options.set_source_language(shaderc::SourceLanguage::GLSL);

    tracing::trace!(filename, ?kind, "compiling GLSL to SPIR-V");

    let artifact = compiler
        .compile_into_spirv(source, kind.to_shaderc(), filename, "main", Some(&options))
        .map_err(|err| Error(err.to_string()))?;

    if artifact.get_num_warnings() > 0 {
        return Err(Error(artifact.get_warning_messages()));
    }

    Ok(artifact.as_binary().to_vec())
}
