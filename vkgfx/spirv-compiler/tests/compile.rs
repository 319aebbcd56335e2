use spirv_compiler::ShaderKind;

const VERTEX_SOURCE: &str = r#"
#version 420

layout(location = 0) in vec3 position;

void main() {
    gl_Position = vec4(position, 1.0);
}
"#;

const FRAGMENT_SOURCE: &str = r#"
#version 420

layout(location = 0) out vec4 frag_color;

void main() {
    frag_color = vec4(1.0, 1.0, 1.0, 1.0);
}
"#;

#[test]
fn compiles_vertex_shader() {
    let spirv = spirv_compiler::compile(VERTEX_SOURCE, ShaderKind::Vertex, "vertex").unwrap();
    assert!(!spirv.is_empty());
    assert_eq!(spirv[0], 0x0723_0203);
}

#[test]
fn compiles_fragment_shader() {
    let spirv = spirv_compiler::compile(FRAGMENT_SOURCE, ShaderKind::Fragment, "fragment").unwrap();
    assert!(!spirv.is_empty());
    assert_eq!(spirv[0], 0x0723_0203);
}

#[test]
fn rejects_malformed_source() {
    let err = spirv_compiler::compile("this is not glsl", ShaderKind::Fragment, "bad").unwrap_err();
    assert!(!err.to_string().is_empty());
}
