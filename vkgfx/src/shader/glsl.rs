//! Compiles a vertex + fragment [`ShaderProgram`] into GLSL 4.20 source
//! (§4.3).

use std::collections::HashMap;
use std::rc::Rc;

use hashbrown::HashMap as FastMap;

use crate::error::CompileError;
use crate::uniform::{MemberDefinition, UniformBlockDefinition};

use super::{ConstantValue, Expression, Node, OutputAttributeKind, ShaderModule, ValueType};

/// Per-binding override for the uniform block synthesized/declared at that
/// binding; lets callers pin a block to a known layout and binding index.
#[derive(Clone, Debug)]
pub struct UniformBlockOverride {
    pub binding: u32,
    pub name: String,
    pub definition: UniformBlockDefinition,
}

#[derive(Clone, Debug, Default)]
pub struct CompilerOptions {
    pub uniform_block_overrides: HashMap<u32, UniformBlockOverride>,
    pub input_attribute_location_overrides: HashMap<String, u32>,
    pub output_attribute_location_overrides: HashMap<String, u32>,
    pub default_uniform_block_name: String,
    pub default_descriptor_set: u32,
}

#[derive(Clone, Debug)]
pub struct CompiledProgram {
    pub vertex_source: String,
    pub fragment_source: String,
    /// Locations assigned to the fragment module's output attributes, in
    /// declaration order; reflection does not need to re-derive these but
    /// callers that build a matching `FramebufferSignature` can use them.
    pub fragment_output_locations: Vec<(String, u32)>,
}

struct Attribute {
    name: String,
    ty: ValueType,
    location: u32,
}

/// One synthesized descriptor binding: either a uniform block or a
/// combined-image-sampler.
enum Binding {
    UniformBlock {
        name: String,
        members: Vec<MemberDefinition>,
        member_types: Vec<ValueType>,
    },
    CombinedSampler {
        name: String,
        param_name: String,
    },
}

pub fn compile(
    program: &super::ShaderProgram,
    options: &CompilerOptions,
) -> Result<CompiledProgram, CompileError> {
    let vertex = program
        .vertex
        .as_ref()
        .ok_or(CompileError::MissingVertexModule)?;
    let fragment = program
        .fragment
        .as_ref()
        .ok_or(CompileError::MissingFragmentModule)?;

    let (bindings_by_binding, param_binding) = aggregate_uniforms(vertex, fragment, options);

    let vertex_inputs = assign_input_locations(vertex, &options.input_attribute_location_overrides);
    let vertex_outputs = assign_output_locations(vertex, &HashMap::new());

    let mut fragment_override = HashMap::new();
    for out in &vertex_outputs {
        fragment_override.insert(out.name.clone(), out.location);
    }
    let fragment_inputs = match_fragment_inputs(fragment, &fragment_override)?;
    let fragment_outputs =
        assign_output_locations(fragment, &options.output_attribute_location_overrides);

    let vertex_source = emit_stage(
        vertex,
        &vertex_inputs,
        &vertex_outputs,
        &bindings_by_binding,
        &param_binding,
        options.default_descriptor_set,
    );
    let fragment_source = emit_stage(
        fragment,
        &fragment_inputs,
        &fragment_outputs,
        &bindings_by_binding,
        &param_binding,
        options.default_descriptor_set,
    );

    Ok(CompiledProgram {
        vertex_source,
        fragment_source,
        fragment_output_locations: fragment_outputs
            .into_iter()
            .map(|a| (a.name, a.location))
            .collect(),
    })
}

/// Walks both modules collecting distinct `Parameter` nodes (deduplicated by
/// pointer identity, order preserved), partitions them into samplers and
/// scalars/vectors/matrices, and assigns each a descriptor binding: explicit
/// overrides win; everything else not covered by an override is folded into
/// a synthesized default uniform block at the lowest unused binding, while
/// each sampler gets its own binding.
fn aggregate_uniforms(
    vertex: &ShaderModule,
    fragment: &ShaderModule,
    options: &CompilerOptions,
) -> (Vec<(u32, Binding)>, FastMap<usize, u32>) {
    let mut seen = FastMap::new();
    let mut params: Vec<Node> = Vec::new();
    for root in vertex.outputs.iter().chain(fragment.outputs.iter()) {
        collect_parameters(root, &mut seen, &mut params);
    }

    let mut used_bindings: std::collections::HashSet<u32> =
        options.uniform_block_overrides.keys().copied().collect();

    let mut bindings: Vec<(u32, Binding)> = Vec::new();
    let mut param_binding: FastMap<usize, u32> = FastMap::new();

    // Materialize explicit uniform-block overrides first; their members are
    // matched against overlapping scalar parameters by name.
    for (binding, ov) in &options.uniform_block_overrides {
        bindings.push((
            *binding,
            Binding::UniformBlock {
                name: ov.name.clone(),
                members: ov.definition.members.clone(),
                member_types: ov
                    .definition
                    .members
                    .iter()
                    .map(|m| uniform_format_to_value_type(m.ty))
                    .collect(),
            },
        ));
    }

    let mut default_members: Vec<MemberDefinition> = Vec::new();
    let mut default_member_types: Vec<ValueType> = Vec::new();

    for param in &params {
        let Expression::Parameter { name, output_value_type } = param.as_ref() else {
            continue;
        };
        let key = Rc::as_ptr(param) as *const () as usize;

        if *output_value_type == ValueType::Sampler2d {
            let binding = lowest_unused(&used_bindings);
            used_bindings.insert(binding);
            bindings.push((
                binding,
                Binding::CombinedSampler {
                    name: format!("sampler_{name}"),
                    param_name: name.clone(),
                },
            ));
            param_binding.insert(key, binding);
            continue;
        }

        // Already covered by an explicit override naming the same member?
        let covered = options.uniform_block_overrides.values().any(|ov| {
            ov.definition.members.iter().any(|m| &m.name == name)
        });
        if covered {
            continue;
        }

        default_members.push(MemberDefinition::new(
            uniform_format_from_value_type(*output_value_type),
            name.clone(),
            1,
        ));
        default_member_types.push(*output_value_type);
    }

    if !default_members.is_empty() {
        let binding = lowest_unused(&used_bindings);
        used_bindings.insert(binding);
        for member in &default_members {
            let key_param = params.iter().find(|p| {
                matches!(p.as_ref(), Expression::Parameter { name, .. } if *name == member.name)
            });
            if let Some(p) = key_param {
                param_binding.insert(Rc::as_ptr(p) as *const () as usize, binding);
            }
        }
        bindings.push((
            binding,
            Binding::UniformBlock {
                name: options.default_uniform_block_name.clone(),
                members: default_members,
                member_types: default_member_types,
            },
        ));
    }

    bindings.sort_by_key(|(b, _)| *b);
    (bindings, param_binding)
}

fn lowest_unused(used: &std::collections::HashSet<u32>) -> u32 {
    let mut b = 0;
    while used.contains(&b) {
        b += 1;
    }
    b
}

fn uniform_format_to_value_type(f: crate::types::UniformFormat) -> ValueType {
    use crate::types::UniformFormat as U;
    match f {
        U::Bool => ValueType::Bool,
        U::Int32 => ValueType::Int,
        U::Float => ValueType::Float,
        U::Vec2I => ValueType::Int2,
        U::Vec2F => ValueType::Float2,
        U::Vec3I => ValueType::Int3,
        U::Vec3F => ValueType::Float3,
        U::Vec4I => ValueType::Int4,
        U::Vec4F => ValueType::Float4,
        U::Mat33F => ValueType::Float3x3,
        U::Mat44F => ValueType::Float4x4,
    }
}

fn uniform_format_from_value_type(v: ValueType) -> crate::types::UniformFormat {
    use crate::types::UniformFormat as U;
    match v {
        ValueType::Bool => U::Bool,
        ValueType::Int => U::Int32,
        ValueType::Float => U::Float,
        ValueType::Int2 => U::Vec2I,
        ValueType::Float2 => U::Vec2F,
        ValueType::Int3 => U::Vec3I,
        ValueType::Float3 => U::Vec3F,
        ValueType::Int4 => U::Vec4I,
        ValueType::Float4 => U::Vec4F,
        ValueType::Float3x3 => U::Mat33F,
        ValueType::Float4x4 => U::Mat44F,
        ValueType::Sampler2d => unreachable!("samplers never enter a uniform block"),
    }
}

fn collect_parameters(node: &Node, seen: &mut FastMap<usize, ()>, out: &mut Vec<Node>) {
    let key = Rc::as_ptr(node) as *const () as usize;
    if matches!(node.as_ref(), Expression::Parameter { .. }) {
        if seen.insert(key, ()).is_none() {
            out.push(node.clone());
        }
        return;
    }
    for input in node.inputs() {
        collect_parameters(input, seen, out);
    }
}

fn assign_input_locations(
    module: &ShaderModule,
    overrides: &HashMap<String, u32>,
) -> Vec<Attribute> {
    let mut seen = FastMap::new();
    let mut inputs: Vec<Node> = Vec::new();
    for root in &module.outputs {
        collect_inputs(root, &mut seen, &mut inputs);
    }

    let mut used: std::collections::HashSet<u32> = overrides.values().copied().collect();
    let mut attrs = Vec::new();
    for node in inputs {
        let Expression::InputAttribute {
            name,
            output_value_type,
        } = node.as_ref()
        else {
            continue;
        };
        let location = match overrides.get(name) {
            Some(l) => *l,
            None => {
                let mut l = 0;
                while used.contains(&l) {
                    l += 1;
                }
                l
            }
        };
        used.insert(location);
        attrs.push(Attribute {
            name: name.clone(),
            ty: *output_value_type,
            location,
        });
    }
    attrs.sort_by_key(|a| a.location);
    attrs
}

fn collect_inputs(node: &Node, seen: &mut FastMap<usize, ()>, out: &mut Vec<Node>) {
    let key = Rc::as_ptr(node) as *const () as usize;
    if matches!(node.as_ref(), Expression::InputAttribute { .. }) {
        if seen.insert(key, ()).is_none() {
            out.push(node.clone());
        }
        return;
    }
    for input in node.inputs() {
        collect_inputs(input, seen, out);
    }
}

fn assign_output_locations(
    module: &ShaderModule,
    overrides: &HashMap<String, u32>,
) -> Vec<Attribute> {
    let mut used: std::collections::HashSet<u32> = overrides.values().copied().collect();
    let mut attrs = Vec::new();
    for root in &module.outputs {
        let Expression::OutputAttribute { attribute, .. } = root.as_ref() else {
            continue;
        };
        let name = match attribute {
            OutputAttributeKind::Default(d) => d.glsl_name().to_string(),
            OutputAttributeKind::Named(n) => n.clone(),
        };
        if matches!(attribute, OutputAttributeKind::Default(_)) {
            // gl_Position / gl_FragDepth never occupy a location.
            continue;
        }
        let location = *overrides.get(&name).unwrap_or(&{
            let mut l = 0;
            while used.contains(&l) {
                l += 1;
            }
            l
        });
        used.insert(location);
        attrs.push(Attribute {
            name,
            ty: root.output_value_type(),
            location,
        });
    }
    attrs.sort_by_key(|a| a.location);
    attrs
}

fn match_fragment_inputs(
    fragment: &ShaderModule,
    vertex_output_locations: &HashMap<String, u32>,
) -> Result<Vec<Attribute>, CompileError> {
    let mut seen = FastMap::new();
    let mut inputs: Vec<Node> = Vec::new();
    for root in &fragment.outputs {
        collect_inputs(root, &mut seen, &mut inputs);
    }

    let mut attrs = Vec::new();
    for node in inputs {
        let Expression::InputAttribute {
            name,
            output_value_type,
        } = node.as_ref()
        else {
            continue;
        };
        let location = *vertex_output_locations
            .get(name)
            .ok_or_else(|| CompileError::UnmatchedInputAttribute(name.clone()))?;
        attrs.push(Attribute {
            name: name.clone(),
            ty: *output_value_type,
            location,
        });
    }
    attrs.sort_by_key(|a| a.location);
    Ok(attrs)
}

/// Counts, per node (by pointer identity), how many other nodes in this
/// module's DAG reference it. An expression deserves a temporary variable
/// iff it is an `OutputAttribute`, a `NativeFunction`, or has more than one
/// successor; `InputAttribute`, `Parameter` and `Constant` never do.
fn successor_counts(module: &ShaderModule) -> FastMap<usize, u32> {
    let mut counts: FastMap<usize, u32> = FastMap::new();
    let mut stack: Vec<Node> = module.outputs.clone();
    let mut visited: FastMap<usize, ()> = FastMap::new();

    while let Some(node) = stack.pop() {
        let key = Rc::as_ptr(&node) as *const () as usize;
        if visited.insert(key, ()).is_some() {
            continue;
        }
        for input in node.inputs() {
            let ikey = Rc::as_ptr(input) as *const () as usize;
            *counts.entry(ikey).or_insert(0) += 1;
            stack.push(input.clone());
        }
    }
    counts
}

fn deserves_temp(node: &Expression, successors: u32) -> bool {
    match node {
        Expression::InputAttribute { .. }
        | Expression::Parameter { .. }
        | Expression::Constant { .. } => false,
        Expression::OutputAttribute { .. } | Expression::NativeFunction { .. } => true,
        _ => successors > 1,
    }
}

/// Reverse-post-order node list: producers before consumers, each node
/// exactly once.
fn reverse_post_order(roots: &[Node]) -> Vec<Node> {
    let mut order = Vec::new();
    let mut visited: FastMap<usize, ()> = FastMap::new();

    fn visit(node: &Node, visited: &mut FastMap<usize, ()>, order: &mut Vec<Node>) {
        let key = Rc::as_ptr(node) as *const () as usize;
        if visited.insert(key, ()).is_some() {
            return;
        }
        for input in node.inputs() {
            visit(input, visited, order);
        }
        order.push(node.clone());
    }

    for root in roots {
        visit(root, &mut visited, &mut order);
    }
    order
}

fn format_float_literal(v: f32) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}.f")
    } else {
        format!("{v}f")
    }
}

fn emit_stage(
    module: &ShaderModule,
    inputs: &[Attribute],
    outputs: &[Attribute],
    bindings: &[(u32, Binding)],
    param_binding: &FastMap<usize, u32>,
    default_set: u32,
) -> String {
    let mut src = String::new();
    src.push_str("#version 420\n\n");

    for attr in inputs {
        src.push_str(&format!(
            "layout(location={}) in {} {};\n",
            attr.location,
            attr.ty.glsl_name(),
            attr.name
        ));
    }
    if !inputs.is_empty() {
        src.push('\n');
    }

    for attr in outputs {
        src.push_str(&format!(
            "layout(location={}) out {} out_{};\n",
            attr.location,
            attr.ty.glsl_name(),
            attr.name
        ));
    }
    if !outputs.is_empty() {
        src.push('\n');
    }

    for (binding, b) in bindings {
        match b {
            Binding::UniformBlock { name, members, member_types } => {
                src.push_str(&format!(
                    "layout (std140, set={default_set}, binding={binding}) uniform {name}\n{{\n"
                ));
                for (member, ty) in members.iter().zip(member_types) {
                    src.push_str(&format!("    {} {};\n", ty.glsl_name(), member.name));
                }
                src.push_str("};\n\n");
            }
            Binding::CombinedSampler { name, .. } => {
                src.push_str(&format!(
                    "layout(set={default_set}, binding={binding}) uniform sampler2D {name};\n\n"
                ));
            }
        }
    }

    let successors = successor_counts(module);
    let order = reverse_post_order(&module.outputs);

    let mut names: FastMap<usize, String> = FastMap::new();
    let mut counters: FastMap<&'static str, u32> = FastMap::new();

    src.push_str("void main() {\n");
    for node in &order {
        let key = Rc::as_ptr(node) as *const () as usize;
        let succ = *successors.get(&key).unwrap_or(&0);

        let expr_str = expr_to_glsl(node, &names, bindings, param_binding);

        match node.as_ref() {
            Expression::OutputAttribute { attribute, .. } => {
                let target = match attribute {
                    OutputAttributeKind::Default(d) => d.glsl_name().to_string(),
                    OutputAttributeKind::Named(n) => format!("out_{n}"),
                };
                src.push_str(&format!("    {target} = {expr_str};\n"));
            }
            _ if deserves_temp(node, succ) => {
                let prefix = node.output_value_type().temp_prefix();
                let counter = counters.entry(prefix).or_insert(0);
                let name = format!("{prefix}_{counter}");
                *counter += 1;
                src.push_str(&format!(
                    "    {} {} = {};\n",
                    node.output_value_type().glsl_name(),
                    name,
                    expr_str
                ));
                names.insert(key, name);
            }
            _ => {}
        }
    }
    src.push_str("}\n");

    src
}

fn expr_to_glsl(
    node: &Node,
    names: &FastMap<usize, String>,
    bindings: &[(u32, Binding)],
    param_binding: &FastMap<usize, u32>,
) -> String {
    let key = Rc::as_ptr(node) as *const () as usize;
    if let Some(name) = names.get(&key) {
        return name.clone();
    }

    match node.as_ref() {
        Expression::Constant { value, .. } => match value {
            ConstantValue::Float(v) => format_float_literal(*v),
            ConstantValue::Int(v) => v.to_string(),
            ConstantValue::Bool(v) => v.to_string(),
        },
        Expression::InputAttribute { name, .. } => name.clone(),
        Expression::Parameter { name, .. } => {
            let binding = param_binding.get(&key).copied();
            match binding.and_then(|b| bindings.iter().find(|(bb, _)| *bb == b)) {
                Some((_, Binding::CombinedSampler { name: sampler, .. })) => sampler.clone(),
                _ => name.clone(),
            }
        }
        Expression::OutputAttribute { input, .. } => {
            expr_to_glsl(input, names, bindings, param_binding)
        }
        Expression::Operator { op, lhs, rhs, .. } => format!(
            "({} {} {})",
            expr_to_glsl(lhs, names, bindings, param_binding),
            op.glsl_infix(),
            expr_to_glsl(rhs, names, bindings, param_binding)
        ),
        Expression::NativeFunction { name, args, .. } => format!(
            "{}({})",
            name,
            args.iter()
                .map(|a| expr_to_glsl(a, names, bindings, param_binding))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Expression::Constructor {
            args,
            output_value_type,
        } => format!(
            "{}({})",
            output_value_type.glsl_name(),
            args.iter()
                .map(|a| expr_to_glsl(a, names, bindings, param_binding))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Expression::Cast {
            input,
            output_value_type,
        } => format!(
            "{}({})",
            output_value_type.glsl_name(),
            expr_to_glsl(input, names, bindings, param_binding)
        ),
        Expression::Swizzle { input, swizzle, .. } => format!(
            "{}.{}",
            expr_to_glsl(input, names, bindings, param_binding),
            swizzle.glsl_suffix()
        ),
        Expression::Conditional {
            cond,
            then_value,
            else_value,
            ..
        } => format!(
            "({} ? {} : {})",
            expr_to_glsl(cond, names, bindings, param_binding),
            expr_to_glsl(then_value, names, bindings, param_binding),
            expr_to_glsl(else_value, names, bindings, param_binding)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::build::*;
    use crate::shader::{OutputAttributeKind::Default as DefaultOut, *};

    #[test]
    fn missing_vertex_module_is_an_error() {
        let program = super::super::ShaderProgram {
            vertex: None,
            fragment: Some(ShaderModule::new(vec![])),
        };
        let err = compile(&program, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::MissingVertexModule));
    }

    #[test]
    fn simple_program_compiles_and_shares_subexpressions() {
        let pos = input_attribute("position", ValueType::Float3);
        let scaled = operator(Operator::Mul, pos.clone(), constant_float(2.0));
        let vertex_out = output_attribute(
            DefaultOut(DefaultAttribute::Position),
            constructor(vec![scaled.clone(), constant_float(1.0)], ValueType::Float4),
        );
        let vertex = ShaderModule::new(vec![vertex_out]);

        let color_param = parameter("tint", ValueType::Float3);
        let frag_out = output_attribute(
            OutputAttributeKind::Named("color".into()),
            constructor(vec![color_param], ValueType::Float4),
        );
        let fragment = ShaderModule::new(vec![frag_out]);

        let program = ShaderProgram {
            vertex: Some(vertex),
            fragment: Some(fragment),
        };

        let mut options = CompilerOptions::default();
        options.default_uniform_block_name = "Defaults".into();

        let compiled = compile(&program, &options).unwrap();
        assert!(compiled.vertex_source.contains("#version 420"));
        assert!(compiled.vertex_source.contains("gl_Position"));
        assert!(compiled.fragment_source.contains("uniform Defaults"));
    }

    #[test]
    fn unmatched_fragment_input_is_an_error() {
        let vertex = ShaderModule::new(vec![output_attribute(
            DefaultOut(DefaultAttribute::Position),
            constant_float(0.0),
        )]);
        let fragment = ShaderModule::new(vec![output_attribute(
            OutputAttributeKind::Named("color".into()),
            input_attribute("missing", ValueType::Float4),
        )]);
        let program = ShaderProgram {
            vertex: Some(vertex),
            fragment: Some(fragment),
        };
        let err = compile(&program, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::UnmatchedInputAttribute(_)));
    }
}
