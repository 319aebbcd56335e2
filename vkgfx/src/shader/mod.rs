//! The shader expression graph: a typed DAG of shader expressions that the
//! [`glsl`] compiler turns into GLSL 4.20 source, and [`spirv`] then hands
//! to the external SPIR-V toolchain.

pub mod glsl;
pub mod spirv;

use std::rc::Rc;

/// Scalar/vector/matrix/opaque type every expression node carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Int2,
    Int3,
    Int4,
    Float,
    Float2,
    Float3,
    Float4,
    Float3x3,
    Float4x4,
    Sampler2d,
}

impl ValueType {
    /// GLSL type-name used in declarations and constructor calls.
    pub fn glsl_name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Int2 => "ivec2",
            Self::Int3 => "ivec3",
            Self::Int4 => "ivec4",
            Self::Float => "float",
            Self::Float2 => "vec2",
            Self::Float3 => "vec3",
            Self::Float4 => "vec4",
            Self::Float3x3 => "mat3",
            Self::Float4x4 => "mat4",
            Self::Sampler2d => "sampler2D",
        }
    }

    /// Short mangled-name prefix used for temporary variables (§4.3 rule 3).
    fn temp_prefix(self) -> &'static str {
        match self {
            Self::Bool => "b",
            Self::Int => "i",
            Self::Int2 | Self::Int3 | Self::Int4 => "iv",
            Self::Float => "f",
            Self::Float2 | Self::Float3 | Self::Float4 => "v",
            Self::Float3x3 | Self::Float4x4 => "m",
            Self::Sampler2d => "s",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DefaultAttribute {
    Position,
    Depth,
}

impl DefaultAttribute {
    pub fn glsl_name(self) -> &'static str {
        match self {
            Self::Position => "gl_Position",
            Self::Depth => "gl_FragDepth",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    Mul,
    Div,
    Add,
    Sub,
    Eq,
    Neq,
    Gt,
    Lt,
    Geq,
    Leq,
}

impl Operator {
    pub fn glsl_infix(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Geq => ">=",
            Self::Leq => "<=",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Swizzle {
    X,
    Y,
    Z,
    W,
    Xy,
    Xyz,
}

impl Swizzle {
    pub fn glsl_suffix(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::W => "w",
            Self::Xy => "xy",
            Self::Xyz => "xyz",
        }
    }
}

/// A constant leaf value. Never emitted as its own temporary.
#[derive(Clone, Debug)]
pub enum ConstantValue {
    Float(f32),
    Int(i32),
    Bool(bool),
}

/// One node of the shader expression DAG. Nodes are reference-counted so
/// the same node may be shared by multiple consumers (a DAG, not a tree);
/// the compiler relies on `Rc::ptr_eq` to detect and dedupe shared nodes.
#[derive(Clone, Debug)]
pub enum Expression {
    Constant {
        value: ConstantValue,
        output_value_type: ValueType,
    },
    InputAttribute {
        name: String,
        output_value_type: ValueType,
    },
    OutputAttribute {
        attribute: OutputAttributeKind,
        input: Node,
    },
    Parameter {
        name: String,
        output_value_type: ValueType,
    },
    Operator {
        op: Operator,
        lhs: Node,
        rhs: Node,
        output_value_type: ValueType,
    },
    NativeFunction {
        name: String,
        args: Vec<Node>,
        output_value_type: ValueType,
    },
    Constructor {
        args: Vec<Node>,
        output_value_type: ValueType,
    },
    Cast {
        input: Node,
        output_value_type: ValueType,
    },
    Swizzle {
        input: Node,
        swizzle: Swizzle,
        output_value_type: ValueType,
    },
    Conditional {
        cond: Node,
        then_value: Node,
        else_value: Node,
        output_value_type: ValueType,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputAttributeKind {
    Default(DefaultAttribute),
    Named(String),
}

/// Shared, reference-counted handle to an [`Expression`] node.
pub type Node = Rc<Expression>;

impl Expression {
    pub fn output_value_type(&self) -> ValueType {
        match self {
            Expression::Constant {
                output_value_type, ..
            }
            | Expression::InputAttribute {
                output_value_type, ..
            }
            | Expression::Parameter {
                output_value_type, ..
            }
            | Expression::Operator {
                output_value_type, ..
            }
            | Expression::NativeFunction {
                output_value_type, ..
            }
            | Expression::Constructor {
                output_value_type, ..
            }
            | Expression::Cast {
                output_value_type, ..
            }
            | Expression::Swizzle {
                output_value_type, ..
            }
            | Expression::Conditional {
                output_value_type, ..
            } => *output_value_type,
            Expression::OutputAttribute { input, .. } => input.output_value_type(),
        }
    }

    /// Direct predecessor (input) nodes, in evaluation order.
    pub(crate) fn inputs(&self) -> Vec<&Node> {
        match self {
            Expression::Constant { .. }
            | Expression::InputAttribute { .. }
            | Expression::Parameter { .. } => vec![],
            Expression::OutputAttribute { input, .. } => vec![input],
            Expression::Operator { lhs, rhs, .. } => vec![lhs, rhs],
            Expression::NativeFunction { args, .. } | Expression::Constructor { args, .. } => {
                args.iter().collect()
            }
            Expression::Cast { input, .. } | Expression::Swizzle { input, .. } => vec![input],
            Expression::Conditional {
                cond,
                then_value,
                else_value,
                ..
            } => vec![cond, then_value, else_value],
        }
    }
}

/// Constructor helpers. These just build DAG nodes; they perform no
/// validation beyond what is required to pick the right `ValueType`.
pub mod build {
    use super::*;

    pub fn constant_float(value: f32) -> Node {
        Rc::new(Expression::Constant {
            value: ConstantValue::Float(value),
            output_value_type: ValueType::Float,
        })
    }

    pub fn constant_int(value: i32) -> Node {
        Rc::new(Expression::Constant {
            value: ConstantValue::Int(value),
            output_value_type: ValueType::Int,
        })
    }

    pub fn constant_bool(value: bool) -> Node {
        Rc::new(Expression::Constant {
            value: ConstantValue::Bool(value),
            output_value_type: ValueType::Bool,
        })
    }

    pub fn input_attribute(name: impl Into<String>, ty: ValueType) -> Node {
        Rc::new(Expression::InputAttribute {
            name: name.into(),
            output_value_type: ty,
        })
    }

    pub fn output_attribute(attribute: OutputAttributeKind, input: Node) -> Node {
        Rc::new(Expression::OutputAttribute { attribute, input })
    }

    pub fn parameter(name: impl Into<String>, ty: ValueType) -> Node {
        Rc::new(Expression::Parameter {
            name: name.into(),
            output_value_type: ty,
        })
    }

    pub fn operator(op: Operator, lhs: Node, rhs: Node) -> Node {
        let output_value_type = lhs.output_value_type();
        Rc::new(Expression::Operator {
            op,
            lhs,
            rhs,
            output_value_type,
        })
    }

    pub fn native_function(name: impl Into<String>, args: Vec<Node>, output: ValueType) -> Node {
        Rc::new(Expression::NativeFunction {
            name: name.into(),
            args,
            output_value_type: output,
        })
    }

    pub fn constructor(args: Vec<Node>, output: ValueType) -> Node {
        Rc::new(Expression::Constructor {
            args,
            output_value_type: output,
        })
    }

    pub fn cast(input: Node, output: ValueType) -> Node {
        Rc::new(Expression::Cast {
            input,
            output_value_type: output,
        })
    }

    pub fn swizzle(input: Node, swizzle: Swizzle, output: ValueType) -> Node {
        Rc::new(Expression::Swizzle {
            input,
            swizzle,
            output_value_type: output,
        })
    }

    pub fn conditional(cond: Node, then_value: Node, else_value: Node) -> Node {
        let output_value_type = then_value.output_value_type();
        Rc::new(Expression::Conditional {
            cond,
            then_value,
            else_value,
            output_value_type,
        })
    }
}

/// A single shader stage: an ordered list of `OutputAttribute` roots.
#[derive(Clone, Debug, Default)]
pub struct ShaderModule {
    pub outputs: Vec<Node>,
}

impl ShaderModule {
    pub fn new(outputs: Vec<Node>) -> Self {
        Self { outputs }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Vertex,
    Fragment,
}

/// A complete program: optional vertex and fragment shader modules.
#[derive(Clone, Debug, Default)]
pub struct ShaderProgram {
    pub vertex: Option<ShaderModule>,
    pub fragment: Option<ShaderModule>,
}
