//! The in-memory SPIR-V IR: types, constants, globals, functions, and basic
//! blocks, owned by a shader IR library.
//!
//! Everything is an index into the library's node arena, so id equality is
//! identity and the dependency collector can walk references without
//! touching pointers.

use ahash::AHashMap;
use bitflags::bitflags;
use indexmap::IndexMap;

use crate::spirv::{Op, StorageClass};

/// Index of a node (type, constant, global, extension) in an IR library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrId(pub u32);

impl IrId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a function in an IR library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrFunctionId(pub u32);

impl IrFunctionId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// The pipeline stages a symbol may run in (or requires).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShaderStage: u8 {
        const VERTEX = 1;
        const GEOMETRY = 2;
        const PIXEL = 4;
        const COMPUTE = 8;
    }
}

impl ShaderStage {
    /// Renders like `Vertex|Pixel` for diagnostics.
    #[must_use]
    pub fn describe(self) -> String {
        let mut names = Vec::new();
        if self.contains(Self::VERTEX) {
            names.push("Vertex");
        }
        if self.contains(Self::GEOMETRY) {
            names.push("Geometry");
        }
        if self.contains(Self::PIXEL) {
            names.push("Pixel");
        }
        if self.contains(Self::COMPUTE) {
            names.push("Compute");
        }
        if names.is_empty() {
            "None".to_owned()
        } else {
            names.join("|")
        }
    }
}

/// Structural identity for types, used to materialize each shape once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: IrId, count: u32 },
    Matrix { column: IrId, count: u32 },
    Struct { name: String },
    Pointer { pointee: IrId, storage: u16 },
    FixedArray { element: IrId, length: u32 },
    RuntimeArray { element: IrId },
    Image { sampled_type: IrId, depth: bool },
    Sampler,
    SampledImage { image: IrId },
    Function { return_type: IrId, parameters: Vec<IrId> },
}

/// A materialized SPIR-V type.
#[derive(Debug, Clone, PartialEq)]
pub struct IrType {
    pub key: TypeKey,
    /// Debug name; struct member names live alongside for reflection.
    pub name: String,
    pub members: Vec<IrId>,
    pub member_names: Vec<String>,
    pub storage: StorageClass,
}

/// A constant's payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Constituents must already be materialized constants.
    Composite(Vec<IrId>),
}

/// Hashable form of [`ConstantValue`] for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Composite(Vec<IrId>),
}

impl ConstantValue {
    #[must_use]
    pub fn key(&self) -> ConstantKey {
        match self {
            Self::Bool(v) => ConstantKey::Bool(*v),
            Self::Int(v) => ConstantKey::Int(*v),
            Self::Float(v) => ConstantKey::Float(v.to_bits()),
            Self::Composite(ids) => ConstantKey::Composite(ids.clone()),
        }
    }
}

/// A module-scope constant.
#[derive(Debug, Clone, PartialEq)]
pub struct IrConstant {
    pub result_type: IrId,
    pub value: ConstantValue,
}

/// A module-scope variable.
#[derive(Debug, Clone, PartialEq)]
pub struct IrGlobal {
    /// The pointer type of the variable.
    pub pointer_type: IrId,
    pub storage: StorageClass,
    pub name: String,
    /// Lowered initializer, collected with the global.
    pub initializer: Option<IrFunctionId>,
}

/// One arena node.
#[derive(Debug, Clone, PartialEq)]
pub enum IrNode {
    Type(IrType),
    Constant(IrConstant),
    Global(IrGlobal),
    /// An extended instruction set import, e.g. `GLSL.std.450`.
    ExtensionImport(String),
}

/// An operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrOperand {
    /// A module-level node (type, constant, global, import).
    Node(IrId),
    /// The SSA result of a prior instruction in the same function.
    Local(u32),
    /// A function in the same library.
    Function(IrFunctionId),
    /// A branch target within the same function.
    Block(u32),
    /// An immediate literal word.
    Literal(u32),
}

/// One instruction inside a basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct IrOp {
    pub op: Op,
    pub result_type: Option<IrId>,
    /// The SSA id this op defines, when it produces a value.
    pub result: Option<u32>,
    pub operands: Vec<IrOperand>,
}

/// A basic block: function-local variables first, then the instruction
/// lines, ending in a terminator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub label: u32,
    /// `OpVariable` lines, hoisted to the entry block on emission.
    pub local_variables: Vec<IrOp>,
    pub lines: Vec<IrOp>,
}

/// A lowered function.
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub function_type: IrId,
    pub return_type: IrId,
    /// SSA ids assigned to parameters, in order.
    pub parameter_locals: Vec<u32>,
    /// Pointer types of the parameters.
    pub parameter_types: Vec<IrId>,
    pub blocks: Vec<BasicBlock>,
    /// The language function this was lowered from, when any.
    pub source: Option<lustre::FunctionId>,
    /// Next SSA id for this function.
    pub next_local: u32,
}

impl IrFunction {
    pub fn allocate_local(&mut self) -> u32 {
        let id = self.next_local;
        self.next_local += 1;
        id
    }
}

/// Which way a fragment field travels through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalDirection {
    Input,
    Output,
    Uniform,
    Private,
}

/// Reflection and routing data for one fragment field's global variable.
#[derive(Debug, Clone)]
pub struct GlobalBinding {
    pub global: IrId,
    /// The fragment type that declared the field.
    pub fragment: lustre::TypeId,
    pub field_name: String,
    /// The composition key: the field name unless `[Name("…")]` overrode it.
    pub routing_name: String,
    pub direction: GlobalDirection,
    /// The value type node (the global itself is a pointer).
    pub value_type: IrId,
}

/// Everything lowered from one language library: the node arena plus lookup
/// tables from language entities to IR entities.
#[derive(Debug, Default)]
pub struct ShaderIrLibrary {
    nodes: Vec<IrNode>,
    pub functions: Vec<IrFunction>,
    types_by_key: AHashMap<TypeKey, IrId>,
    constants_by_key: AHashMap<(IrId, ConstantKey), IrId>,
    extension_imports: AHashMap<String, IrId>,
    /// Language type -> value type node.
    pub type_map: AHashMap<lustre::TypeId, IrId>,
    /// Language function -> lowered function.
    pub function_map: AHashMap<lustre::FunctionId, IrFunctionId>,
    /// Module-scope variables in declaration order, with their owning
    /// fragment and field names for composition routing.
    pub globals: IndexMap<String, IrId>,
    /// Routing and reflection data per global, in declaration order.
    pub global_bindings: Vec<GlobalBinding>,
    /// Per-symbol gathered stage requirements (function/type keys by name).
    pub stage_requirements: AHashMap<String, ShaderStage>,
}

impl ShaderIrLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node(&self, id: IrId) -> &IrNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: IrId) -> &mut IrNode {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_node(&mut self, node: IrNode) -> IrId {
        let id = IrId(u32::try_from(self.nodes.len()).expect("IR arena exceeds u32"));
        self.nodes.push(node);
        id
    }

    /// Materializes a type once per structural key.
    pub fn intern_type(&mut self, key: TypeKey, name: impl Into<String>) -> IrId {
        if let Some(&existing) = self.types_by_key.get(&key) {
            return existing;
        }
        let id = self.add_node(IrNode::Type(IrType {
            key: key.clone(),
            name: name.into(),
            members: Vec::new(),
            member_names: Vec::new(),
            storage: StorageClass::Function,
        }));
        self.types_by_key.insert(key, id);
        id
    }

    /// The type node for a key, if already materialized.
    #[must_use]
    pub fn find_type(&self, key: &TypeKey) -> Option<IrId> {
        self.types_by_key.get(key).copied()
    }

    /// Materializes a constant once per (type, value).
    pub fn intern_constant(&mut self, result_type: IrId, value: ConstantValue) -> IrId {
        let key = (result_type, value.key());
        if let Some(&existing) = self.constants_by_key.get(&key) {
            return existing;
        }
        let id = self.add_node(IrNode::Constant(IrConstant { result_type, value }));
        self.constants_by_key.insert(key, id);
        id
    }

    /// Imports an extended instruction set once.
    pub fn intern_extension_import(&mut self, name: &str) -> IrId {
        if let Some(&existing) = self.extension_imports.get(name) {
            return existing;
        }
        let id = self.add_node(IrNode::ExtensionImport(name.to_owned()));
        self.extension_imports.insert(name.to_owned(), id);
        id
    }

    pub fn add_function(&mut self, function: IrFunction) -> IrFunctionId {
        let id = IrFunctionId(u32::try_from(self.functions.len()).expect("function arena exceeds u32"));
        self.functions.push(function);
        id
    }

    #[must_use]
    pub fn function(&self, id: IrFunctionId) -> &IrFunction {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: IrFunctionId) -> &mut IrFunction {
        &mut self.functions[id.index()]
    }

    /// The global registered under a routing name, if any.
    #[must_use]
    pub fn find_global(&self, name: &str) -> Option<IrId> {
        self.globals.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_intern_structurally() {
        let mut library = ShaderIrLibrary::new();
        let float = library.intern_type(TypeKey::Float { width: 32 }, "f32");
        let float_again = library.intern_type(TypeKey::Float { width: 32 }, "f32");
        assert_eq!(float, float_again);

        let vec3 = library.intern_type(
            TypeKey::Vector {
                component: float,
                count: 3,
            },
            "vec3",
        );
        assert_ne!(float, vec3);
    }

    #[test]
    fn constants_intern_per_type_and_value() {
        let mut library = ShaderIrLibrary::new();
        let float = library.intern_type(TypeKey::Float { width: 32 }, "f32");
        let a = library.intern_constant(float, ConstantValue::Float(1.0));
        let b = library.intern_constant(float, ConstantValue::Float(1.0));
        let c = library.intern_constant(float, ConstantValue::Float(2.0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
