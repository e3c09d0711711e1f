//! The dependency collector: computes the transitive closure of everything
//! an entry point references and emits it in valid SPIR-V declaration order
//! (types before constants, constants before globals, globals before
//! function declarations, declarations before bodies).

use std::collections::BTreeSet;

use ahash::AHashSet;

use crate::{
    ir::{IrFunctionId, IrId, IrNode, IrOp, IrOperand, ShaderIrLibrary, TypeKey},
    spirv::{Capability, Op, StorageClass, required_capability, required_extension},
};

/// Everything a stage module needs, in emission order.
#[derive(Debug, Default)]
pub struct ModuleEmission {
    pub capabilities: Vec<Capability>,
    pub extensions: Vec<&'static str>,
    pub imports: Vec<IrId>,
    /// Types, constants, and globals interleaved in dependency order: a
    /// node always appears after everything it references.
    pub declarations: Vec<IrId>,
    /// Functions in declaration order; bodies emit in the same order.
    pub functions: Vec<IrFunctionId>,
    /// Global initializer functions, run by the generated entry prologue.
    pub global_initializers: Vec<IrFunctionId>,
}

impl ModuleEmission {
    /// A deterministic textual rendering of the module, used as the tool
    /// pass byte stream while the binary/GLSL backends stay external.
    #[must_use]
    pub fn disassemble(&self, library: &ShaderIrLibrary) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for capability in &self.capabilities {
            let _ = writeln!(out, "OpCapability {capability}");
        }
        for extension in &self.extensions {
            let _ = writeln!(out, "OpExtension \"{extension}\"");
        }
        for &import in &self.imports {
            if let IrNode::ExtensionImport(name) = library.node(import) {
                let _ = writeln!(out, "%{} = OpExtInstImport \"{name}\"", import.0);
            }
        }
        for &declaration in &self.declarations {
            match library.node(declaration) {
                IrNode::Type(ty) => {
                    let _ = writeln!(out, "%{} = {} ; {}", declaration.0, type_opcode(&ty.key), ty.name);
                }
                IrNode::Constant(constant) => {
                    let _ = writeln!(
                        out,
                        "%{} = OpConstant %{} {:?}",
                        declaration.0, constant.result_type.0, constant.value
                    );
                }
                IrNode::Global(global) => {
                    let _ = writeln!(
                        out,
                        "%{} = OpVariable %{} {} ; {}",
                        declaration.0, global.pointer_type.0, global.storage, global.name
                    );
                }
                IrNode::ExtensionImport(_) => {}
            }
        }
        for &function in &self.functions {
            let declared = library.function(function);
            let _ = writeln!(out, "OpFunction %{} ; {}", declared.function_type.0, declared.name);
            for block in &declared.blocks {
                let _ = writeln!(out, "  OpLabel %b{}", block.label);
                for line in block.local_variables.iter().chain(&block.lines) {
                    let _ = writeln!(out, "    {}", render_op(line));
                }
            }
            let _ = writeln!(out, "OpFunctionEnd");
        }
        out
    }
}

fn type_opcode(key: &TypeKey) -> &'static str {
    match key {
        TypeKey::Void => "OpTypeVoid",
        TypeKey::Bool => "OpTypeBool",
        TypeKey::Int { .. } => "OpTypeInt",
        TypeKey::Float { .. } => "OpTypeFloat",
        TypeKey::Vector { .. } => "OpTypeVector",
        TypeKey::Matrix { .. } => "OpTypeMatrix",
        TypeKey::Struct { .. } => "OpTypeStruct",
        TypeKey::Pointer { .. } => "OpTypePointer",
        TypeKey::FixedArray { .. } => "OpTypeArray",
        TypeKey::RuntimeArray { .. } => "OpTypeRuntimeArray",
        TypeKey::Image { .. } => "OpTypeImage",
        TypeKey::Sampler => "OpTypeSampler",
        TypeKey::SampledImage { .. } => "OpTypeSampledImage",
        TypeKey::Function { .. } => "OpTypeFunction",
    }
}

fn render_op(op: &IrOp) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    if let Some(result) = op.result {
        let _ = write!(out, "%t{result} = ");
    }
    let _ = write!(out, "Op{}", op.op);
    if let Some(result_type) = op.result_type {
        let _ = write!(out, " %{}", result_type.0);
    }
    for operand in &op.operands {
        match operand {
            IrOperand::Node(id) => {
                let _ = write!(out, " %{}", id.0);
            }
            IrOperand::Local(id) => {
                let _ = write!(out, " %t{id}");
            }
            IrOperand::Function(id) => {
                let _ = write!(out, " %f{}", id.0);
            }
            IrOperand::Block(label) => {
                let _ = write!(out, " %b{label}");
            }
            IrOperand::Literal(value) => {
                let _ = write!(out, " {value}");
            }
        }
    }
    out
}

/// Walks the closure from an entry function.
pub struct TypeDependencyCollector<'l> {
    library: &'l ShaderIrLibrary,
    seen_nodes: AHashSet<IrId>,
    seen_functions: AHashSet<IrFunctionId>,
    capabilities: BTreeSet<Capability>,
    extensions: BTreeSet<&'static str>,
    emission: ModuleEmission,
}

impl<'l> TypeDependencyCollector<'l> {
    #[must_use]
    pub fn new(library: &'l ShaderIrLibrary) -> Self {
        let mut capabilities = BTreeSet::new();
        // Every module is a shader with linkage until an op adds more.
        capabilities.insert(Capability::Shader);
        capabilities.insert(Capability::Linkage);
        Self {
            library,
            seen_nodes: AHashSet::new(),
            seen_functions: AHashSet::new(),
            capabilities,
            extensions: BTreeSet::new(),
            emission: ModuleEmission::default(),
        }
    }

    /// Collects everything reachable from `entry` and returns the ordered
    /// emission.
    #[must_use]
    pub fn collect(mut self, entry: IrFunctionId) -> ModuleEmission {
        self.collect_function(entry);
        self.emission.capabilities = self.capabilities.iter().copied().collect();
        self.emission.extensions = self.extensions.iter().copied().collect();
        self.emission
    }

    fn collect_function(&mut self, function: IrFunctionId) {
        if !self.seen_functions.insert(function) {
            return;
        }
        let declared = self.library.function(function);
        self.collect_node(declared.function_type);
        self.collect_node(declared.return_type);
        for &parameter in &declared.parameter_types {
            self.collect_node(parameter);
        }
        // Declaration position is fixed before walking the body so mutual
        // references keep a stable order.
        self.emission.functions.push(function);
        for block in &declared.blocks {
            for op in block.local_variables.iter().chain(&block.lines) {
                self.collect_op(op);
            }
        }
    }

    fn collect_op(&mut self, op: &IrOp) {
        if let Some(result_type) = op.result_type {
            self.collect_node(result_type);
        }
        if let Some(capability) = required_capability(op.op) {
            self.capabilities.insert(capability);
        }
        if op.op == Op::BranchConditional {
            // Only the condition: walking branch targets would loop.
            if let Some(first) = op.operands.first() {
                self.collect_operand(first);
            }
            return;
        }
        for operand in &op.operands {
            self.collect_operand(operand);
        }
    }

    fn collect_operand(&mut self, operand: &IrOperand) {
        match operand {
            IrOperand::Node(id) => self.collect_node(*id),
            IrOperand::Function(id) => self.collect_function(*id),
            IrOperand::Local(_) | IrOperand::Block(_) | IrOperand::Literal(_) => {}
        }
    }

    fn collect_node(&mut self, id: IrId) {
        if self.seen_nodes.contains(&id) {
            return;
        }
        match self.library.node(id).clone() {
            IrNode::Type(ty) => {
                // Constituent types always land before the composite.
                match &ty.key {
                    TypeKey::Vector { component, .. } => self.collect_node(*component),
                    TypeKey::Matrix { column, .. } => self.collect_node(*column),
                    TypeKey::Pointer { pointee, .. } => self.collect_node(*pointee),
                    TypeKey::FixedArray { element, .. } | TypeKey::RuntimeArray { element } => {
                        self.collect_node(*element);
                    }
                    TypeKey::SampledImage { image } => self.collect_node(*image),
                    TypeKey::Image { sampled_type, .. } => self.collect_node(*sampled_type),
                    TypeKey::Function {
                        return_type,
                        parameters,
                    } => {
                        self.collect_node(*return_type);
                        for &parameter in parameters {
                            self.collect_node(parameter);
                        }
                    }
                    _ => {}
                }
                for &member in &ty.members {
                    self.collect_node(member);
                }
                if ty.storage == StorageClass::StorageBuffer
                    && let Some(extension) = required_extension(StorageClass::StorageBuffer)
                {
                    self.extensions.insert(extension);
                }
                if self.seen_nodes.insert(id) {
                    self.emission.declarations.push(id);
                }
            }
            IrNode::Constant(constant) => {
                self.collect_node(constant.result_type);
                // Composite constituents are themselves constants and must
                // already be visited before this one lands.
                if let crate::ir::ConstantValue::Composite(parts) = &constant.value {
                    for &part in parts {
                        self.collect_node(part);
                    }
                }
                if self.seen_nodes.insert(id) {
                    self.emission.declarations.push(id);
                }
            }
            IrNode::Global(global) => {
                self.collect_node(global.pointer_type);
                if let Some(extension) = required_extension(global.storage) {
                    self.extensions.insert(extension);
                }
                if self.seen_nodes.insert(id) {
                    self.emission.declarations.push(id);
                }
                // The initializer function (and everything it references)
                // rides along with the global.
                if let Some(initializer) = global.initializer {
                    self.collect_function(initializer);
                    self.emission.global_initializers.push(initializer);
                }
            }
            IrNode::ExtensionImport(_) => {
                if self.seen_nodes.insert(id) {
                    self.emission.imports.push(id);
                }
            }
        }
    }
}
