//! Lowering of analyzed fragment code to SPIR-V IR.
//!
//! The compiler runs cycle detection and stage-requirement gathering first,
//! then materializes fragment types and globals, declares every function so
//! calls can reference each other, and finally lowers bodies block by block.
//! Constructs with no shader meaning (strings, heap objects, timeouts)
//! raise `UnsupportedConstruct` validation errors.

use ahash::AHashMap;

use lustre::{
    FieldId, FunctionId, Module, TypeId,
    analyzer::{AnalysisOutput, FunctionBody},
    front::ast::{BinaryToken, NodeKind, ResolvedMember, ResolvedRef, SyntaxTree},
    ids::NodeId,
    members::find_attribute,
    opcode::UnaryOp,
    value::Constant,
};

use crate::{
    cycle_detection,
    errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError},
    function_resolvers::{FunctionResolverRegistry, IntrinsicLowering, Splat, resolve_binary, resolve_cast},
    ir::{
        BasicBlock, ConstantValue, GlobalBinding, GlobalDirection, IrFunction, IrFunctionId, IrGlobal, IrId, IrNode,
        IrOp, IrOperand, ShaderIrLibrary, TypeKey,
    },
    spirv::{Op, StorageClass},
    stage_requirements,
    type_resolvers::{TypeResolution, TypeResolverRegistry},
};

/// The shader IR compiler for one analyzed fragment library.
pub struct ShaderIrCompiler<'a> {
    pub module: &'a Module,
    pub tree: &'a SyntaxTree,
    pub analysis: &'a AnalysisOutput,
    pub type_registry: TypeResolverRegistry,
    pub function_registry: FunctionResolverRegistry,
}

impl<'a> ShaderIrCompiler<'a> {
    #[must_use]
    pub fn new(module: &'a Module, tree: &'a SyntaxTree, analysis: &'a AnalysisOutput) -> Self {
        Self {
            module,
            tree,
            analysis,
            type_registry: TypeResolverRegistry::new(),
            function_registry: FunctionResolverRegistry::new(),
        }
    }

    /// Runs validation and lowering, producing the IR library.
    pub fn compile(&self, errors: &mut ShaderCompilationErrors) -> ShaderIrLibrary {
        let mut library = ShaderIrLibrary::new();

        if cycle_detection::run(self.module, self.tree, self.analysis, errors) {
            return library;
        }
        let requirements = stage_requirements::run(self.module, self.tree, self.analysis, errors);
        for (function, requirement) in &requirements {
            library
                .stage_requirements
                .insert(self.module.function(*function).name.clone(), requirement.stages);
        }
        if errors.error_triggered {
            return library;
        }

        // Fragment fields become module globals.
        let fragment_types = self.fragment_types();
        for &fragment in &fragment_types {
            self.lower_fragment_globals(fragment, &mut library, errors);
        }

        // Declare functions first so calls resolve, then lower bodies.
        let mut bodies: Vec<(FunctionId, &FunctionBody)> =
            self.analysis.bodies.iter().map(|(&f, body)| (f, body)).collect();
        bodies.sort_unstable_by_key(|(function, _)| *function);

        for &(function, body) in &bodies {
            if matches!(body, FunctionBody::Scope { .. }) {
                self.declare_function(function, &mut library, errors);
            }
        }
        for &(function, body) in &bodies {
            match body {
                FunctionBody::Scope {
                    body: body_node,
                    parameters,
                } => self.lower_body(function, *body_node, parameters, &mut library, errors),
                FunctionBody::FieldInitializer { field, initializer } => {
                    self.lower_global_initializer(*field, *initializer, &mut library, errors);
                }
                FunctionBody::PreConstructor { .. } => {}
            }
        }
        library
    }

    /// The fragment classes of this compilation, i.e. bound types with a
    /// declared stage attribute.
    fn fragment_types(&self) -> Vec<TypeId> {
        self.module
            .library(self.analysis.library)
            .types
            .iter()
            .copied()
            .filter(|&ty| stage_requirements::declared_stage(self.module, ty).is_some())
            .collect()
    }

    fn resolution<'s, 'l>(
        &'s self,
        library: &'l mut ShaderIrLibrary,
        errors: &'l mut ShaderCompilationErrors,
    ) -> TypeResolution<'s, 'l> {
        TypeResolution {
            module: self.module,
            registry: &self.type_registry,
            library,
            errors,
        }
    }

    fn lower_fragment_globals(
        &self,
        fragment: TypeId,
        library: &mut ShaderIrLibrary,
        errors: &mut ShaderCompilationErrors,
    ) {
        let Some(bound) = self.module.types.bound(fragment) else {
            return;
        };
        let fields: Vec<FieldId> = bound.fields.values().copied().collect();
        for field in fields {
            let descriptor = self.module.field(field);
            let field_name = descriptor.name.clone();
            let value_type_id = descriptor.value_type;
            let direction = if find_attribute(&descriptor.attributes, "Input").is_some() {
                GlobalDirection::Input
            } else if find_attribute(&descriptor.attributes, "Output").is_some() {
                GlobalDirection::Output
            } else if find_attribute(&descriptor.attributes, "Uniform").is_some() {
                GlobalDirection::Uniform
            } else {
                GlobalDirection::Private
            };
            // `[Name("…")]` overrides the routing key.
            let routing_name = find_attribute(&descriptor.attributes, "Name")
                .and_then(|attribute| attribute.string_parameter().map(str::to_owned))
                .unwrap_or_else(|| field_name.clone());
            let storage = match direction {
                GlobalDirection::Input => StorageClass::Input,
                GlobalDirection::Output => StorageClass::Output,
                GlobalDirection::Uniform => StorageClass::UniformConstant,
                GlobalDirection::Private => StorageClass::Private,
            };

            let mut resolution = self.resolution(library, errors);
            let Some(value_type) = resolution.resolve(value_type_id) else {
                continue;
            };
            let pointer_type = resolution.pointer(value_type, storage);
            let global_name = format!("{}.{}", self.module.types.name_of(fragment), field_name);
            let global = library.add_node(IrNode::Global(IrGlobal {
                pointer_type,
                storage,
                name: global_name.clone(),
                initializer: None,
            }));
            library.globals.insert(global_name, global);
            library.global_bindings.push(GlobalBinding {
                global,
                fragment,
                field_name,
                routing_name,
                direction,
                value_type,
            });
        }
    }

    fn declare_function(&self, function: FunctionId, library: &mut ShaderIrLibrary, errors: &mut ShaderCompilationErrors) {
        let declared = self.module.function(function);
        let name = match declared.owner {
            Some(owner) => format!("{}.{}", self.module.types.name_of(owner), declared.name),
            None => declared.name.clone(),
        };
        let parameter_count = declared.signature.params.len();
        let parameter_type_ids: Vec<TypeId> = declared.signature.params.iter().map(|p| p.ty).collect();
        let return_type_id = declared.signature.return_type;

        let mut resolution = self.resolution(library, errors);
        let Some(return_type) = resolution.resolve(return_type_id) else {
            return;
        };
        let mut parameter_types = Vec::with_capacity(parameter_count);
        for ty in parameter_type_ids {
            let Some(resolved) = resolution.resolve(ty) else {
                return;
            };
            parameter_types.push(resolved);
        }
        let function_type = library.intern_type(
            TypeKey::Function {
                return_type,
                parameters: parameter_types.clone(),
            },
            format!("fn {name}"),
        );

        let mut ir_function = IrFunction {
            name,
            function_type,
            return_type,
            parameter_locals: Vec::new(),
            parameter_types,
            blocks: vec![BasicBlock::default()],
            source: Some(function),
            next_local: 0,
        };
        for _ in 0..parameter_count {
            let local = ir_function.allocate_local();
            ir_function.parameter_locals.push(local);
        }
        let id = library.add_function(ir_function);
        library.function_map.insert(function, id);
    }

    fn lower_global_initializer(
        &self,
        field: FieldId,
        initializer: NodeId,
        library: &mut ShaderIrLibrary,
        errors: &mut ShaderCompilationErrors,
    ) {
        let descriptor = self.module.field(field);
        let owner = descriptor.owner;
        if stage_requirements::declared_stage(self.module, owner).is_none() {
            return;
        }
        let field_name = descriptor.name.clone();
        let value_type_id = descriptor.value_type;
        let global_name = format!("{}.{}", self.module.types.name_of(owner), field_name);
        let Some(global) = library.find_global(&global_name) else {
            return;
        };

        let mut resolution = self.resolution(library, errors);
        let Some(return_type) = resolution.resolve(value_type_id) else {
            return;
        };
        let function_type = library.intern_type(
            TypeKey::Function {
                return_type,
                parameters: Vec::new(),
            },
            format!("fn init {global_name}"),
        );
        let ir_function = IrFunction {
            name: format!("[init] {global_name}"),
            function_type,
            return_type,
            parameter_locals: Vec::new(),
            parameter_types: Vec::new(),
            blocks: vec![BasicBlock::default()],
            source: None,
            next_local: 0,
        };
        let id = library.add_function(ir_function);

        let mut translator = FunctionTranslator {
            compiler: self,
            library,
            errors,
            function: id,
            locals: AHashMap::new(),
            current_block: 0,
            terminated: false,
        };
        if let Some(value) = translator.lower_expression(initializer) {
            let operand = value.operand;
            translator.emit(IrOp {
                op: Op::ReturnValue,
                result_type: None,
                result: None,
                operands: vec![operand],
            });
        }

        if let IrNode::Global(global_node) = library.node_mut(global) {
            global_node.initializer = Some(id);
        }
    }

    fn lower_body(
        &self,
        function: FunctionId,
        body: NodeId,
        parameters: &[NodeId],
        library: &mut ShaderIrLibrary,
        errors: &mut ShaderCompilationErrors,
    ) {
        let Some(&ir_id) = library.function_map.get(&function) else {
            return;
        };
        let mut translator = FunctionTranslator {
            compiler: self,
            library,
            errors,
            function: ir_id,
            locals: AHashMap::new(),
            current_block: 0,
            terminated: false,
        };

        // Parameters become function-storage variables so assignment works
        // uniformly.
        for (index, &parameter) in parameters.iter().enumerate() {
            let Some(value_type_id) = (match translator.compiler.tree.kind(parameter) {
                NodeKind::Parameter { resolved_type, .. } => *resolved_type,
                _ => None,
            }) else {
                continue;
            };
            let Some(value_type) = translator.resolve_type(value_type_id) else {
                continue;
            };
            let pointer = translator.declare_variable(parameter, value_type);
            let parameter_local = translator.library.function(ir_id).parameter_locals[index];
            translator.emit(IrOp {
                op: Op::Store,
                result_type: None,
                result: None,
                operands: vec![IrOperand::Local(pointer), IrOperand::Local(parameter_local)],
            });
        }

        translator.lower_statement(body);
        if !translator.terminated {
            translator.emit(IrOp {
                op: Op::Return,
                result_type: None,
                result: None,
                operands: Vec::new(),
            });
        }
    }
}

/// A lowered value: the operand plus its value type.
#[derive(Debug, Clone, Copy)]
struct Translated {
    operand: IrOperand,
    value_type: IrId,
}

struct FunctionTranslator<'c, 'l> {
    compiler: &'c ShaderIrCompiler<'c>,
    library: &'l mut ShaderIrLibrary,
    errors: &'l mut ShaderCompilationErrors,
    function: IrFunctionId,
    /// Declaration node -> (pointer SSA id, value type).
    locals: AHashMap<NodeId, (u32, IrId)>,
    current_block: usize,
    terminated: bool,
}

impl FunctionTranslator<'_, '_> {
    fn resolve_type(&mut self, ty: TypeId) -> Option<IrId> {
        let mut resolution = TypeResolution {
            module: self.compiler.module,
            registry: &self.compiler.type_registry,
            library: self.library,
            errors: self.errors,
        };
        resolution.resolve(ty)
    }

    fn pointer_type(&mut self, pointee: IrId, storage: StorageClass) -> IrId {
        let mut resolution = TypeResolution {
            module: self.compiler.module,
            registry: &self.compiler.type_registry,
            library: self.library,
            errors: self.errors,
        };
        resolution.pointer(pointee, storage)
    }

    fn allocate_local(&mut self) -> u32 {
        self.library.function_mut(self.function).allocate_local()
    }

    fn emit(&mut self, op: IrOp) {
        if self.terminated {
            return;
        }
        let block = self.current_block;
        self.library.function_mut(self.function).blocks[block].lines.push(op);
    }

    /// Starts a fresh block and returns its label.
    fn start_block(&mut self) -> u32 {
        let function = self.library.function_mut(self.function);
        let label = u32::try_from(function.blocks.len()).expect("block count exceeds u32");
        function.blocks.push(BasicBlock {
            label,
            ..BasicBlock::default()
        });
        self.current_block = label as usize;
        self.terminated = false;
        label
    }

    fn unsupported(&mut self, node: NodeId, what: &str) {
        self.errors.raise(ValidationError {
            kind: ShaderErrorKind::UnsupportedConstruct,
            short_message: format!("{what} is not legal in shaders"),
            full_message: format!("{what} has no SPIR-V lowering"),
            location: self.compiler.tree.location(node),
            call_stack: Vec::new(),
        });
    }

    /// A function-storage variable for a declaration node.
    fn declare_variable(&mut self, declaration: NodeId, value_type: IrId) -> u32 {
        let pointer_type = self.pointer_type(value_type, StorageClass::Function);
        let result = self.allocate_local();
        let function = self.library.function_mut(self.function);
        function.blocks[0].local_variables.push(IrOp {
            op: Op::Variable,
            result_type: Some(pointer_type),
            result: Some(result),
            operands: vec![IrOperand::Literal(StorageClass::Function as u32)],
        });
        self.locals.insert(declaration, (result, value_type));
        result
    }

    // --- statements ---

    fn lower_statement(&mut self, id: NodeId) {
        if self.terminated {
            return;
        }
        match self.compiler.tree.kind(id).clone() {
            NodeKind::Scope { statements } => {
                for statement in statements {
                    self.lower_statement(statement);
                }
            }
            NodeKind::LocalVariable {
                initializer,
                resolved_type,
                ..
            } => {
                let Some(value_type) = resolved_type.and_then(|ty| self.resolve_type(ty)) else {
                    return;
                };
                let pointer = self.declare_variable(id, value_type);
                if let Some(initializer) = initializer
                    && let Some(value) = self.lower_expression(initializer)
                {
                    self.emit(IrOp {
                        op: Op::Store,
                        result_type: None,
                        result: None,
                        operands: vec![IrOperand::Local(pointer), value.operand],
                    });
                }
            }
            NodeKind::If {
                condition,
                then_scope,
                else_node,
            } => self.lower_if(condition, then_scope, else_node),
            NodeKind::While { condition, body } => self.lower_while(condition, body),
            NodeKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                if let Some(initializer) = initializer {
                    self.lower_statement(initializer);
                }
                self.lower_loop(condition, body, increment);
            }
            NodeKind::Return { value } => {
                match value.and_then(|value| self.lower_expression(value)) {
                    Some(value) => self.emit(IrOp {
                        op: Op::ReturnValue,
                        result_type: None,
                        result: None,
                        operands: vec![value.operand],
                    }),
                    None => self.emit(IrOp {
                        op: Op::Return,
                        result_type: None,
                        result: None,
                        operands: Vec::new(),
                    }),
                }
                self.terminated = true;
            }
            NodeKind::BinaryOperator { .. }
            | NodeKind::UnaryOperator { .. }
            | NodeKind::FunctionCall { .. }
            | NodeKind::MultiExpression { .. } => {
                self.lower_expression(id);
            }
            NodeKind::Throw { .. } | NodeKind::Delete { .. } | NodeKind::Timeout { .. } => {
                self.unsupported(id, "this statement");
            }
            NodeKind::Loop { .. } | NodeKind::DoWhile { .. } | NodeKind::Break | NodeKind::Continue => {
                self.unsupported(id, "this loop form");
            }
            _ => {
                self.lower_expression(id);
            }
        }
    }

    fn lower_if(&mut self, condition: NodeId, then_scope: NodeId, else_node: Option<NodeId>) {
        let Some(condition_value) = self.lower_expression(condition) else {
            return;
        };
        let branch_block = self.current_block;
        let then_label = self.start_block();
        self.lower_statement(then_scope);
        let then_end = self.current_block;
        let then_terminated = self.terminated;

        let (else_label, else_end, else_terminated) = match else_node {
            Some(else_node) => {
                let label = self.start_block();
                self.lower_statement(else_node);
                (label, self.current_block, self.terminated)
            }
            None => (0, 0, false),
        };

        let merge_label = self.start_block();

        // Wire the branch in the originating block.
        let has_else = else_node.is_some();
        let false_target = if has_else { else_label } else { merge_label };
        self.library.function_mut(self.function).blocks[branch_block].lines.push(IrOp {
            op: Op::BranchConditional,
            result_type: None,
            result: None,
            operands: vec![
                condition_value.operand,
                IrOperand::Block(then_label),
                IrOperand::Block(false_target),
            ],
        });
        if !then_terminated {
            self.library.function_mut(self.function).blocks[then_end].lines.push(IrOp {
                op: Op::Branch,
                result_type: None,
                result: None,
                operands: vec![IrOperand::Block(merge_label)],
            });
        }
        if has_else && !else_terminated {
            self.library.function_mut(self.function).blocks[else_end].lines.push(IrOp {
                op: Op::Branch,
                result_type: None,
                result: None,
                operands: vec![IrOperand::Block(merge_label)],
            });
        }
    }

    fn lower_while(&mut self, condition: NodeId, body: NodeId) {
        self.lower_loop(Some(condition), body, None);
    }

    fn lower_loop(&mut self, condition: Option<NodeId>, body: NodeId, increment: Option<NodeId>) {
        let entry_block = self.current_block;
        let header_label = self.start_block();
        let condition_value = condition.and_then(|condition| self.lower_expression(condition));
        let header_end = self.current_block;

        let body_label = self.start_block();
        self.lower_statement(body);
        if let Some(increment) = increment {
            self.lower_expression(increment);
        }
        let body_end = self.current_block;
        let body_terminated = self.terminated;

        let merge_label = self.start_block();

        let function = self.library.function_mut(self.function);
        function.blocks[entry_block].lines.push(IrOp {
            op: Op::Branch,
            result_type: None,
            result: None,
            operands: vec![IrOperand::Block(header_label)],
        });
        match condition_value {
            Some(condition_value) => function.blocks[header_end].lines.push(IrOp {
                op: Op::BranchConditional,
                result_type: None,
                result: None,
                operands: vec![
                    condition_value.operand,
                    IrOperand::Block(body_label),
                    IrOperand::Block(merge_label),
                ],
            }),
            None => function.blocks[header_end].lines.push(IrOp {
                op: Op::Branch,
                result_type: None,
                result: None,
                operands: vec![IrOperand::Block(body_label)],
            }),
        }
        if !body_terminated {
            function.blocks[body_end].lines.push(IrOp {
                op: Op::Branch,
                result_type: None,
                result: None,
                operands: vec![IrOperand::Block(header_label)],
            });
        }
    }

    // --- expressions ---

    fn lower_expression(&mut self, id: NodeId) -> Option<Translated> {
        match self.compiler.tree.kind(id).clone() {
            NodeKind::Literal { constant } => self.lower_literal(id, &constant),
            NodeKind::Identifier {
                resolved: Some(ResolvedRef::Local(declaration)),
                ..
            } => {
                let (pointer, value_type) = *self.locals.get(&declaration)?;
                Some(self.load(IrOperand::Local(pointer), value_type))
            }
            NodeKind::MemberAccess { resolved, .. } => {
                let binding = self.field_binding(resolved)?;
                Some(self.load(IrOperand::Node(binding.0), binding.1))
            }
            NodeKind::BinaryOperator { op, left, right } => self.lower_binary(id, op, left, right),
            NodeKind::UnaryOperator { op, operand } => self.lower_unary(id, op, operand),
            NodeKind::TypeCast { operand, operator, .. } => {
                let value = self.lower_expression(operand)?;
                let Some(operator) = operator else {
                    return Some(value);
                };
                let result_type = self
                    .compiler
                    .tree
                    .get(id)
                    .result_type
                    .and_then(|ty| self.resolve_type(ty))?;
                match resolve_cast(&operator) {
                    Some(op) => {
                        let result = self.allocate_local();
                        self.emit(IrOp {
                            op,
                            result_type: Some(result_type),
                            result: Some(result),
                            operands: vec![value.operand],
                        });
                        Some(Translated {
                            operand: IrOperand::Local(result),
                            value_type: result_type,
                        })
                    }
                    None => Some(value),
                }
            }
            NodeKind::FunctionCall {
                callee,
                arguments,
                resolved_function,
            } => self.lower_call(id, callee, &arguments, resolved_function),
            NodeKind::MultiExpression {
                expressions,
                yield_index,
                ..
            } => {
                let mut result = None;
                for (index, &expression) in expressions.iter().enumerate() {
                    if matches!(self.compiler.tree.kind(expression), NodeKind::LocalVariable { .. }) {
                        self.lower_statement(expression);
                    } else {
                        let value = self.lower_expression(expression);
                        if index == yield_index {
                            result = value;
                        }
                    }
                }
                result
            }
            NodeKind::This => None,
            _ => {
                self.unsupported(id, "this expression");
                None
            }
        }
    }

    fn lower_literal(&mut self, id: NodeId, constant: &Constant) -> Option<Translated> {
        let result_type_id = self.compiler.tree.get(id).result_type?;
        let value_type = self.resolve_type(result_type_id)?;
        let value = match constant {
            Constant::Boolean(v) => ConstantValue::Bool(*v),
            Constant::Integer(v) => ConstantValue::Int(*v),
            Constant::Real(v) => ConstantValue::Float(*v),
            _ => {
                self.unsupported(id, "this literal");
                return None;
            }
        };
        let node = self.library.intern_constant(value_type, value);
        Some(Translated {
            operand: IrOperand::Node(node),
            value_type,
        })
    }

    /// The global node and value type behind a `this.Field` access.
    fn field_binding(&mut self, resolved: Option<ResolvedMember>) -> Option<(IrId, IrId)> {
        let Some(ResolvedMember::Field(field)) = resolved else {
            return None;
        };
        let binding = self
            .library
            .global_bindings
            .iter()
            .find(|binding| {
                let descriptor = self.compiler.module.field(field);
                binding.fragment == descriptor.owner && binding.field_name == descriptor.name
            })?;
        Some((binding.global, binding.value_type))
    }

    fn load(&mut self, pointer: IrOperand, value_type: IrId) -> Translated {
        let result = self.allocate_local();
        self.emit(IrOp {
            op: Op::Load,
            result_type: Some(value_type),
            result: Some(result),
            operands: vec![pointer],
        });
        Translated {
            operand: IrOperand::Local(result),
            value_type,
        }
    }

    /// The writable pointer behind an assignment target.
    fn lower_target(&mut self, id: NodeId) -> Option<IrOperand> {
        match self.compiler.tree.kind(id).clone() {
            NodeKind::Identifier {
                resolved: Some(ResolvedRef::Local(declaration)),
                ..
            } => self.locals.get(&declaration).map(|&(pointer, _)| IrOperand::Local(pointer)),
            NodeKind::MemberAccess { resolved, .. } => self.field_binding(resolved).map(|(global, _)| IrOperand::Node(global)),
            _ => {
                self.unsupported(id, "this assignment target");
                None
            }
        }
    }

    fn lower_binary(&mut self, id: NodeId, op: BinaryToken, left: NodeId, right: NodeId) -> Option<Translated> {
        match op {
            BinaryToken::Assign => {
                let target = self.lower_target(left)?;
                let value = self.lower_expression(right)?;
                self.emit(IrOp {
                    op: Op::Store,
                    result_type: None,
                    result: None,
                    operands: vec![target, value.operand],
                });
                Some(value)
            }
            BinaryToken::CompoundAssign(arith) => {
                let target = self.lower_target(left)?;
                let current = self.lower_expression(left)?;
                let value = self.lower_expression(right)?;
                let result = self.lower_binary_arith(id, arith, left, right, current, value)?;
                self.emit(IrOp {
                    op: Op::Store,
                    result_type: None,
                    result: None,
                    operands: vec![target, result.operand],
                });
                Some(result)
            }
            BinaryToken::LogicalAnd | BinaryToken::LogicalOr => {
                // Shader lowering keeps both sides; fragments are expected
                // to be side-effect free in conditions.
                let left_value = self.lower_expression(left)?;
                let right_value = self.lower_expression(right)?;
                let result = self.allocate_local();
                let bool_type = left_value.value_type;
                self.emit(IrOp {
                    op: if op == BinaryToken::LogicalAnd {
                        Op::LogicalAnd
                    } else {
                        Op::LogicalOr
                    },
                    result_type: Some(bool_type),
                    result: Some(result),
                    operands: vec![left_value.operand, right_value.operand],
                });
                Some(Translated {
                    operand: IrOperand::Local(result),
                    value_type: bool_type,
                })
            }
            BinaryToken::Arith(arith) => {
                let left_value = self.lower_expression(left)?;
                let right_value = self.lower_expression(right)?;
                self.lower_binary_arith(id, arith, left, right, left_value, right_value)
            }
        }
    }

    fn lower_binary_arith(
        &mut self,
        id: NodeId,
        op: lustre::opcode::BinaryOp,
        left: NodeId,
        right: NodeId,
        left_value: Translated,
        right_value: Translated,
    ) -> Option<Translated> {
        let left_type_id = self.compiler.tree.get(left).result_type?;
        let right_type_id = self.compiler.tree.get(right).result_type?;
        let Some(lowering) = resolve_binary(self.compiler.module, op, left_type_id, right_type_id) else {
            self.unsupported(id, "this operator");
            return None;
        };

        // Splat the scalar side into a vector when SPIR-V has no mixed form.
        let (mut lhs, mut rhs) = (left_value, right_value);
        match lowering.splat {
            Splat::Left => lhs = self.splat(lhs, rhs.value_type),
            Splat::Right => rhs = self.splat(rhs, lhs.value_type),
            Splat::None => {}
        }
        if lowering.flip_operands {
            std::mem::swap(&mut lhs, &mut rhs);
        }

        let result_type = if lowering.boolean_result {
            self.library.intern_type(TypeKey::Bool, "bool")
        } else {
            self.compiler
                .tree
                .get(id)
                .result_type
                .and_then(|ty| self.resolve_type(ty))?
        };
        let result = self.allocate_local();
        self.emit(IrOp {
            op: lowering.op,
            result_type: Some(result_type),
            result: Some(result),
            operands: vec![lhs.operand, rhs.operand],
        });
        Some(Translated {
            operand: IrOperand::Local(result),
            value_type: result_type,
        })
    }

    /// Builds a vector from a scalar by repeating it per component.
    fn splat(&mut self, scalar: Translated, vector_type: IrId) -> Translated {
        let count = match self.library.node(vector_type) {
            IrNode::Type(ty) => match ty.key {
                TypeKey::Vector { count, .. } => count,
                _ => return scalar,
            },
            _ => return scalar,
        };
        let result = self.allocate_local();
        self.emit(IrOp {
            op: Op::CompositeConstruct,
            result_type: Some(vector_type),
            result: Some(result),
            operands: vec![scalar.operand; count as usize],
        });
        Translated {
            operand: IrOperand::Local(result),
            value_type: vector_type,
        }
    }

    fn lower_unary(&mut self, id: NodeId, op: UnaryOp, operand: NodeId) -> Option<Translated> {
        let value = self.lower_expression(operand)?;
        let instruction = match op {
            UnaryOp::Negate => {
                let is_float = matches!(
                    self.library.node(value.value_type),
                    IrNode::Type(ty) if matches!(ty.key, TypeKey::Float { .. } | TypeKey::Vector { .. } | TypeKey::Matrix { .. })
                );
                if is_float { Op::FNegate } else { Op::SNegate }
            }
            UnaryOp::LogicalNot => Op::LogicalNot,
            UnaryOp::BitwiseNot => Op::Not,
            UnaryOp::Increment | UnaryOp::Decrement => {
                self.unsupported(id, "increment in shaders");
                return None;
            }
        };
        let result = self.allocate_local();
        self.emit(IrOp {
            op: instruction,
            result_type: Some(value.value_type),
            result: Some(result),
            operands: vec![value.operand],
        });
        Some(Translated {
            operand: IrOperand::Local(result),
            value_type: value.value_type,
        })
    }

    fn lower_call(
        &mut self,
        id: NodeId,
        callee: NodeId,
        arguments: &[NodeId],
        resolved_function: Option<FunctionId>,
    ) -> Option<Translated> {
        let Some(function) = resolved_function else {
            self.unsupported(id, "delegate calls");
            return None;
        };
        let result_type = self
            .compiler
            .tree
            .get(id)
            .result_type
            .and_then(|ty| self.resolve_type(ty));

        // Intrinsics first: casts, math, and image operations.
        if let Some(lowering) = self.compiler.function_registry.find(self.compiler.module, function) {
            return self.lower_intrinsic(lowering, callee, arguments, result_type);
        }

        // A user fragment function.
        let Some(&target) = self.library.function_map.get(&function) else {
            self.errors.raise(ValidationError {
                kind: ShaderErrorKind::UnresolvedFunction,
                short_message: format!("'{}' has no shader lowering", self.compiler.module.function(function).name),
                full_message: format!(
                    "the function '{}' was not lowered into this shader library",
                    self.compiler.module.function(function).name
                ),
                location: self.compiler.tree.location(id),
                call_stack: Vec::new(),
            });
            return None;
        };
        let mut operands = vec![IrOperand::Function(target)];
        for &argument in arguments {
            operands.push(self.lower_expression(argument)?.operand);
        }
        let result = self.allocate_local();
        let result_type = result_type?;
        self.emit(IrOp {
            op: Op::FunctionCall,
            result_type: Some(result_type),
            result: Some(result),
            operands,
        });
        Some(Translated {
            operand: IrOperand::Local(result),
            value_type: result_type,
        })
    }

    fn lower_intrinsic(
        &mut self,
        lowering: IntrinsicLowering,
        callee: NodeId,
        arguments: &[NodeId],
        result_type: Option<IrId>,
    ) -> Option<Translated> {
        let result_type = result_type?;
        match lowering {
            IntrinsicLowering::Simple(op) => {
                let mut operands = Vec::with_capacity(arguments.len());
                for &argument in arguments {
                    operands.push(self.lower_expression(argument)?.operand);
                }
                let result = self.allocate_local();
                self.emit(IrOp {
                    op,
                    result_type: Some(result_type),
                    result: Some(result),
                    operands,
                });
                Some(Translated {
                    operand: IrOperand::Local(result),
                    value_type: result_type,
                })
            }
            IntrinsicLowering::Extended(member) => {
                let import = self.library.intern_extension_import("GLSL.std.450");
                let mut operands = vec![IrOperand::Node(import), IrOperand::Literal(member)];
                for &argument in arguments {
                    operands.push(self.lower_expression(argument)?.operand);
                }
                let result = self.allocate_local();
                self.emit(IrOp {
                    op: Op::ExtInst,
                    result_type: Some(result_type),
                    result: Some(result),
                    operands,
                });
                Some(Translated {
                    operand: IrOperand::Local(result),
                    value_type: result_type,
                })
            }
            IntrinsicLowering::SampleImplicitLod => {
                // The receiver is the sampled image the method was called on.
                let receiver = match self.compiler.tree.kind(callee) {
                    NodeKind::MemberAccess { object, .. } => *object,
                    _ => callee,
                };
                let image = self.lower_expression(receiver)?;
                let coordinate = self.lower_expression(*arguments.first()?)?;
                let result = self.allocate_local();
                self.emit(IrOp {
                    op: Op::ImageSampleImplicitLod,
                    result_type: Some(result_type),
                    result: Some(result),
                    operands: vec![image.operand, coordinate.operand],
                });
                Some(Translated {
                    operand: IrOperand::Local(result),
                    value_type: result_type,
                })
            }
        }
    }
}
