//! The bytecode compiler: walks the annotated tree and emits three-address
//! opcodes into each function's buffer.
//!
//! Slot allocation is a per-function bump allocator: parameters and `this`
//! occupy the frame header, locals and temporaries follow. Forward jumps are
//! emitted with a placeholder offset and patched when the target is known;
//! loops keep patch lists for their breaks and continues.

use ahash::AHashMap;

use crate::{
    analyzer::{AnalysisOutput, FunctionBody},
    front::ast::{BinaryToken, NodeKind, ResolvedMember, ResolvedRef, SyntaxTree},
    function::{CodeBlock, DebugEntry},
    ids::{FieldId, FunctionId, MemberRef, NodeId, TypeId},
    library::Module,
    location::CodeLocation,
    opcode::{CopyMode, Instruction, LocalIndex, Operand, OperandKind, UnaryOp},
    types::TypeKind,
    value::{Constant, Handle, Value},
};

/// Compiles every analyzed function body into its opcode buffer.
pub fn generate(module: &mut Module, tree: &SyntaxTree, output: &AnalysisOutput) {
    let mut compiled: Vec<(FunctionId, CodeBlock)> = Vec::with_capacity(output.bodies.len());
    for (&function, body) in &output.bodies {
        let mut generator = FunctionGenerator::new(module, tree, function);
        let code = generator.run(body);
        compiled.push((function, code));
    }
    for (function, code) in compiled {
        module.function_mut(function).code = Some(code);
    }
}

/// A forward jump waiting for its target.
#[derive(Debug, Clone, Copy)]
struct JumpLabel(usize);

/// Patch lists for one enclosing loop.
#[derive(Debug, Default)]
struct LoopFrame {
    break_jumps: Vec<JumpLabel>,
    continue_jumps: Vec<JumpLabel>,
    /// How many scopes were open when the loop began, so break/continue can
    /// emit the right number of `EndScope`s.
    scope_depth: usize,
}

struct FunctionGenerator<'a> {
    module: &'a Module,
    tree: &'a SyntaxTree,
    function: FunctionId,
    ops: Vec<Instruction>,
    constants: Vec<Value>,
    debug_ranges: Vec<DebugEntry>,
    /// Next free frame slot.
    next_slot: u32,
    /// Declaration node to frame slot.
    slots: AHashMap<NodeId, u32>,
    loops: Vec<LoopFrame>,
    /// Scopes currently open at the emission point.
    scope_depth: usize,
    current_location: Option<CodeLocation>,
}

impl<'a> FunctionGenerator<'a> {
    fn new(module: &'a Module, tree: &'a SyntaxTree, function: FunctionId) -> Self {
        let declared = module.function(function);
        Self {
            module,
            tree,
            function,
            ops: Vec::new(),
            constants: Vec::new(),
            debug_ranges: Vec::new(),
            next_slot: declared.first_local_slot(),
            slots: AHashMap::new(),
            loops: Vec::new(),
            scope_depth: 0,
            current_location: None,
        }
    }

    fn run(&mut self, body: &FunctionBody) -> CodeBlock {
        match body {
            FunctionBody::Scope { body, parameters } => {
                for (index, &parameter) in parameters.iter().enumerate() {
                    let slot = self.module.function(self.function).parameter_slot(index);
                    self.slots.insert(parameter, slot);
                }
                self.emit_statement(*body);
            }
            FunctionBody::FieldInitializer { field, initializer } => {
                self.emit_field_initializer(*field, *initializer);
            }
            FunctionBody::PreConstructor { type_id } => {
                self.emit_pre_constructor(*type_id);
            }
        }
        self.emit(Instruction::Return);
        CodeBlock {
            ops: std::mem::take(&mut self.ops),
            constants: std::mem::take(&mut self.constants),
            required_stack: self.next_slot,
            debug_ranges: std::mem::take(&mut self.debug_ranges),
        }
    }

    // --- low-level emission ---

    fn emit(&mut self, op: Instruction) -> usize {
        let index = self.ops.len();
        if let Some(location) = &self.current_location {
            let should_record = self
                .debug_ranges
                .last()
                .is_none_or(|last| last.location != *location);
            if should_record {
                self.debug_ranges.push(DebugEntry {
                    op_index: index as u32,
                    location: location.clone(),
                });
            }
        }
        self.ops.push(op);
        index
    }

    fn set_location(&mut self, node: NodeId) {
        let mut location = self.tree.location(node);
        let function = self.module.function(self.function);
        location.function = Some(function.name.clone());
        location.class = function.owner.map(|owner| self.module.types.name_of(owner).to_owned());
        self.current_location = Some(location);
    }

    fn alloc_temp(&mut self) -> LocalIndex {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn alloc_block(&mut self, count: u32) -> LocalIndex {
        let slot = self.next_slot;
        self.next_slot += count;
        slot
    }

    fn add_constant(&mut self, value: Value) -> u32 {
        let index = u32::try_from(self.constants.len()).expect("constant pool exceeds u32");
        self.constants.push(value);
        index
    }

    fn constant_operand(&mut self, value: Value) -> Operand {
        Operand::constant(self.add_constant(value))
    }

    /// Emits a forward jump, returning the label to patch.
    fn emit_jump(&mut self, op: Instruction) -> JumpLabel {
        JumpLabel(self.emit(op))
    }

    /// Points a forward jump at the current instruction position.
    fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.ops.len();
        let offset = i32::try_from(target).expect("opcode index exceeds i32")
            - i32::try_from(label.0).expect("opcode index exceeds i32");
        match &mut self.ops[label.0] {
            Instruction::Jump { jump_offset } | Instruction::If { jump_offset, .. } => *jump_offset = offset,
            other => unreachable!("patching a non-jump instruction {other:?}"),
        }
    }

    /// Emits a backward jump to a known instruction index.
    fn emit_jump_to(&mut self, target: usize) {
        let current = self.ops.len();
        let offset = i32::try_from(target).expect("opcode index exceeds i32")
            - i32::try_from(current).expect("opcode index exceeds i32");
        self.emit(Instruction::Jump { jump_offset: offset });
    }

    fn current_offset(&self) -> usize {
        self.ops.len()
    }

    // --- statements ---

    fn emit_statement(&mut self, id: NodeId) {
        self.set_location(id);
        match self.tree.kind(id).clone() {
            NodeKind::Scope { statements } => {
                self.emit(Instruction::BeginScope);
                self.scope_depth += 1;
                for statement in statements {
                    self.emit_statement(statement);
                }
                self.scope_depth -= 1;
                self.emit(Instruction::EndScope);
            }
            NodeKind::If {
                condition,
                then_scope,
                else_node,
            } => {
                let condition_operand = self.emit_expression(condition);
                let skip_then = self.emit_jump(Instruction::If {
                    condition: condition_operand,
                    jump_offset: 0,
                    on_true: false,
                });
                self.emit_statement(then_scope);
                match else_node {
                    Some(else_node) => {
                        let skip_else = self.emit_jump(Instruction::Jump { jump_offset: 0 });
                        self.patch_jump(skip_then);
                        self.emit_statement(else_node);
                        self.patch_jump(skip_else);
                    }
                    None => self.patch_jump(skip_then),
                }
            }
            NodeKind::While { condition, body } => {
                let start = self.current_offset();
                let condition_operand = self.emit_expression(condition);
                let exit = self.emit_jump(Instruction::If {
                    condition: condition_operand,
                    jump_offset: 0,
                    on_true: false,
                });
                self.loops.push(LoopFrame {
                    scope_depth: self.scope_depth,
                    ..LoopFrame::default()
                });
                self.emit_statement(body);
                self.emit_jump_to(start);
                self.patch_jump(exit);
                self.finish_loop(start);
            }
            NodeKind::DoWhile { body, condition } => {
                let start = self.current_offset();
                self.loops.push(LoopFrame {
                    scope_depth: self.scope_depth,
                    ..LoopFrame::default()
                });
                self.emit_statement(body);
                let continue_target = self.current_offset();
                let condition_operand = self.emit_expression(condition);
                let back = self.current_offset();
                let offset = i32::try_from(start).expect("opcode index exceeds i32")
                    - i32::try_from(back).expect("opcode index exceeds i32");
                self.emit(Instruction::If {
                    condition: condition_operand,
                    jump_offset: offset,
                    on_true: true,
                });
                self.finish_loop(continue_target);
            }
            NodeKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                self.emit(Instruction::BeginScope);
                self.scope_depth += 1;
                if let Some(initializer) = initializer {
                    self.emit_statement(initializer);
                }
                let start = self.current_offset();
                let exit = condition.map(|condition| {
                    let condition_operand = self.emit_expression(condition);
                    self.emit_jump(Instruction::If {
                        condition: condition_operand,
                        jump_offset: 0,
                        on_true: false,
                    })
                });
                self.loops.push(LoopFrame {
                    scope_depth: self.scope_depth,
                    ..LoopFrame::default()
                });
                self.emit_statement(body);
                let continue_target = self.current_offset();
                if let Some(increment) = increment {
                    self.emit_expression(increment);
                }
                self.emit_jump_to(start);
                if let Some(exit) = exit {
                    self.patch_jump(exit);
                }
                self.finish_loop(continue_target);
                self.scope_depth -= 1;
                self.emit(Instruction::EndScope);
            }
            NodeKind::Loop { body } => {
                let start = self.current_offset();
                self.loops.push(LoopFrame {
                    scope_depth: self.scope_depth,
                    ..LoopFrame::default()
                });
                self.emit_statement(body);
                self.emit_jump_to(start);
                self.finish_loop(start);
            }
            NodeKind::Break => {
                let Some(frame) = self.loops.last() else {
                    return;
                };
                let unwind = self.scope_depth - frame.scope_depth;
                for _ in 0..unwind {
                    self.emit(Instruction::EndScope);
                }
                let label = self.emit_jump(Instruction::Jump { jump_offset: 0 });
                if let Some(frame) = self.loops.last_mut() {
                    frame.break_jumps.push(label);
                }
            }
            NodeKind::Continue => {
                let Some(frame) = self.loops.last() else {
                    return;
                };
                let unwind = self.scope_depth - frame.scope_depth;
                for _ in 0..unwind {
                    self.emit(Instruction::EndScope);
                }
                let label = self.emit_jump(Instruction::Jump { jump_offset: 0 });
                if let Some(frame) = self.loops.last_mut() {
                    frame.continue_jumps.push(label);
                }
            }
            NodeKind::Return { value } => {
                if let Some(value) = value {
                    let source = self.emit_expression(value);
                    self.emit(Instruction::Copy {
                        source,
                        destination: Operand::local(0),
                        mode: CopyMode::ToReturn,
                    });
                }
                self.emit(Instruction::Return);
            }
            NodeKind::Throw { value } => {
                let exception = self.emit_expression(value);
                self.emit(Instruction::ThrowException { exception });
            }
            NodeKind::Delete { value } => {
                let object = self.emit_expression(value);
                self.emit(Instruction::DeleteObject { object });
            }
            NodeKind::Timeout { seconds, body } => {
                self.emit(Instruction::BeginTimeout {
                    seconds: u32::try_from(seconds).unwrap_or(0),
                });
                self.emit_statement(body);
                self.emit(Instruction::EndTimeout);
            }
            NodeKind::LocalVariable {
                initializer,
                resolved_type,
                ..
            } => {
                let slot = self.alloc_temp();
                self.slots.insert(id, slot);
                let ty = resolved_type.unwrap_or(self.module.core.error);
                let source = match initializer {
                    Some(initializer) => self.emit_expression(initializer),
                    None => {
                        let default = self.module.types.default_value(ty);
                        self.constant_operand(default)
                    }
                };
                self.emit(Instruction::Copy {
                    source,
                    destination: Operand::local(slot),
                    mode: CopyMode::Initialize,
                });
            }
            _ => {
                self.emit_expression(id);
            }
        }
    }

    /// Patches a finished loop's break jumps to land here and its continues
    /// at `continue_target`.
    fn finish_loop(&mut self, continue_target: usize) {
        let frame = self.loops.pop().expect("finish_loop without an open loop");
        for label in frame.break_jumps {
            self.patch_jump(label);
        }
        for label in frame.continue_jumps {
            let offset = i32::try_from(continue_target).expect("opcode index exceeds i32")
                - i32::try_from(label.0).expect("opcode index exceeds i32");
            match &mut self.ops[label.0] {
                Instruction::Jump { jump_offset } => *jump_offset = offset,
                other => unreachable!("continue patch on non-jump {other:?}"),
            }
        }
    }

    // --- generated bodies ---

    /// One field initializer: evaluate and store into the field through
    /// `this`.
    fn emit_field_initializer(&mut self, field: FieldId, initializer: NodeId) {
        self.set_location(initializer);
        let descriptor = self.module.field(field);
        let offset = descriptor.offset;
        let is_static = descriptor.is_static;
        let source = self.emit_expression(initializer);
        let destination = if is_static {
            Operand::static_field(field)
        } else {
            let this_slot = self
                .module
                .function(self.function)
                .this_slot()
                .expect("instance initializer has this");
            Operand::field(this_slot, offset)
        };
        self.emit(Instruction::Copy {
            source,
            destination,
            mode: CopyMode::Initialize,
        });
    }

    /// The pre-constructor: zero every instance field (parent layout first),
    /// then run each field's initializer function.
    fn emit_pre_constructor(&mut self, type_id: TypeId) {
        let this_slot = self
            .module
            .function(self.function)
            .this_slot()
            .expect("pre-constructor has this");

        // Parent chain, root first, so offsets fill in layout order.
        let mut chain = Vec::new();
        let mut current = Some(type_id);
        while let Some(ty) = current {
            chain.push(ty);
            current = self.module.types.bound(ty).and_then(|bound| bound.parent);
        }
        chain.reverse();

        for ty in chain {
            let Some(bound) = self.module.types.bound(ty) else {
                continue;
            };
            let fields: Vec<FieldId> = bound.fields.values().copied().collect();
            for field in fields {
                let descriptor = self.module.field(field);
                let offset = descriptor.offset;
                let default = self.module.types.default_value(descriptor.value_type);
                let initializer = descriptor.initializer;
                let source = self.constant_operand(default);
                self.emit(Instruction::Copy {
                    source,
                    destination: Operand::field(this_slot, offset),
                    mode: CopyMode::Initialize,
                });
                if let Some(initializer) = initializer {
                    self.emit_member_call(initializer, Operand::local(this_slot), &[], false);
                }
            }
        }
    }

    // --- expressions ---

    /// Emits an expression and returns the operand its value is readable at.
    fn emit_expression(&mut self, id: NodeId) -> Operand {
        match self.tree.kind(id).clone() {
            NodeKind::Literal { constant } => {
                let ty = self.result_type(id);
                let value = self.constant_to_value(&constant, ty);
                self.constant_operand(value)
            }
            NodeKind::Null => {
                let value = Value::Handle(Handle::null(self.module.core.null));
                self.constant_operand(value)
            }
            NodeKind::This => {
                let slot = self
                    .module
                    .function(self.function)
                    .this_slot()
                    .expect("'this' outside instance member survived analysis");
                Operand::local(slot)
            }
            NodeKind::Identifier { resolved, .. } => match resolved {
                Some(ResolvedRef::Local(declaration)) => {
                    let slot = self.slots.get(&declaration).copied().unwrap_or(0);
                    Operand::local(slot)
                }
                _ => Operand::default(),
            },
            NodeKind::MemberAccess { object, resolved, .. } => match resolved {
                Some(ResolvedMember::Field(field)) => {
                    let offset = self.module.field(field).offset;
                    let object_local = self.expression_to_local(object);
                    Operand::field(object_local, offset)
                }
                Some(ResolvedMember::StaticField(field)) => Operand::static_field(field),
                Some(ResolvedMember::Property(property)) => {
                    // A read: call the getter.
                    let descriptor = self.module.property(property);
                    let getter = descriptor.get.expect("read of write-only property survived analysis");
                    if descriptor.is_static {
                        self.emit_static_call(getter, &[])
                    } else {
                        let object_operand = self.emit_expression(object);
                        self.emit_member_call(getter, object_operand, &[], false)
                    }
                }
                Some(ResolvedMember::EnumValue(value)) => self.constant_operand(Value::Integer(value)),
                Some(ResolvedMember::Function(_)) | None => Operand::default(),
            },
            NodeKind::FunctionCall { .. } => self.emit_call(id),
            NodeKind::MultiExpression {
                expressions,
                yield_index,
                ..
            } => {
                let mut result = Operand::default();
                for (index, &expression) in expressions.iter().enumerate() {
                    if matches!(self.tree.kind(expression), NodeKind::LocalVariable { .. }) {
                        self.emit_statement(expression);
                    } else {
                        let operand = self.emit_expression(expression);
                        if index == yield_index {
                            result = operand;
                        }
                    }
                }
                result
            }
            NodeKind::BinaryOperator { op, left, right } => self.emit_binary(id, op, left, right),
            NodeKind::UnaryOperator { op, operand } => self.emit_unary(op, operand),
            NodeKind::TypeCast { operand, operator, .. } => {
                let source = self.emit_expression(operand);
                match operator {
                    Some(operator) => {
                        let output = self.alloc_temp();
                        self.emit(Instruction::TypeCast {
                            operator,
                            source,
                            output,
                        });
                        Operand::local(output)
                    }
                    None => source,
                }
            }
            NodeKind::New {
                arguments,
                resolved_constructor,
                ..
            } => {
                let created = self.result_type(id);
                let handle_local = self.alloc_temp();
                self.set_location(id);
                self.emit(Instruction::CreateType {
                    created_type: created,
                    save_handle: handle_local,
                    reference_counted: true,
                });
                self.emit_construction(created, handle_local, &arguments, resolved_constructor);
                Operand::local(handle_local)
            }
            NodeKind::LocalNew {
                arguments,
                resolved_constructor,
                ..
            } => {
                let created = self.result_type(id);
                let size = self
                    .module
                    .types
                    .bound(created)
                    .map_or(0, |bound| bound.size_slots.max(1));
                let stack_local = self.alloc_block(size);
                let handle_local = self.alloc_temp();
                self.set_location(id);
                self.emit(Instruction::CreateLocalType {
                    created_type: created,
                    save_handle: handle_local,
                    stack_local,
                });
                self.emit_construction(created, handle_local, &arguments, resolved_constructor);
                Operand::local(handle_local)
            }
            NodeKind::StringInterpolant { parts } => {
                self.emit(Instruction::BeginStringBuilder);
                for part in parts {
                    let value = self.emit_expression(part);
                    let value_type = self.result_type(part);
                    self.emit(Instruction::AddToStringBuilder { value_type, value });
                }
                let save_local = self.alloc_temp();
                self.emit(Instruction::EndStringBuilder { save_local });
                Operand::local(save_local)
            }
            NodeKind::TypeIdExpr { expression } => {
                let operand = self.emit_expression(expression);
                let compile_time_type = self.result_type(expression);
                let save_local = self.alloc_temp();
                self.emit(Instruction::TypeId {
                    compile_time_type,
                    expression: operand,
                    save_local,
                });
                Operand::local(save_local)
            }
            NodeKind::MemberIdExpr { expression } => {
                let member = match self.tree.kind(expression) {
                    NodeKind::MemberAccess {
                        resolved: Some(ResolvedMember::Field(field) | ResolvedMember::StaticField(field)),
                        ..
                    } => Some(MemberRef::Field(*field)),
                    NodeKind::MemberAccess {
                        resolved: Some(ResolvedMember::Property(property)),
                        ..
                    } => Some(MemberRef::Property(*property)),
                    NodeKind::MemberAccess {
                        resolved: Some(ResolvedMember::Function(function)),
                        ..
                    } => Some(MemberRef::Function(*function)),
                    _ => None,
                };
                match member {
                    Some(member) => {
                        let save_local = self.alloc_temp();
                        self.emit(Instruction::MemberId { member, save_local });
                        Operand::local(save_local)
                    }
                    None => self.emit_expression(expression),
                }
            }
            _ => Operand::default(),
        }
    }

    fn result_type(&self, id: NodeId) -> TypeId {
        self.tree.get(id).result_type.unwrap_or(self.module.core.error)
    }

    /// Materializes an expression into a local slot (reusing locals that
    /// already are one).
    fn expression_to_local(&mut self, id: NodeId) -> LocalIndex {
        let operand = self.emit_expression(id);
        self.operand_to_local(operand)
    }

    fn operand_to_local(&mut self, operand: Operand) -> LocalIndex {
        if operand.kind == OperandKind::Local && operand.field_offset == 0 {
            return operand.index;
        }
        let slot = self.alloc_temp();
        self.emit(Instruction::Copy {
            source: operand,
            destination: Operand::local(slot),
            mode: CopyMode::Initialize,
        });
        slot
    }

    // --- operators ---

    fn emit_binary(&mut self, id: NodeId, op: BinaryToken, left: NodeId, right: NodeId) -> Operand {
        self.set_location(id);
        match op {
            BinaryToken::Assign => {
                let destination = self.emit_access(left);
                match destination {
                    AccessPath::Operand(destination) => {
                        let source = self.emit_expression(right);
                        self.emit(Instruction::Copy {
                            source,
                            destination,
                            mode: CopyMode::Assignment,
                        });
                        destination
                    }
                    AccessPath::Property { property, object } => {
                        let source = self.emit_expression(right);
                        let descriptor = self.module.property(property);
                        let setter = descriptor.set.expect("write to read-only property survived analysis");
                        if descriptor.is_static {
                            self.emit_static_call(setter, &[source]);
                        } else {
                            let object = object.expect("instance property access has an object");
                            self.emit_member_call(setter, object, &[source], false);
                        }
                        source
                    }
                }
            }
            BinaryToken::CompoundAssign(arith) => {
                let destination = self.emit_access(left);
                match destination {
                    AccessPath::Operand(destination) => {
                        let source = self.emit_expression(right);
                        self.emit(Instruction::BinaryLValue {
                            op: arith,
                            output: destination,
                            right: source,
                        });
                        destination
                    }
                    AccessPath::Property { property, object } => {
                        // get, operate, set.
                        let descriptor = self.module.property(property);
                        let getter = descriptor.get.expect("compound assignment on write-only property");
                        let setter = descriptor.set.expect("compound assignment on read-only property");
                        let is_static = descriptor.is_static;
                        let current = if is_static {
                            self.emit_static_call(getter, &[])
                        } else {
                            let object = object.expect("instance property access has an object");
                            self.emit_member_call(getter, object, &[], false)
                        };
                        let source = self.emit_expression(right);
                        let output = self.alloc_temp();
                        self.emit(Instruction::BinaryRValue {
                            op: arith,
                            left: current,
                            right: source,
                            output,
                        });
                        let result = Operand::local(output);
                        if is_static {
                            self.emit_static_call(setter, &[result]);
                        } else {
                            let object = object.expect("instance property access has an object");
                            self.emit_member_call(setter, object, &[result], false);
                        }
                        result
                    }
                }
            }
            BinaryToken::LogicalAnd => {
                // Short circuit: result starts as the left value and only
                // evaluates the right side when the left was true.
                let output = self.alloc_temp();
                let left_operand = self.emit_expression(left);
                self.emit(Instruction::Copy {
                    source: left_operand,
                    destination: Operand::local(output),
                    mode: CopyMode::Initialize,
                });
                let skip = self.emit_jump(Instruction::If {
                    condition: Operand::local(output),
                    jump_offset: 0,
                    on_true: false,
                });
                let right_operand = self.emit_expression(right);
                self.emit(Instruction::Copy {
                    source: right_operand,
                    destination: Operand::local(output),
                    mode: CopyMode::Assignment,
                });
                self.patch_jump(skip);
                Operand::local(output)
            }
            BinaryToken::LogicalOr => {
                let output = self.alloc_temp();
                let left_operand = self.emit_expression(left);
                self.emit(Instruction::Copy {
                    source: left_operand,
                    destination: Operand::local(output),
                    mode: CopyMode::Initialize,
                });
                let skip = self.emit_jump(Instruction::If {
                    condition: Operand::local(output),
                    jump_offset: 0,
                    on_true: true,
                });
                let right_operand = self.emit_expression(right);
                self.emit(Instruction::Copy {
                    source: right_operand,
                    destination: Operand::local(output),
                    mode: CopyMode::Assignment,
                });
                self.patch_jump(skip);
                Operand::local(output)
            }
            BinaryToken::Arith(arith) => {
                let left_operand = self.emit_expression(left);
                let right_operand = self.emit_expression(right);
                let output = self.alloc_temp();
                self.emit(Instruction::BinaryRValue {
                    op: arith,
                    left: left_operand,
                    right: right_operand,
                    output,
                });
                Operand::local(output)
            }
        }
    }

    fn emit_unary(&mut self, op: UnaryOp, operand: NodeId) -> Operand {
        match op {
            UnaryOp::Increment | UnaryOp::Decrement => {
                let access = self.emit_access(operand);
                match access {
                    AccessPath::Operand(target) => {
                        self.emit(Instruction::UnaryLValue { op, operand: target });
                        target
                    }
                    AccessPath::Property { .. } => Operand::default(),
                }
            }
            _ => {
                let source = self.emit_expression(operand);
                let output = self.alloc_temp();
                self.emit(Instruction::UnaryRValue {
                    op,
                    operand: source,
                    output,
                });
                Operand::local(output)
            }
        }
    }

    /// Emits the write path of an assignable expression.
    fn emit_access(&mut self, id: NodeId) -> AccessPath {
        match self.tree.kind(id).clone() {
            NodeKind::Identifier {
                resolved: Some(ResolvedRef::Local(declaration)),
                ..
            } => {
                let slot = self.slots.get(&declaration).copied().unwrap_or(0);
                AccessPath::Operand(Operand::local(slot))
            }
            NodeKind::MemberAccess { object, resolved, .. } => match resolved {
                Some(ResolvedMember::Field(field)) => {
                    let offset = self.module.field(field).offset;
                    let object_local = self.expression_to_local(object);
                    AccessPath::Operand(Operand::field(object_local, offset))
                }
                Some(ResolvedMember::StaticField(field)) => AccessPath::Operand(Operand::static_field(field)),
                Some(ResolvedMember::Property(property)) => {
                    let descriptor = self.module.property(property);
                    let object_operand = if descriptor.is_static {
                        None
                    } else {
                        Some(self.emit_expression(object))
                    };
                    AccessPath::Property {
                        property,
                        object: object_operand,
                    }
                }
                _ => AccessPath::Operand(Operand::default()),
            },
            _ => {
                // Fall back to the readable operand (error paths).
                AccessPath::Operand(self.emit_expression(id))
            }
        }
    }

    // --- calls ---

    fn emit_call(&mut self, id: NodeId) -> Operand {
        let (callee, arguments, resolved_function) = match self.tree.kind(id) {
            NodeKind::FunctionCall {
                callee,
                arguments,
                resolved_function,
            } => (*callee, arguments.clone(), *resolved_function),
            _ => unreachable!("emit_call on a non-call node"),
        };
        self.set_location(id);

        match resolved_function {
            Some(function) => {
                let is_static = self.module.function(function).is_static;
                let can_be_virtual = self.module.function(function).is_virtual;
                if is_static {
                    // Argument values evaluate left to right in the current
                    // frame, then copy into the callee's.
                    let argument_operands: Vec<Operand> = arguments
                        .iter()
                        .map(|&argument| self.emit_expression(argument))
                        .collect();
                    self.emit_static_call(function, &argument_operands)
                } else {
                    // The receiver evaluates before its arguments.
                    let object = match self.tree.kind(callee) {
                        NodeKind::MemberAccess { object, .. } => *object,
                        _ => callee,
                    };
                    let object_operand = self.emit_expression(object);
                    let object_local = self.operand_to_local(object_operand);
                    let argument_operands: Vec<Operand> = arguments
                        .iter()
                        .map(|&argument| self.emit_expression(argument))
                        .collect();
                    self.emit_member_call(
                        function,
                        Operand::local(object_local),
                        &argument_operands,
                        can_be_virtual,
                    )
                }
            }
            None => {
                // A delegate-valued call: `this` presence is only known at
                // run time, so prep carries the static-skip offset.
                let delegate = self.emit_expression(callee);
                let argument_operands: Vec<Operand> = arguments
                    .iter()
                    .map(|&argument| self.emit_expression(argument))
                    .collect();
                self.emit_invoke(
                    InvokeTarget::Delegate(delegate),
                    &argument_operands,
                    self.result_type(id),
                )
            }
        }
    }

    fn emit_static_call(&mut self, function: FunctionId, arguments: &[Operand]) -> Operand {
        let return_type = self.module.function(function).signature.return_type;
        self.emit_invoke(InvokeTarget::Static(function), arguments, return_type)
    }

    fn emit_member_call(
        &mut self,
        function: FunctionId,
        this_operand: Operand,
        arguments: &[Operand],
        can_be_virtual: bool,
    ) -> Operand {
        let return_type = self.module.function(function).signature.return_type;
        self.emit_invoke(
            InvokeTarget::Instance {
                function,
                this_operand,
                can_be_virtual,
            },
            arguments,
            return_type,
        )
    }

    /// The call sequence: copy parameters into the callee frame, prep the
    /// delegate, invoke, copy the return value back.
    fn emit_invoke(&mut self, target: InvokeTarget, arguments: &[Operand], return_type: TypeId) -> Operand {
        for (index, &argument) in arguments.iter().enumerate() {
            let destination = Operand::local(1 + u32::try_from(index).expect("argument index exceeds u32"));
            self.emit(Instruction::Copy {
                source: argument,
                destination,
                mode: CopyMode::ToParameter,
            });
        }

        let delegate_local = self.alloc_temp();
        match target {
            InvokeTarget::Static(function) => {
                self.emit(Instruction::CreateStaticDelegate {
                    function,
                    save_local: delegate_local,
                });
            }
            InvokeTarget::Instance {
                function,
                this_operand,
                can_be_virtual,
            } => {
                self.emit(Instruction::CreateInstanceDelegate {
                    function,
                    this_operand,
                    save_local: delegate_local,
                    can_be_virtual,
                });
            }
            InvokeTarget::Delegate(operand) => {
                self.emit(Instruction::Copy {
                    source: operand,
                    destination: Operand::local(delegate_local),
                    mode: CopyMode::Initialize,
                });
            }
        }
        self.emit(Instruction::PrepForFunctionCall {
            delegate: Operand::local(delegate_local),
            jump_offset_if_static: 0,
        });
        self.emit(Instruction::FunctionCall);

        if return_type == self.module.core.void {
            Operand::default()
        } else {
            let save_local = self.alloc_temp();
            self.emit(Instruction::Copy {
                source: Operand::local(0),
                destination: Operand::local(save_local),
                mode: CopyMode::FromReturn,
            });
            Operand::local(save_local)
        }
    }

    /// Pre-constructor then constructor for a freshly created object.
    fn emit_construction(
        &mut self,
        created: TypeId,
        handle_local: LocalIndex,
        arguments: &[NodeId],
        constructor: Option<FunctionId>,
    ) {
        let bound = self.module.types.bound(created);
        let pre_constructor = bound.and_then(|b| b.pre_constructor);
        if let Some(pre) = pre_constructor {
            self.emit_member_call(pre, Operand::local(handle_local), &[], false);
        }
        let argument_operands: Vec<Operand> = arguments
            .iter()
            .map(|&argument| self.emit_expression(argument))
            .collect();
        if let Some(constructor) = constructor {
            self.emit_member_call(constructor, Operand::local(handle_local), &argument_operands, false);
        }
    }

    // --- constants ---

    fn constant_to_value(&self, constant: &Constant, ty: TypeId) -> Value {
        match constant {
            Constant::Null => Value::Handle(Handle::null(ty)),
            Constant::Boolean(v) => Value::Boolean(*v),
            Constant::Integer(v) => match self.module.types.get(ty).kind {
                TypeKind::Primitive(crate::types::Primitive::DoubleInteger) => Value::DoubleInteger(*v),
                _ => Value::Integer(*v as i32),
            },
            Constant::Real(v) => match self.module.types.get(ty).kind {
                TypeKind::Primitive(crate::types::Primitive::DoubleReal) => Value::DoubleReal(*v),
                _ => Value::Real(*v as f32),
            },
            Constant::Str(v) => Value::string(v),
            Constant::Type(v) => Value::TypeRef(*v),
        }
    }
}

/// Where an assignment writes.
enum AccessPath {
    Operand(Operand),
    Property {
        property: crate::ids::PropertyId,
        object: Option<Operand>,
    },
}

/// The callee shape of an invocation.
enum InvokeTarget {
    Static(FunctionId),
    Instance {
        function: FunctionId,
        this_operand: Operand,
        can_be_virtual: bool,
    },
    Delegate(Operand),
}
