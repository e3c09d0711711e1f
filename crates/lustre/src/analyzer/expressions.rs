//! Expression and statement typing: Io checking, overload selection,
//! implicit cast insertion, and the indexer rewrite.

use smallvec::SmallVec;

use super::{Analyzer, ScopeKind};
use crate::{
    analyzer::conversion::{call_cost, explicit_cast, implicit_cast},
    diagnostics::DiagnosticCode,
    front::ast::{BinaryToken, IndexerMode, Io, NodeKind, ResolvedMember, ResolvedRef, TypeName},
    ids::{FunctionId, NodeId, TypeId},
    location::CodeLocation,
    opcode::{BinaryOp, CastOperator, UnaryOp},
    types::Primitive,
};

impl Analyzer<'_> {
    /// Types a scope node, returning whether every path through it returns.
    pub(crate) fn check_scope_node(&mut self, scope: NodeId, kind: ScopeKind) -> bool {
        let statements = match self.tree.kind(scope) {
            NodeKind::Scope { statements } => statements.clone(),
            // A single statement stands in for a scope in rewrites.
            _ => return self.check_statement(scope),
        };
        self.scopes.push(super::LocalScope {
            declarations: ahash::AHashMap::new(),
            kind,
        });
        let mut all_return = false;
        for statement in statements {
            let returns = self.check_statement(statement);
            all_return = all_return || returns;
        }
        self.scopes.pop();
        all_return
    }

    /// Types one statement, returning whether it returns on every path.
    pub(crate) fn check_statement(&mut self, id: NodeId) -> bool {
        match self.tree.kind(id).clone() {
            NodeKind::Scope { .. } => self.check_scope_node(id, ScopeKind::Block),
            NodeKind::If {
                condition,
                then_scope,
                else_node,
            } => {
                self.check_condition(condition);
                let then_returns = self.check_scope_node(then_scope, ScopeKind::Block);
                let else_returns = match else_node {
                    Some(else_node) => self.check_statement(else_node),
                    None => false,
                };
                then_returns && else_node.is_some() && else_returns
            }
            NodeKind::While { condition, body } => {
                self.check_condition(condition);
                self.check_scope_node(body, ScopeKind::Loop);
                false
            }
            NodeKind::DoWhile { body, condition } => {
                self.check_scope_node(body, ScopeKind::Loop);
                self.check_condition(condition);
                false
            }
            NodeKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                self.scopes.push(super::LocalScope {
                    declarations: ahash::AHashMap::new(),
                    kind: ScopeKind::Block,
                });
                if let Some(initializer) = initializer {
                    self.check_statement(initializer);
                }
                if let Some(condition) = condition {
                    self.check_condition(condition);
                }
                if let Some(increment) = increment {
                    self.check_expr(increment, Io::empty());
                }
                self.check_scope_node(body, ScopeKind::Loop);
                self.scopes.pop();
                false
            }
            NodeKind::Loop { body } => {
                self.check_scope_node(body, ScopeKind::Loop);
                false
            }
            NodeKind::Break => {
                if !self.inside_loop() {
                    let location = self.tree.location(id);
                    self.errors
                        .raise(location, DiagnosticCode::BreakOutsideLoop, "'break' outside of a loop");
                }
                false
            }
            NodeKind::Continue => {
                if !self.inside_loop() {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::ContinueOutsideLoop,
                        "'continue' outside of a loop",
                    );
                }
                false
            }
            NodeKind::Return { value } => {
                let return_type = self.context.return_type;
                let void = self.module.core.void;
                match value {
                    Some(value) => {
                        if return_type == void {
                            let location = self.tree.location(value);
                            self.errors.raise(
                                location,
                                DiagnosticCode::ReturnValueInVoidFunction,
                                "this function does not return a value",
                            );
                            self.check_expr(value, Io::READ_RVALUE);
                        } else {
                            let coerced = self.check_and_coerce(value, return_type);
                            if let NodeKind::Return { value } = &mut self.tree.get_mut(id).kind {
                                *value = Some(coerced);
                            }
                        }
                    }
                    None => {
                        if return_type != void {
                            let location = self.tree.location(id);
                            self.errors.raise(
                                location,
                                DiagnosticCode::ReturnMissingValue,
                                "this function must return a value",
                            );
                        }
                    }
                }
                true
            }
            NodeKind::Throw { value } => {
                let ty = self.check_expr(value, Io::READ_RVALUE);
                let exception = self.module.core.exception;
                if !self.module.is_error_type(ty) && !self.module.types.is_subtype_of(ty, exception) {
                    let location = self.tree.location(value);
                    self.errors.raise(
                        location,
                        DiagnosticCode::ThrowTypeMismatch,
                        format!("thrown values must derive from Exception, found '{}'", self.type_name(ty)),
                    );
                }
                true
            }
            NodeKind::Delete { value } => {
                let ty = self.check_expr(value, Io::READ_RVALUE);
                if !self.module.is_error_type(ty) && !self.module.types.is_reference(ty) {
                    let location = self.tree.location(value);
                    self.errors.raise(
                        location,
                        DiagnosticCode::DeleteOnNonHandle,
                        format!("'{}' is not a deletable handle type", self.type_name(ty)),
                    );
                }
                false
            }
            NodeKind::Timeout { body, .. } => self.check_scope_node(body, ScopeKind::Timeout),
            NodeKind::LocalVariable {
                name,
                declared_type,
                initializer,
                resolved_type,
            } => {
                // Synthesized locals from indexer rewrites arrive already
                // typed; just declare them.
                if resolved_type.is_some() {
                    self.declare_local(&name, id);
                    return false;
                }
                let aliases = self.context.aliases.clone();
                let ty = match (&declared_type, initializer) {
                    (Some(written), initializer) => {
                        let ty = self.resolve_type_name(written, &aliases);
                        if let Some(initializer) = initializer {
                            let coerced = self.check_and_coerce(initializer, ty);
                            if let NodeKind::LocalVariable { initializer, .. } = &mut self.tree.get_mut(id).kind {
                                *initializer = Some(coerced);
                            }
                        }
                        ty
                    }
                    (None, Some(initializer)) => {
                        let ty = self.check_expr(initializer, Io::READ_RVALUE);
                        if ty == self.module.core.null {
                            let location = self.tree.location(id);
                            self.errors.raise(
                                location,
                                DiagnosticCode::ExpectedType,
                                "cannot infer a type from 'null'; declare one",
                            );
                            self.module.core.error
                        } else {
                            ty
                        }
                    }
                    (None, None) => {
                        let location = self.tree.location(id);
                        self.errors.raise(
                            location,
                            DiagnosticCode::ExpectedType,
                            "a variable needs a declared type or an initializer",
                        );
                        self.module.core.error
                    }
                };
                if let NodeKind::LocalVariable { resolved_type, .. } = &mut self.tree.get_mut(id).kind {
                    *resolved_type = Some(ty);
                }
                self.declare_local(&name, id);
                false
            }
            // Anything else is an expression statement.
            _ => {
                self.check_expr(id, Io::empty());
                false
            }
        }
    }

    fn check_condition(&mut self, condition: NodeId) {
        let ty = self.check_expr(condition, Io::READ_RVALUE);
        let boolean = self.module.core.boolean();
        if ty != boolean && !self.module.is_error_type(ty) {
            let location = self.tree.location(condition);
            self.errors.raise(
                location,
                DiagnosticCode::ConditionMustBeBoolean,
                format!("conditions must be Boolean, found '{}'", self.type_name(ty)),
            );
        }
    }

    /// Types an expression, records its Io and required usage, and returns
    /// its result type (the error placeholder after a failure).
    pub(crate) fn check_expr(&mut self, id: NodeId, usage: Io) -> TypeId {
        let result = self.check_expr_inner(id);
        let node = self.tree.get_mut(id);
        node.result_type = Some(result.ty);
        node.io = result.io;
        node.io_usage = usage;
        if usage.contains(Io::WRITE_LVALUE) && !result.io.contains(Io::WRITE_LVALUE) {
            let location = self.tree.location(id);
            self.errors.raise(
                location,
                DiagnosticCode::WritingToReadOnly,
                "this value cannot be assigned to",
            );
        } else if usage.contains(Io::READ_RVALUE) && !result.io.contains(Io::READ_RVALUE) {
            let location = self.tree.location(id);
            self.errors.raise(
                location,
                DiagnosticCode::ReadingFromWriteOnly,
                "this value cannot be read",
            );
        }
        result.ty
    }

    fn error_result(&self) -> TypedExpr {
        TypedExpr {
            ty: self.module.core.error,
            io: Io::READ_RVALUE | Io::WRITE_LVALUE,
        }
    }

    fn check_expr_inner(&mut self, id: NodeId) -> TypedExpr {
        match self.tree.kind(id).clone() {
            NodeKind::Literal { constant } => TypedExpr {
                ty: self.constant_type(&constant),
                io: Io::READ_RVALUE,
            },
            NodeKind::Null => TypedExpr {
                ty: self.module.core.null,
                io: Io::READ_RVALUE,
            },
            NodeKind::This => {
                if self.context.is_static || self.context.owner.is_none() {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::ThisOutsideInstanceMember,
                        "'this' is only valid inside instance members",
                    );
                    return self.error_result();
                }
                TypedExpr {
                    ty: self.context.owner.expect("checked above"),
                    io: Io::READ_RVALUE,
                }
            }
            NodeKind::StringInterpolant { parts } => {
                for part in parts {
                    self.check_expr(part, Io::READ_RVALUE);
                }
                TypedExpr {
                    ty: self.module.core.string(),
                    io: Io::READ_RVALUE,
                }
            }
            NodeKind::Identifier { name, .. } => self.check_identifier(id, &name),
            NodeKind::MemberAccess { object, name, .. } => self.check_member_access(id, object, &name),
            NodeKind::FunctionCall { .. } => self.check_call(id),
            NodeKind::IndexerCall { object, arguments } => {
                // A pure read: lazily materialize only the Get variant.
                self.rewrite_indexer(id, object, &arguments, IndexerMode::Get, None)
            }
            NodeKind::MultiExpression {
                expressions,
                yield_index,
                ..
            } => {
                let mut ty = self.module.core.void;
                for (index, &expression) in expressions.iter().enumerate() {
                    if matches!(self.tree.kind(expression), NodeKind::LocalVariable { .. }) {
                        self.check_statement(expression);
                    } else {
                        let expression_ty = self.check_expr(expression, Io::READ_RVALUE);
                        if index == yield_index {
                            ty = expression_ty;
                        }
                    }
                }
                TypedExpr {
                    ty,
                    io: Io::READ_RVALUE,
                }
            }
            NodeKind::BinaryOperator { op, left, right } => self.check_binary(id, op, left, right),
            NodeKind::UnaryOperator { op, operand } => self.check_unary(id, op, operand),
            NodeKind::TypeCast {
                operand,
                target: Some(target),
                ..
            } => self.check_explicit_cast(id, operand, &target),
            NodeKind::TypeCast { operand, .. } => {
                // Inserted casts are pre-annotated; nothing to re-derive.
                let ty = self.tree.get(id).result_type.unwrap_or(self.module.core.error);
                let _ = operand;
                TypedExpr {
                    ty,
                    io: Io::READ_RVALUE,
                }
            }
            NodeKind::New {
                type_name, arguments, ..
            }
            | NodeKind::LocalNew {
                type_name, arguments, ..
            } => self.check_creation(id, &type_name, &arguments),
            NodeKind::TypeIdExpr { expression } => {
                self.check_expr(expression, Io::READ_RVALUE);
                TypedExpr {
                    ty: self.module.core.type_ref,
                    io: Io::READ_RVALUE,
                }
            }
            NodeKind::MemberIdExpr { expression } => {
                self.check_expr(expression, Io::READ_RVALUE);
                let resolved = matches!(
                    self.tree.kind(expression),
                    NodeKind::MemberAccess { resolved: Some(_), .. }
                );
                if !resolved {
                    let location = self.tree.location(expression);
                    self.errors.raise(
                        location,
                        DiagnosticCode::MemberNotFound,
                        "'memberid' requires a member access",
                    );
                    return self.error_result();
                }
                TypedExpr {
                    ty: self.module.core.member_ref,
                    io: Io::READ_RVALUE,
                }
            }
            _ => {
                let location = self.tree.location(id);
                self.errors.raise(
                    location,
                    DiagnosticCode::UnexpectedToken,
                    "expected an expression here",
                );
                self.error_result()
            }
        }
    }

    fn check_identifier(&mut self, id: NodeId, name: &str) -> TypedExpr {
        if let Some(declaration) = self.find_local(name) {
            let ty = match self.tree.kind(declaration) {
                NodeKind::LocalVariable { resolved_type, .. } | NodeKind::Parameter { resolved_type, .. } => {
                    resolved_type.unwrap_or(self.module.core.error)
                }
                _ => self.module.core.error,
            };
            if let NodeKind::Identifier { resolved, .. } = &mut self.tree.get_mut(id).kind {
                *resolved = Some(ResolvedRef::Local(declaration));
            }
            return TypedExpr {
                ty,
                io: Io::READ_RVALUE | Io::WRITE_LVALUE,
            };
        }
        // A bare type name is only meaningful as a static-access qualifier;
        // member access and calls resolve it themselves before getting here.
        if self.library.type_names.contains_key(name) || self.module.find_type(name).is_some() {
            let location = self.tree.location(id);
            self.errors.raise(
                location,
                DiagnosticCode::VariableNotFound,
                format!("type '{name}' cannot be used as a value"),
            );
            return self.error_result();
        }
        let location = self.tree.location(id);
        self.errors.raise(
            location,
            DiagnosticCode::VariableNotFound,
            format!("'{name}' could not be found"),
        );
        self.error_result()
    }

    /// The type an identifier names, when it is not shadowed by a local.
    fn identifier_as_type(&mut self, node: NodeId) -> Option<TypeId> {
        let NodeKind::Identifier { name, .. } = self.tree.kind(node) else {
            return None;
        };
        let name = name.clone();
        if self.find_local(&name).is_some() {
            return None;
        }
        let found = self
            .library
            .type_names
            .get(&name)
            .copied()
            .or_else(|| self.module.find_type(&name))?;
        if let NodeKind::Identifier { resolved, .. } = &mut self.tree.get_mut(node).kind {
            *resolved = Some(ResolvedRef::Type(found));
        }
        let node_mut = self.tree.get_mut(node);
        node_mut.result_type = Some(found);
        Some(found)
    }

    fn check_member_access(&mut self, id: NodeId, object: NodeId, name: &str) -> TypedExpr {
        // Static access: `Type.Member`.
        if let Some(type_id) = self.identifier_as_type(object) {
            return self.resolve_static_member(id, type_id, name);
        }
        let object_type = self.check_expr(object, Io::READ_RVALUE);
        if self.module.is_error_type(object_type) {
            return self.error_result();
        }
        self.resolve_instance_member(id, object_type, name)
    }

    fn resolve_static_member(&mut self, id: NodeId, type_id: TypeId, name: &str) -> TypedExpr {
        if let Some(bound) = self.module.types.bound(type_id) {
            if bound.is_enum {
                if let Some(&value) = bound.enum_values.get(name) {
                    if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(id).kind {
                        *resolved = Some(ResolvedMember::EnumValue(value));
                    }
                    return TypedExpr {
                        ty: type_id,
                        io: Io::READ_RVALUE,
                    };
                }
            }
            if let Some(field) = self.module.types.find_static_field(type_id, name) {
                let ty = self.module.field(field).value_type;
                if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(id).kind {
                    *resolved = Some(ResolvedMember::StaticField(field));
                }
                return TypedExpr {
                    ty,
                    io: Io::READ_RVALUE | Io::WRITE_LVALUE,
                };
            }
            if let Some(property) = self.module.types.find_property(type_id, name) {
                let desc = self.module.property(property);
                if desc.is_static {
                    let ty = desc.value_type;
                    let io = property_io(desc.is_readable(), desc.is_writable());
                    if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(id).kind {
                        *resolved = Some(ResolvedMember::Property(property));
                    }
                    return TypedExpr { ty, io };
                }
            }
        }
        let location = self.tree.location(id);
        self.errors.raise(
            location,
            DiagnosticCode::MemberNotFound,
            format!("'{}' has no static member '{name}'", self.type_name(type_id)),
        );
        self.error_result()
    }

    fn resolve_instance_member(&mut self, id: NodeId, object_type: TypeId, name: &str) -> TypedExpr {
        if let Some(field) = self.module.types.find_field(object_type, name) {
            let ty = self.module.field(field).value_type;
            if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(id).kind {
                *resolved = Some(ResolvedMember::Field(field));
            }
            return TypedExpr {
                ty,
                io: Io::READ_RVALUE | Io::WRITE_LVALUE,
            };
        }
        if let Some(property) = self.module.types.find_property(object_type, name) {
            let desc = self.module.property(property);
            let ty = desc.value_type;
            let io = property_io(desc.is_readable(), desc.is_writable());
            if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(id).kind {
                *resolved = Some(ResolvedMember::Property(property));
            }
            return TypedExpr { ty, io };
        }
        let location = self.tree.location(id);
        self.errors.raise(
            location,
            DiagnosticCode::MemberNotFound,
            format!("'{}' has no member '{name}'", self.type_name(object_type)),
        );
        self.error_result()
    }

    // --- calls ---

    fn check_call(&mut self, id: NodeId) -> TypedExpr {
        let (callee, arguments) = match self.tree.kind(id) {
            NodeKind::FunctionCall {
                callee, arguments, ..
            } => (*callee, arguments.clone()),
            _ => unreachable!("check_call on a non-call node"),
        };

        // Argument types first; selection and coercion follow.
        let argument_types: Vec<TypeId> = arguments
            .iter()
            .map(|&argument| self.check_expr(argument, Io::READ_RVALUE))
            .collect();
        if argument_types.iter().any(|&ty| self.module.is_error_type(ty)) {
            return self.error_result();
        }

        // Collect the candidate set by callee shape.
        let candidates: SmallVec<[FunctionId; 4]> = match self.tree.kind(callee).clone() {
            NodeKind::Identifier { name, .. } => {
                if let Some(declaration) = self.find_local(&name) {
                    // A delegate-typed local called as a function.
                    let _ = declaration;
                    return self.check_delegate_call(id, callee, &arguments, &argument_types);
                }
                let found = self.find_free_functions(&name);
                if found.is_empty() {
                    let location = self.tree.location(callee);
                    self.errors.raise(
                        location,
                        DiagnosticCode::VariableNotFound,
                        format!("function '{name}' could not be found"),
                    );
                    return self.error_result();
                }
                if let NodeKind::Identifier { resolved, .. } = &mut self.tree.get_mut(callee).kind {
                    *resolved = Some(ResolvedRef::LibraryFunction);
                }
                found.into_iter().collect()
            }
            NodeKind::MemberAccess { object, name, .. } => {
                if let Some(type_id) = self.identifier_as_type(object) {
                    let set = self
                        .module
                        .types
                        .find_functions(type_id, &name)
                        .map(<[FunctionId]>::to_vec)
                        .unwrap_or_default();
                    let static_set: SmallVec<[FunctionId; 4]> = set
                        .into_iter()
                        .filter(|&f| self.module.function(f).is_static)
                        .collect();
                    if static_set.is_empty() {
                        let location = self.tree.location(callee);
                        self.errors.raise(
                            location,
                            DiagnosticCode::MemberNotFound,
                            format!("'{}' has no static function '{name}'", self.type_name(type_id)),
                        );
                        return self.error_result();
                    }
                    static_set
                } else {
                    let object_type = self.check_expr(object, Io::READ_RVALUE);
                    if self.module.is_error_type(object_type) {
                        return self.error_result();
                    }
                    let set = self
                        .module
                        .types
                        .find_functions(object_type, &name)
                        .map(<[FunctionId]>::to_vec)
                        .unwrap_or_default();
                    let instance_set: SmallVec<[FunctionId; 4]> = set
                        .into_iter()
                        .filter(|&f| !self.module.function(f).is_static)
                        .collect();
                    if instance_set.is_empty() {
                        // A field or property holding a delegate is callable.
                        let member = self.resolve_instance_member(callee, object_type, &name);
                        if self.module.types.delegate(member.ty).is_some() {
                            let node = self.tree.get_mut(callee);
                            node.result_type = Some(member.ty);
                            node.io = member.io;
                            return self.check_delegate_call(id, callee, &arguments, &argument_types);
                        }
                        if !self.module.is_error_type(member.ty) {
                            let location = self.tree.location(callee);
                            self.errors.raise(
                                location,
                                DiagnosticCode::NotCallable,
                                format!("member '{name}' is not callable"),
                            );
                        }
                        return self.error_result();
                    }
                    instance_set
                }
            }
            _ => {
                // Any other expression must evaluate to a delegate.
                return self.check_delegate_call(id, callee, &arguments, &argument_types);
            }
        };

        let location = self.tree.location(id);
        let Some(selected) = self.select_overload(&candidates, &argument_types, &location) else {
            return self.error_result();
        };

        // Record the selection on both the call and the member access.
        if let NodeKind::FunctionCall { resolved_function, .. } = &mut self.tree.get_mut(id).kind {
            *resolved_function = Some(selected);
        }
        if let NodeKind::MemberAccess { resolved, .. } = &mut self.tree.get_mut(callee).kind {
            *resolved = Some(ResolvedMember::Function(selected));
        }

        self.coerce_arguments(id, &arguments, &argument_types, selected);
        TypedExpr {
            ty: self.module.function(selected).signature.return_type,
            io: Io::READ_RVALUE,
        }
    }

    /// Free-function overload set, searching this library then dependencies
    /// (newest first).
    fn find_free_functions(&self, name: &str) -> Vec<FunctionId> {
        if let Some(set) = self.library.function_names.get(name) {
            return set.clone();
        }
        for library in self.module.libraries.iter().rev() {
            if let Some(set) = library.function_names.get(name) {
                return set.clone();
            }
        }
        Vec::new()
    }

    /// Unique lowest-cost viable candidate, or a diagnostic.
    fn select_overload(
        &mut self,
        candidates: &[FunctionId],
        argument_types: &[TypeId],
        location: &CodeLocation,
    ) -> Option<FunctionId> {
        let mut best: Option<(u32, FunctionId)> = None;
        let mut tied: Vec<FunctionId> = Vec::new();
        for &candidate in candidates {
            let parameter_types: Vec<TypeId> = self
                .module
                .function(candidate)
                .signature
                .params
                .iter()
                .map(|p| p.ty)
                .collect();
            let Some(cost) = call_cost(self.module, &parameter_types, argument_types) else {
                continue;
            };
            match best {
                None => best = Some((cost, candidate)),
                Some((best_cost, _)) if cost < best_cost => {
                    best = Some((cost, candidate));
                    tied.clear();
                }
                Some((best_cost, _)) if cost == best_cost => tied.push(candidate),
                Some(_) => {}
            }
        }
        match best {
            Some((_, selected)) if tied.is_empty() => Some(selected),
            Some((_, selected)) => {
                let mut associated: Vec<CodeLocation> = vec![self.module.function(selected).location.clone()];
                associated.extend(tied.iter().map(|&f| self.module.function(f).location.clone()));
                self.errors.raise_with(
                    location.clone(),
                    DiagnosticCode::AmbiguousOverload,
                    "more than one overload matches these arguments",
                    associated,
                    Vec::new(),
                );
                None
            }
            None => {
                if candidates.len() == 1 {
                    // With one candidate, point at the first bad argument.
                    let function = self.module.function(candidates[0]);
                    let params = &function.signature.params;
                    if params.len() != argument_types.len() {
                        self.errors.raise(
                            location.clone(),
                            DiagnosticCode::ArgumentCountMismatch,
                            format!("expected {} argument(s), {} given", params.len(), argument_types.len()),
                        );
                        return None;
                    }
                    let params: Vec<TypeId> = params.iter().map(|p| p.ty).collect();
                    for (index, (&param, &arg)) in params.iter().zip(argument_types).enumerate() {
                        if param != arg && implicit_cast(self.module, arg, param).is_none() {
                            self.errors.raise(
                                location.clone(),
                                DiagnosticCode::NoImplicitConversion,
                                format!(
                                    "argument {} cannot convert from '{}' to '{}'",
                                    index + 1,
                                    self.type_name(arg),
                                    self.type_name(param)
                                ),
                            );
                            return None;
                        }
                    }
                }
                let names: Vec<String> = argument_types.iter().map(|&ty| self.type_name(ty)).collect();
                self.errors.raise(
                    location.clone(),
                    DiagnosticCode::UnableToResolveOverload,
                    format!("no overload accepts ({})", names.join(", ")),
                );
                None
            }
        }
    }

    fn coerce_arguments(&mut self, call: NodeId, arguments: &[NodeId], argument_types: &[TypeId], selected: FunctionId) {
        let parameter_types: Vec<TypeId> = self
            .module
            .function(selected)
            .signature
            .params
            .iter()
            .map(|p| p.ty)
            .collect();
        let mut rewritten = arguments.to_vec();
        for (index, (&argument, &param)) in arguments.iter().zip(&parameter_types).enumerate() {
            let from = argument_types[index];
            rewritten[index] = self.coerce_checked(argument, from, param);
        }
        match &mut self.tree.get_mut(call).kind {
            NodeKind::FunctionCall { arguments, .. }
            | NodeKind::New {
                arguments, ..
            }
            | NodeKind::LocalNew { arguments, .. } => *arguments = rewritten,
            _ => {}
        }
    }

    fn check_delegate_call(
        &mut self,
        id: NodeId,
        callee: NodeId,
        arguments: &[NodeId],
        argument_types: &[TypeId],
    ) -> TypedExpr {
        let callee_type = match self.tree.get(callee).result_type {
            Some(ty) => ty,
            None => self.check_expr(callee, Io::READ_RVALUE),
        };
        if self.module.is_error_type(callee_type) {
            return self.error_result();
        }
        let Some(signature) = self.module.types.delegate(callee_type).cloned() else {
            let location = self.tree.location(callee);
            self.errors.raise(
                location,
                DiagnosticCode::NotCallable,
                format!("'{}' is not callable", self.type_name(callee_type)),
            );
            return self.error_result();
        };
        if signature.params.len() != arguments.len() {
            let location = self.tree.location(id);
            self.errors.raise(
                location,
                DiagnosticCode::ArgumentCountMismatch,
                format!(
                    "expected {} argument(s), {} given",
                    signature.params.len(),
                    arguments.len()
                ),
            );
            return self.error_result();
        }
        let mut rewritten = arguments.to_vec();
        for (index, (&argument, param)) in arguments.iter().zip(&signature.params).enumerate() {
            rewritten[index] = self.coerce_checked(argument, argument_types[index], param.ty);
        }
        if let NodeKind::FunctionCall { arguments, .. } = &mut self.tree.get_mut(id).kind {
            *arguments = rewritten;
        }
        TypedExpr {
            ty: signature.return_type,
            io: Io::READ_RVALUE,
        }
    }

    fn check_creation(&mut self, id: NodeId, type_name: &TypeName, arguments: &[NodeId]) -> TypedExpr {
        let aliases = self.context.aliases.clone();
        let created = self.resolve_type_name(type_name, &aliases);
        if self.module.is_error_type(created) {
            return self.error_result();
        }
        let Some(bound) = self.module.types.bound(created) else {
            self.errors.raise(
                type_name.location.clone(),
                DiagnosticCode::TypeNotFound,
                format!("'{}' is not a constructible class", self.type_name(created)),
            );
            return self.error_result();
        };
        if bound.is_enum {
            self.errors.raise(
                type_name.location.clone(),
                DiagnosticCode::TypeNotFound,
                "enums cannot be constructed",
            );
            return self.error_result();
        }
        let constructors = bound.constructors.clone();

        let argument_types: Vec<TypeId> = arguments
            .iter()
            .map(|&argument| self.check_expr(argument, Io::READ_RVALUE))
            .collect();
        if argument_types.iter().any(|&ty| self.module.is_error_type(ty)) {
            return self.error_result();
        }

        if constructors.is_empty() {
            if !arguments.is_empty() {
                let location = self.tree.location(id);
                self.errors.raise(
                    location,
                    DiagnosticCode::ArgumentCountMismatch,
                    "this type has no constructor taking arguments",
                );
            }
        } else {
            let location = self.tree.location(id);
            let Some(selected) = self.select_overload(&constructors, &argument_types, &location) else {
                return self.error_result();
            };
            match &mut self.tree.get_mut(id).kind {
                NodeKind::New {
                    resolved_constructor, ..
                }
                | NodeKind::LocalNew {
                    resolved_constructor, ..
                } => *resolved_constructor = Some(selected),
                _ => {}
            }
            self.coerce_arguments(id, arguments, &argument_types, selected);
        }
        TypedExpr {
            ty: created,
            io: Io::READ_RVALUE,
        }
    }

    // --- operators ---

    fn check_binary(&mut self, id: NodeId, op: BinaryToken, left: NodeId, right: NodeId) -> TypedExpr {
        match op {
            BinaryToken::Assign => {
                if let NodeKind::IndexerCall { object, arguments } = self.tree.kind(left).clone() {
                    let ty = self.rewrite_indexer(id, object, &arguments, IndexerMode::Set, Some(right));
                    return ty;
                }
                let left_type = self.check_expr(left, Io::WRITE_LVALUE);
                if self.module.is_error_type(left_type) {
                    self.check_expr(right, Io::READ_RVALUE);
                    return self.error_result();
                }
                let coerced = self.check_and_coerce(right, left_type);
                if let NodeKind::BinaryOperator { right, .. } = &mut self.tree.get_mut(id).kind {
                    *right = coerced;
                }
                TypedExpr {
                    ty: left_type,
                    io: Io::READ_RVALUE,
                }
            }
            BinaryToken::CompoundAssign(arith) => {
                if let NodeKind::IndexerCall { object, arguments } = self.tree.kind(left).clone() {
                    let ty = self.rewrite_indexer(id, object, &arguments, IndexerMode::GetSet, Some(right));
                    return ty;
                }
                let left_type = self.check_expr(left, Io::READ_RVALUE | Io::WRITE_LVALUE);
                if self.module.is_error_type(left_type) {
                    self.check_expr(right, Io::READ_RVALUE);
                    return self.error_result();
                }
                if self.binary_value_type(arith, left_type, left_type).is_none() {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NoImplicitConversion,
                        format!("operator is not defined for '{}'", self.type_name(left_type)),
                    );
                }
                let coerced = self.check_and_coerce(right, left_type);
                if let NodeKind::BinaryOperator { right, .. } = &mut self.tree.get_mut(id).kind {
                    *right = coerced;
                }
                TypedExpr {
                    ty: left_type,
                    io: Io::empty(),
                }
            }
            BinaryToken::LogicalAnd | BinaryToken::LogicalOr => {
                let boolean = self.module.core.boolean();
                let left_coerced = self.check_and_coerce(left, boolean);
                let right_coerced = self.check_and_coerce(right, boolean);
                if let NodeKind::BinaryOperator { left, right, .. } = &mut self.tree.get_mut(id).kind {
                    *left = left_coerced;
                    *right = right_coerced;
                }
                TypedExpr {
                    ty: boolean,
                    io: Io::READ_RVALUE,
                }
            }
            BinaryToken::Arith(arith) => {
                let left_type = self.check_expr(left, Io::READ_RVALUE);
                let right_type = self.check_expr(right, Io::READ_RVALUE);
                if self.module.is_error_type(left_type) || self.module.is_error_type(right_type) {
                    return self.error_result();
                }
                let Some(operands) = self.binary_operand_type(arith, left_type, right_type) else {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NoImplicitConversion,
                        format!(
                            "operator is not defined between '{}' and '{}'",
                            self.type_name(left_type),
                            self.type_name(right_type)
                        ),
                    );
                    return self.error_result();
                };
                let left_coerced = self.coerce_checked(left, left_type, operands.left);
                let right_coerced = self.coerce_checked(right, right_type, operands.right);
                if let NodeKind::BinaryOperator { left, right, .. } = &mut self.tree.get_mut(id).kind {
                    *left = left_coerced;
                    *right = right_coerced;
                }
                TypedExpr {
                    ty: operands.result,
                    io: Io::READ_RVALUE,
                }
            }
        }
    }

    fn check_unary(&mut self, id: NodeId, op: UnaryOp, operand: NodeId) -> TypedExpr {
        match op {
            UnaryOp::Negate => {
                let ty = self.check_expr(operand, Io::READ_RVALUE);
                let ok = self.scalar_primitive(ty).is_some_and(Primitive::is_scalar_numeric)
                    || self
                        .scalar_primitive(ty)
                        .is_some_and(|p| p.vector_shape().is_some() || p.matrix_shape().is_some());
                if !ok && !self.module.is_error_type(ty) {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NoImplicitConversion,
                        format!("cannot negate '{}'", self.type_name(ty)),
                    );
                    return self.error_result();
                }
                TypedExpr {
                    ty,
                    io: Io::READ_RVALUE,
                }
            }
            UnaryOp::LogicalNot => {
                let boolean = self.module.core.boolean();
                let coerced = self.check_and_coerce(operand, boolean);
                if let NodeKind::UnaryOperator { operand, .. } = &mut self.tree.get_mut(id).kind {
                    *operand = coerced;
                }
                TypedExpr {
                    ty: boolean,
                    io: Io::READ_RVALUE,
                }
            }
            UnaryOp::BitwiseNot => {
                let ty = self.check_expr(operand, Io::READ_RVALUE);
                if !self.is_integer_family(ty) && !self.module.is_error_type(ty) {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NoImplicitConversion,
                        format!("'~' requires an integer type, found '{}'", self.type_name(ty)),
                    );
                    return self.error_result();
                }
                TypedExpr {
                    ty,
                    io: Io::READ_RVALUE,
                }
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                let ty = self.check_expr(operand, Io::READ_RVALUE | Io::WRITE_LVALUE);
                if !self.scalar_primitive(ty).is_some_and(Primitive::is_scalar_numeric)
                    && !self.module.is_error_type(ty)
                {
                    let location = self.tree.location(id);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NoImplicitConversion,
                        format!("cannot increment '{}'", self.type_name(ty)),
                    );
                }
                TypedExpr {
                    ty,
                    io: Io::empty(),
                }
            }
        }
    }

    fn check_explicit_cast(&mut self, id: NodeId, operand: NodeId, target: &TypeName) -> TypedExpr {
        let aliases = self.context.aliases.clone();
        let to = self.resolve_type_name(target, &aliases);
        let from = self.check_expr(operand, Io::READ_RVALUE);
        if self.module.is_error_type(from) || self.module.is_error_type(to) {
            return self.error_result();
        }
        let Some(info) = explicit_cast(self.module, from, to) else {
            self.errors.raise(
                target.location.clone(),
                DiagnosticCode::InvalidExplicitCast,
                format!(
                    "there is no conversion from '{}' to '{}'",
                    self.type_name(from),
                    self.type_name(to)
                ),
            );
            return self.error_result();
        };
        if let NodeKind::TypeCast { operator, .. } = &mut self.tree.get_mut(id).kind {
            *operator = Some(if from == to {
                CastOperator::Upcast { to }
            } else {
                info.operator
            });
        }
        TypedExpr {
            ty: to,
            io: Io::READ_RVALUE,
        }
    }

    // --- indexer rewriting ---

    /// Rewrites `object[args]` (and its assignment forms) into a
    /// `MultiExpression` of Get/GetSet/Set calls over synthesized locals, so
    /// code generation is uniform and the object/index expressions evaluate
    /// exactly once.
    fn rewrite_indexer(
        &mut self,
        node: NodeId,
        object: NodeId,
        arguments: &[NodeId],
        mode: IndexerMode,
        assigned: Option<NodeId>,
    ) -> TypedExpr {
        let location = self.tree.location(node);
        let object_type = self.check_expr(object, Io::READ_RVALUE);
        if self.module.is_error_type(object_type) {
            return self.error_result();
        }
        let has_get = self.module.types.find_functions(object_type, "Get").is_some();
        let has_set = self.module.types.find_functions(object_type, "Set").is_some();
        let needed_set = !matches!(mode, IndexerMode::Get);
        if !has_get || (needed_set && !has_set) {
            self.errors.raise(
                location,
                DiagnosticCode::IndexerNotFound,
                format!("'{}' does not define an indexer", self.type_name(object_type)),
            );
            return self.error_result();
        }

        let compound_op = match (mode, self.tree.kind(node)) {
            (IndexerMode::GetSet, NodeKind::BinaryOperator { op: BinaryToken::CompoundAssign(op), .. }) => Some(*op),
            _ => None,
        };

        let mut expressions = Vec::new();
        let object_local = self.synthesize_local(object, object_type, &location);
        expressions.push(object_local.declaration);

        let mut index_idents = Vec::new();
        for &argument in arguments {
            let argument_type = self.check_expr(argument, Io::READ_RVALUE);
            let local = self.synthesize_local(argument, argument_type, &location);
            expressions.push(local.declaration);
            index_idents.push(local.name);
        }

        let make_ident = |analyzer: &mut Self, name: &str| {
            analyzer.tree.add(
                NodeKind::Identifier {
                    name: name.to_owned(),
                    resolved: None,
                },
                location.clone(),
            )
        };

        let final_call = match mode {
            IndexerMode::Get => {
                let callee_obj = make_ident(self, &object_local.name);
                let callee = self.tree.add(
                    NodeKind::MemberAccess {
                        object: callee_obj,
                        name: "Get".to_owned(),
                        resolved: None,
                    },
                    location.clone(),
                );
                let args: Vec<NodeId> = index_idents.iter().map(|n| make_ident(self, n)).collect();
                self.tree.add(
                    NodeKind::FunctionCall {
                        callee,
                        arguments: args,
                        resolved_function: None,
                    },
                    location.clone(),
                )
            }
            IndexerMode::Set | IndexerMode::GetSet => {
                let value = assigned.expect("assignment rewrites carry a value");
                let value_expr = if let Some(op) = compound_op {
                    // value = object.Get(indices) op assigned
                    let get_obj = make_ident(self, &object_local.name);
                    let get_callee = self.tree.add(
                        NodeKind::MemberAccess {
                            object: get_obj,
                            name: "Get".to_owned(),
                            resolved: None,
                        },
                        location.clone(),
                    );
                    let get_args: Vec<NodeId> = index_idents.iter().map(|n| make_ident(self, n)).collect();
                    let get_call = self.tree.add(
                        NodeKind::FunctionCall {
                            callee: get_callee,
                            arguments: get_args,
                            resolved_function: None,
                        },
                        location.clone(),
                    );
                    self.tree.add(
                        NodeKind::BinaryOperator {
                            op: BinaryToken::Arith(op),
                            left: get_call,
                            right: value,
                        },
                        location.clone(),
                    )
                } else {
                    value
                };
                let set_obj = make_ident(self, &object_local.name);
                let set_callee = self.tree.add(
                    NodeKind::MemberAccess {
                        object: set_obj,
                        name: "Set".to_owned(),
                        resolved: None,
                    },
                    location.clone(),
                );
                let mut set_args: Vec<NodeId> = index_idents.iter().map(|n| make_ident(self, n)).collect();
                set_args.push(value_expr);
                self.tree.add(
                    NodeKind::FunctionCall {
                        callee: set_callee,
                        arguments: set_args,
                        resolved_function: None,
                    },
                    location.clone(),
                )
            }
        };
        expressions.push(final_call);
        let yield_index = expressions.len() - 1;

        self.tree.get_mut(node).kind = NodeKind::MultiExpression {
            expressions,
            yield_index,
            mode,
        };
        self.tree.fixup_parents(node);

        // A rewritten node re-checks as the multi-expression it now is.
        let ty = self.check_expr(node, Io::READ_RVALUE);
        TypedExpr {
            ty,
            io: Io::READ_RVALUE,
        }
    }

    /// Declares a synthesized, already-typed local holding `initializer`.
    fn synthesize_local(&mut self, initializer: NodeId, ty: TypeId, location: &CodeLocation) -> SynthesizedLocal {
        self.synthetic_counter += 1;
        // Bracketed names cannot collide with user identifiers.
        let name = format!("[indexer{}]", self.synthetic_counter);
        let declaration = self.tree.add(
            NodeKind::LocalVariable {
                name: name.clone(),
                declared_type: None,
                initializer: Some(initializer),
                resolved_type: Some(ty),
            },
            location.clone(),
        );
        SynthesizedLocal { name, declaration }
    }

    // --- coercion ---

    /// Types `child` as a readable value and inserts an implicit cast to
    /// `to` if needed, returning the node to use in the parent's slot.
    pub(crate) fn check_and_coerce(&mut self, child: NodeId, to: TypeId) -> NodeId {
        let from = self.check_expr(child, Io::READ_RVALUE);
        self.coerce_checked(child, from, to)
    }

    /// Inserts an implicit cast around an already-typed node, or reports
    /// exactly one `NoImplicitConversion` pointing at the expression.
    pub(crate) fn coerce_checked(&mut self, child: NodeId, from: TypeId, to: TypeId) -> NodeId {
        if from == to || self.module.is_error_type(from) || self.module.is_error_type(to) {
            return child;
        }
        let Some(info) = implicit_cast(self.module, from, to) else {
            let location = self.tree.location(child);
            self.errors.raise(
                location,
                DiagnosticCode::NoImplicitConversion,
                format!(
                    "cannot implicitly convert from '{}' to '{}'",
                    self.type_name(from),
                    self.type_name(to)
                ),
            );
            return child;
        };
        if info.cost == 0 {
            return child;
        }
        self.insert_cast(child, info.operator, to)
    }

    /// Reparents `child` beneath a new `TypeCast` node annotated with the
    /// operator to emit.
    fn insert_cast(&mut self, child: NodeId, operator: CastOperator, to: TypeId) -> NodeId {
        let parent = self.tree.get(child).parent;
        let location = self.tree.location(child);
        let cast = self.tree.add(
            NodeKind::TypeCast {
                operand: child,
                target: None,
                operator: Some(operator),
            },
            location,
        );
        {
            let node = self.tree.get_mut(cast);
            node.parent = parent;
            node.result_type = Some(to);
            node.io = Io::READ_RVALUE;
            node.io_usage = Io::READ_RVALUE;
        }
        self.tree.get_mut(child).parent = Some(cast);
        cast
    }

    // --- operand typing helpers ---

    fn scalar_primitive(&self, ty: TypeId) -> Option<Primitive> {
        self.module.primitive_of(ty)
    }

    fn is_integer_family(&self, ty: TypeId) -> bool {
        matches!(
            self.scalar_primitive(ty),
            Some(Primitive::Byte | Primitive::Integer | Primitive::DoubleInteger)
        )
    }

    /// The operand/result typing of a pure binary operator, or `None` when
    /// the operator is undefined for the pair.
    fn binary_operand_type(&mut self, op: BinaryOp, left: TypeId, right: TypeId) -> Option<BinaryOperands> {
        use BinaryOp::{
            Add, BitwiseAnd, BitwiseOr, BitwiseXor, Divide, Equal, Greater, GreaterEqual, Less, LessEqual, Modulo,
            Multiply, NotEqual, ShiftLeft, ShiftRight, Subtract,
        };
        let boolean = self.module.core.boolean();
        let left_primitive = self.scalar_primitive(left);
        let right_primitive = self.scalar_primitive(right);

        // Scalar numerics promote to the wider operand.
        if let (Some(lp), Some(rp)) = (left_primitive, right_primitive)
            && lp.is_scalar_numeric()
            && rp.is_scalar_numeric()
        {
            let promoted = if implicit_cast(self.module, left, right).is_some_and(|c| c.cost > 0) {
                right
            } else {
                left
            };
            return match op {
                Add | Subtract | Multiply | Divide | Modulo => Some(BinaryOperands::uniform(promoted, promoted)),
                ShiftLeft | ShiftRight | BitwiseAnd | BitwiseOr | BitwiseXor => {
                    self.is_integer_family(promoted).then(|| BinaryOperands::uniform(promoted, promoted))
                }
                Equal | NotEqual | Less | LessEqual | Greater | GreaterEqual => {
                    Some(BinaryOperands::uniform(promoted, boolean))
                }
            };
        }

        // String concatenation and comparison.
        if left == self.module.core.string() && right == left {
            return match op {
                Add => Some(BinaryOperands::uniform(left, left)),
                Equal | NotEqual => Some(BinaryOperands::uniform(left, boolean)),
                _ => None,
            };
        }

        // Vectors: component-wise with same type, or vector-scalar.
        if let (Some(lp), Some(rp)) = (left_primitive, right_primitive) {
            if let Some((component, _)) = lp.vector_shape() {
                if lp == rp && matches!(op, Add | Subtract | Multiply | Divide) {
                    return Some(BinaryOperands::uniform(left, left));
                }
                if rp == component && matches!(op, Multiply | Divide) {
                    return Some(BinaryOperands {
                        left,
                        right,
                        result: left,
                    });
                }
                if lp == rp && matches!(op, Equal | NotEqual) {
                    return Some(BinaryOperands::uniform(left, boolean));
                }
            }
            if let Some((component, _)) = rp.vector_shape()
                && lp == component
                && op == Multiply
            {
                return Some(BinaryOperands {
                    left,
                    right,
                    result: right,
                });
            }
            // Matrices: matrix * matrix (same shape) and matrix * vector.
            if lp.matrix_shape().is_some() && op == Multiply {
                if lp == rp {
                    return Some(BinaryOperands::uniform(left, left));
                }
                let vector = match (lp, rp) {
                    (Primitive::Real3x3, Primitive::Real3) | (Primitive::Real4x4, Primitive::Real4) => Some(right),
                    _ => None,
                };
                if let Some(vector) = vector {
                    return Some(BinaryOperands {
                        left,
                        right,
                        result: vector,
                    });
                }
            }
        }

        // Booleans compare for equality only.
        if left == boolean && right == boolean && matches!(op, Equal | NotEqual) {
            return Some(BinaryOperands::uniform(boolean, boolean));
        }

        // Enums compare as themselves.
        if left == right
            && self.module.types.bound(left).is_some_and(|b| b.is_enum)
            && matches!(op, Equal | NotEqual)
        {
            return Some(BinaryOperands::uniform(left, boolean));
        }

        // Handles: equality between related types, plus null on either side.
        if matches!(op, Equal | NotEqual) {
            let null = self.module.core.null;
            if left == null && self.module.types.is_reference(right) {
                return Some(BinaryOperands {
                    left: right,
                    right,
                    result: boolean,
                });
            }
            if right == null && self.module.types.is_reference(left) {
                return Some(BinaryOperands {
                    left,
                    right: left,
                    result: boolean,
                });
            }
            if self.module.types.is_reference(left)
                && self.module.types.is_reference(right)
                && (self.module.types.is_subtype_of(left, right) || self.module.types.is_subtype_of(right, left))
            {
                return Some(BinaryOperands {
                    left,
                    right,
                    result: boolean,
                });
            }
        }

        None
    }

    /// Whether a compound-assignment operator is valid on a type.
    fn binary_value_type(&mut self, op: BinaryOp, left: TypeId, right: TypeId) -> Option<TypeId> {
        self.binary_operand_type(op, left, right).map(|operands| operands.result)
    }

    pub(crate) fn type_name(&self, ty: TypeId) -> String {
        self.module.types.name_of(ty).to_owned()
    }
}

/// The Io and type of a checked expression.
#[derive(Debug, Clone, Copy)]
struct TypedExpr {
    ty: TypeId,
    io: Io,
}

/// Operand coercion targets and the result type of a binary operator.
#[derive(Debug, Clone, Copy)]
struct BinaryOperands {
    left: TypeId,
    right: TypeId,
    result: TypeId,
}

impl BinaryOperands {
    fn uniform(operand: TypeId, result: TypeId) -> Self {
        Self {
            left: operand,
            right: operand,
            result,
        }
    }
}

/// A synthesized local introduced by the indexer rewrite.
struct SynthesizedLocal {
    name: String,
    declaration: NodeId,
}

/// The Io a property supports, from which accessors it declares.
fn property_io(readable: bool, writable: bool) -> Io {
    let mut io = Io::empty();
    if readable {
        io |= Io::READ_RVALUE;
    }
    if writable {
        io |= Io::WRITE_LVALUE;
    }
    io
}
