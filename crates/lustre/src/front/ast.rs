//! The syntax tree: an arena of nodes with parent indices and the annotation
//! slots the analyzer fills in.
//!
//! Children are stored as [`NodeId`]s inside each node's kind; parents are
//! non-owning indices re-derived by a fixup walk after construction and after
//! any clone (template instantiation deep-copies a subtree and re-walks it to
//! set parents).

use bitflags::bitflags;

use crate::{
    ids::{FieldId, FunctionId, NodeId, PropertyId, TypeId},
    location::CodeLocation,
    opcode::{BinaryOp, CastOperator, Operand, UnaryOp},
    value::Constant,
};

bitflags! {
    /// Whether an expression's value can be read, written, or both.
    ///
    /// Every evaluated expression is assigned one of these; before using an
    /// expression as an operand, the parent tags the usage it requires and
    /// the analyzer reports any mismatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Io: u8 {
        const READ_RVALUE = 1;
        const WRITE_LVALUE = 2;
    }
}

/// A type as written in source: a name plus optional template arguments,
/// resolved to a [`TypeId`] during analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeName {
    pub name: String,
    pub template_args: Vec<TypeNameArg>,
    pub location: CodeLocation,
}

/// One written template argument: a type or a constant (array lengths).
#[derive(Debug, Clone, PartialEq)]
pub enum TypeNameArg {
    Type(TypeName),
    Integer(i64),
}

impl TypeName {
    #[must_use]
    pub fn simple(name: impl Into<String>, location: CodeLocation) -> Self {
        Self {
            name: name.into(),
            template_args: Vec::new(),
            location,
        }
    }
}

/// An attribute as written: `[Name]` or `[Name(params…)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeNode {
    pub name: String,
    pub parameters: Vec<Constant>,
    pub location: CodeLocation,
}

/// Binary operators at the syntax level, including assignment and the
/// short-circuiting logical forms that never become single opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryToken {
    Assign,
    CompoundAssign(BinaryOp),
    Arith(BinaryOp),
    LogicalAnd,
    LogicalOr,
}

/// What an identifier resolved to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedRef {
    /// A local variable or parameter; the id of its declaring node.
    Local(NodeId),
    /// A type used as a static access qualifier or value.
    Type(TypeId),
    /// A free (library-level) function name; overload selection happens at
    /// the call site.
    LibraryFunction,
}

/// What a member access resolved to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedMember {
    Field(FieldId),
    StaticField(FieldId),
    Property(PropertyId),
    /// A bound function; for calls the id is the selected overload, for
    /// delegate references it is the single candidate.
    Function(FunctionId),
    /// An enum value of the accessed enum type.
    EnumValue(i32),
}

/// Which variant of an indexer rewrite a `MultiExpression` encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerMode {
    /// Pure read: `a[i]` as an r-value.
    Get,
    /// Compound assignment: read, operate, write back.
    GetSet,
    /// Pure assignment: `a[i] = v`.
    Set,
}

/// The kind and children of one syntax node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// The root of a compilation: classes, enums, free functions, and loose
    /// statements (gathered into a synthesized entry function).
    Root { items: Vec<NodeId> },

    // --- declarations ---
    Class {
        name: String,
        is_struct: bool,
        template_params: Vec<String>,
        parent: Option<TypeName>,
        attributes: Vec<AttributeNode>,
        members: Vec<NodeId>,
        /// Set once the analyzer creates (or instantiates) the bound type.
        resolved_type: Option<TypeId>,
    },
    Enum {
        name: String,
        values: Vec<(String, Option<i64>)>,
        attributes: Vec<AttributeNode>,
        resolved_type: Option<TypeId>,
    },
    MemberVariable {
        name: String,
        declared_type: TypeName,
        initializer: Option<NodeId>,
        is_static: bool,
        attributes: Vec<AttributeNode>,
        resolved_field: Option<FieldId>,
    },
    Property {
        name: String,
        declared_type: TypeName,
        get_body: Option<NodeId>,
        set_body: Option<NodeId>,
        is_static: bool,
        attributes: Vec<AttributeNode>,
        resolved_property: Option<PropertyId>,
    },
    Function {
        name: String,
        parameters: Vec<NodeId>,
        return_type: Option<TypeName>,
        body: NodeId,
        is_static: bool,
        is_virtual: bool,
        is_override: bool,
        attributes: Vec<AttributeNode>,
        resolved_function: Option<FunctionId>,
    },
    Constructor {
        parameters: Vec<NodeId>,
        body: NodeId,
        attributes: Vec<AttributeNode>,
        resolved_function: Option<FunctionId>,
    },
    Destructor {
        body: NodeId,
        resolved_function: Option<FunctionId>,
    },
    Parameter {
        name: String,
        declared_type: TypeName,
        resolved_type: Option<TypeId>,
    },
    SendsEvent {
        name: String,
        event_type: TypeName,
    },

    // --- statements ---
    Scope { statements: Vec<NodeId> },
    If {
        condition: NodeId,
        then_scope: NodeId,
        else_node: Option<NodeId>,
    },
    While { condition: NodeId, body: NodeId },
    DoWhile { body: NodeId, condition: NodeId },
    For {
        initializer: Option<NodeId>,
        condition: Option<NodeId>,
        increment: Option<NodeId>,
        body: NodeId,
    },
    Loop { body: NodeId },
    Break,
    Continue,
    Return { value: Option<NodeId> },
    Throw { value: NodeId },
    Delete { value: NodeId },
    Timeout { seconds: i64, body: NodeId },
    LocalVariable {
        name: String,
        declared_type: Option<TypeName>,
        initializer: Option<NodeId>,
        resolved_type: Option<TypeId>,
    },

    // --- expressions ---
    Literal { constant: Constant },
    Null,
    This,
    StringInterpolant { parts: Vec<NodeId> },
    Identifier {
        name: String,
        resolved: Option<ResolvedRef>,
    },
    MemberAccess {
        object: NodeId,
        name: String,
        resolved: Option<ResolvedMember>,
    },
    FunctionCall {
        callee: NodeId,
        arguments: Vec<NodeId>,
        resolved_function: Option<FunctionId>,
    },
    IndexerCall {
        object: NodeId,
        arguments: Vec<NodeId>,
    },
    /// The uniform rewrite of side-effecting indexer use: the ordered
    /// sub-expressions plus which one yields the overall value.
    MultiExpression {
        expressions: Vec<NodeId>,
        yield_index: usize,
        mode: IndexerMode,
    },
    BinaryOperator {
        op: BinaryToken,
        left: NodeId,
        right: NodeId,
    },
    UnaryOperator { op: UnaryOp, operand: NodeId },
    /// A conversion: written explicitly (`expr as T`) or inserted by the
    /// analyzer, which reparents the operand beneath this node and annotates
    /// the cast operator to emit.
    TypeCast {
        operand: NodeId,
        target: Option<TypeName>,
        operator: Option<CastOperator>,
    },
    New {
        type_name: TypeName,
        arguments: Vec<NodeId>,
        resolved_constructor: Option<FunctionId>,
    },
    LocalNew {
        type_name: TypeName,
        arguments: Vec<NodeId>,
        resolved_constructor: Option<FunctionId>,
    },
    TypeIdExpr { expression: NodeId },
    MemberIdExpr { expression: NodeId },
}

/// One node: kind plus location, parent link, and analyzer annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub location: CodeLocation,
    /// Non-owning parent index, re-derived after construction and clones.
    pub parent: Option<NodeId>,
    /// The expression's computed type.
    pub result_type: Option<TypeId>,
    /// What the expression itself supports.
    pub io: Io,
    /// What the parent requires of it.
    pub io_usage: Io,
    /// How code generation reads or writes the value.
    pub access: Operand,
}

impl SyntaxNode {
    #[must_use]
    pub fn new(kind: NodeKind, location: CodeLocation) -> Self {
        Self {
            kind,
            location,
            parent: None,
            result_type: None,
            io: Io::empty(),
            io_usage: Io::empty(),
            access: Operand::default(),
        }
    }
}

/// The arena owning a parsed compilation's nodes.
#[derive(Debug, Default)]
pub struct SyntaxTree {
    nodes: Vec<SyntaxNode>,
    pub root: NodeId,
}

impl SyntaxTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: NodeKind, location: CodeLocation) -> NodeId {
        let id = NodeId::from(self.nodes.len());
        self.nodes.push(SyntaxNode::new(kind, location));
        id
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut SyntaxNode {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.get(id).kind
    }

    #[must_use]
    pub fn location(&self, id: NodeId) -> CodeLocation {
        self.get(id).location.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Calls `visit` with every direct child of `id`.
    pub fn for_each_child(&self, id: NodeId, mut visit: impl FnMut(NodeId)) {
        self.get(id).kind.for_each_child(&mut visit);
    }

    /// Direct children of `id`, in source order.
    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.for_each_child(id, |child| out.push(child));
        out
    }

    /// Re-derives parent links for the whole subtree under `root`.
    ///
    /// Must be called after building a tree and after every clone.
    pub fn fixup_parents(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for child in self.children(id) {
                self.get_mut(child).parent = Some(id);
                stack.push(child);
            }
        }
    }

    /// Deep-copies the subtree rooted at `source` into fresh nodes and
    /// returns the new root. Parent links inside the copy are re-derived.
    ///
    /// Annotations are copied as-is; template instantiation resets the ones
    /// it needs to recompute.
    pub fn clone_subtree(&mut self, source: NodeId) -> NodeId {
        let new_root = self.clone_recursive(source);
        self.get_mut(new_root).parent = None;
        self.fixup_parents(new_root);
        new_root
    }

    fn clone_recursive(&mut self, source: NodeId) -> NodeId {
        let mut node = self.get(source).clone();
        let children = self.children(source);
        let mut mapping = Vec::with_capacity(children.len());
        for child in children {
            mapping.push((child, self.clone_recursive(child)));
        }
        node.kind = node.kind.map_children(|old| {
            mapping
                .iter()
                .find(|(from, _)| *from == old)
                .map_or(old, |(_, to)| *to)
        });
        let id = NodeId::from(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Walks ancestors from `id` (exclusive) to the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = self.get(id).parent;
        std::iter::from_fn(move || {
            let next = current?;
            current = self.get(next).parent;
            Some(next)
        })
    }
}

impl NodeKind {
    /// Calls `visit` with each direct child id, in source order.
    pub fn for_each_child(&self, visit: &mut impl FnMut(NodeId)) {
        fn opt(child: &Option<NodeId>, visit: &mut impl FnMut(NodeId)) {
            if let Some(id) = child {
                visit(*id);
            }
        }
        match self {
            Self::Root { items } => items.iter().copied().for_each(visit),
            Self::Class { members, .. } => members.iter().copied().for_each(visit),
            Self::MemberVariable { initializer, .. } => opt(initializer, visit),
            Self::Property {
                get_body, set_body, ..
            } => {
                opt(get_body, visit);
                opt(set_body, visit);
            }
            Self::Function {
                parameters, body, ..
            } => {
                parameters.iter().copied().for_each(&mut *visit);
                visit(*body);
            }
            Self::Constructor {
                parameters, body, ..
            } => {
                parameters.iter().copied().for_each(&mut *visit);
                visit(*body);
            }
            Self::Destructor { body, .. } => visit(*body),
            Self::Scope { statements } => statements.iter().copied().for_each(visit),
            Self::If {
                condition,
                then_scope,
                else_node,
            } => {
                visit(*condition);
                visit(*then_scope);
                opt(else_node, visit);
            }
            Self::While { condition, body } => {
                visit(*condition);
                visit(*body);
            }
            Self::DoWhile { body, condition } => {
                visit(*body);
                visit(*condition);
            }
            Self::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                opt(initializer, visit);
                opt(condition, visit);
                opt(increment, visit);
                visit(*body);
            }
            Self::Loop { body } | Self::Timeout { body, .. } => visit(*body),
            Self::Return { value } => opt(value, visit),
            Self::Throw { value } | Self::Delete { value } => visit(*value),
            Self::LocalVariable { initializer, .. } => opt(initializer, visit),
            Self::StringInterpolant { parts } => parts.iter().copied().for_each(visit),
            Self::MemberAccess { object, .. } => visit(*object),
            Self::FunctionCall {
                callee, arguments, ..
            } => {
                visit(*callee);
                arguments.iter().copied().for_each(visit);
            }
            Self::IndexerCall { object, arguments } => {
                visit(*object);
                arguments.iter().copied().for_each(visit);
            }
            Self::MultiExpression { expressions, .. } => expressions.iter().copied().for_each(visit),
            Self::BinaryOperator { left, right, .. } => {
                visit(*left);
                visit(*right);
            }
            Self::UnaryOperator { operand, .. } | Self::TypeCast { operand, .. } => visit(*operand),
            Self::New { arguments, .. } | Self::LocalNew { arguments, .. } => {
                arguments.iter().copied().for_each(visit);
            }
            Self::TypeIdExpr { expression } | Self::MemberIdExpr { expression } => visit(*expression),
            Self::Enum { .. }
            | Self::Parameter { .. }
            | Self::SendsEvent { .. }
            | Self::Break
            | Self::Continue
            | Self::Literal { .. }
            | Self::Null
            | Self::This
            | Self::Identifier { .. } => {}
        }
    }

    /// Returns a copy of this kind with every child id passed through `map`.
    #[must_use]
    pub fn map_children(self, mut map: impl FnMut(NodeId) -> NodeId) -> Self {
        fn opt(child: Option<NodeId>, map: &mut impl FnMut(NodeId) -> NodeId) -> Option<NodeId> {
            child.map(map)
        }
        match self {
            Self::Root { items } => Self::Root {
                items: items.into_iter().map(map).collect(),
            },
            Self::Class {
                name,
                is_struct,
                template_params,
                parent,
                attributes,
                members,
                resolved_type,
            } => Self::Class {
                name,
                is_struct,
                template_params,
                parent,
                attributes,
                members: members.into_iter().map(map).collect(),
                resolved_type,
            },
            Self::MemberVariable {
                name,
                declared_type,
                initializer,
                is_static,
                attributes,
                resolved_field,
            } => Self::MemberVariable {
                name,
                declared_type,
                initializer: opt(initializer, &mut map),
                is_static,
                attributes,
                resolved_field,
            },
            Self::Property {
                name,
                declared_type,
                get_body,
                set_body,
                is_static,
                attributes,
                resolved_property,
            } => Self::Property {
                name,
                declared_type,
                get_body: opt(get_body, &mut map),
                set_body: opt(set_body, &mut map),
                is_static,
                attributes,
                resolved_property,
            },
            Self::Function {
                name,
                parameters,
                return_type,
                body,
                is_static,
                is_virtual,
                is_override,
                attributes,
                resolved_function,
            } => Self::Function {
                name,
                parameters: parameters.into_iter().map(&mut map).collect(),
                return_type,
                body: map(body),
                is_static,
                is_virtual,
                is_override,
                attributes,
                resolved_function,
            },
            Self::Constructor {
                parameters,
                body,
                attributes,
                resolved_function,
            } => Self::Constructor {
                parameters: parameters.into_iter().map(&mut map).collect(),
                body: map(body),
                attributes,
                resolved_function,
            },
            Self::Destructor { body, resolved_function } => Self::Destructor {
                body: map(body),
                resolved_function,
            },
            Self::Scope { statements } => Self::Scope {
                statements: statements.into_iter().map(map).collect(),
            },
            Self::If {
                condition,
                then_scope,
                else_node,
            } => Self::If {
                condition: map(condition),
                then_scope: map(then_scope),
                else_node: opt(else_node, &mut map),
            },
            Self::While { condition, body } => Self::While {
                condition: map(condition),
                body: map(body),
            },
            Self::DoWhile { body, condition } => Self::DoWhile {
                body: map(body),
                condition: map(condition),
            },
            Self::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                let initializer = opt(initializer, &mut map);
                let condition = opt(condition, &mut map);
                let increment = opt(increment, &mut map);
                Self::For {
                    initializer,
                    condition,
                    increment,
                    body: map(body),
                }
            }
            Self::Loop { body } => Self::Loop { body: map(body) },
            Self::Timeout { seconds, body } => Self::Timeout {
                seconds,
                body: map(body),
            },
            Self::Return { value } => Self::Return { value: opt(value, &mut map) },
            Self::Throw { value } => Self::Throw { value: map(value) },
            Self::Delete { value } => Self::Delete { value: map(value) },
            Self::LocalVariable {
                name,
                declared_type,
                initializer,
                resolved_type,
            } => Self::LocalVariable {
                name,
                declared_type,
                initializer: opt(initializer, &mut map),
                resolved_type,
            },
            Self::StringInterpolant { parts } => Self::StringInterpolant {
                parts: parts.into_iter().map(map).collect(),
            },
            Self::MemberAccess {
                object,
                name,
                resolved,
            } => Self::MemberAccess {
                object: map(object),
                name,
                resolved,
            },
            Self::FunctionCall {
                callee,
                arguments,
                resolved_function,
            } => Self::FunctionCall {
                callee: map(callee),
                arguments: arguments.into_iter().map(map).collect(),
                resolved_function,
            },
            Self::IndexerCall { object, arguments } => Self::IndexerCall {
                object: map(object),
                arguments: arguments.into_iter().map(map).collect(),
            },
            Self::MultiExpression {
                expressions,
                yield_index,
                mode,
            } => Self::MultiExpression {
                expressions: expressions.into_iter().map(map).collect(),
                yield_index,
                mode,
            },
            Self::BinaryOperator { op, left, right } => Self::BinaryOperator {
                op,
                left: map(left),
                right: map(right),
            },
            Self::UnaryOperator { op, operand } => Self::UnaryOperator {
                op,
                operand: map(operand),
            },
            Self::TypeCast {
                operand,
                target,
                operator,
            } => Self::TypeCast {
                operand: map(operand),
                target,
                operator,
            },
            Self::New {
                type_name,
                arguments,
                resolved_constructor,
            } => Self::New {
                type_name,
                arguments: arguments.into_iter().map(map).collect(),
                resolved_constructor,
            },
            Self::LocalNew {
                type_name,
                arguments,
                resolved_constructor,
            } => Self::LocalNew {
                type_name,
                arguments: arguments.into_iter().map(map).collect(),
                resolved_constructor,
            },
            Self::TypeIdExpr { expression } => Self::TypeIdExpr {
                expression: map(expression),
            },
            Self::MemberIdExpr { expression } => Self::MemberIdExpr {
                expression: map(expression),
            },
            other @ (Self::Enum { .. }
            | Self::Parameter { .. }
            | Self::SendsEvent { .. }
            | Self::Break
            | Self::Continue
            | Self::Literal { .. }
            | Self::Null
            | Self::This
            | Self::Identifier { .. }) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_fixup_links_children() {
        let mut tree = SyntaxTree::new();
        let leaf = tree.add(NodeKind::Null, CodeLocation::default());
        let ret = tree.add(NodeKind::Return { value: Some(leaf) }, CodeLocation::default());
        let scope = tree.add(
            NodeKind::Scope {
                statements: vec![ret],
            },
            CodeLocation::default(),
        );
        tree.root = tree.add(NodeKind::Root { items: vec![scope] }, CodeLocation::default());
        tree.fixup_parents(tree.root);

        assert_eq!(tree.get(leaf).parent, Some(ret));
        assert_eq!(tree.get(ret).parent, Some(scope));
        assert_eq!(tree.get(scope).parent, Some(tree.root));
    }

    #[test]
    fn clone_subtree_remaps_children_and_parents() {
        let mut tree = SyntaxTree::new();
        let leaf = tree.add(NodeKind::Null, CodeLocation::default());
        let ret = tree.add(NodeKind::Return { value: Some(leaf) }, CodeLocation::default());
        tree.fixup_parents(ret);

        let copy = tree.clone_subtree(ret);
        assert_ne!(copy, ret);
        let NodeKind::Return { value: Some(copied_leaf) } = *tree.kind(copy) else {
            panic!("clone changed node kind");
        };
        assert_ne!(copied_leaf, leaf);
        assert_eq!(tree.get(copied_leaf).parent, Some(copy));
        // The original is untouched.
        let NodeKind::Return { value: Some(original_leaf) } = *tree.kind(ret) else {
            panic!("original changed kind");
        };
        assert_eq!(original_leaf, leaf);
    }
}
