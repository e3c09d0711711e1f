//! The semantic analyzer: scope resolution, type inference, overload
//! selection, implicit conversion insertion, and IO-mode checking.
//!
//! Passes run in a fixed order: collect classes and enums (including template
//! definitions), resolve inheritance and template instantiations, collect
//! members, then type every function body. Template instantiation can occur
//! while typing bodies, so newly instantiated classes queue their own body
//! jobs and the driver drains until nothing is pending.
//!
//! In tolerant mode the analyzer substitutes the error placeholder type after
//! a failure and keeps going, so language services see every diagnostic.

pub mod conversion;
mod expressions;

use ahash::AHashMap;

use crate::{
    diagnostics::{CompilationErrors, DiagnosticCode},
    front::ast::{AttributeNode, NodeKind, SyntaxTree, TypeName, TypeNameArg},
    function::{Function, FunctionKind},
    ids::{FieldId, FunctionId, LibraryId, NodeId, TypeId},
    library::{Library, Module},
    location::{CodeEntry, CodeLocation},
    members::{Attribute, FieldDesc, PropertyDesc},
    types::{
        BoundType, DelegateParam, DelegateSig, SentEvent, TemplateArg, TemplateArgKey, Type, TypeCopyMode, TypeKind,
    },
    value::Constant,
};

/// What the code generator compiles for one function.
#[derive(Debug, Clone)]
pub enum FunctionBody {
    /// An ordinary body: statements plus the parameter declaration nodes.
    Scope {
        body: NodeId,
        parameters: Vec<NodeId>,
    },
    /// A generated field initializer: evaluate and store into the field.
    FieldInitializer { field: FieldId, initializer: NodeId },
    /// The generated pre-constructor: zero every instance field, then call
    /// each field initializer.
    PreConstructor { type_id: TypeId },
}

/// The analyzer's product, consumed by the bytecode compiler.
#[derive(Debug)]
pub struct AnalysisOutput {
    pub library: LibraryId,
    pub bodies: AHashMap<FunctionId, FunctionBody>,
    /// The synthesized function holding loose top-level statements.
    pub entry_function: Option<FunctionId>,
}

/// A function body waiting to be typed.
#[derive(Debug)]
struct BodyJob {
    owner: Option<TypeId>,
    /// The class node whose template aliases apply while typing.
    class_node: Option<NodeId>,
    function: FunctionId,
    body: NodeId,
    parameters: Vec<NodeId>,
}

/// What kind of lexical scope a [`LocalScope`] represents; break/continue
/// bind to the nearest `Loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Function,
    Block,
    Loop,
    Timeout,
}

/// One lexical scope during typing.
#[derive(Debug)]
pub(crate) struct LocalScope {
    pub(crate) declarations: AHashMap<String, NodeId>,
    pub(crate) kind: ScopeKind,
}

/// The typing context for the function currently being checked.
#[derive(Debug, Clone)]
pub(crate) struct FunctionContext {
    pub(crate) owner: Option<TypeId>,
    pub(crate) return_type: TypeId,
    pub(crate) is_static: bool,
    /// Template parameter aliases active for this body.
    pub(crate) aliases: Vec<(String, TypeId)>,
}

pub struct Analyzer<'a> {
    pub(crate) module: &'a mut Module,
    pub(crate) tree: &'a mut SyntaxTree,
    pub(crate) errors: &'a mut CompilationErrors,
    pub(crate) library: Library,
    pub(crate) library_id: LibraryId,
    /// Template class definitions by base name; never themselves types.
    templates: AHashMap<String, NodeId>,
    /// Template parameter substitutions per instantiated class node.
    aliases_by_class: AHashMap<NodeId, Vec<(String, TypeId)>>,
    bodies: AHashMap<FunctionId, FunctionBody>,
    pending_bodies: Vec<BodyJob>,
    /// Classes whose members are collected, to order parents before children.
    members_collected: ahash::AHashSet<NodeId>,
    /// Classes currently on the inheritance resolution stack.
    resolving: ahash::AHashSet<NodeId>,
    pub(crate) scopes: Vec<LocalScope>,
    pub(crate) context: FunctionContext,
    /// Monotonic counter for synthesized local names in indexer rewrites.
    pub(crate) synthetic_counter: u32,
}

/// Runs semantic analysis over a parsed tree, producing a new library in the
/// module plus the body map for code generation.
///
/// Diagnostics land in `errors`; the caller decides whether `was_error`
/// aborts the pipeline.
pub fn analyze(
    module: &mut Module,
    tree: &mut SyntaxTree,
    library_name: &str,
    code_entries: Vec<CodeEntry>,
    errors: &mut CompilationErrors,
) -> AnalysisOutput {
    let library_id = LibraryId::from(module.libraries.len());
    let mut analyzer = Analyzer {
        module,
        tree,
        errors,
        library: Library {
            name: library_name.to_owned(),
            code_entries,
            ..Library::default()
        },
        library_id,
        templates: AHashMap::new(),
        aliases_by_class: AHashMap::new(),
        bodies: AHashMap::new(),
        pending_bodies: Vec::new(),
        members_collected: ahash::AHashSet::new(),
        resolving: ahash::AHashSet::new(),
        scopes: Vec::new(),
        context: FunctionContext {
            owner: None,
            return_type: TypeId(0),
            is_static: true,
            aliases: Vec::new(),
        },
        synthetic_counter: 0,
    };
    let entry_function = analyzer.run();
    let bodies = std::mem::take(&mut analyzer.bodies);
    let library = std::mem::take(&mut analyzer.library);
    let added = module.add_library(library);
    debug_assert_eq!(added, library_id);
    AnalysisOutput {
        library: library_id,
        bodies,
        entry_function,
    }
}

impl Analyzer<'_> {
    fn run(&mut self) -> Option<FunctionId> {
        let items = match self.tree.kind(self.tree.root) {
            NodeKind::Root { items } => items.clone(),
            _ => return None,
        };

        // Pass 1: collect classes, enums, and template definitions.
        let mut class_nodes = Vec::new();
        let mut function_nodes = Vec::new();
        let mut loose_statements = Vec::new();
        for item in items {
            match self.tree.kind(item) {
                NodeKind::Class { template_params, name, .. } => {
                    if template_params.is_empty() {
                        self.declare_class_shell(item);
                        class_nodes.push(item);
                    } else if self.templates.insert(name.clone(), item).is_some() {
                        let location = self.tree.location(item);
                        self.errors.raise(
                            location,
                            DiagnosticCode::DuplicateTypeName,
                            format!("template '{name}' is declared more than once"),
                        );
                    }
                }
                NodeKind::Enum { .. } => self.declare_enum(item),
                NodeKind::Function { .. } => function_nodes.push(item),
                _ => loose_statements.push(item),
            }
        }

        // Pass 2 + 3: resolve inheritance and collect members, parents first.
        for &class in &class_nodes {
            self.collect_class_members(class);
        }

        // Library-level functions.
        for function in function_nodes {
            self.declare_free_function(function);
        }

        // Loose statements become the library's entry function.
        let entry_function = if loose_statements.is_empty() {
            None
        } else {
            Some(self.declare_entry_function(&loose_statements))
        };
        self.library.entry_function = entry_function;

        // Pass 4+: type every body; instantiations queue more work.
        while let Some(job) = self.pending_bodies.pop() {
            self.check_body(&job);
        }

        entry_function
    }

    // --- declarations ---

    /// Creates the bound-type shell for a class so its name resolves while
    /// other declarations are processed.
    fn declare_class_shell(&mut self, class: NodeId) -> TypeId {
        let (name, is_struct, attributes) = match self.tree.kind(class) {
            NodeKind::Class {
                name,
                is_struct,
                attributes,
                ..
            } => (name.clone(), *is_struct, attributes.clone()),
            _ => unreachable!("declare_class_shell on a non-class node"),
        };
        let location = self.tree.location(class);
        if self.library.type_names.contains_key(&name) {
            self.errors.raise(
                location.clone(),
                DiagnosticCode::DuplicateTypeName,
                format!("type '{name}' is declared more than once in this library"),
            );
        }
        let id = self.module.types.add(Type {
            name: name.clone(),
            library: self.library_id,
            kind: TypeKind::Bound(BoundType {
                copy_mode: if is_struct {
                    TypeCopyMode::Value
                } else {
                    TypeCopyMode::Reference
                },
                manager: crate::ids::HandleManagerId::HEAP,
                attributes: self.lower_attributes(&attributes),
                location: location.clone(),
                ..BoundType::default()
            }),
        });
        self.library.type_names.insert(name, id);
        self.library.types.push(id);
        if let NodeKind::Class { resolved_type, .. } = &mut self.tree.get_mut(class).kind {
            *resolved_type = Some(id);
        }
        id
    }

    fn declare_enum(&mut self, node: NodeId) {
        let (name, values, attributes) = match self.tree.kind(node) {
            NodeKind::Enum {
                name,
                values,
                attributes,
                ..
            } => (name.clone(), values.clone(), attributes.clone()),
            _ => unreachable!("declare_enum on a non-enum node"),
        };
        let location = self.tree.location(node);
        if self.library.type_names.contains_key(&name) {
            self.errors.raise(
                location.clone(),
                DiagnosticCode::DuplicateTypeName,
                format!("type '{name}' is declared more than once in this library"),
            );
        }
        let mut bound = BoundType {
            copy_mode: TypeCopyMode::Value,
            manager: crate::ids::HandleManagerId::POINTER,
            is_enum: true,
            attributes: self.lower_attributes(&attributes),
            location: location.clone(),
            ..BoundType::default()
        };
        let mut next = 0;
        for (value_name, explicit) in values {
            let value = explicit.map_or(next, |v| i64::try_from(i32::try_from(v).unwrap_or(0)).unwrap_or(0));
            let value = i32::try_from(value).unwrap_or(0);
            bound.enum_values.insert(value_name, value);
            next = i64::from(value) + 1;
        }
        let id = self.module.types.add(Type {
            name: name.clone(),
            library: self.library_id,
            kind: TypeKind::Bound(bound),
        });
        self.library.type_names.insert(name, id);
        self.library.types.push(id);
        if let NodeKind::Enum { resolved_type, .. } = &mut self.tree.get_mut(node).kind {
            *resolved_type = Some(id);
        }
    }

    fn lower_attributes(&self, attributes: &[AttributeNode]) -> Vec<Attribute> {
        attributes
            .iter()
            .map(|node| Attribute {
                name: node.name.clone(),
                parameters: node.parameters.clone(),
            })
            .collect()
    }

    // --- inheritance + members ---

    /// Collects a class's members, resolving its parent first so field
    /// offsets begin after the parent layout.
    fn collect_class_members(&mut self, class: NodeId) {
        if self.members_collected.contains(&class) {
            return;
        }
        if !self.resolving.insert(class) {
            let location = self.tree.location(class);
            self.errors.raise(
                location,
                DiagnosticCode::CycleOfInheritance,
                "inheritance forms a cycle",
            );
            return;
        }

        let (type_id, parent_name, members) = match self.tree.kind(class) {
            NodeKind::Class {
                resolved_type,
                parent,
                members,
                ..
            } => (resolved_type.expect("shell declared"), parent.clone(), members.clone()),
            _ => unreachable!("collect_class_members on a non-class node"),
        };
        let aliases = self.aliases_by_class.get(&class).cloned().unwrap_or_default();

        // Resolve the parent type, recursing so its layout is final.
        let mut parent_size = 0;
        if let Some(parent_name) = parent_name {
            let parent_id = self.resolve_type_name(&parent_name, &aliases);
            if !self.module.is_error_type(parent_id) {
                match &self.module.types.get(parent_id).kind {
                    TypeKind::Bound(_) => {
                        // A parent declared in this library needs its own
                        // members collected first; the resolving set stays
                        // intact so a cycle trips the guard above.
                        if let Some(parent_node) = self.class_node_of(parent_id) {
                            self.collect_class_members(parent_node);
                        }
                        let parent_bound = self.module.types.bound(parent_id).expect("parent is bound");
                        parent_size = parent_bound.size_slots;
                        let parent_vtable = parent_bound.virtual_table.clone();
                        if let Some(bound) = self.module.types.bound_mut(type_id) {
                            bound.parent = Some(parent_id);
                            bound.virtual_table = parent_vtable;
                            bound.size_slots = parent_size;
                        }
                    }
                    _ => {
                        self.errors.raise(
                            parent_name.location.clone(),
                            DiagnosticCode::BaseTypeNotAClass,
                            format!("'{}' cannot be inherited from", parent_name.name),
                        );
                    }
                }
            }
        }

        let mut next_offset = parent_size;
        for member in members {
            self.collect_member(type_id, class, member, &aliases, &mut next_offset);
        }
        if let Some(bound) = self.module.types.bound_mut(type_id) {
            bound.size_slots = next_offset;
        }

        // Every bound class gets a pre-constructor that zeroes fields and
        // runs initializers.
        let pre = self.add_member_function(
            type_id,
            "PreConstructor",
            Vec::new(),
            self.module.core.void,
            FunctionKind::PreConstructor,
            false,
            self.tree.location(class),
        );
        self.bodies.insert(pre, FunctionBody::PreConstructor { type_id });
        if let Some(bound) = self.module.types.bound_mut(type_id) {
            bound.pre_constructor = Some(pre);
        }

        self.resolving.remove(&class);
        self.members_collected.insert(class);
    }

    /// The class node that declared a type in this library, if any.
    fn class_node_of(&self, type_id: TypeId) -> Option<NodeId> {
        // Instantiated and declared classes both record their type on the
        // node; linear search is fine at library sizes.
        self.aliases_by_class
            .keys()
            .copied()
            .chain(self.members_collected.iter().copied())
            .chain(self.resolving.iter().copied())
            .find(|&node| {
                matches!(
                    self.tree.kind(node),
                    NodeKind::Class { resolved_type: Some(id), .. } if *id == type_id
                )
            })
            .or_else(|| self.find_class_node_by_type(type_id))
    }

    fn find_class_node_by_type(&self, type_id: TypeId) -> Option<NodeId> {
        let NodeKind::Root { items } = self.tree.kind(self.tree.root) else {
            return None;
        };
        items
            .iter()
            .copied()
            .find(|&item| matches!(self.tree.kind(item), NodeKind::Class { resolved_type: Some(id), .. } if *id == type_id))
    }

    fn collect_member(
        &mut self,
        type_id: TypeId,
        class_node: NodeId,
        member: NodeId,
        aliases: &[(String, TypeId)],
        next_offset: &mut u32,
    ) {
        let location = self.tree.location(member);
        match self.tree.kind(member).clone() {
            NodeKind::MemberVariable {
                name,
                declared_type,
                initializer,
                is_static,
                attributes,
                ..
            } => {
                self.check_duplicate_member(type_id, &name, &location);
                let value_type = self.resolve_type_name(&declared_type, aliases);
                let offset = if is_static {
                    0
                } else {
                    let offset = *next_offset;
                    *next_offset += 1;
                    offset
                };
                let field = self.module.add_field(FieldDesc {
                    name: name.clone(),
                    owner: type_id,
                    value_type,
                    offset,
                    is_static,
                    attributes: self.lower_attributes(&attributes),
                    initializer: None,
                    location: location.clone(),
                });
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    if is_static {
                        bound.statics.insert(name.clone(), field);
                    } else {
                        bound.fields.insert(name.clone(), field);
                    }
                }
                if let NodeKind::MemberVariable { resolved_field, .. } = &mut self.tree.get_mut(member).kind {
                    *resolved_field = Some(field);
                }
                if let Some(initializer) = initializer {
                    let function = self.add_member_function(
                        type_id,
                        &format!("[initializer {name}]"),
                        Vec::new(),
                        self.module.core.void,
                        FunctionKind::FieldInitializer,
                        is_static,
                        location,
                    );
                    self.module.fields[field.index()].initializer = Some(function);
                    self.bodies
                        .insert(function, FunctionBody::FieldInitializer { field, initializer });
                    self.pending_bodies.push(BodyJob {
                        owner: Some(type_id),
                        class_node: Some(class_node),
                        function,
                        body: initializer,
                        parameters: Vec::new(),
                    });
                }
            }
            NodeKind::Property {
                name,
                declared_type,
                get_body,
                set_body,
                is_static,
                attributes,
                ..
            } => {
                self.check_duplicate_member(type_id, &name, &location);
                let value_type = self.resolve_type_name(&declared_type, aliases);
                let get = get_body.map(|body| {
                    let function = self.add_member_function(
                        type_id,
                        &format!("[get {name}]"),
                        Vec::new(),
                        value_type,
                        FunctionKind::PropertyGet,
                        is_static,
                        location.clone(),
                    );
                    self.bodies.insert(
                        function,
                        FunctionBody::Scope {
                            body,
                            parameters: Vec::new(),
                        },
                    );
                    self.pending_bodies.push(BodyJob {
                        owner: Some(type_id),
                        class_node: Some(class_node),
                        function,
                        body,
                        parameters: Vec::new(),
                    });
                    function
                });
                let set = set_body.map(|body| {
                    // The setter takes the implicit `value` parameter.
                    let value_param = self.tree.add(
                        NodeKind::Parameter {
                            name: "value".to_owned(),
                            declared_type: declared_type.clone(),
                            resolved_type: Some(value_type),
                        },
                        location.clone(),
                    );
                    let function = self.add_member_function(
                        type_id,
                        &format!("[set {name}]"),
                        vec![DelegateParam {
                            name: Some("value".to_owned()),
                            ty: value_type,
                        }],
                        self.module.core.void,
                        FunctionKind::PropertySet,
                        is_static,
                        location.clone(),
                    );
                    self.bodies.insert(
                        function,
                        FunctionBody::Scope {
                            body,
                            parameters: vec![value_param],
                        },
                    );
                    self.pending_bodies.push(BodyJob {
                        owner: Some(type_id),
                        class_node: Some(class_node),
                        function,
                        body,
                        parameters: vec![value_param],
                    });
                    function
                });
                let property = self.module.add_property(PropertyDesc {
                    name: name.clone(),
                    owner: type_id,
                    value_type,
                    get,
                    set,
                    is_static,
                    attributes: self.lower_attributes(&attributes),
                    location,
                });
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    bound.properties.insert(name.clone(), property);
                }
                if let NodeKind::Property { resolved_property, .. } = &mut self.tree.get_mut(member).kind {
                    *resolved_property = Some(property);
                }
            }
            NodeKind::Function {
                name,
                parameters,
                return_type,
                body,
                is_static,
                is_virtual,
                is_override,
                attributes,
                ..
            } => {
                let params = self.resolve_parameters(&parameters, aliases);
                let return_type =
                    return_type.map_or(self.module.core.void, |ty| self.resolve_type_name(&ty, aliases));
                // Fields and properties cannot share a name with a function;
                // other overloads of the same name are fine.
                if self.module.types.bound(type_id).is_some_and(|bound| {
                    bound.fields.contains_key(&name) || bound.statics.contains_key(&name) || bound.properties.contains_key(&name)
                }) {
                    self.errors.raise(
                        location.clone(),
                        DiagnosticCode::DuplicateMemberName,
                        format!("'{name}' is already declared on this type"),
                    );
                }
                let function = self.add_member_function(
                    type_id,
                    &name,
                    params,
                    return_type,
                    FunctionKind::Normal,
                    is_static,
                    location.clone(),
                );
                let lowered_attributes = self.lower_attributes(&attributes);
                {
                    let f = self.module.function_mut(function);
                    f.is_virtual = is_virtual || is_override;
                    f.is_override = is_override;
                    f.attributes = lowered_attributes;
                }
                self.check_function_overloading(type_id, function, &name, is_override, &location);
                if let NodeKind::Function { resolved_function, .. } = &mut self.tree.get_mut(member).kind {
                    *resolved_function = Some(function);
                }
                self.bodies.insert(
                    function,
                    FunctionBody::Scope {
                        body,
                        parameters: parameters.clone(),
                    },
                );
                self.pending_bodies.push(BodyJob {
                    owner: Some(type_id),
                    class_node: Some(class_node),
                    function,
                    body,
                    parameters,
                });
            }
            NodeKind::Constructor {
                parameters,
                body,
                attributes,
                ..
            } => {
                let params = self.resolve_parameters(&parameters, aliases);
                let lowered_attributes = self.lower_attributes(&attributes);
                let function = self.add_member_function(
                    type_id,
                    "Constructor",
                    params,
                    self.module.core.void,
                    FunctionKind::Constructor,
                    false,
                    location,
                );
                self.module.function_mut(function).attributes = lowered_attributes;
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    bound.constructors.push(function);
                }
                if let NodeKind::Constructor { resolved_function, .. } = &mut self.tree.get_mut(member).kind {
                    *resolved_function = Some(function);
                }
                self.bodies.insert(
                    function,
                    FunctionBody::Scope {
                        body,
                        parameters: parameters.clone(),
                    },
                );
                self.pending_bodies.push(BodyJob {
                    owner: Some(type_id),
                    class_node: Some(class_node),
                    function,
                    body,
                    parameters,
                });
            }
            NodeKind::Destructor { body, .. } => {
                let function = self.add_member_function(
                    type_id,
                    "Destructor",
                    Vec::new(),
                    self.module.core.void,
                    FunctionKind::Destructor,
                    false,
                    location,
                );
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    bound.destructor = Some(function);
                }
                if let NodeKind::Destructor { resolved_function, .. } = &mut self.tree.get_mut(member).kind {
                    *resolved_function = Some(function);
                }
                self.bodies.insert(
                    function,
                    FunctionBody::Scope {
                        body,
                        parameters: Vec::new(),
                    },
                );
                self.pending_bodies.push(BodyJob {
                    owner: Some(type_id),
                    class_node: Some(class_node),
                    function,
                    body,
                    parameters: Vec::new(),
                });
            }
            NodeKind::SendsEvent { name, event_type } => {
                let event_type = self.resolve_type_name(&event_type, aliases);
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    bound.sent_events.push(SentEvent { name, event_type });
                }
            }
            _ => {
                self.errors.raise(
                    location,
                    DiagnosticCode::UnexpectedToken,
                    "only member declarations may appear inside a class",
                );
            }
        }
    }

    /// Rejects members whose name shadows a field or property, declared here
    /// or inherited.
    fn check_duplicate_member(&mut self, type_id: TypeId, name: &str, location: &CodeLocation) {
        let bound = self.module.types.bound(type_id);
        let duplicate_here = bound.is_some_and(|b| {
            b.fields.contains_key(name)
                || b.statics.contains_key(name)
                || b.properties.contains_key(name)
                || b.functions.contains_key(name)
        });
        if duplicate_here {
            self.errors.raise(
                location.clone(),
                DiagnosticCode::DuplicateMemberName,
                format!("'{name}' is already declared on this type"),
            );
            return;
        }
        let parent = bound.and_then(|b| b.parent);
        if let Some(parent) = parent
            && (self.module.types.find_field(parent, name).is_some()
                || self.module.types.find_property(parent, name).is_some())
        {
            self.errors.raise(
                location.clone(),
                DiagnosticCode::MemberShadowsInherited,
                format!("'{name}' shadows an inherited member"),
            );
        }
    }

    /// Enforces override marking and duplicate-signature rejection within an
    /// overload set, and maintains the virtual table.
    fn check_function_overloading(
        &mut self,
        type_id: TypeId,
        function: FunctionId,
        name: &str,
        is_override: bool,
        location: &CodeLocation,
    ) {
        let signature_key = self.module.function(function).signature.structural_key();

        // Duplicate signature within this type's own overload set.
        let own_set: Vec<FunctionId> = self
            .module
            .types
            .bound(type_id)
            .and_then(|bound| bound.functions.get(name).cloned())
            .unwrap_or_default();
        for existing in &own_set {
            if self.module.function(*existing).signature.structural_key() == signature_key {
                self.errors.raise_with(
                    location.clone(),
                    DiagnosticCode::DuplicateMemberName,
                    format!("'{name}' is already declared with this signature"),
                    vec![self.module.function(*existing).location.clone()],
                    Vec::new(),
                );
            }
        }

        // A parent function with the same signature requires the override
        // marker (and the parent must allow it).
        let parent = self.module.types.bound(type_id).and_then(|bound| bound.parent);
        let parent_match = parent.and_then(|parent| {
            self.module
                .types
                .find_functions(parent, name)
                .and_then(|set| {
                    set.iter()
                        .copied()
                        .find(|&id| self.module.function(id).signature.structural_key() == signature_key)
                })
        });
        match parent_match {
            Some(parent_function) => {
                if !is_override {
                    self.errors.raise_with(
                        location.clone(),
                        DiagnosticCode::OverrideWithoutMarker,
                        format!("'{name}' hides an inherited function; mark it 'override'"),
                        vec![self.module.function(parent_function).location.clone()],
                        Vec::new(),
                    );
                } else if !self.module.function(parent_function).is_virtual {
                    self.errors.raise(
                        location.clone(),
                        DiagnosticCode::OverrideWithoutMarker,
                        format!("'{name}' overrides a function that is not virtual"),
                    );
                }
                // Replace the parent's slot in the virtual table.
                if let Some(bound) = self.module.types.bound_mut(type_id) {
                    for entry in &mut bound.virtual_table {
                        if *entry == parent_function {
                            *entry = function;
                        }
                    }
                }
            }
            None => {
                if is_override {
                    self.errors.raise(
                        location.clone(),
                        DiagnosticCode::OverrideWithoutMarker,
                        format!("'{name}' is marked 'override' but overrides nothing"),
                    );
                }
                let is_virtual = self.module.function(function).is_virtual;
                if is_virtual && let Some(bound) = self.module.types.bound_mut(type_id) {
                    bound.virtual_table.push(function);
                }
            }
        }

        if let Some(bound) = self.module.types.bound_mut(type_id) {
            bound.functions.entry(name.to_owned()).or_default().push(function);
        }
    }

    fn resolve_parameters(&mut self, parameters: &[NodeId], aliases: &[(String, TypeId)]) -> Vec<DelegateParam> {
        parameters
            .iter()
            .map(|&parameter| {
                let (name, declared_type) = match self.tree.kind(parameter) {
                    NodeKind::Parameter {
                        name, declared_type, ..
                    } => (name.clone(), declared_type.clone()),
                    _ => unreachable!("parameter list holds parameter nodes"),
                };
                let ty = self.resolve_type_name(&declared_type, aliases);
                if let NodeKind::Parameter { resolved_type, .. } = &mut self.tree.get_mut(parameter).kind {
                    *resolved_type = Some(ty);
                }
                DelegateParam { name: Some(name), ty }
            })
            .collect()
    }

    fn add_member_function(
        &mut self,
        owner: TypeId,
        name: &str,
        params: Vec<DelegateParam>,
        return_type: TypeId,
        kind: FunctionKind,
        is_static: bool,
        location: CodeLocation,
    ) -> FunctionId {
        let signature = DelegateSig {
            params,
            return_type,
        };
        let delegate_type = self.module.intern_delegate(signature.clone());
        let id = self.module.add_function(Function {
            name: name.to_owned(),
            owner: Some(owner),
            signature,
            delegate_type,
            kind,
            is_static,
            is_virtual: false,
            is_override: false,
            attributes: Vec::new(),
            location,
            code: None,
            native: None,
        });
        self.library.functions.push(id);
        id
    }

    fn declare_free_function(&mut self, node: NodeId) {
        let (name, parameters, return_type, body, attributes) = match self.tree.kind(node) {
            NodeKind::Function {
                name,
                parameters,
                return_type,
                body,
                attributes,
                ..
            } => (
                name.clone(),
                parameters.clone(),
                return_type.clone(),
                *body,
                attributes.clone(),
            ),
            _ => unreachable!("declare_free_function on a non-function node"),
        };
        let location = self.tree.location(node);
        let params = self.resolve_parameters(&parameters, &[]);
        let return_type = return_type.map_or(self.module.core.void, |ty| self.resolve_type_name(&ty, &[]));
        let signature = DelegateSig {
            params,
            return_type,
        };
        let signature_key = signature.structural_key();
        let delegate_type = self.module.intern_delegate(signature.clone());
        let id = self.module.add_function(Function {
            name: name.clone(),
            owner: None,
            signature,
            delegate_type,
            kind: FunctionKind::Normal,
            is_static: true,
            is_virtual: false,
            is_override: false,
            attributes: self.lower_attributes(&attributes),
            location: location.clone(),
            code: None,
            native: None,
        });
        let set = self.library.function_names.entry(name.clone()).or_default();
        for existing in set.iter() {
            if self.module.function(*existing).signature.structural_key() == signature_key {
                self.errors.raise(
                    location.clone(),
                    DiagnosticCode::DuplicateMemberName,
                    format!("function '{name}' is already declared with this signature"),
                );
            }
        }
        set.push(id);
        self.library.functions.push(id);
        if let NodeKind::Function { resolved_function, .. } = &mut self.tree.get_mut(node).kind {
            *resolved_function = Some(id);
        }
        self.bodies.insert(
            id,
            FunctionBody::Scope {
                body,
                parameters: parameters.clone(),
            },
        );
        self.pending_bodies.push(BodyJob {
            owner: None,
            class_node: None,
            function: id,
            body,
            parameters,
        });
    }

    /// Wraps loose top-level statements into a synthesized entry function.
    fn declare_entry_function(&mut self, statements: &[NodeId]) -> FunctionId {
        let location = statements
            .first()
            .map_or_else(CodeLocation::default, |&s| self.tree.location(s));
        let body = self.tree.add(
            NodeKind::Scope {
                statements: statements.to_vec(),
            },
            location.clone(),
        );
        self.tree.fixup_parents(body);
        let signature = DelegateSig {
            params: Vec::new(),
            return_type: self.module.core.void,
        };
        let delegate_type = self.module.intern_delegate(signature.clone());
        let id = self.module.add_function(Function {
            name: "[entry]".to_owned(),
            owner: None,
            signature,
            delegate_type,
            kind: FunctionKind::Normal,
            is_static: true,
            is_virtual: false,
            is_override: false,
            attributes: Vec::new(),
            location,
            code: None,
            native: None,
        });
        self.library.functions.push(id);
        self.bodies.insert(
            id,
            FunctionBody::Scope {
                body,
                parameters: Vec::new(),
            },
        );
        self.pending_bodies.push(BodyJob {
            owner: None,
            class_node: None,
            function: id,
            body,
            parameters: Vec::new(),
        });
        id
    }

    // --- types and templates ---

    /// Resolves a written type to an id, instantiating templates on demand.
    pub(crate) fn resolve_type_name(&mut self, written: &TypeName, aliases: &[(String, TypeId)]) -> TypeId {
        if written.template_args.is_empty() {
            if let Some((_, id)) = aliases.iter().find(|(name, _)| *name == written.name) {
                return *id;
            }
            if let Some(&id) = self.library.type_names.get(&written.name) {
                return id;
            }
            if let Some(id) = self.module.find_type(&written.name) {
                return id;
            }
            if self.templates.contains_key(&written.name) {
                self.errors.raise(
                    written.location.clone(),
                    DiagnosticCode::TemplateArityMismatch,
                    format!("template '{}' requires arguments", written.name),
                );
                return self.module.core.error;
            }
            self.errors.raise(
                written.location.clone(),
                DiagnosticCode::TypeNotFound,
                format!("type '{}' could not be found", written.name),
            );
            return self.module.core.error;
        }

        // Arguments resolve first so the dedup key is built from final ids;
        // a nested fresh instantiation still collapses to one type.
        let args: Vec<TemplateArg> = written
            .template_args
            .iter()
            .map(|arg| match arg {
                TypeNameArg::Type(written_arg) => TemplateArg::Type(self.resolve_type_name(written_arg, aliases)),
                TypeNameArg::Integer(value) => TemplateArg::Constant(Constant::Integer(*value)),
            })
            .collect();
        self.instantiate_template(&written.name, &args, &written.location)
    }

    /// Produces (or reuses) the instantiation of a template for the given
    /// arguments: user templates by cloning their definition, intrinsic
    /// templates through the module's registered factories.
    pub(crate) fn instantiate_template(&mut self, base: &str, args: &[TemplateArg], location: &CodeLocation) -> TypeId {
        if args
            .iter()
            .any(|arg| matches!(arg, TemplateArg::Type(id) if self.module.is_error_type(*id)))
        {
            return self.module.core.error;
        }
        let key = (
            base.to_owned(),
            args.iter().map(TemplateArg::structural_key).collect::<Vec<TemplateArgKey>>(),
        );
        if let Some(&existing) = self.module.template_cache.get(&key) {
            return existing;
        }

        let instantiated_name = self.instantiated_name(base, args);
        let Some(&template_node) = self.templates.get(base) else {
            // Intrinsic templates (fixed arrays, images) come from factories.
            if let Some(factory) = self.module.template_factories.get(base).copied() {
                if let Some(type_id) = factory(self.module, args, &instantiated_name) {
                    self.module.template_cache.insert(key, type_id);
                    self.library.type_names.insert(instantiated_name, type_id);
                    self.library.types.push(type_id);
                    return type_id;
                }
                self.errors.raise(
                    location.clone(),
                    DiagnosticCode::TemplateArityMismatch,
                    format!("template '{base}' rejected these arguments"),
                );
                return self.module.core.error;
            }
            self.errors.raise(
                location.clone(),
                DiagnosticCode::TemplateNotFound,
                format!("template '{base}' could not be found"),
            );
            return self.module.core.error;
        };
        let params = match self.tree.kind(template_node) {
            NodeKind::Class { template_params, .. } => template_params.clone(),
            _ => return self.module.core.error,
        };
        if params.len() != args.len() {
            self.errors.raise(
                location.clone(),
                DiagnosticCode::TemplateArityMismatch,
                format!(
                    "template '{base}' takes {} argument(s), {} given",
                    params.len(),
                    args.len()
                ),
            );
            return self.module.core.error;
        }
        // User templates substitute parameters into type positions, so every
        // argument must itself be a type.
        let mut type_args = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                TemplateArg::Type(id) => type_args.push(*id),
                TemplateArg::Constant(_) => {
                    self.errors.raise(
                        location.clone(),
                        DiagnosticCode::TemplateArityMismatch,
                        format!("template '{base}' takes type arguments only"),
                    );
                    return self.module.core.error;
                }
            }
        }

        // Clone the definition, rename it, and treat the copy as an ordinary
        // class whose parameter names alias the argument types.
        let clone = self.tree.clone_subtree(template_node);
        if let NodeKind::Class {
            name, template_params, ..
        } = &mut self.tree.get_mut(clone).kind
        {
            *name = instantiated_name;
            template_params.clear();
        }
        let aliases: Vec<(String, TypeId)> = params.into_iter().zip(type_args.iter().copied()).collect();
        self.aliases_by_class.insert(clone, aliases);

        let type_id = self.declare_class_shell(clone);
        if let Some(bound) = self.module.types.bound_mut(type_id) {
            bound.template_base = Some(base.to_owned());
            bound.template_args = args.to_vec();
        }
        // Cache before members so self-referential templates terminate.
        self.module.template_cache.insert(key, type_id);
        self.collect_class_members(clone);
        type_id
    }

    /// `Base[Arg, 3]`-style display name for an instantiation.
    fn instantiated_name(&self, base: &str, args: &[TemplateArg]) -> String {
        let rendered: Vec<String> = args
            .iter()
            .map(|arg| match arg {
                TemplateArg::Type(id) => self.module.types.name_of(*id).to_owned(),
                TemplateArg::Constant(constant) => constant.to_string(),
            })
            .collect();
        format!("{base}[{}]", rendered.join(", "))
    }

    /// Lowers a parsed constant (shared by attributes and literal typing).
    pub(crate) fn constant_type(&self, constant: &Constant) -> TypeId {
        match constant {
            Constant::Null => self.module.core.null,
            Constant::Boolean(_) => self.module.core.boolean(),
            Constant::Integer(_) => self.module.core.integer(),
            Constant::Real(_) => self.module.core.real(),
            Constant::Str(_) => self.module.core.string(),
            Constant::Type(_) => self.module.core.type_ref,
        }
    }

    // --- bodies ---

    fn check_body(&mut self, job: &BodyJob) {
        let function = self.module.function(job.function);
        let return_type = function.signature.return_type;
        let is_static = function.is_static;
        let kind = function.kind;
        self.context = FunctionContext {
            owner: job.owner,
            return_type,
            is_static,
            aliases: job
                .class_node
                .and_then(|class| self.aliases_by_class.get(&class).cloned())
                .unwrap_or_default(),
        };
        self.scopes.clear();
        self.scopes.push(LocalScope {
            declarations: AHashMap::new(),
            kind: ScopeKind::Function,
        });
        for &parameter in &job.parameters {
            let name = match self.tree.kind(parameter) {
                NodeKind::Parameter { name, .. } => name.clone(),
                _ => continue,
            };
            self.declare_local(&name, parameter);
        }

        let initializer_field = match self.bodies.get(&job.function) {
            Some(FunctionBody::FieldInitializer { field, .. }) => Some(*field),
            Some(FunctionBody::PreConstructor { .. }) | None => {
                self.scopes.pop();
                return;
            }
            Some(FunctionBody::Scope { .. }) => None,
        };

        match initializer_field {
            Some(field) => {
                let field_type = self.module.field(field).value_type;
                let member_node = self.tree.get(job.body).parent;
                let coerced = self.check_and_coerce(job.body, field_type);
                // Reparent the (possibly cast-wrapped) initializer on its
                // member node so code generation sees the final child.
                if let Some(member) = member_node
                    && let NodeKind::MemberVariable { initializer, .. } = &mut self.tree.get_mut(member).kind
                {
                    *initializer = Some(coerced);
                }
                if let Some(FunctionBody::FieldInitializer { initializer, .. }) = self.bodies.get_mut(&job.function) {
                    *initializer = coerced;
                }
            }
            None => {
                let all_return = self.check_scope_node(job.body, ScopeKind::Function);
                let returns_value = return_type != self.module.core.void && !self.module.is_error_type(return_type);
                if returns_value && !all_return && kind == FunctionKind::Normal {
                    let location = self.tree.location(job.body);
                    self.errors.raise(
                        location,
                        DiagnosticCode::NotAllPathsReturn,
                        "not all code paths return a value",
                    );
                }
            }
        }
        self.scopes.pop();
    }

    pub(crate) fn declare_local(&mut self, name: &str, declaration: NodeId) {
        let already = self
            .scopes
            .last()
            .is_some_and(|scope| scope.declarations.contains_key(name));
        if already {
            let location = self.tree.location(declaration);
            self.errors.raise(
                location,
                DiagnosticCode::DuplicateMemberName,
                format!("'{name}' is already declared in this scope"),
            );
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.declarations.insert(name.to_owned(), declaration);
        }
    }

    /// Finds a local declaration by name, innermost scope first.
    pub(crate) fn find_local(&self, name: &str) -> Option<NodeId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.declarations.get(name).copied())
    }

    /// Whether any enclosing scope is a loop (for break/continue).
    pub(crate) fn inside_loop(&self) -> bool {
        self.scopes.iter().rev().any(|scope| scope.kind == ScopeKind::Loop)
    }
}
