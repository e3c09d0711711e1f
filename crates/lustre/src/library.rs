//! Libraries and the module that flattens them for execution.
//!
//! A [`Library`] owns a set of types and functions produced by one
//! compilation. Libraries form a DAG via their dependency names; a [`Module`]
//! is the ordered flattening consumed by compilation, linking, and execution,
//! and is also the arena that owns every type, function, field, and property
//! so that ids are meaningful module-wide.

use ahash::AHashMap;

use crate::{
    ids::{FieldId, FunctionId, HandleManagerId, LibraryId, PropertyId, TypeId},
    location::{CodeEntry, CodeLocation},
    members::{FieldDesc, PropertyDesc},
    function::{Function, FunctionKind},
    types::{
        BoundType, DelegateParam, DelegateSig, Primitive, TemplateArgKey, Type, TypeCopyMode, TypeKind, TypeStore,
    },
};

/// One compiled library: a named set of types and functions plus the
/// dependencies it was compiled against.
#[derive(Debug, Default)]
pub struct Library {
    pub name: String,
    /// Names of libraries this one depends on; must already be in the module.
    pub dependencies: Vec<String>,
    /// Name lookup for types declared by this library. Type names are unique
    /// within a library.
    pub type_names: AHashMap<String, TypeId>,
    /// Every type this library declared, in declaration order.
    pub types: Vec<TypeId>,
    /// Every function this library declared.
    pub functions: Vec<FunctionId>,
    /// Overload sets for the library-level (free) functions.
    pub function_names: AHashMap<String, Vec<FunctionId>>,
    /// The synthesized function holding this library's loose top-level
    /// statements, if it had any.
    pub entry_function: Option<FunctionId>,
    /// The code entries this library was compiled from.
    pub code_entries: Vec<CodeEntry>,
}

/// Well-known types every module starts with.
#[derive(Debug, Clone)]
pub struct CoreTypes {
    primitives: AHashMap<Primitive, TypeId>,
    pub void: TypeId,
    pub null: TypeId,
    pub error: TypeId,
    pub any: TypeId,
    /// The base exception class (`Message` field at offset 0).
    pub exception: TypeId,
    /// `Exception`'s `Message` field.
    pub exception_message: FieldId,
    /// The first-class type-reference type produced by `typeid`.
    pub type_ref: TypeId,
    /// The first-class member-reference type produced by `memberid`.
    pub member_ref: TypeId,
}

impl CoreTypes {
    /// The id of a primitive type.
    #[must_use]
    pub fn primitive(&self, primitive: Primitive) -> TypeId {
        self.primitives[&primitive]
    }

    #[must_use]
    pub fn boolean(&self) -> TypeId {
        self.primitive(Primitive::Boolean)
    }

    #[must_use]
    pub fn integer(&self) -> TypeId {
        self.primitive(Primitive::Integer)
    }

    #[must_use]
    pub fn real(&self) -> TypeId {
        self.primitive(Primitive::Real)
    }

    #[must_use]
    pub fn string(&self) -> TypeId {
        self.primitive(Primitive::Str)
    }
}

/// The ordered flattening of libraries plus the arenas they share.
#[derive(Debug)]
pub struct Module {
    pub types: TypeStore,
    pub functions: Vec<Function>,
    pub fields: Vec<FieldDesc>,
    pub properties: Vec<PropertyDesc>,
    pub libraries: Vec<Library>,
    pub core: CoreTypes,
    /// Structural dedup for delegate types: (param types, return) -> id.
    delegate_cache: AHashMap<(Vec<TypeId>, TypeId), TypeId>,
    /// Structural dedup for `ref T` indirections.
    indirection_cache: AHashMap<TypeId, TypeId>,
    /// Structural dedup for template instantiations, keyed on the base name
    /// plus fully resolved argument keys so freshly instantiated nested
    /// templates still collapse to one id.
    pub(crate) template_cache: AHashMap<(String, Vec<TemplateArgKey>), TypeId>,
    /// Intrinsic template factories by base name (fixed arrays, image sets):
    /// invoked when no user template declares the name.
    pub template_factories: AHashMap<String, TemplateFactory>,
}

/// Builds an intrinsic template instantiation; `None` rejects the argument
/// list. The factory adds the type (under the supplied display name) itself.
pub type TemplateFactory = fn(&mut Module, &[crate::types::TemplateArg], &str) -> Option<TypeId>;

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    /// Creates a module containing the core library: primitives, `Void`,
    /// `Null`, `Error`, `Any`, and the `Exception` class.
    #[must_use]
    pub fn new() -> Self {
        let mut types = TypeStore::new();
        let mut fields = Vec::new();
        let core_lib = LibraryId(0);

        let mut primitives = AHashMap::new();
        for primitive in [
            Primitive::Boolean,
            Primitive::Byte,
            Primitive::Integer,
            Primitive::DoubleInteger,
            Primitive::Real,
            Primitive::DoubleReal,
            Primitive::Real2,
            Primitive::Real3,
            Primitive::Real4,
            Primitive::Integer2,
            Primitive::Integer3,
            Primitive::Integer4,
            Primitive::Boolean2,
            Primitive::Boolean3,
            Primitive::Boolean4,
            Primitive::Quaternion,
            Primitive::Real3x3,
            Primitive::Real4x4,
            Primitive::Str,
        ] {
            let name: &'static str = primitive.into();
            let id = types.add(Type {
                name: name.to_owned(),
                library: core_lib,
                kind: TypeKind::Primitive(primitive),
            });
            primitives.insert(primitive, id);
        }

        let void = types.add(Type {
            name: "Void".to_owned(),
            library: core_lib,
            kind: TypeKind::Void,
        });
        let null = types.add(Type {
            name: "Null".to_owned(),
            library: core_lib,
            kind: TypeKind::Null,
        });
        let error = types.add(Type {
            name: "Error".to_owned(),
            library: core_lib,
            kind: TypeKind::Error,
        });
        let any = types.add(Type {
            name: "Any".to_owned(),
            library: core_lib,
            kind: TypeKind::Any,
        });

        // The base exception class: one String field, `Message`, at offset 0.
        let string_id = primitives[&Primitive::Str];
        let exception = types.add(Type {
            name: "Exception".to_owned(),
            library: core_lib,
            kind: TypeKind::Bound(BoundType {
                copy_mode: TypeCopyMode::Reference,
                manager: HandleManagerId::HEAP,
                size_slots: 1,
                ..BoundType::default()
            }),
        });
        let exception_message = FieldId(0);
        fields.push(FieldDesc {
            name: "Message".to_owned(),
            owner: exception,
            value_type: string_id,
            offset: 0,
            is_static: false,
            attributes: Vec::new(),
            initializer: None,
            location: CodeLocation::default(),
        });
        if let Some(bound) = types.bound_mut(exception) {
            bound.fields.insert("Message".to_owned(), exception_message);
        }

        // First-class type and member references, produced by the `typeid`
        // and `memberid` opcodes.
        let type_ref = types.add(Type {
            name: "Type".to_owned(),
            library: core_lib,
            kind: TypeKind::Bound(BoundType {
                copy_mode: TypeCopyMode::Value,
                manager: HandleManagerId::POINTER,
                ..BoundType::default()
            }),
        });
        let member_ref = types.add(Type {
            name: "Member".to_owned(),
            library: core_lib,
            kind: TypeKind::Bound(BoundType {
                copy_mode: TypeCopyMode::Value,
                manager: HandleManagerId::POINTER,
                ..BoundType::default()
            }),
        });

        let mut type_names = AHashMap::new();
        for (id, ty) in types.iter() {
            type_names.insert(ty.name.clone(), id);
        }
        let all_types: Vec<TypeId> = types.iter().map(|(id, _)| id).collect();

        let mut module = Self {
            types,
            functions: Vec::new(),
            fields,
            properties: Vec::new(),
            libraries: vec![Library {
                name: "Core".to_owned(),
                type_names,
                types: all_types,
                ..Library::default()
            }],
            core: CoreTypes {
                primitives,
                void,
                null,
                error,
                any,
                exception,
                exception_message,
                type_ref,
                member_ref,
            },
            delegate_cache: AHashMap::new(),
            indirection_cache: AHashMap::new(),
            template_cache: AHashMap::new(),
            template_factories: AHashMap::new(),
        };
        module.install_exception_constructor();
        module
    }

    /// Registers an intrinsic template factory (no effect if a user template
    /// of the same name is compiled later; user templates win).
    pub fn register_template_factory(&mut self, base: impl Into<String>, factory: TemplateFactory) {
        self.template_factories.insert(base.into(), factory);
    }

    /// Binds `Exception`'s native constructor, `constructor(message : String)`.
    fn install_exception_constructor(&mut self) {
        let signature = self.signature(&[self.core.string()], self.core.void);
        let delegate_type = self.intern_delegate(signature.clone());
        let exception = self.core.exception;
        let id = self.add_function(Function {
            name: "Constructor".to_owned(),
            owner: Some(exception),
            signature,
            delegate_type,
            kind: FunctionKind::Constructor,
            is_static: false,
            is_virtual: false,
            is_override: false,
            attributes: Vec::new(),
            location: CodeLocation::default(),
            code: None,
            native: Some(crate::vm::natives::exception_constructor),
        });
        if let Some(bound) = self.types.bound_mut(exception) {
            bound.constructors.push(id);
        }
        self.libraries[0].functions.push(id);
    }

    /// Finds a type by name, searching the most recently added library first.
    #[must_use]
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        self.libraries
            .iter()
            .rev()
            .find_map(|library| library.type_names.get(name).copied())
    }

    /// The primitive kind of a type, if it is one.
    #[must_use]
    pub fn primitive_of(&self, id: TypeId) -> Option<Primitive> {
        match self.types.get(id).kind {
            TypeKind::Primitive(primitive) => Some(primitive),
            _ => None,
        }
    }

    /// Interns a delegate type, deduplicating structurally.
    pub fn intern_delegate(&mut self, sig: DelegateSig) -> TypeId {
        let key = sig.structural_key();
        if let Some(&existing) = self.delegate_cache.get(&key) {
            return existing;
        }
        let name = self.delegate_display_name(&sig);
        let id = self.types.add(Type {
            name,
            library: LibraryId(0),
            kind: TypeKind::Delegate(sig),
        });
        self.delegate_cache.insert(key, id);
        id
    }

    /// Interns a `ref T` indirection type.
    pub fn intern_indirection(&mut self, inner: TypeId) -> TypeId {
        if let Some(&existing) = self.indirection_cache.get(&inner) {
            return existing;
        }
        let name = format!("ref {}", self.types.name_of(inner));
        let id = self.types.add(Type {
            name,
            library: LibraryId(0),
            kind: TypeKind::Indirection(inner),
        });
        self.indirection_cache.insert(inner, id);
        id
    }

    /// A `delegate (A, B) : R` display name.
    fn delegate_display_name(&self, sig: &DelegateSig) -> String {
        let params: Vec<&str> = sig.params.iter().map(|p| self.types.name_of(p.ty)).collect();
        format!(
            "delegate ({}) : {}",
            params.join(", "),
            self.types.name_of(sig.return_type)
        )
    }

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId::from(self.functions.len());
        self.functions.push(function);
        id
    }

    #[must_use]
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn add_field(&mut self, field: FieldDesc) -> FieldId {
        let id = FieldId::from(self.fields.len());
        self.fields.push(field);
        id
    }

    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldDesc {
        &self.fields[id.index()]
    }

    pub fn add_property(&mut self, property: PropertyDesc) -> PropertyId {
        let id = PropertyId::from(self.properties.len());
        self.properties.push(property);
        id
    }

    #[must_use]
    pub fn property(&self, id: PropertyId) -> &PropertyDesc {
        &self.properties[id.index()]
    }

    /// Registers a finished library as the newest in the flattening and
    /// returns its id.
    pub fn add_library(&mut self, library: Library) -> LibraryId {
        let id = LibraryId::from(self.libraries.len());
        self.libraries.push(library);
        id
    }

    #[must_use]
    pub fn library(&self, id: LibraryId) -> &Library {
        &self.libraries[id.index()]
    }

    /// Builds a `delegate` signature convenience for natives and tests.
    #[must_use]
    pub fn signature(&self, params: &[TypeId], return_type: TypeId) -> DelegateSig {
        DelegateSig {
            params: params
                .iter()
                .map(|&ty| DelegateParam { name: None, ty })
                .collect(),
            return_type,
        }
    }

    /// True when a type is (or contains) the error placeholder.
    #[must_use]
    pub fn is_error_type(&self, id: TypeId) -> bool {
        id == self.core.error
    }

    /// Whether a function kind was generated rather than written by a user.
    #[must_use]
    pub fn is_generated(&self, id: FunctionId) -> bool {
        matches!(
            self.function(id).kind,
            FunctionKind::PreConstructor | FunctionKind::FieldInitializer | FunctionKind::PatchDummy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_module_has_primitives_and_exception() {
        let module = Module::new();
        assert_eq!(module.find_type("Integer"), Some(module.core.integer()));
        assert_eq!(module.find_type("String"), Some(module.core.string()));
        assert_eq!(module.find_type("Exception"), Some(module.core.exception));
        assert!(module.find_type("NoSuchType").is_none());
    }

    #[test]
    fn delegate_interning_dedups_structurally() {
        let mut module = Module::new();
        let sig_a = module.signature(&[module.core.integer()], module.core.real());
        let sig_b = module.signature(&[module.core.integer()], module.core.real());
        let a = module.intern_delegate(sig_a);
        let b = module.intern_delegate(sig_b);
        assert_eq!(a, b);

        let sig_c = module.signature(&[module.core.real()], module.core.real());
        let c = module.intern_delegate(sig_c);
        assert_ne!(a, c);
    }

    #[test]
    fn indirection_interning_dedups() {
        let mut module = Module::new();
        let integer = module.core.integer();
        assert_eq!(module.intern_indirection(integer), module.intern_indirection(integer));
    }

    #[test]
    fn newest_library_shadows_on_lookup() {
        let mut module = Module::new();
        let id = module.types.add(Type {
            name: "Shadow".to_owned(),
            library: LibraryId(1),
            kind: TypeKind::Void,
        });
        let mut library = Library {
            name: "user".to_owned(),
            ..Library::default()
        };
        library.type_names.insert("Shadow".to_owned(), id);
        module.add_library(library);
        assert_eq!(module.find_type("Shadow"), Some(id));
    }
}
