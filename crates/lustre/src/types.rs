//! The type model: primitives, bound classes/structs, delegates, and the
//! arena that owns them.
//!
//! Types are interned in a [`TypeStore`] and referred to by [`TypeId`]
//! everywhere else. Structural kinds (delegates, indirections, template
//! instantiations) are deduplicated by the module so id equality is type
//! identity.

use indexmap::IndexMap;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    ids::{FieldId, FunctionId, HandleManagerId, PropertyId, TypeId},
    location::CodeLocation,
    members::Attribute,
    value::{Constant, ConstantKey, Handle, Value},
};

/// The built-in value kinds.
///
/// Vectors and matrices are fixed-size aggregates over their component
/// primitive; `Str` is a primitive whose values are immutable string handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum Primitive {
    Boolean,
    Byte,
    Integer,
    DoubleInteger,
    Real,
    DoubleReal,
    Real2,
    Real3,
    Real4,
    Integer2,
    Integer3,
    Integer4,
    Boolean2,
    Boolean3,
    Boolean4,
    Quaternion,
    Real3x3,
    Real4x4,
    #[strum(serialize = "String")]
    Str,
}

impl Primitive {
    /// The zero-initialized value of this primitive.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            Self::Boolean => Value::Boolean(false),
            Self::Byte => Value::Byte(0),
            Self::Integer => Value::Integer(0),
            Self::DoubleInteger => Value::DoubleInteger(0),
            Self::Real => Value::Real(0.0),
            Self::DoubleReal => Value::DoubleReal(0.0),
            Self::Real2 => Value::Real2([0.0; 2]),
            Self::Real3 => Value::Real3([0.0; 3]),
            Self::Real4 => Value::Real4([0.0; 4]),
            Self::Integer2 => Value::Integer2([0; 2]),
            Self::Integer3 => Value::Integer3([0; 3]),
            Self::Integer4 => Value::Integer4([0; 4]),
            Self::Boolean2 => Value::Boolean2([false; 2]),
            Self::Boolean3 => Value::Boolean3([false; 3]),
            Self::Boolean4 => Value::Boolean4([false; 4]),
            Self::Quaternion => Value::Quaternion([0.0, 0.0, 0.0, 1.0]),
            Self::Real3x3 => Value::Real3x3(Box::new([0.0; 9])),
            Self::Real4x4 => Value::Real4x4(Box::new([0.0; 16])),
            Self::Str => Value::string(""),
        }
    }

    /// Scalar numeric kinds that participate in implicit widening.
    #[must_use]
    pub fn is_scalar_numeric(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Integer | Self::DoubleInteger | Self::Real | Self::DoubleReal
        )
    }

    /// The component primitive and arity for vector kinds.
    #[must_use]
    pub fn vector_shape(self) -> Option<(Self, u32)> {
        match self {
            Self::Real2 => Some((Self::Real, 2)),
            Self::Real3 => Some((Self::Real, 3)),
            Self::Real4 | Self::Quaternion => Some((Self::Real, 4)),
            Self::Integer2 => Some((Self::Integer, 2)),
            Self::Integer3 => Some((Self::Integer, 3)),
            Self::Integer4 => Some((Self::Integer, 4)),
            Self::Boolean2 => Some((Self::Boolean, 2)),
            Self::Boolean3 => Some((Self::Boolean, 3)),
            Self::Boolean4 => Some((Self::Boolean, 4)),
            _ => None,
        }
    }

    /// (rows, columns) for matrix kinds.
    #[must_use]
    pub fn matrix_shape(self) -> Option<(u32, u32)> {
        match self {
            Self::Real3x3 => Some((3, 3)),
            Self::Real4x4 => Some((4, 4)),
            _ => None,
        }
    }
}

/// Whether a bound type copies by value or is shared by handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypeCopyMode {
    /// Structs: assignment copies the whole payload.
    Value,
    /// Classes: assignment copies the handle, the payload is shared.
    #[default]
    Reference,
}

/// An argument in a template instantiation.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateArg {
    Type(TypeId),
    Constant(Constant),
}

impl TemplateArg {
    /// Hashable form, used in instantiation dedup keys.
    #[must_use]
    pub fn structural_key(&self) -> TemplateArgKey {
        match self {
            Self::Type(id) => TemplateArgKey::Type(*id),
            Self::Constant(constant) => TemplateArgKey::Constant(constant.structural_key()),
        }
    }
}

/// Hashable form of [`TemplateArg`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateArgKey {
    Type(TypeId),
    Constant(ConstantKey),
}

/// An event a type declares that it sends, readable via reflection.
#[derive(Debug, Clone, PartialEq)]
pub struct SentEvent {
    pub name: String,
    pub event_type: TypeId,
}

/// Runtime descriptor of a class or struct.
///
/// Member tables hold only members declared on this type; lookups walk the
/// parent chain. A derived type's payload begins with the parent's layout
/// (single inheritance), so field offsets are stable under upcasting.
#[derive(Debug, Clone, Default)]
pub struct BoundType {
    /// Base name of the template this was instantiated from, if any.
    pub template_base: Option<String>,
    /// Ordered template arguments for instantiations.
    pub template_args: Vec<TemplateArg>,
    pub copy_mode: TypeCopyMode,
    /// Parent class for single inheritance.
    pub parent: Option<TypeId>,
    /// Instance fields declared on this type, in declaration (= layout) order.
    pub fields: IndexMap<String, FieldId>,
    /// Static fields declared on this type.
    pub statics: IndexMap<String, FieldId>,
    /// Getter/setter members declared on this type.
    pub properties: IndexMap<String, PropertyId>,
    /// Function overload sets declared on this type.
    pub functions: IndexMap<String, Vec<FunctionId>>,
    pub constructors: Vec<FunctionId>,
    pub destructor: Option<FunctionId>,
    /// The generated function that zero-initializes fields and runs their
    /// initializers before any user constructor.
    pub pre_constructor: Option<FunctionId>,
    pub sent_events: Vec<SentEvent>,
    pub attributes: Vec<Attribute>,
    /// Which manager allocates and dereferences instances of this type.
    pub manager: HandleManagerId,
    /// Total payload size in slots, including the parent prefix.
    pub size_slots: u32,
    /// Ordered virtual dispatch table for native-interop subclassing: every
    /// virtual function in declaration order, parent entries first.
    pub virtual_table: Vec<FunctionId>,
    /// Enum value names for enum types, in declaration order.
    pub enum_values: IndexMap<String, i32>,
    pub is_enum: bool,
    pub location: CodeLocation,
}

/// A parameter of a delegate signature.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateParam {
    pub name: Option<String>,
    pub ty: TypeId,
}

/// A delegate signature: parameter types plus return type.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateSig {
    pub params: Vec<DelegateParam>,
    pub return_type: TypeId,
}

impl DelegateSig {
    /// Structural identity: parameter types and return type, names ignored.
    #[must_use]
    pub fn structural_key(&self) -> (Vec<TypeId>, TypeId) {
        (self.params.iter().map(|p| p.ty).collect(), self.return_type)
    }
}

/// What kind of thing a type is.
#[derive(Debug, Clone)]
pub enum TypeKind {
    Primitive(Primitive),
    /// The absence of a value; only valid as a return type.
    Void,
    /// The type of the `null` literal, convertible to any handle type.
    Null,
    /// The placeholder adopted by failed resolutions so errors don't cascade.
    Error,
    /// The top type: can store any one-slot value plus its type descriptor.
    Any,
    Bound(BoundType),
    Delegate(DelegateSig),
    /// A handle to a value type (`ref T`).
    Indirection(TypeId),
}

/// One entry in the type store.
#[derive(Debug, Clone)]
pub struct Type {
    pub name: String,
    /// The library that declared this type.
    pub library: crate::ids::LibraryId,
    pub kind: TypeKind,
}

/// The arena owning every type in a module.
#[derive(Debug, Default)]
pub struct TypeStore {
    types: Vec<Type>,
}

impl TypeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ty: Type) -> TypeId {
        let id = TypeId::from(self.types.len());
        self.types.push(ty);
        id
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.index()]
    }

    #[must_use]
    pub fn name_of(&self, id: TypeId) -> &str {
        &self.get(id).name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterates `(id, type)` pairs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types.iter().enumerate().map(|(i, ty)| (TypeId::from(i), ty))
    }

    /// The bound descriptor of `id`, if it is a bound type.
    #[must_use]
    pub fn bound(&self, id: TypeId) -> Option<&BoundType> {
        match &self.get(id).kind {
            TypeKind::Bound(bound) => Some(bound),
            _ => None,
        }
    }

    pub fn bound_mut(&mut self, id: TypeId) -> Option<&mut BoundType> {
        match &mut self.get_mut(id).kind {
            TypeKind::Bound(bound) => Some(bound),
            _ => None,
        }
    }

    /// The delegate signature of `id`, if it is a delegate type.
    #[must_use]
    pub fn delegate(&self, id: TypeId) -> Option<&DelegateSig> {
        match &self.get(id).kind {
            TypeKind::Delegate(sig) => Some(sig),
            _ => None,
        }
    }

    /// Whether values of this type are stored and copied as handles.
    #[must_use]
    pub fn is_reference(&self, id: TypeId) -> bool {
        match &self.get(id).kind {
            TypeKind::Bound(bound) => bound.copy_mode == TypeCopyMode::Reference,
            TypeKind::Indirection(_) | TypeKind::Null => true,
            _ => false,
        }
    }

    /// Walks the parent chain: is `derived` the same as or a subclass of
    /// `base`?
    #[must_use]
    pub fn is_subtype_of(&self, derived: TypeId, base: TypeId) -> bool {
        let mut current = derived;
        loop {
            if current == base {
                return true;
            }
            match self.bound(current).and_then(|b| b.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Finds an instance field by name, walking the parent chain.
    #[must_use]
    pub fn find_field(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        self.walk_chain(ty, |bound| bound.fields.get(name).copied())
    }

    /// Finds a static field by name, walking the parent chain.
    #[must_use]
    pub fn find_static_field(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        self.walk_chain(ty, |bound| bound.statics.get(name).copied())
    }

    /// Finds a property by name, walking the parent chain.
    #[must_use]
    pub fn find_property(&self, ty: TypeId, name: &str) -> Option<PropertyId> {
        self.walk_chain(ty, |bound| bound.properties.get(name).copied())
    }

    /// Finds the overload set for a function name, walking the parent chain.
    ///
    /// Only the nearest declaring type's set is returned; overriding is
    /// resolved by signature inside that set.
    #[must_use]
    pub fn find_functions(&self, ty: TypeId, name: &str) -> Option<&[FunctionId]> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let bound = self.bound(id)?;
            if let Some(set) = bound.functions.get(name) {
                return Some(set);
            }
            current = bound.parent;
        }
        None
    }

    /// The zero value for a type: primitives zero, handles null, delegates
    /// and `any` empty.
    #[must_use]
    pub fn default_value(&self, id: TypeId) -> Value {
        match &self.get(id).kind {
            TypeKind::Primitive(primitive) => primitive.default_value(),
            TypeKind::Bound(bound) if bound.copy_mode == TypeCopyMode::Reference => Value::Handle(Handle::null(id)),
            TypeKind::Bound(bound) if bound.is_enum => Value::Integer(0),
            TypeKind::Bound(_) => Value::Handle(Handle::null(id)),
            TypeKind::Delegate(_) => Value::Delegate(crate::value::Delegate {
                function: FunctionId(u32::MAX),
                this_handle: None,
            }),
            TypeKind::Indirection(inner) => Value::Handle(Handle::null(*inner)),
            TypeKind::Any => Value::Any(Box::new(crate::value::AnyValue {
                stored_type: id,
                value: Value::Empty,
            })),
            TypeKind::Void | TypeKind::Null | TypeKind::Error => Value::Empty,
        }
    }

    fn walk_chain<T>(&self, ty: TypeId, mut find: impl FnMut(&BoundType) -> Option<T>) -> Option<T> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let bound = self.bound(id)?;
            if let Some(found) = find(bound) {
                return Some(found);
            }
            current = bound.parent;
        }
        None
    }
}
