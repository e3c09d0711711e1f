//! Member descriptors: fields, getter/setter properties, and attributes.
//!
//! These are the runtime-visible descriptions populated by analysis and
//! consulted by the VM (virtual dispatch, static-field initialization) and by
//! reflection.

use crate::{
    ids::{FunctionId, TypeId},
    location::CodeLocation,
    value::Constant,
};

/// A named annotation with optional constant parameters.
///
/// Attributes decorate types and members and are readable at runtime by name;
/// their parameters are immutable constants.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub parameters: Vec<Constant>,
}

impl Attribute {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// The first parameter as a string, the common single-argument shape
    /// (e.g. `[Name("normal")]`).
    #[must_use]
    pub fn string_parameter(&self) -> Option<&str> {
        match self.parameters.first() {
            Some(Constant::Str(text)) => Some(text),
            _ => None,
        }
    }
}

/// Searches an attribute list by name.
#[must_use]
pub fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|attribute| attribute.name == name)
}

/// A field declared on a bound type.
///
/// Instance fields have a fixed slot offset within the enclosing payload
/// (parent layout first); static fields are looked up by [`FieldId`] identity
/// in the executing state's static map and initialized on first access.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    /// The type that declared this field.
    pub owner: TypeId,
    pub value_type: TypeId,
    /// Slot offset within the payload, including the parent prefix.
    /// Meaningless for static fields.
    pub offset: u32,
    pub is_static: bool,
    pub attributes: Vec<Attribute>,
    /// The generated initializer function, run by the pre-constructor for
    /// instance fields and on first access for statics.
    pub initializer: Option<FunctionId>,
    pub location: CodeLocation,
}

/// A getter/setter member declared on a bound type.
///
/// A field is conceptually a property whose accessors are generated; the
/// reflection layer exposes both through the same surface.
#[derive(Debug, Clone)]
pub struct PropertyDesc {
    pub name: String,
    pub owner: TypeId,
    pub value_type: TypeId,
    pub get: Option<FunctionId>,
    pub set: Option<FunctionId>,
    pub is_static: bool,
    pub attributes: Vec<Attribute>,
    pub location: CodeLocation,
}

impl PropertyDesc {
    /// Readable means it has a getter.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.get.is_some()
    }

    /// Writable means it has a setter.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }
}
