//! Runtime values: everything that can live in a stack slot, a constant pool,
//! a heap object field, or inside an `any`.
//!
//! The representation is one `Value` per slot. Primitives and fixed-size
//! vectors are stored inline; matrices are boxed to keep the slot small;
//! strings are reference-counted immutable byte sequences carried inline in
//! their handle; objects are referenced through a [`Handle`] that travels with
//! the id of the manager that can dereference it.

use std::{fmt, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::ids::{FunctionId, HandleManagerId, MemberRef, TypeId};

/// A reference-counted immutable string.
///
/// Equality is structural and hashing is by content, which is what the string
/// handle manager exposes through the uniform manager interface.
pub type StringHandle = Rc<str>;

/// The manager-specific payload of a handle.
///
/// Which variant is live is implied by the handle's manager id; the enum keeps
/// the data self-describing and safe to move around.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleData {
    /// The null handle. Every manager dereferences this to nothing.
    Empty,
    /// A heap object: arena slot plus the uid the header held at handle
    /// creation. Dereference succeeds only while the uids still match, so
    /// handles to deleted objects read as null instead of dangling.
    Heap { slot: u32, uid: u64 },
    /// A stack object: the uid of the scope it was constructed in plus the
    /// absolute stack slot where its first field lives. Null once the scope's
    /// uid is retired.
    Stack { scope_uid: u64, slot: u32 },
    /// A raw host object registered for the lifetime of the process.
    Pointer { key: u64 },
    /// An immutable string stored inline.
    Str(StringHandle),
}

/// A tagged reference to an object through one of the handle managers.
#[derive(Debug, Clone, PartialEq)]
pub struct Handle {
    /// Which manager dereferences this handle.
    pub manager: HandleManagerId,
    /// The static type the handle stores; the dynamic type may be more
    /// derived and lives in the heap object's header.
    pub stored_type: TypeId,
    /// Manager-specific payload.
    pub data: HandleData,
}

impl Handle {
    /// The null handle of the given static type.
    #[must_use]
    pub fn null(stored_type: TypeId) -> Self {
        Self {
            manager: HandleManagerId::HEAP,
            stored_type,
            data: HandleData::Empty,
        }
    }

    /// Whether this is the literal null handle (no manager lookup needed).
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self.data, HandleData::Empty)
    }
}

/// A callable value: a bound function plus the `this` it is bound to.
///
/// Static functions leave `this_handle` as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delegate {
    pub function: FunctionId,
    pub this_handle: Option<Handle>,
}

/// The payload of an `any` value: the stored type plus the value itself.
///
/// Values larger than one slot are not permitted inside an `any`; the slot
/// representation makes every storable value exactly one slot, so the check
/// is enforced structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct AnyValue {
    pub stored_type: TypeId,
    pub value: Value,
}

/// One stack slot's worth of data.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// An unset slot. Reading one is a VM bug, never a user-visible state.
    #[default]
    Empty,
    Boolean(bool),
    Byte(u8),
    Integer(i32),
    DoubleInteger(i64),
    Real(f32),
    DoubleReal(f64),
    Real2([f32; 2]),
    Real3([f32; 3]),
    Real4([f32; 4]),
    Integer2([i32; 2]),
    Integer3([i32; 3]),
    Integer4([i32; 4]),
    Boolean2([bool; 2]),
    Boolean3([bool; 3]),
    Boolean4([bool; 4]),
    Quaternion([f32; 4]),
    Real3x3(Box<[f32; 9]>),
    Real4x4(Box<[f32; 16]>),
    Str(StringHandle),
    Handle(Handle),
    Delegate(Delegate),
    Any(Box<AnyValue>),
    /// The result of the `TypeId` opcode: a first-class type reference.
    TypeRef(TypeId),
    /// The result of the `MemberId` opcode: a first-class member reference.
    MemberRef(MemberRef),
}

impl Value {
    /// A new string value.
    #[must_use]
    pub fn string(text: impl AsRef<str>) -> Self {
        Self::Str(Rc::from(text.as_ref()))
    }

    /// True for the null handle and for `Empty`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Handle(handle) => handle.is_null(),
            _ => false,
        }
    }

    /// The boolean interpretation used by `If` opcodes.
    ///
    /// Only `Boolean` values are conditionable; the analyzer guarantees the
    /// operand type, so anything else is a compiler bug.
    #[must_use]
    pub fn as_condition(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// The default textual conversion used by string interpolation for values
    /// whose type has no user conversion.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }

        match self {
            Self::Empty => write!(f, "<empty>"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::DoubleInteger(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::DoubleReal(v) => write!(f, "{v}"),
            Self::Real2(v) => join(f, v),
            Self::Real3(v) => join(f, v),
            Self::Real4(v) | Self::Quaternion(v) => join(f, v),
            Self::Integer2(v) => join(f, v),
            Self::Integer3(v) => join(f, v),
            Self::Integer4(v) => join(f, v),
            Self::Boolean2(v) => join(f, v),
            Self::Boolean3(v) => join(f, v),
            Self::Boolean4(v) => join(f, v),
            Self::Real3x3(v) => join(f, v.as_slice()),
            Self::Real4x4(v) => join(f, v.as_slice()),
            Self::Str(v) => write!(f, "{v}"),
            Self::Handle(handle) if handle.is_null() => write!(f, "null"),
            Self::Handle(_) => write!(f, "<object>"),
            Self::Delegate(_) => write!(f, "<delegate>"),
            Self::Any(any) => write!(f, "{}", any.value),
            Self::TypeRef(_) => write!(f, "<type>"),
            Self::MemberRef(_) => write!(f, "<member>"),
        }
    }
}

/// A compile-time constant: attribute parameters, enum values, and the
/// literal kinds the front end produces.
///
/// Attribute parameters are immutable; reflection hands them out by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    Type(TypeId),
}

impl Constant {
    /// A structural key that is hashable even for real-valued constants.
    ///
    /// Used to deduplicate template instantiations whose arguments include
    /// constants.
    #[must_use]
    pub fn structural_key(&self) -> ConstantKey {
        match self {
            Self::Null => ConstantKey::Null,
            Self::Boolean(v) => ConstantKey::Boolean(*v),
            Self::Integer(v) => ConstantKey::Integer(*v),
            Self::Real(v) => ConstantKey::Real(v.to_bits()),
            Self::Str(v) => ConstantKey::Str(v.clone()),
            Self::Type(v) => ConstantKey::Type(*v),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "\"{v}\""),
            Self::Type(v) => write!(f, "<type {}>", v.0),
        }
    }
}

/// Hashable form of [`Constant`], with reals compared bitwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(u64),
    Str(String),
    Type(TypeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_displays_as_null() {
        let value = Value::Handle(Handle::null(TypeId(0)));
        assert_eq!(value.to_string(), "null");
    }

    #[test]
    fn string_equality_is_structural() {
        let a = Value::string("paws");
        let b = Value::string("paws");
        assert_eq!(a, b);
    }

    #[test]
    fn real_constants_key_bitwise() {
        assert_eq!(
            Constant::Real(1.5).structural_key(),
            Constant::Real(1.5).structural_key()
        );
        assert_ne!(
            Constant::Real(0.0).structural_key(),
            Constant::Real(-0.0).structural_key()
        );
    }
}
