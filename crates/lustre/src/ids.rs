//! Index newtypes for the arenas that make up a module.
//!
//! Everything that used to be a pointer in a traditional runtime (types,
//! functions, fields, syntax nodes) is an index into an arena here. Indices
//! are cheap to copy, serialize cleanly, and make identity comparisons
//! explicit: two template instantiations deduplicate to the *same* `TypeId`.

use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            #[must_use]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self(u32::try_from(index).expect("arena index exceeds u32"))
            }
        }
    };
}

arena_id! {
    /// A type in the module's type store.
    TypeId
}
arena_id! {
    /// A function in the module's function arena.
    FunctionId
}
arena_id! {
    /// A field (instance or static) in the module's field arena.
    ///
    /// Static fields use this as their identity in the per-state static map.
    FieldId
}
arena_id! {
    /// A getter/setter pair in the module's property arena.
    PropertyId
}
arena_id! {
    /// A library within a module's ordered flattening.
    LibraryId
}
arena_id! {
    /// A node in a syntax tree arena.
    NodeId
}

/// Identifies which handle manager a handle dereferences through.
///
/// The id travels inside every [`Handle`](crate::value::Handle) so dispatch is
/// a single indexed lookup. The four built-in managers have fixed ids; shared
/// host managers are assigned ids after them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleManagerId(pub u16);

impl HandleManagerId {
    /// Heap objects allocated by the language; reference counted, uid checked.
    pub const HEAP: Self = Self(0);
    /// Objects living in a stack frame; null once their scope exits.
    pub const STACK: Self = Self(1);
    /// Raw host pointers with global lifetime; never deletable.
    pub const POINTER: Self = Self(2);
    /// Immutable reference-counted strings stored inline in the handle.
    pub const STRING: Self = Self(3);
    /// First id available for shared host-registered managers.
    pub const FIRST_SHARED: Self = Self(4);

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A reference to any member kind, used by reflection and the `MemberId`
/// opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRef {
    Field(FieldId),
    Property(PropertyId),
    Function(FunctionId),
}
