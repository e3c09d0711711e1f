//! Compiled functions: signatures, opcode buffers, constant pools, and the
//! frame layout contract between the compiler and the VM.

use strum::IntoStaticStr;

use crate::{
    ids::TypeId,
    location::CodeLocation,
    members::Attribute,
    opcode::Instruction,
    types::DelegateSig,
    value::Value,
};

/// A native implementation bound in place of (or alongside) bytecode.
///
/// Natives read their parameters from the frame through the [`Call`]
/// (crate::vm::Call) wrapper, write the return slot, and report exceptions by
/// returning the error the VM threads through the interpreter loop.
pub type NativeFn = fn(&mut crate::vm::Call<'_>) -> crate::vm::ExecResult<()>;

/// What role a function plays on its owning type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoStaticStr)]
pub enum FunctionKind {
    #[default]
    Normal,
    Constructor,
    /// The generated function that zero-initializes instance fields and runs
    /// their initializers before the user constructor.
    PreConstructor,
    Destructor,
    PropertyGet,
    PropertySet,
    /// The generated initializer for one field, called from the
    /// pre-constructor (instance) or on first access (static).
    FieldInitializer,
    /// The replacement bound to functions removed by a library patch;
    /// returns the default-zero value of its return type.
    PatchDummy,
}

/// Maps an instruction index back to the source location that produced it.
///
/// Entries are sorted by `op_index`; lookup takes the last entry at or before
/// the program counter.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEntry {
    pub op_index: u32,
    pub location: CodeLocation,
}

/// The executable body of a function: a typed block of instructions plus its
/// read-only constant pool.
#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub ops: Vec<Instruction>,
    pub constants: Vec<Value>,
    /// Total frame size in slots: return slot, parameters, `this`, locals,
    /// and temporaries.
    pub required_stack: u32,
    /// Per-instruction debug ranges, sorted by instruction index.
    pub debug_ranges: Vec<DebugEntry>,
}

impl CodeBlock {
    /// The source location active at `pc`, if any was recorded.
    #[must_use]
    pub fn location_at(&self, pc: usize) -> Option<&CodeLocation> {
        let pc = u32::try_from(pc).ok()?;
        match self.debug_ranges.binary_search_by_key(&pc, |entry| entry.op_index) {
            Ok(index) => Some(&self.debug_ranges[index].location),
            Err(0) => None,
            Err(index) => Some(&self.debug_ranges[index - 1].location),
        }
    }
}

/// A function in the module arena.
///
/// The call frame is laid out contiguously at the frame base:
/// `[return slot][parameter 0]…[parameter N][this if instance][locals…]`.
/// The layout helpers below are the single source of truth for those offsets.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// The declaring type for member functions.
    pub owner: Option<TypeId>,
    pub signature: DelegateSig,
    /// The interned delegate type matching `signature`.
    pub delegate_type: TypeId,
    pub kind: FunctionKind,
    pub is_static: bool,
    /// May be overridden by derived types.
    pub is_virtual: bool,
    /// Overrides a parent function of the same signature.
    pub is_override: bool,
    pub attributes: Vec<Attribute>,
    pub location: CodeLocation,
    /// Compiled bytecode, absent for natives and not-yet-compiled functions.
    pub code: Option<CodeBlock>,
    /// Native thunk, run instead of bytecode when present.
    pub native: Option<NativeFn>,
}

impl Function {
    /// The return value's slot, always present (void functions simply never
    /// write it).
    pub const RETURN_SLOT: u32 = 0;

    /// The slot of parameter `index`.
    #[must_use]
    pub fn parameter_slot(&self, index: usize) -> u32 {
        1 + u32::try_from(index).expect("parameter index exceeds u32")
    }

    /// The slot holding `this`, for instance functions.
    #[must_use]
    pub fn this_slot(&self) -> Option<u32> {
        if self.is_static {
            None
        } else {
            Some(1 + u32::try_from(self.signature.params.len()).expect("parameter count exceeds u32"))
        }
    }

    /// The first slot available for locals and temporaries.
    #[must_use]
    pub fn first_local_slot(&self) -> u32 {
        let params = u32::try_from(self.signature.params.len()).expect("parameter count exceeds u32");
        1 + params + u32::from(!self.is_static)
    }

    /// Whether this function returns a value.
    #[must_use]
    pub fn returns_value(&self, void_type: TypeId) -> bool {
        self.signature.return_type != void_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DelegateParam;

    fn sample(is_static: bool, params: usize) -> Function {
        Function {
            name: "F".to_owned(),
            owner: None,
            signature: DelegateSig {
                params: (0..params)
                    .map(|i| DelegateParam {
                        name: Some(format!("p{i}")),
                        ty: TypeId(0),
                    })
                    .collect(),
                return_type: TypeId(0),
            },
            delegate_type: TypeId(0),
            kind: FunctionKind::Normal,
            is_static,
            is_virtual: false,
            is_override: false,
            attributes: Vec::new(),
            location: CodeLocation::default(),
            code: None,
            native: None,
        }
    }

    #[test]
    fn frame_layout_static() {
        let f = sample(true, 2);
        assert_eq!(f.parameter_slot(0), 1);
        assert_eq!(f.parameter_slot(1), 2);
        assert_eq!(f.this_slot(), None);
        assert_eq!(f.first_local_slot(), 3);
    }

    #[test]
    fn frame_layout_instance() {
        let f = sample(false, 1);
        assert_eq!(f.this_slot(), Some(2));
        assert_eq!(f.first_local_slot(), 3);
    }

    #[test]
    fn debug_range_lookup_takes_last_at_or_before() {
        let mut code = CodeBlock::default();
        code.debug_ranges.push(DebugEntry {
            op_index: 0,
            location: CodeLocation::point("t", 1, 1),
        });
        code.debug_ranges.push(DebugEntry {
            op_index: 4,
            location: CodeLocation::point("t", 9, 1),
        });
        assert_eq!(code.location_at(0).unwrap().primary_line, 1);
        assert_eq!(code.location_at(3).unwrap().primary_line, 1);
        assert_eq!(code.location_at(4).unwrap().primary_line, 9);
        assert_eq!(code.location_at(100).unwrap().primary_line, 9);
    }
}
