//! The three-address opcode model: every executable instruction and how its
//! operands address values.
//!
//! Instructions are a tagged sum with per-variant operand structs, stored in a
//! `Vec<Instruction>` per function so the buffer never moves during
//! execution. The program counter is an instruction index; control-flow
//! opcodes carry relative instruction offsets within the same function.

use strum::IntoStaticStr;

use crate::{
    ids::{FieldId, FunctionId, HandleManagerId, MemberRef, PropertyId, TypeId},
    types::Primitive,
};

/// A frame-relative stack slot index.
pub type LocalIndex = u32;

/// Where an operand's value lives.
///
/// This tells the VM how to read or write a particular expression: a local is
/// written directly on the stack, a field goes through a handle (or another
/// local for stack structs), a static field is looked up by field identity,
/// and a property would require a get/set call (the analyzer rewrites those
/// into calls, so the VM never sees one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoStaticStr)]
pub enum OperandKind {
    /// Never set: reading one is a compiler bug.
    #[default]
    NotSet,
    /// Read-only value in the function's constant pool.
    Constant,
    /// A local stack slot, frame relative.
    Local,
    /// A member reached through the handle (or struct start) in a local slot.
    Field,
    /// A static field looked up in the state's static map.
    StaticField,
    /// A get/set member; present for completeness, rewritten before emission.
    Property,
}

/// The addressing mode and offsets an opcode uses to locate a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Constant pool index, local slot, or the local slot holding the handle
    /// (or struct start) for `Field` operands.
    pub index: LocalIndex,
    /// Slot offset applied after dereferencing, for member access. Also valid
    /// for stack-struct locals, where it simply offsets the slot index.
    pub field_offset: u32,
    /// The field identity for `StaticField` operands.
    pub static_field: Option<FieldId>,
    /// The property for `Property` operands.
    pub property: Option<PropertyId>,
}

impl Operand {
    /// A local slot operand.
    #[must_use]
    pub fn local(index: LocalIndex) -> Self {
        Self {
            kind: OperandKind::Local,
            index,
            ..Self::default()
        }
    }

    /// A constant pool operand.
    #[must_use]
    pub fn constant(index: u32) -> Self {
        Self {
            kind: OperandKind::Constant,
            index,
            ..Self::default()
        }
    }

    /// A field reached through the handle or struct stored at `local`.
    #[must_use]
    pub fn field(local: LocalIndex, offset: u32) -> Self {
        Self {
            kind: OperandKind::Field,
            index: local,
            field_offset: offset,
            ..Self::default()
        }
    }

    /// A static field operand.
    #[must_use]
    pub fn static_field(field: FieldId) -> Self {
        Self {
            kind: OperandKind::StaticField,
            static_field: Some(field),
            ..Self::default()
        }
    }
}

/// How a `Copy` opcode treats its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Overwrite an initialized location, releasing what it held.
    Assignment,
    /// First write into an uninitialized location.
    Initialize,
    /// Write into the next frame's parameter region.
    ToParameter,
    /// Read the next frame's return slot after a call.
    FromReturn,
    /// Write the current frame's return slot before returning.
    ToReturn,
}

/// Binary operators on value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinaryOp {
    /// Whether the result type is `Boolean` regardless of operand type.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal | Self::NotEqual | Self::Less | Self::LessEqual | Self::Greater | Self::GreaterEqual
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum UnaryOp {
    Negate,
    LogicalNot,
    BitwiseNot,
    /// Side-effecting `++`; only valid as an l-value operation.
    Increment,
    /// Side-effecting `--`; only valid as an l-value operation.
    Decrement,
}

/// The conversion a `TypeCast` instruction performs.
///
/// One of these is emitted for every implicit and explicit conversion the
/// analyzer inserts, so the runtime can enforce downcast and `any` safety.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CastOperator {
    /// Numeric or component-wise primitive conversion.
    Primitive { from: Primitive, to: Primitive },
    /// Store a value (with its most-derived type) into an `any`.
    ToAny { related: TypeId },
    /// Extract from an `any`, throwing unless the stored type matches.
    FromAny { related: TypeId },
    /// Reinterpret a base handle as derived, checking the dynamic type first.
    Downcast { to: TypeId },
    /// Reinterpret a derived handle as a base; always safe.
    Upcast { to: TypeId },
    /// The `null` literal adopting a concrete handle type.
    NullToHandle { to: TypeId },
    /// Integer value of an enum.
    EnumToInteger,
}

/// One executable instruction.
///
/// Arithmetic r-value forms write a fresh local; l-value forms mutate their
/// output operand in place (compound assignment). Calls are expressed as
/// parameter copies, then `PrepForFunctionCall` (reads the delegate and
/// resolves virtual dispatch), then `FunctionCall`.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    /// Copy a value from one place to another.
    Copy {
        source: Operand,
        destination: Operand,
        mode: CopyMode,
    },
    /// Pure binary operation; output is always a local.
    BinaryRValue {
        op: BinaryOp,
        left: Operand,
        right: Operand,
        output: LocalIndex,
    },
    /// Side-effecting binary operation (compound assignment) mutating
    /// `output` in place.
    BinaryLValue {
        op: BinaryOp,
        output: Operand,
        right: Operand,
    },
    /// Pure unary operation; output is always a local.
    UnaryRValue {
        op: UnaryOp,
        operand: Operand,
        output: LocalIndex,
    },
    /// Side-effecting unary operation (increment/decrement) in place.
    UnaryLValue { op: UnaryOp, operand: Operand },
    /// Convert one value to another; output is always a local.
    TypeCast {
        operator: CastOperator,
        source: Operand,
        output: LocalIndex,
    },
    /// Conditional relative jump. Jumps when the condition equals `on_true`.
    If {
        condition: Operand,
        jump_offset: i32,
        on_true: bool,
    },
    /// Unconditional relative jump.
    Jump { jump_offset: i32 },
    /// Read the delegate operand, resolve virtual dispatch against the `this`
    /// handle's dynamic type, write `this` into the callee frame, and stage
    /// the call. If the delegate turns out static, the program counter
    /// additionally advances by `jump_offset_if_static` (skipping the `this`
    /// copy emitted for delegate-valued calls of unknown staticness).
    PrepForFunctionCall {
        delegate: Operand,
        jump_offset_if_static: i32,
    },
    /// Invoke the staged call: push the callee frame and execute it.
    FunctionCall,
    /// Pop the current frame, returning to the caller.
    Return,
    /// Allocate a heap object and store its handle in a local. The
    /// pre-constructor and constructor are called by separately emitted
    /// instructions.
    CreateType {
        created_type: TypeId,
        save_handle: LocalIndex,
        reference_counted: bool,
    },
    /// Construct an object in this frame's stack at `stack_local` and store a
    /// stack handle to it in `save_handle`.
    CreateLocalType {
        created_type: TypeId,
        save_handle: LocalIndex,
        stack_local: LocalIndex,
    },
    /// Language `delete`: runs the destructor, frees the payload, and
    /// invalidates every alias.
    DeleteObject { object: Operand },
    /// Throw the exception object referenced by the operand.
    ThrowException { exception: Operand },
    /// Create a handle pointing at the operand's location.
    ToHandle {
        source: Operand,
        save_local: LocalIndex,
        handle_type: TypeId,
    },
    /// Create a delegate with no `this`.
    CreateStaticDelegate {
        function: FunctionId,
        save_local: LocalIndex,
    },
    /// Create a delegate bound to `this`; when `can_be_virtual`, dispatch is
    /// re-resolved against the handle's dynamic type at call prep.
    CreateInstanceDelegate {
        function: FunctionId,
        this_operand: Operand,
        save_local: LocalIndex,
        can_be_virtual: bool,
    },
    /// Push the most-derived type of the evaluated expression (or the
    /// compile-time type for value types).
    TypeId {
        compile_time_type: TypeId,
        expression: Operand,
        save_local: LocalIndex,
    },
    /// Push a first-class member reference.
    MemberId { member: MemberRef, save_local: LocalIndex },
    /// Start a fresh string builder for efficient concatenation.
    BeginStringBuilder,
    /// Convert the operand using the runtime converter for `value_type` and
    /// append it to the topmost builder.
    AddToStringBuilder { value_type: TypeId, value: Operand },
    /// Finish the topmost builder and store the string in a local.
    EndStringBuilder { save_local: LocalIndex },
    /// Enter a lexical scope: values constructed inside are destructed when
    /// it ends.
    BeginScope,
    /// Exit the innermost scope, destroying its registered values in reverse
    /// insertion order.
    EndScope,
    /// Push a timeout budget owned by the current frame.
    BeginTimeout { seconds: u32 },
    /// Pop the innermost timeout.
    EndTimeout,
    /// A breakpoint written over another instruction; the original is kept in
    /// the state's breakpoint map and executed after the debugger resumes.
    Breakpoint,
}

/// Manager id constant re-exported next to the opcode model since `CreateType`
/// implies the heap manager.
pub const HEAP_MANAGER: HandleManagerId = HandleManagerId::HEAP;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_constructors_set_kind() {
        assert_eq!(Operand::local(3).kind, OperandKind::Local);
        assert_eq!(Operand::constant(0).kind, OperandKind::Constant);
        let field = Operand::field(2, 5);
        assert_eq!(field.kind, OperandKind::Field);
        assert_eq!(field.index, 2);
        assert_eq!(field.field_offset, 5);
    }

    #[test]
    fn comparison_ops_report_boolean_result() {
        assert!(BinaryOp::Less.is_comparison());
        assert!(!BinaryOp::Add.is_comparison());
    }
}
