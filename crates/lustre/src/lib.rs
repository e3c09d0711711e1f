#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked before casting")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts follow the language's wrap rules")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior is the language's integer semantics")]

pub mod analyzer;
pub mod codegen;
pub mod debugger;
pub mod diagnostics;
pub mod front;
pub mod function;
pub mod handles;
pub mod ids;
pub mod library;
pub mod location;
pub mod members;
pub mod opcode;
pub mod project;
pub mod string_builder;
pub mod tracer;
pub mod types;
pub mod value;
pub mod vm;

pub use crate::{
    diagnostics::{CompilationErrors, DiagnosticCode, ErrorEvent},
    ids::{FieldId, FunctionId, HandleManagerId, LibraryId, MemberRef, NodeId, PropertyId, TypeId},
    library::{CoreTypes, Library, Module},
    location::{CodeEntry, CodeLocation, MessageFormat},
    project::{CompiledLibrary, Project},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{Constant, Delegate, Handle, HandleData, Value},
    vm::{
        Call, ExceptionKind, ExceptionRaise, ExceptionReport, ExecResult, ExecutableState, FatalKind, PatchError,
        StackTrace, StateEvent, VmError,
    },
};
