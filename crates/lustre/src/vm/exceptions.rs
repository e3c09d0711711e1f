//! Runtime exceptions, stack traces, and the error value threaded through
//! the interpreter loop.
//!
//! Throwing constructs a heap exception object, captures the stack trace,
//! and returns an error up the dispatcher, which unwinds frames destroying
//! each scope's registered values in reverse order. A host frame may catch
//! by consuming the report; the default is propagation as an
//! `UnhandledException` event.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{location::CodeLocation, value::Handle};

/// Result alias for everything the interpreter loop can fail with.
pub type ExecResult<T> = Result<T, VmError>;

/// The built-in exception kinds thrown by intrinsics, plus `Custom` for
/// user-thrown exception objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExceptionKind {
    NullReference,
    InvalidCast,
    Timeout,
    StackOverflow,
    DivideByZero,
    NonDeletableObject,
    NotImplemented,
    InvalidStaticInitializer,
    Internal,
    Custom,
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackTraceFrame {
    pub function: String,
    pub location: Option<CodeLocation>,
}

/// The call stack captured when an exception was thrown, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackTrace {
    pub frames: Vec<StackTraceFrame>,
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for frame in &self.frames {
            match &frame.location {
                Some(location) => writeln!(f, "  {} ({location})", frame.function)?,
                None => writeln!(f, "  {} (native)", frame.function)?,
            }
        }
        Ok(())
    }
}

/// A thrown exception: the heap object plus everything the host needs to
/// report it without dereferencing.
#[derive(Debug, Clone)]
pub struct ExceptionRaise {
    /// The heap-allocated exception object (null when allocation was not
    /// possible, e.g. under a fatal condition).
    pub handle: Handle,
    pub kind: ExceptionKind,
    pub message: String,
    pub trace: StackTrace,
    /// Where the throwing opcode was.
    pub location: Option<CodeLocation>,
}

impl std::fmt::Display for ExceptionRaise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Fatal conditions that leave the state unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    /// A stack overflow occurred while already executing on the overflow
    /// reserve.
    NestedStackOverflow,
    /// Allocation failed while constructing an exception.
    ExceptionAllocationFailed,
}

/// The error value threaded through the interpreter loop in place of
/// longjmp-style unwinding.
#[derive(Debug, Clone)]
pub enum VmError {
    /// A catchable exception; scope cleanup runs during propagation.
    Exception(Box<ExceptionRaise>),
    /// The state is unusable from here on.
    Fatal(FatalKind),
}

impl VmError {
    #[must_use]
    pub fn exception(&self) -> Option<&ExceptionRaise> {
        match self {
            Self::Exception(raise) => Some(raise),
            Self::Fatal(_) => None,
        }
    }
}

/// The per-invoke exception report a host inspects after re-entry.
///
/// Native callbacks check this after every `invoke`; clearing it catches the
/// exception, the default is propagation.
#[derive(Debug, Default)]
pub struct ExceptionReport {
    exceptions: Vec<ExceptionRaise>,
}

impl ExceptionReport {
    /// Whether an exception is pending.
    #[must_use]
    pub fn has_thrown(&self) -> bool {
        !self.exceptions.is_empty()
    }

    pub(crate) fn record(&mut self, raise: ExceptionRaise) {
        self.exceptions.push(raise);
    }

    /// The pending exceptions, most recent last.
    #[must_use]
    pub fn exceptions(&self) -> &[ExceptionRaise] {
        &self.exceptions
    }

    /// Consumes the report, catching the exceptions.
    pub fn clear(&mut self) -> Vec<ExceptionRaise> {
        std::mem::take(&mut self.exceptions)
    }
}
