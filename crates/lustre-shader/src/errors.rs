//! Shader compilation errors: validation events with call stacks.

use lustre::location::CodeLocation;
use strum::{Display, IntoStaticStr};

/// The distinct shader validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ShaderErrorKind {
    Recursion,
    StageMismatch,
    MissingTemplateType,
    InvalidInitializerArity,
    UnsupportedConstruct,
    UnresolvedType,
    UnresolvedFunction,
    MissingFragment,
    UnmatchedInput,
}

/// A validation error with the offending dependency chain as its call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub kind: ShaderErrorKind,
    /// A short, stable message (hosts match on this).
    pub short_message: String,
    /// The full explanation.
    pub full_message: String,
    pub location: CodeLocation,
    /// The dependency chain leading to the error, outermost first.
    pub call_stack: Vec<CodeLocation>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}: {}", self.location, self.full_message)?;
        for frame in &self.call_stack {
            writeln!(f, "  from {frame}")?;
        }
        Ok(())
    }
}

/// The shared error channel for one shader compilation.
///
/// Mirrors the compile-time channel in the language core: the first raise
/// latches `error_triggered`, and passes that emit at most one error (cycle
/// detection) check the latch before raising again.
#[derive(Debug, Default)]
pub struct ShaderCompilationErrors {
    events: Vec<ValidationError>,
    pub error_triggered: bool,
}

impl ShaderCompilationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, error: ValidationError) {
        self.error_triggered = true;
        self.events.push(error);
    }

    #[must_use]
    pub fn events(&self) -> &[ValidationError] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<ValidationError> {
        self.events
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
