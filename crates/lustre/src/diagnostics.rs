//! Compile-time diagnostics: error codes, error events, and the collection
//! channel shared by the front end, analyzer, and code generator.
//!
//! Diagnostics are deterministic and carry source locations plus optional
//! associated locations (e.g. the previous declaration for a duplicate-name
//! error). In tolerant mode the analyzer keeps going after the first error by
//! substituting the error type, so IDE language services can surface as many
//! problems as possible in one pass.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::location::{CodeLocation, MessageFormat};

/// Every distinct compile error the pipeline can raise.
///
/// The variant name doubles as the stable machine-readable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // --- front end ---
    UnexpectedCharacter,
    UnterminatedString,
    UnexpectedToken,
    ExpectedIdentifier,
    ExpectedType,

    // --- declarations ---
    DuplicateTypeName,
    DuplicateMemberName,
    MemberShadowsInherited,
    OverrideWithoutMarker,
    BaseTypeNotFound,
    BaseTypeNotAClass,
    CycleOfInheritance,
    TemplateArityMismatch,
    TemplateNotFound,

    // --- expressions ---
    TypeNotFound,
    VariableNotFound,
    MemberNotFound,
    NoImplicitConversion,
    InvalidExplicitCast,
    UnableToResolveOverload,
    AmbiguousOverload,
    ArgumentCountMismatch,
    ReadingFromWriteOnly,
    WritingToReadOnly,
    IndexerNotFound,
    ConditionMustBeBoolean,
    DeleteOnNonHandle,
    ThrowTypeMismatch,
    ThisOutsideInstanceMember,

    // --- control flow ---
    NotAllPathsReturn,
    BreakOutsideLoop,
    ContinueOutsideLoop,
    ReturnValueInVoidFunction,
    ReturnMissingValue,

    // --- any / delegates ---
    ValueTooLargeForAny,
    NotCallable,
}

/// A single compile error, with everything needed to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Stable machine-readable code.
    pub code: DiagnosticCode,
    /// Where the error occurred.
    pub location: CodeLocation,
    /// Other locations that contribute context (prior declarations, the
    /// conflicting overloads, the other end of a cycle).
    pub associated_locations: Vec<CodeLocation>,
    /// Human-readable reason.
    pub reason: String,
    /// Short illustrative snippets of what correct code would look like.
    pub examples: Vec<String>,
}

impl ErrorEvent {
    /// Renders the event as a single report in the chosen format.
    #[must_use]
    pub fn formatted(&self, format: MessageFormat) -> String {
        self.location.formatted_with_message(format, &self.reason)
    }
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formatted(MessageFormat::Language))
    }
}

/// The shared output channel for compile errors.
///
/// All phases raise through this object. `was_error` latches once anything is
/// raised; in tolerant mode the raising phase is expected to substitute error
/// placeholders and continue, otherwise it should unwind as soon as possible.
#[derive(Debug, Default)]
pub struct CompilationErrors {
    /// Every event raised so far, in raise order.
    pub(crate) events: Vec<ErrorEvent>,
    /// Latched to true on the first raise.
    pub was_error: bool,
    /// When set, errors raised after the first are dropped. Only used around
    /// code paths that would otherwise cascade from one root cause.
    pub ignore_multiple_errors: bool,
    /// When set, errors are recorded but phases keep running. Used by IDE
    /// language-service contexts only.
    pub tolerant_mode: bool,
}

impl CompilationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises an error with no associated locations.
    pub fn raise(&mut self, location: CodeLocation, code: DiagnosticCode, reason: impl Into<String>) {
        self.raise_with(location, code, reason, Vec::new(), Vec::new());
    }

    /// Raises an error carrying extra context locations and examples.
    pub fn raise_with(
        &mut self,
        location: CodeLocation,
        code: DiagnosticCode,
        reason: impl Into<String>,
        associated_locations: Vec<CodeLocation>,
        examples: Vec<String>,
    ) {
        if self.was_error && self.ignore_multiple_errors {
            return;
        }
        self.was_error = true;
        self.events.push(ErrorEvent {
            code,
            location,
            associated_locations,
            reason: reason.into(),
            examples,
        });
    }

    /// All events raised so far.
    #[must_use]
    pub fn events(&self) -> &[ErrorEvent] {
        &self.events
    }

    /// Consumes the channel, returning the raised events.
    #[must_use]
    pub fn into_events(self) -> Vec<ErrorEvent> {
        self.events
    }

    /// Number of events raised.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_on_first_raise() {
        let mut errors = CompilationErrors::new();
        assert!(!errors.was_error);
        errors.raise(CodeLocation::point("t", 1, 1), DiagnosticCode::TypeNotFound, "no such type");
        assert!(errors.was_error);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn ignore_multiple_drops_followups() {
        let mut errors = CompilationErrors::new();
        errors.ignore_multiple_errors = true;
        errors.raise(CodeLocation::point("t", 1, 1), DiagnosticCode::TypeNotFound, "first");
        errors.raise(CodeLocation::point("t", 2, 1), DiagnosticCode::TypeNotFound, "second");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn code_renders_as_name() {
        assert_eq!(DiagnosticCode::NoImplicitConversion.to_string(), "NoImplicitConversion");
    }
}
