//! Source locations and the code entries they refer back to.
//!
//! Every syntax node, opcode debug range, diagnostic, and stack frame carries a
//! [`CodeLocation`] so messages can point at the exact line and character the
//! user wrote. Locations can be rendered in several single-line formats so
//! tooling (editors, CI logs) can parse them.

use std::{
    fmt::{self, Write as _},
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a location (plus an attached message) is rendered as text.
///
/// Errors, exceptions, and general code location information all share these
/// formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum MessageFormat {
    /// The standard descriptive format:
    /// `In <origin> at line <line>, character <character> (within function <function>)`
    /// followed by the message on its own indented line.
    #[default]
    Language,
    /// `  File "<origin>", line <line>, in <function>` with the message
    /// indented below, matching Python traceback lines.
    Python,
    /// `<origin>(<line>): <message>` so IDEs can jump straight to the file.
    Msvc,
}

/// One code string handed to the compiler, together with where it came from.
///
/// The origin is usually a file path but can be any label (REPL chunk, editor
/// buffer). `user_data` is round-tripped untouched so hosts can correlate
/// diagnostics with their own bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeEntry {
    /// The full source text.
    pub code: String,
    /// The file or script label this code originated from.
    pub origin: String,
    /// Opaque host data echoed back on every location produced from this entry.
    pub user_data: u64,
}

impl CodeEntry {
    /// Creates an entry from source text and an origin label.
    #[must_use]
    pub fn new(code: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            origin: origin.into(),
            user_data: 0,
        }
    }

    /// A hash identifying this exact code + origin pair.
    ///
    /// If a file changes names this will no longer map to the same entry.
    #[must_use]
    pub fn entry_hash(&self) -> u64 {
        let mut hasher = ahash::AHasher::default();
        self.code.hash(&mut hasher);
        self.origin.hash(&mut hasher);
        hasher.finish()
    }
}

/// A range in a code entry, with a primary point used for display.
///
/// Lines and characters start at 1 (0 means the location was never set). The
/// primary point always lies between start and end: for a binary operator the
/// start/end span both operands while the primary sits on the operator itself.
/// Library, class, and function context is filled in during analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    /// The file/script label this location originated from.
    pub origin: String,
    pub start_line: u32,
    pub primary_line: u32,
    pub end_line: u32,
    /// Character columns relative to the start of the line, starting at 1.
    pub start_character: u32,
    pub primary_character: u32,
    pub end_character: u32,
    /// Optional owning library, filled out by the analyzer.
    pub library: Option<String>,
    /// Optional owning class, filled out by the analyzer.
    pub class: Option<String>,
    /// Optional owning function, filled out by the analyzer.
    pub function: Option<String>,
    /// True for locations inside native bound code, which cannot be stepped.
    pub native: bool,
}

impl CodeLocation {
    /// A point location at `line:character` in `origin`.
    #[must_use]
    pub fn point(origin: impl Into<String>, line: u32, character: u32) -> Self {
        Self {
            origin: origin.into(),
            start_line: line,
            primary_line: line,
            end_line: line,
            start_character: character,
            primary_character: character,
            end_character: character,
            ..Self::default()
        }
    }

    /// Whether this location was ever set to a valid value.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.origin.is_empty() && self.start_line != 0
    }

    /// A location strictly at the start of this one.
    #[must_use]
    pub fn start_only(&self) -> Self {
        let mut loc = self.clone();
        loc.primary_line = loc.start_line;
        loc.end_line = loc.start_line;
        loc.primary_character = loc.start_character;
        loc.end_character = loc.start_character;
        loc
    }

    /// A location strictly at the end of this one.
    #[must_use]
    pub fn end_only(&self) -> Self {
        let mut loc = self.clone();
        loc.start_line = loc.end_line;
        loc.primary_line = loc.end_line;
        loc.start_character = loc.end_character;
        loc.primary_character = loc.end_character;
        loc
    }

    /// Merges two locations into one spanning both, keeping `self`'s primary.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut loc = self.clone();
        if (other.start_line, other.start_character) < (loc.start_line, loc.start_character) {
            loc.start_line = other.start_line;
            loc.start_character = other.start_character;
        }
        if (other.end_line, other.end_character) > (loc.end_line, loc.end_character) {
            loc.end_line = other.end_line;
            loc.end_character = other.end_character;
        }
        loc
    }

    /// Renders just the location (no message, no newlines) in the given format.
    #[must_use]
    pub fn formatted(&self, format: MessageFormat) -> String {
        let mut out = String::new();
        match format {
            MessageFormat::Language => {
                let _ = write!(
                    out,
                    "In {} at line {}, character {}",
                    self.origin, self.primary_line, self.primary_character
                );
                if let Some(function) = &self.function {
                    let _ = write!(out, " (within function {function})");
                }
            }
            MessageFormat::Python => {
                let _ = write!(out, "  File \"{}\", line {}", self.origin, self.primary_line);
                if let Some(function) = &self.function {
                    let _ = write!(out, ", in {function}");
                }
            }
            MessageFormat::Msvc => {
                let _ = write!(out, "{}({})", self.origin, self.primary_line);
            }
        }
        out
    }

    /// Renders the location with a message attached (may include newlines
    /// depending on the format).
    #[must_use]
    pub fn formatted_with_message(&self, format: MessageFormat, message: &str) -> String {
        match format {
            MessageFormat::Language => format!("{}\n  {message}", self.formatted(format)),
            MessageFormat::Python => format!("{}\n    {message}", self.formatted(format)),
            MessageFormat::Msvc => format!("{}: {message}", self.formatted(format)),
        }
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted(MessageFormat::Language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CodeLocation {
        let mut loc = CodeLocation::point("Player.lus", 12, 5);
        loc.function = Some("Speak".to_owned());
        loc
    }

    #[test]
    fn language_format() {
        assert_eq!(
            sample().formatted(MessageFormat::Language),
            "In Player.lus at line 12, character 5 (within function Speak)"
        );
    }

    #[test]
    fn msvc_format_with_message() {
        assert_eq!(
            sample().formatted_with_message(MessageFormat::Msvc, "boom"),
            "Player.lus(12): boom"
        );
    }

    #[test]
    fn union_spans_both() {
        let mut a = CodeLocation::point("a", 3, 1);
        a.end_line = 3;
        a.end_character = 9;
        let b = CodeLocation::point("a", 5, 2);
        let joined = a.union(&b);
        assert_eq!(joined.start_line, 3);
        assert_eq!(joined.end_line, 5);
    }
}
