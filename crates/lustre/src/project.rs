//! The compilation entry point: an ordered set of code entries in, a library
//! (or diagnostics) out.

use crate::{
    analyzer::analyze,
    codegen::generate,
    diagnostics::{CompilationErrors, ErrorEvent},
    front::parser::parse_entries,
    ids::{FunctionId, LibraryId},
    library::Module,
    location::CodeEntry,
};

/// A compiled library handle: its id in the module plus the synthesized
/// entry function for loose top-level statements.
#[derive(Debug, Clone, Copy)]
pub struct CompiledLibrary {
    pub library: LibraryId,
    pub entry_function: Option<FunctionId>,
}

/// An ordered set of code entries to compile together into one library.
#[derive(Debug, Default)]
pub struct Project {
    entries: Vec<CodeEntry>,
    /// Keep producing diagnostics after the first error (language-service
    /// contexts).
    pub tolerant_mode: bool,
}

impl Project {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a code string with its origin label.
    pub fn add_code(&mut self, code: impl Into<String>, origin: impl Into<String>) -> &mut Self {
        self.entries.push(CodeEntry::new(code.into(), origin.into()));
        self
    }

    pub fn add_entry(&mut self, entry: CodeEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Tokenizes, parses, analyzes, and generates bytecode for the entries,
    /// adding the finished library to `module`.
    ///
    /// All diagnostics are returned together on failure; in tolerant mode
    /// every phase keeps going as far as it can to maximize what is
    /// reported.
    pub fn compile(&self, module: &mut Module, library_name: &str) -> Result<CompiledLibrary, Vec<ErrorEvent>> {
        let mut errors = CompilationErrors {
            tolerant_mode: self.tolerant_mode,
            ..CompilationErrors::new()
        };
        let mut tree = parse_entries(&self.entries, &mut errors);
        if errors.was_error && !self.tolerant_mode {
            return Err(errors.into_events());
        }
        let output = analyze(module, &mut tree, library_name, self.entries.clone(), &mut errors);
        if errors.was_error {
            return Err(errors.into_events());
        }
        generate(module, &tree, &output);
        Ok(CompiledLibrary {
            library: output.library,
            entry_function: output.entry_function,
        })
    }
}
