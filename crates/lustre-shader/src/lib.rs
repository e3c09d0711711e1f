//! Shader compilation for the Lustre language: lowers analyzed fragment
//! code to SPIR-V IR and composes fragments into per-stage shader modules.
//!
//! The pipeline shares the language front end and analyzer with the core
//! crate, branching at the analyzer boundary: instead of bytecode, fragment
//! bodies lower through resolver registries into an IR module with cycle
//! detection, stage-requirement propagation, and dependency-ordered
//! emission. The final GLSL/binary backend is an external translation pass
//! invoked on the emitted IR.

pub mod compositor;
pub mod cycle_detection;
pub mod dependency;
pub mod errors;
pub mod function_resolvers;
pub mod intrinsics;
pub mod ir;
pub mod spirv;
pub mod stage_requirements;
pub mod translator;
pub mod type_resolvers;

use lustre::{
    CodeEntry, ErrorEvent, Module,
    analyzer::{AnalysisOutput, analyze},
    diagnostics::CompilationErrors,
    front::{ast::SyntaxTree, parser::parse_entries},
};

pub use crate::{
    compositor::{CompositeDefinition, Compositor, InterfaceBinding, ShaderTranslationPassResult},
    errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError},
    ir::{ShaderIrLibrary, ShaderStage},
    translator::ShaderIrCompiler,
};

/// A fragment compilation: the analyzed artifacts the IR compiler consumes.
#[derive(Debug)]
pub struct FragmentLibrary {
    pub tree: SyntaxTree,
    pub analysis: AnalysisOutput,
}

/// Parses and analyzes fragment sources against a module that already has
/// the shader intrinsics registered.
pub fn compile_fragments(
    module: &mut Module,
    entries: &[CodeEntry],
    library_name: &str,
) -> Result<FragmentLibrary, Vec<ErrorEvent>> {
    let mut errors = CompilationErrors::new();
    let mut tree = parse_entries(entries, &mut errors);
    if errors.was_error {
        return Err(errors.into_events());
    }
    let analysis = analyze(module, &mut tree, library_name, entries.to_vec(), &mut errors);
    if errors.was_error {
        return Err(errors.into_events());
    }
    Ok(FragmentLibrary { tree, analysis })
}

/// The compilation pipeline descriptor: which backend runs after the IR is
/// built, plus its tool and debug passes. The backend itself is a plug-in;
/// this crate stops at the dependency-ordered IR.
#[derive(Debug, Clone, Default)]
pub struct CompilePipeline {
    pub backend: String,
    pub tool_passes: Vec<String>,
    pub debug_passes: Vec<String>,
}
