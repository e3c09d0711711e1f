//! Recursion detection over the fragment call graph.
//!
//! SPIR-V forbids recursion, so a DFS walks (type initializers →
//! constructors → function bodies → called members), marking nodes as being
//! determined while they sit on the stack; reaching one again is a recursion
//! error. A single error is emitted per compilation, reporting the first
//! offending call chain.

use ahash::AHashSet;

use lustre::{
    FunctionId, Module,
    analyzer::{AnalysisOutput, FunctionBody},
    front::ast::{NodeKind, SyntaxTree},
    ids::NodeId,
    location::CodeLocation,
};

use crate::errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError};

/// The stable message hosts and tests match on.
pub const RECURSION_MESSAGE: &str = "Recursion is illegal in shaders";

/// Runs recursion detection over every symbol the analysis produced.
/// Returns true when an error was found.
pub fn run(
    module: &Module,
    tree: &SyntaxTree,
    analysis: &AnalysisOutput,
    errors: &mut ShaderCompilationErrors,
) -> bool {
    let mut detection = CycleDetection {
        module,
        tree,
        analysis,
        errors,
        on_stack: AHashSet::new(),
        completed: AHashSet::new(),
        chain: Vec::new(),
    };
    let roots: Vec<FunctionId> = analysis.bodies.keys().copied().collect();
    let mut roots = roots;
    // Stable traversal order keeps "the first offending chain" deterministic.
    roots.sort_unstable();
    for function in roots {
        detection.visit(function, None);
        if detection.errors.error_triggered {
            break;
        }
    }
    errors.error_triggered
}

struct CycleDetection<'a> {
    module: &'a Module,
    tree: &'a SyntaxTree,
    analysis: &'a AnalysisOutput,
    errors: &'a mut ShaderCompilationErrors,
    /// Functions currently being determined (the DFS stack).
    on_stack: AHashSet<FunctionId>,
    /// Fully explored sub-graphs, known cycle-free.
    completed: AHashSet<FunctionId>,
    /// Call-site locations for the active chain, outermost first.
    chain: Vec<CodeLocation>,
}

impl CycleDetection<'_> {
    fn visit(&mut self, function: FunctionId, call_site: Option<CodeLocation>) {
        if self.errors.error_triggered {
            return;
        }
        let pushed = call_site.is_some();
        if let Some(location) = call_site {
            self.chain.push(location);
        }
        // Seeing an on-stack node again is the cycle; a completed node means
        // this entire sub-tree was already explored without one.
        if self.on_stack.contains(&function) {
            self.report(function);
            return;
        }
        if self.completed.contains(&function) {
            if pushed {
                self.chain.pop();
            }
            return;
        }

        self.on_stack.insert(function);
        let body = self.analysis.bodies.get(&function).and_then(|body| match body {
            FunctionBody::Scope { body, .. } => Some(*body),
            FunctionBody::FieldInitializer { initializer, .. } => Some(*initializer),
            FunctionBody::PreConstructor { .. } => None,
        });
        if let Some(body) = body {
            for (callee, location) in collect_calls(self.tree, body) {
                self.visit(callee, Some(location));
                if self.errors.error_triggered {
                    // Leave the chain intact: it is the report.
                    return;
                }
            }
        }
        self.on_stack.remove(&function);
        self.completed.insert(function);
        if pushed {
            self.chain.pop();
        }
    }

    fn report(&mut self, function: FunctionId) {
        let declared = self.module.function(function);
        self.errors.raise(ValidationError {
            kind: ShaderErrorKind::Recursion,
            short_message: RECURSION_MESSAGE.to_owned(),
            full_message: format!("the function '{}' is part of a recursive call chain", declared.name),
            location: self.chain.first().cloned().unwrap_or_else(|| declared.location.clone()),
            call_stack: self.chain.clone(),
        });
    }
}

/// Every resolved call (function calls and constructions) under `body`.
pub(crate) fn collect_calls(tree: &SyntaxTree, body: NodeId) -> Vec<(FunctionId, CodeLocation)> {
    let mut calls = Vec::new();
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        match tree.kind(node) {
            NodeKind::FunctionCall {
                resolved_function: Some(function),
                ..
            } => calls.push((*function, tree.location(node))),
            NodeKind::New {
                resolved_constructor: Some(constructor),
                ..
            }
            | NodeKind::LocalNew {
                resolved_constructor: Some(constructor),
                ..
            } => calls.push((*constructor, tree.location(node))),
            _ => {}
        }
        for child in tree.children(node) {
            stack.push(child);
        }
    }
    // The traversal stack reverses order; restore source order for stable
    // first-chain reporting.
    calls.reverse();
    calls
}
