//! Stage-requirement propagation through the fragment call graph.
//!
//! Intrinsics carry direct requirements (derivatives and implicit-LOD
//! sampling are pixel-only); every caller unions the requirements of what it
//! calls. A symbol whose declared fragment stage conflicts with its
//! transitive requirements produces a `ValidationError` carrying the full
//! dependency chain as its call stack.

use ahash::AHashMap;

use lustre::{
    FunctionId, Module, TypeId,
    analyzer::{AnalysisOutput, FunctionBody},
    front::ast::SyntaxTree,
    location::CodeLocation,
    members::find_attribute,
};

use crate::{
    cycle_detection::collect_calls,
    errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError},
    intrinsics::{REQUIRES_PIXEL, REQUIRES_VERTEX},
    ir::ShaderStage,
};

/// A symbol's gathered requirements plus the chain that introduced them.
#[derive(Debug, Clone, Default)]
pub struct StageRequirements {
    pub stages: ShaderStage,
    /// Dependency chain to the requirement source, outermost first.
    pub chain: Vec<CodeLocation>,
}

/// The fragment stage a type declares through its attributes, if any.
#[must_use]
pub fn declared_stage(module: &Module, ty: TypeId) -> Option<ShaderStage> {
    let bound = module.types.bound(ty)?;
    let attributes = &bound.attributes;
    if find_attribute(attributes, "Vertex").is_some() || find_attribute(attributes, "CoreVertex").is_some() {
        return Some(ShaderStage::VERTEX);
    }
    if find_attribute(attributes, "Pixel").is_some() || find_attribute(attributes, "RenderPass").is_some() {
        return Some(ShaderStage::PIXEL);
    }
    if find_attribute(attributes, "Geometry").is_some() {
        return Some(ShaderStage::GEOMETRY);
    }
    if find_attribute(attributes, "Compute").is_some() {
        return Some(ShaderStage::COMPUTE);
    }
    None
}

/// Gathers per-function requirements and checks them against declared
/// fragment stages. Returns the memoized requirement map for downstream
/// consumers.
pub fn run(
    module: &Module,
    tree: &SyntaxTree,
    analysis: &AnalysisOutput,
    errors: &mut ShaderCompilationErrors,
) -> AHashMap<FunctionId, StageRequirements> {
    let mut gatherer = Gatherer {
        module,
        tree,
        analysis,
        memo: AHashMap::new(),
        visiting: ahash::AHashSet::new(),
    };
    let mut functions: Vec<FunctionId> = analysis.bodies.keys().copied().collect();
    functions.sort_unstable();
    for function in &functions {
        gatherer.gather(*function);
    }

    // Mismatch check: every member of a staged fragment must be callable in
    // that stage.
    for function in &functions {
        let Some(owner) = module.function(*function).owner else {
            continue;
        };
        let Some(declared) = declared_stage(module, owner) else {
            continue;
        };
        let requirements = gatherer.memo.get(function).cloned().unwrap_or_default();
        let unmet = requirements.stages.difference(declared);
        if !unmet.is_empty() {
            let declared_function = module.function(*function);
            errors.raise(ValidationError {
                kind: ShaderErrorKind::StageMismatch,
                short_message: format!(
                    "requires {} but runs in {}",
                    requirements.stages.describe(),
                    declared.describe()
                ),
                full_message: format!(
                    "'{}' runs in the {} stage but transitively requires {}",
                    declared_function.name,
                    declared.describe(),
                    requirements.stages.describe()
                ),
                location: declared_function.location.clone(),
                call_stack: requirements.chain.clone(),
            });
        }
    }
    gatherer.memo
}

struct Gatherer<'a> {
    module: &'a Module,
    tree: &'a SyntaxTree,
    analysis: &'a AnalysisOutput,
    memo: AHashMap<FunctionId, StageRequirements>,
    visiting: ahash::AHashSet<FunctionId>,
}

impl Gatherer<'_> {
    /// Requirements are a simple union over the call graph; any mismatch is
    /// reported with the full set, no priority among stages.
    fn gather(&mut self, function: FunctionId) -> StageRequirements {
        if let Some(cached) = self.memo.get(&function) {
            return cached.clone();
        }
        // Recursion is a separate (earlier) error; break the cycle quietly.
        if !self.visiting.insert(function) {
            return StageRequirements::default();
        }

        let declared = self.module.function(function);
        let mut requirements = StageRequirements::default();
        if find_attribute(&declared.attributes, REQUIRES_PIXEL).is_some() {
            requirements.stages |= ShaderStage::PIXEL;
            requirements.chain = vec![declared.location.clone()];
        }
        if find_attribute(&declared.attributes, REQUIRES_VERTEX).is_some() {
            requirements.stages |= ShaderStage::VERTEX;
            requirements.chain = vec![declared.location.clone()];
        }

        let body = self.analysis.bodies.get(&function).and_then(|body| match body {
            FunctionBody::Scope { body, .. } => Some(*body),
            FunctionBody::FieldInitializer { initializer, .. } => Some(*initializer),
            FunctionBody::PreConstructor { .. } => None,
        });
        if let Some(body) = body {
            for (callee, location) in collect_calls(self.tree, body) {
                let callee_requirements = self.gather(callee);
                let added = callee_requirements.stages.difference(requirements.stages);
                if !added.is_empty() {
                    requirements.stages |= callee_requirements.stages;
                    let mut chain = vec![location];
                    chain.extend(callee_requirements.chain);
                    requirements.chain = chain;
                }
            }
        }

        self.visiting.remove(&function);
        self.memo.insert(function, requirements.clone());
        requirements
    }
}
