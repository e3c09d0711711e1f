//! Fragment composition: building one module per active pipeline stage from
//! a core-vertex fragment, ordered material fragments, an API-perspective
//! output fragment, and a render-pass fragment.
//!
//! Each stage gets a generated entry function that runs the stage's
//! fragments in order; between fragments, outputs route into matching
//! inputs by `(name, type)` key, honoring `[Name("…")]` overrides.

use lustre::{Module, TypeId};

use crate::{
    dependency::TypeDependencyCollector,
    errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError},
    ir::{
        BasicBlock, GlobalBinding, GlobalDirection, IrFunction, IrFunctionId, IrOp, IrOperand, ShaderIrLibrary,
        ShaderStage, TypeKey,
    },
    spirv::Op,
    stage_requirements::declared_stage,
};

/// A composite shader definition, named by fragment type names.
#[derive(Debug, Clone, Default)]
pub struct CompositeDefinition {
    pub name: String,
    pub core_vertex: String,
    /// Material fragments in application order.
    pub material_fragments: Vec<String>,
    pub api_perspective_output: String,
    pub render_pass: String,
}

/// One interface symbol of a composed stage, for reflection.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceBinding {
    pub name: String,
    pub direction: GlobalDirection,
    pub type_name: String,
}

/// The product of one stage's composition: the tool pass's byte stream (or
/// the backend's error log) plus reflection data.
#[derive(Debug)]
pub struct ShaderTranslationPassResult {
    pub stage: ShaderStage,
    pub result: Result<Vec<u8>, String>,
    pub reflection: Vec<InterfaceBinding>,
}

/// Composes a definition into per-stage results.
pub struct Compositor<'a> {
    pub module: &'a Module,
}

impl Compositor<'_> {
    /// Builds one module per active stage.
    pub fn compose(
        &self,
        library: &mut ShaderIrLibrary,
        definition: &CompositeDefinition,
        errors: &mut ShaderCompilationErrors,
    ) -> Vec<ShaderTranslationPassResult> {
        let mut pipeline: Vec<(TypeId, ShaderStage)> = Vec::new();
        let mut ordered_names = vec![definition.core_vertex.clone()];
        ordered_names.extend(definition.material_fragments.iter().cloned());
        ordered_names.push(definition.api_perspective_output.clone());
        ordered_names.push(definition.render_pass.clone());

        for name in &ordered_names {
            let Some(fragment) = self.module.find_type(name) else {
                errors.raise(ValidationError {
                    kind: ShaderErrorKind::MissingFragment,
                    short_message: format!("fragment '{name}' was not found"),
                    full_message: format!("the composite '{}' references the unknown fragment '{name}'", definition.name),
                    location: Default::default(),
                    call_stack: Vec::new(),
                });
                continue;
            };
            let Some(stage) = declared_stage(self.module, fragment) else {
                errors.raise(ValidationError {
                    kind: ShaderErrorKind::MissingFragment,
                    short_message: format!("'{name}' declares no stage"),
                    full_message: format!("the fragment '{name}' carries no stage attribute"),
                    location: Default::default(),
                    call_stack: Vec::new(),
                });
                continue;
            };
            pipeline.push((fragment, stage));
        }
        if errors.error_triggered {
            return Vec::new();
        }

        let mut results = Vec::new();
        for stage in [ShaderStage::VERTEX, ShaderStage::GEOMETRY, ShaderStage::PIXEL, ShaderStage::COMPUTE] {
            let stage_fragments: Vec<TypeId> = pipeline
                .iter()
                .filter(|(_, fragment_stage)| *fragment_stage == stage)
                .map(|(fragment, _)| *fragment)
                .collect();
            if stage_fragments.is_empty() {
                continue;
            }
            results.push(self.compose_stage(library, definition, stage, &stage_fragments, errors));
        }
        results
    }

    fn compose_stage(
        &self,
        library: &mut ShaderIrLibrary,
        definition: &CompositeDefinition,
        stage: ShaderStage,
        fragments: &[TypeId],
        errors: &mut ShaderCompilationErrors,
    ) -> ShaderTranslationPassResult {
        let void = library.intern_type(TypeKey::Void, "void");
        let entry_type = library.intern_type(
            TypeKey::Function {
                return_type: void,
                parameters: Vec::new(),
            },
            "fn entry",
        );
        let mut entry = IrFunction {
            name: format!("{}[{}]", definition.name, stage.describe()),
            function_type: entry_type,
            return_type: void,
            parameter_locals: Vec::new(),
            parameter_types: Vec::new(),
            blocks: vec![BasicBlock::default()],
            source: None,
            next_local: 0,
        };

        // Route outputs of earlier fragments into inputs of later ones and
        // call each fragment's Main in order.
        let mut satisfied_inputs: Vec<(TypeId, String)> = Vec::new();
        for (index, &fragment) in fragments.iter().enumerate() {
            let inputs: Vec<GlobalBinding> = library
                .global_bindings
                .iter()
                .filter(|binding| binding.fragment == fragment && binding.direction == GlobalDirection::Input)
                .cloned()
                .collect();
            for input in inputs {
                let source = fragments[..index].iter().rev().find_map(|&earlier| {
                    library.global_bindings.iter().find(|binding| {
                        binding.fragment == earlier
                            && binding.direction == GlobalDirection::Output
                            && binding.routing_name == input.routing_name
                            && binding.value_type == input.value_type
                    })
                });
                if let Some(source) = source {
                    let loaded = entry.allocate_local();
                    entry.blocks[0].lines.push(IrOp {
                        op: Op::Load,
                        result_type: Some(source.value_type),
                        result: Some(loaded),
                        operands: vec![IrOperand::Node(source.global)],
                    });
                    entry.blocks[0].lines.push(IrOp {
                        op: Op::Store,
                        result_type: None,
                        result: None,
                        operands: vec![IrOperand::Node(input.global), IrOperand::Local(loaded)],
                    });
                    satisfied_inputs.push((input.fragment, input.routing_name.clone()));
                }
            }

            if let Some(main) = self.fragment_main(library, fragment) {
                entry.blocks[0].lines.push(IrOp {
                    op: Op::FunctionCall,
                    result_type: Some(void),
                    result: None,
                    operands: vec![IrOperand::Function(main)],
                });
            } else {
                let name = self.module.types.name_of(fragment).to_owned();
                errors.raise(ValidationError {
                    kind: ShaderErrorKind::MissingFragment,
                    short_message: format!("'{name}' has no Main"),
                    full_message: format!("the fragment '{name}' declares no Main function to compose"),
                    location: self
                        .module
                        .types
                        .bound(fragment)
                        .map(|bound| bound.location.clone())
                        .unwrap_or_default(),
                    call_stack: Vec::new(),
                });
            }
        }
        entry.blocks[0].lines.push(IrOp {
            op: Op::Return,
            result_type: None,
            result: None,
            operands: Vec::new(),
        });
        let entry_id = library.add_function(entry);

        // Reflection: every interface symbol of the stage; inputs satisfied
        // by routing are internal and drop out.
        let reflection: Vec<InterfaceBinding> = library
            .global_bindings
            .iter()
            .filter(|binding| fragments.contains(&binding.fragment))
            .filter(|binding| {
                !(binding.direction == GlobalDirection::Input
                    && satisfied_inputs.contains(&(binding.fragment, binding.routing_name.clone())))
            })
            .map(|binding| InterfaceBinding {
                name: binding.routing_name.clone(),
                direction: binding.direction,
                type_name: match library.node(binding.value_type) {
                    crate::ir::IrNode::Type(ty) => ty.name.clone(),
                    _ => String::new(),
                },
            })
            .collect();

        let emission = TypeDependencyCollector::new(library).collect(entry_id);
        let byte_stream = emission.disassemble(library).into_bytes();
        ShaderTranslationPassResult {
            stage,
            result: Ok(byte_stream),
            reflection,
        }
    }

    /// The `Main` function a fragment contributes to composition.
    fn fragment_main(&self, library: &ShaderIrLibrary, fragment: TypeId) -> Option<IrFunctionId> {
        let bound = self.module.types.bound(fragment)?;
        let main = bound.functions.get("Main")?.first()?;
        library.function_map.get(main).copied()
    }
}
