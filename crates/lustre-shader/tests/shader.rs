//! Shader pipeline scenarios: validation errors, declaration-order
//! guarantees, and fragment composition.

use lustre::{CodeEntry, Module};
use lustre_shader::{
    CompositeDefinition, Compositor, ShaderCompilationErrors, ShaderErrorKind, ShaderIrCompiler, ShaderIrLibrary,
    compile_fragments,
    intrinsics::register_shader_intrinsics,
    ir::{GlobalDirection, IrNode, TypeKey},
};
use pretty_assertions::assert_eq;

fn compile_ir(source: &str) -> (Module, ShaderIrLibrary, ShaderCompilationErrors) {
    let mut module = Module::new();
    register_shader_intrinsics(&mut module);
    let entries = vec![CodeEntry::new(source, "fragments.lus")];
    let fragments = match compile_fragments(&mut module, &entries, "fragments") {
        Ok(fragments) => fragments,
        Err(events) => {
            let rendered: Vec<String> = events.iter().map(ToString::to_string).collect();
            panic!("fragment analysis failed:\n{}", rendered.join("\n"));
        }
    };
    let compiler = ShaderIrCompiler::new(&module, &fragments.tree, &fragments.analysis);
    let mut errors = ShaderCompilationErrors::new();
    let library = compiler.compile(&mut errors);
    (module, library, errors)
}

#[test]
fn recursion_produces_exactly_one_error() {
    let (_, _, errors) = compile_ir(
        "[Pixel] class Frag\
         {\
             function A(n : Real) : Real { return this.B(n); }\
             function B(n : Real) : Real { return this.A(n); }\
             function Main() { }\
         }",
    );
    let events = errors.into_events();
    assert_eq!(events.len(), 1, "exactly one recursion error: {events:?}");
    assert_eq!(events[0].kind, ShaderErrorKind::Recursion);
    assert_eq!(events[0].short_message, "Recursion is illegal in shaders");
    assert!(!events[0].call_stack.is_empty(), "the offending chain is reported");
}

#[test]
fn pixel_only_intrinsics_reject_vertex_callers() {
    let (_, _, errors) = compile_ir(
        "[Vertex] class V\
         {\
             var U : Real = 0.0;\
             function Main() { var d : Real = Ddx(this.U); }\
         }",
    );
    let events = errors.into_events();
    let mismatch = events
        .iter()
        .find(|event| event.kind == ShaderErrorKind::StageMismatch)
        .expect("a stage mismatch is reported");
    assert!(mismatch.short_message.contains("Pixel"));
    assert!(
        !mismatch.call_stack.is_empty(),
        "the dependency chain rides along as the call stack"
    );
}

#[test]
fn pixel_fragments_may_use_derivatives() {
    let (_, _, errors) = compile_ir(
        "[Pixel] class P\
         {\
             var U : Real = 0.0;\
             function Main() { var d : Real = Ddx(this.U); }\
         }",
    );
    assert!(errors.is_empty(), "no errors expected: {:?}", errors.events());
}

#[test]
fn lowered_fragments_declare_globals_for_fields() {
    let (_, library, errors) = compile_ir(
        "[Pixel] class P\
         {\
             [Input] var Uv : Real2;\
             [Output] var Color : Real4;\
             function Main() { }\
         }",
    );
    assert!(errors.is_empty(), "no errors expected: {:?}", errors.events());
    let directions: Vec<GlobalDirection> = library.global_bindings.iter().map(|b| b.direction).collect();
    assert!(directions.contains(&GlobalDirection::Input));
    assert!(directions.contains(&GlobalDirection::Output));
}

#[test]
fn fixed_arrays_materialize_element_types_first() {
    let (_, library, errors) = compile_ir(
        "[Pixel] class P\
         {\
             var Weights : FixedArray[Real, 4];\
             function Main() { }\
         }",
    );
    assert!(errors.is_empty(), "no errors expected: {:?}", errors.events());
    let float = library.find_type(&TypeKey::Float { width: 32 }).expect("f32 exists");
    assert!(
        library
            .find_type(&TypeKey::FixedArray { element: float, length: 4 })
            .is_some(),
        "the array type was materialized over the element"
    );
}

/// Property: declarations emit in dependency order — every node lands after
/// everything it references.
#[test]
fn emission_orders_declarations_before_their_users() {
    let (module, mut library, errors) = compile_ir(
        "[Vertex] class V\
         {\
             [Output] var Position : Real4;\
             function Main() { this.Position = this.Position * 2.0; }\
         }\
         [Pixel] class P\
         {\
             [Input] var Position : Real4;\
             [Output] var Color : Real4;\
             function Main() { this.Color = this.Position; }\
         }",
    );
    assert!(errors.is_empty(), "no errors expected: {:?}", errors.events());

    let compositor = Compositor { module: &module };
    let definition = CompositeDefinition {
        name: "Test".to_owned(),
        core_vertex: "V".to_owned(),
        material_fragments: Vec::new(),
        api_perspective_output: "V".to_owned(),
        render_pass: "P".to_owned(),
    };
    let mut compose_errors = ShaderCompilationErrors::new();
    let results = compositor.compose(&mut library, &definition, &mut compose_errors);
    assert!(compose_errors.is_empty(), "composition errors: {:?}", compose_errors.events());
    assert_eq!(results.len(), 2, "one module per active stage");

    // Re-run collection on the first stage entry to inspect ordering.
    for result in &results {
        let bytes = result.result.as_ref().expect("tool pass produced a byte stream");
        assert!(!bytes.is_empty());
    }

    // Ordering check over the library itself: walk every declaration list
    // position and confirm referenced nodes appear earlier.
    let entry = library.functions.len() - 1;
    let emission = lustre_shader::dependency::TypeDependencyCollector::new(&library)
        .collect(lustre_shader::ir::IrFunctionId(entry as u32));
    let mut seen = std::collections::HashSet::new();
    for &declaration in &emission.declarations {
        match library.node(declaration) {
            IrNode::Type(ty) => {
                let referenced: Vec<_> = match &ty.key {
                    TypeKey::Vector { component, .. } => vec![*component],
                    TypeKey::Matrix { column, .. } => vec![*column],
                    TypeKey::Pointer { pointee, .. } => vec![*pointee],
                    TypeKey::FixedArray { element, .. } | TypeKey::RuntimeArray { element } => vec![*element],
                    TypeKey::Function {
                        return_type,
                        parameters,
                    } => {
                        let mut all = vec![*return_type];
                        all.extend(parameters.iter().copied());
                        all
                    }
                    _ => ty.members.clone(),
                };
                for reference in referenced {
                    assert!(seen.contains(&reference), "type emitted before a constituent");
                }
            }
            IrNode::Constant(constant) => {
                assert!(
                    seen.contains(&constant.result_type),
                    "constant emitted before its type"
                );
            }
            IrNode::Global(global) => {
                assert!(
                    seen.contains(&global.pointer_type),
                    "global emitted before its pointer type"
                );
            }
            IrNode::ExtensionImport(_) => {}
        }
        seen.insert(declaration);
    }
}

#[test]
fn composition_routes_outputs_to_inputs_by_name_and_type() {
    let (module, mut library, errors) = compile_ir(
        "[Vertex] class V\
         {\
             [Output][Name(\"worldPos\")] var Position : Real3;\
             function Main() { }\
         }\
         [Vertex] class Lit\
         {\
             [Input][Name(\"worldPos\")] var Pos : Real3;\
             [Output] var Shade : Real;\
             function Main() { this.Shade = Dot(this.Pos, this.Pos); }\
         }\
         [Pixel] class P\
         {\
             [Output] var Color : Real4;\
             function Main() { }\
         }",
    );
    assert!(errors.is_empty(), "no errors expected: {:?}", errors.events());

    let compositor = Compositor { module: &module };
    let definition = CompositeDefinition {
        name: "Routed".to_owned(),
        core_vertex: "V".to_owned(),
        material_fragments: vec!["Lit".to_owned()],
        api_perspective_output: "V".to_owned(),
        render_pass: "P".to_owned(),
    };
    let mut compose_errors = ShaderCompilationErrors::new();
    let results = compositor.compose(&mut library, &definition, &mut compose_errors);
    assert!(compose_errors.is_empty(), "composition errors: {:?}", compose_errors.events());

    let vertex = results
        .iter()
        .find(|result| result.stage == lustre_shader::ShaderStage::VERTEX)
        .expect("a vertex module");
    // The matched input was routed internally, so it is not part of the
    // stage interface; the overridden name is what reflection shows for the
    // producer side.
    assert!(
        !vertex
            .reflection
            .iter()
            .any(|binding| binding.direction == GlobalDirection::Input && binding.name == "worldPos"),
        "routed inputs leave the stage interface: {:?}",
        vertex.reflection
    );
    assert!(
        vertex
            .reflection
            .iter()
            .any(|binding| binding.direction == GlobalDirection::Output && binding.name == "worldPos")
    );
}

#[test]
fn unknown_fragments_fail_composition() {
    let (module, mut library, _) = compile_ir(
        "[Vertex] class V { function Main() { } }",
    );
    let compositor = Compositor { module: &module };
    let definition = CompositeDefinition {
        name: "Broken".to_owned(),
        core_vertex: "Missing".to_owned(),
        material_fragments: Vec::new(),
        api_perspective_output: "V".to_owned(),
        render_pass: "V".to_owned(),
    };
    let mut errors = ShaderCompilationErrors::new();
    let results = compositor.compose(&mut library, &definition, &mut errors);
    assert!(results.is_empty());
    assert!(
        errors
            .events()
            .iter()
            .any(|event| event.kind == ShaderErrorKind::MissingFragment)
    );
}
