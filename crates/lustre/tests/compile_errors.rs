//! Diagnostic behavior: exact error codes, single-error guarantees, and
//! tolerant-mode recovery.

use lustre::{DiagnosticCode, ErrorEvent, Module, Project};
use pretty_assertions::assert_eq;

fn compile_err(source: &str) -> Vec<ErrorEvent> {
    let mut module = Module::new();
    let mut project = Project::new();
    project.add_code(source, "test.lus");
    match project.compile(&mut module, "test") {
        Ok(_) => panic!("expected compilation to fail"),
        Err(events) => events,
    }
}

#[test]
fn incompatible_initializer_reports_exactly_one_conversion_error() {
    let events = compile_err(
        "class Animal { }\
         function Test() { var x : Animal = 5; }",
    );
    assert_eq!(events.len(), 1, "exactly one diagnostic: {events:?}");
    assert_eq!(events[0].code, DiagnosticCode::NoImplicitConversion);
}

#[test]
fn unviable_overloads_are_a_compile_error() {
    let events = compile_err(
        "function F(n : Integer) : Integer { return 1; }\
         function F(r : Real) : Integer { return 2; }\
         function Bad() { F(true); }",
    );
    assert!(
        events
            .iter()
            .any(|event| event.code == DiagnosticCode::UnableToResolveOverload),
        "expected UnableToResolveOverload: {events:?}"
    );
}

#[test]
fn equal_cost_overloads_are_ambiguous() {
    let events = compile_err(
        "function G(a : Real, b : Integer) : Integer { return 1; }\
         function G(a : Integer, b : Real) : Integer { return 2; }\
         function Bad() { G(1, 2); }",
    );
    let ambiguous = events
        .iter()
        .find(|event| event.code == DiagnosticCode::AmbiguousOverload)
        .expect("ambiguity reported");
    assert!(
        !ambiguous.associated_locations.is_empty(),
        "the competing overloads are listed"
    );
}

#[test]
fn duplicate_type_names_are_rejected() {
    let events = compile_err("class A { } class A { }");
    assert!(events.iter().any(|event| event.code == DiagnosticCode::DuplicateTypeName));
}

#[test]
fn shadowing_an_inherited_field_is_rejected() {
    let events = compile_err(
        "class Base { var N : Integer; }\
         class Derived : Base { var N : Integer; }",
    );
    assert!(
        events
            .iter()
            .any(|event| event.code == DiagnosticCode::MemberShadowsInherited)
    );
}

#[test]
fn hiding_without_the_override_marker_is_rejected() {
    let events = compile_err(
        "class Base { virtual function F() { } }\
         class Derived : Base { function F() { } }",
    );
    assert!(
        events
            .iter()
            .any(|event| event.code == DiagnosticCode::OverrideWithoutMarker)
    );
}

#[test]
fn missing_returns_are_detected_per_path() {
    let events = compile_err(
        "function F(b : Boolean) : Integer { if (b) { return 1; } }",
    );
    assert!(events.iter().any(|event| event.code == DiagnosticCode::NotAllPathsReturn));
}

#[test]
fn both_if_branches_returning_satisfies_the_check() {
    let mut module = Module::new();
    let mut project = Project::new();
    project.add_code(
        "function F(b : Boolean) : Integer { if (b) { return 1; } else { return 2; } }",
        "test.lus",
    );
    project.compile(&mut module, "test").expect("all paths return");
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let events = compile_err("function F() { break; }");
    assert!(events.iter().any(|event| event.code == DiagnosticCode::BreakOutsideLoop));
}

#[test]
fn conditions_must_be_boolean() {
    let events = compile_err("function F() { if (1) { } }");
    assert!(
        events
            .iter()
            .any(|event| event.code == DiagnosticCode::ConditionMustBeBoolean)
    );
}

#[test]
fn throwing_a_non_exception_is_rejected() {
    let events = compile_err("function F() { throw 5; }");
    assert!(events.iter().any(|event| event.code == DiagnosticCode::ThrowTypeMismatch));
}

#[test]
fn inheritance_cycles_are_rejected() {
    let events = compile_err("class A : B { } class B : A { }");
    assert!(events.iter().any(|event| event.code == DiagnosticCode::CycleOfInheritance));
}

#[test]
fn tolerant_mode_reports_multiple_independent_errors() {
    let mut module = Module::new();
    let mut project = Project::new();
    project.tolerant_mode = true;
    project.add_code(
        "function A() { missing1(); }\
         function B() { missing2(); }",
        "test.lus",
    );
    let events = project.compile(&mut module, "test").expect_err("both calls fail");
    let unresolved = events
        .iter()
        .filter(|event| event.code == DiagnosticCode::VariableNotFound)
        .count();
    assert_eq!(unresolved, 2, "tolerant mode keeps going: {events:?}");
}

#[test]
fn errors_render_in_every_message_format() {
    let events = compile_err("function F() { missing(); }");
    let event = &events[0];
    let language = event.formatted(lustre::MessageFormat::Language);
    assert!(language.contains("In test.lus at line 1"));
    let msvc = event.formatted(lustre::MessageFormat::Msvc);
    assert!(msvc.starts_with("test.lus(1):"));
    let python = event.formatted(lustre::MessageFormat::Python);
    assert!(python.contains("File \"test.lus\""));
}
