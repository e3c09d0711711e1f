//! End-to-end scenarios: compile source, execute it on a fresh state, and
//! observe results, exceptions, and events through the host surface.

use lustre::{
    CodeEntry, ExceptionKind, ExecutableState, Module, Project, StateEvent, Value,
};
use pretty_assertions::assert_eq;

/// Compiles one source string into a fresh module and state.
fn compile(source: &str) -> (ExecutableState, lustre::CompiledLibrary) {
    let mut module = Module::new();
    let mut project = Project::new();
    project.add_code(source, "test.lus");
    let compiled = match project.compile(&mut module, "test") {
        Ok(compiled) => compiled,
        Err(events) => {
            let rendered: Vec<String> = events.iter().map(ToString::to_string).collect();
            panic!("compilation failed:\n{}", rendered.join("\n"));
        }
    };
    (ExecutableState::new(module), compiled)
}

fn call_integer(state: &mut ExecutableState, name: &str, args: Vec<Value>) -> i32 {
    match state.invoke_by_name(name, args) {
        Ok(Some(Value::Integer(value))) => value,
        other => panic!("expected an Integer from {name}, got {other:?}"),
    }
}

#[test]
fn factorial_of_five_is_120() {
    let (mut state, _) = compile(
        "function Factorial(n : Integer) : Integer\
         { if (n <= 1) return 1; return n * Factorial(n - 1); }",
    );
    assert_eq!(call_integer(&mut state, "Factorial", vec![Value::Integer(5)]), 120);
    assert!(state.drain_events().is_empty(), "no events expected");
}

/// The deterministic-interpreter property: identical starting state,
/// identical results.
#[test]
fn execution_is_deterministic_across_invocations() {
    let (mut state, _) = compile(
        "function Mix(n : Integer) : Integer\
         { var total : Integer = 0;\
           for (var i : Integer = 0; i < n; i += 1) { total += i * 3; }\
           return total; }",
    );
    let first = call_integer(&mut state, "Mix", vec![Value::Integer(10)]);
    let second = call_integer(&mut state, "Mix", vec![Value::Integer(10)]);
    assert_eq!(first, second);
    assert_eq!(first, 135);
}

#[test]
fn null_dereference_reports_unhandled_exception() {
    let (mut state, compiled) = compile(
        "class Animal { function Speak() { } }\n\
         var a : Animal = null;\n\
         a.Speak();",
    );
    let error = state
        .invoke_entry(compiled.library)
        .expect_err("calling through null must throw");
    assert_eq!(error.kind, ExceptionKind::NullReference);
    let location = error.location.expect("the throw carries a location");
    assert_eq!(location.origin, "test.lus");
    assert_eq!(location.primary_line, 3);

    let events = state.drain_events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, StateEvent::UnhandledException { exception }
                if exception.kind == ExceptionKind::NullReference)),
        "expected an UnhandledException event, got {events:?}"
    );
}

#[test]
fn timeout_interrupts_an_infinite_loop() {
    let (mut state, _) = compile(
        "function Spin() { timeout (1) { while (true) { } } }\
         function Ok() : Integer { return 7; }",
    );
    let start = std::time::Instant::now();
    let error = state
        .invoke_by_name("Spin", Vec::new())
        .expect_err("the loop must time out");
    let elapsed = start.elapsed();

    assert_eq!(error.kind, ExceptionKind::Timeout);
    assert!(error.message.contains("1 second"), "message was: {}", error.message);
    assert!(elapsed.as_secs_f64() < 3.0, "timeout took {elapsed:?}");

    // The state resumes once the timeout scope has unwound.
    state.drain_events();
    assert_eq!(call_integer(&mut state, "Ok", Vec::new()), 7);
}

#[test]
fn overload_resolution_picks_by_argument_type() {
    let (mut state, _) = compile(
        "function F(n : Integer) : Integer { return 1; }\
         function F(r : Real) : Integer { return 2; }\
         function CallInt() : Integer { return F(2); }\
         function CallReal() : Integer { return F(2.0); }",
    );
    assert_eq!(call_integer(&mut state, "CallInt", Vec::new()), 1);
    assert_eq!(call_integer(&mut state, "CallReal", Vec::new()), 2);
}

#[test]
fn deleted_objects_null_every_alias() {
    let (mut state, _) = compile(
        "class Box { var N : Integer = 3; }\
         function Test() : Integer\
         {\
             var a : Box = new Box();\
             var b : Box = a;\
             delete a;\
             if (b == null) { return 1; }\
             return 0;\
         }",
    );
    assert_eq!(call_integer(&mut state, "Test", Vec::new()), 1);
}

#[test]
fn scope_exit_runs_destructors_exactly_once() {
    let (mut state, _) = compile(
        "class Tally { static var Count : Integer = 0; }\
         class D { destructor() { Tally.Count += 1; } }\
         function MakeTwo() { var a : D = new D(); var b : D = new D(); }\
         function Count() : Integer { return Tally.Count; }",
    );
    assert!(state.invoke_by_name("MakeTwo", Vec::new()).is_ok());
    assert_eq!(call_integer(&mut state, "Count", Vec::new()), 2);
    assert!(state.invoke_by_name("MakeTwo", Vec::new()).is_ok());
    assert_eq!(call_integer(&mut state, "Count", Vec::new()), 4);
}

#[test]
fn virtual_dispatch_resolves_against_the_dynamic_type() {
    let (mut state, _) = compile(
        "class Animal { virtual function Id() : Integer { return 1; } }\
         class Cat : Animal { override function Id() : Integer { return 2; } }\
         function Test() : Integer { var a : Animal = new Cat(); return a.Id(); }",
    );
    assert_eq!(call_integer(&mut state, "Test", Vec::new()), 2);
}

#[test]
fn any_round_trips_with_checked_extraction() {
    let (mut state, _) = compile(
        "function Store() : Integer\
         {\
             var boxed : Any = 41;\
             var back : Integer = boxed as Integer;\
             return back + 1;\
         }",
    );
    assert_eq!(call_integer(&mut state, "Store", Vec::new()), 42);
}

#[test]
fn bad_any_extraction_throws_invalid_cast() {
    let (mut state, _) = compile(
        "function Bad() : Integer\
         {\
             var boxed : Any = true;\
             return boxed as Integer;\
         }",
    );
    let error = state.invoke_by_name("Bad", Vec::new()).expect_err("must throw");
    assert_eq!(error.kind, ExceptionKind::InvalidCast);
}

#[test]
fn indexers_rewrite_to_get_and_set_calls() {
    let (mut state, _) = compile(
        "class Cell\
         {\
             var Value : Integer = 0;\
             function Get(i : Integer) : Integer { return this.Value + i; }\
             function Set(i : Integer, v : Integer) { this.Value = v; }\
         }\
         function Test() : Integer\
         {\
             var c : Cell = new Cell();\
             c[0] = 5;\
             c[0] += 2;\
             return c[1];\
         }",
    );
    assert_eq!(call_integer(&mut state, "Test", Vec::new()), 8);
}

#[test]
fn properties_call_get_and_set() {
    let (mut state, _) = compile(
        "class Player\
         {\
             var Backing : Integer = 0;\
             property Health : Integer\
             {\
                 get { return this.Backing; }\
                 set { this.Backing = value; }\
             }\
         }\
         function Test() : Integer\
         {\
             var p : Player = new Player();\
             p.Health = 10;\
             p.Health += 5;\
             return p.Health;\
         }",
    );
    assert_eq!(call_integer(&mut state, "Test", Vec::new()), 15);
}

#[test]
fn string_interpolation_builds_text() {
    let (mut state, _) = compile(
        "function Greet(n : Integer) : String { return \"n is `n` and doubled `n * 2`\"; }",
    );
    match state.invoke_by_name("Greet", vec![Value::Integer(4)]) {
        Ok(Some(Value::Str(text))) => assert_eq!(&*text, "n is 4 and doubled 8"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn user_exceptions_carry_their_message() {
    let (mut state, _) = compile(
        "function Boom() { throw new Exception(\"paws off\"); }",
    );
    let error = state.invoke_by_name("Boom", Vec::new()).expect_err("must throw");
    assert_eq!(error.kind, ExceptionKind::Custom);
    assert_eq!(error.message, "paws off");
    assert!(!error.trace.frames.is_empty());
}

#[test]
fn template_instantiations_deduplicate() {
    let mut module = Module::new();
    let mut project = Project::new();
    project.add_code(
        "class Stack[T] { var Count : Integer = 0; }\
         function A() { var s : Stack[Integer] = new Stack[Integer](); }\
         function B() { var s : Stack[Integer] = new Stack[Integer](); }\
         function C() { var s : Stack[Real] = new Stack[Real](); }",
        "test.lus",
    );
    project.compile(&mut module, "test").expect("compiles");
    let integer_stacks = module
        .types
        .iter()
        .filter(|(_, ty)| ty.name == "Stack[Integer]")
        .count();
    assert_eq!(integer_stacks, 1, "structurally equal instantiations share one type");
    assert!(module.find_type("Stack[Real]").is_some());
}

#[test]
fn stack_overflow_throws_then_state_recovers() {
    let (mut state, _) = compile(
        "function Down(n : Integer) : Integer { return Down(n + 1); }\
         function Ok() : Integer { return 5; }",
    );
    let error = state
        .invoke_by_name("Down", vec![Value::Integer(0)])
        .expect_err("unbounded recursion must overflow");
    assert_eq!(error.kind, ExceptionKind::StackOverflow);
    state.drain_events();
    // The overflow reserve is rearmed; the state keeps working.
    assert_eq!(call_integer(&mut state, "Ok", Vec::new()), 5);
}

#[test]
fn state_shutdown_reports_leaks() {
    let (mut state, _) = compile(
        "class Treasure { }\
         class Keeper { static var Kept : Treasure = new Treasure(); }\
         function Touch() : Integer\
         {\
             if (Keeper.Kept == null) { return 0; }\
             return 1;\
         }",
    );
    assert_eq!(call_integer(&mut state, "Touch", Vec::new()), 1);
    let events = state.shutdown();
    let leaks: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            StateEvent::MemoryLeak {
                type_name,
                allocated_at,
            } => Some((type_name.clone(), allocated_at.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(leaks.len(), 1, "exactly the kept Treasure leaks: {events:?}");
    assert_eq!(leaks[0].0, "Treasure");
    let location = leaks[0].1.as_ref().expect("leak carries its allocation site");
    assert_eq!(location.origin, "test.lus");
}

#[test]
fn scopes_clean_up_normally_without_leaks() {
    let (mut state, _) = compile(
        "class Box { var N : Integer = 1; }\
         function Churn() : Integer\
         {\
             var total : Integer = 0;\
             for (var i : Integer = 0; i < 8; i += 1)\
             {\
                 var b : Box = new Box();\
                 total += b.N;\
             }\
             return total;\
         }",
    );
    assert_eq!(call_integer(&mut state, "Churn", Vec::new()), 8);
    assert_eq!(state.live_heap_objects(), 0, "every Box was reclaimed by its scope");
}

#[test]
fn identity_patch_keeps_results_and_handles_valid() {
    let source = "class Counter\
         {\
             var Value : Integer = 0;\
             function Bump() : Integer { this.Value += 1; return this.Value; }\
         }\
         function Make() : Integer { var c : Counter = new Counter(); return c.Bump(); }";
    let (mut state, _) = compile(source);
    assert_eq!(call_integer(&mut state, "Make", Vec::new()), 1);

    let entries = vec![CodeEntry::new(source, "test.lus")];
    state
        .patch_library(&entries, "test-patched")
        .expect("an identity patch installs cleanly");

    // Previously valid calls produce the same result through the redirects.
    assert_eq!(call_integer(&mut state, "Make", Vec::new()), 1);
}

#[test]
fn patch_redirects_to_the_newest_definition() {
    let (mut state, _) = compile("function Ok() : Integer { return 1; }");
    let entries = vec![CodeEntry::new("function Ok() : Integer { return 2; }", "test.lus")];
    state.patch_library(&entries, "patch").expect("patch installs");
    // The newest definition wins for name lookup and redirects.
    assert_eq!(call_integer(&mut state, "Ok", Vec::new()), 2);
}

#[test]
fn breakpoints_pause_nothing_but_preserve_execution() {
    let (mut state, _) = compile("function F() : Integer { return 3; }");
    let function = state.find_function("F", 0).expect("F exists");
    assert!(state.set_breakpoint(function, 0));
    // Execution still produces the same result: the original instruction
    // runs after the breakpoint reports.
    assert_eq!(call_integer(&mut state, "F", Vec::new()), 3);
    assert!(state.clear_breakpoint(function, 0));
    assert_eq!(call_integer(&mut state, "F", Vec::new()), 3);
}

#[test]
fn reflection_set_value_applies_conversion_checks() {
    let (mut state, _) = compile(
        "class Data { var R : Real = 0.0; }\
         function Make() : Data { return new Data(); }",
    );
    let handle = match state.invoke_by_name("Make", Vec::new()) {
        Ok(Some(Value::Handle(handle))) => handle,
        other => panic!("expected a handle, got {other:?}"),
    };
    let data_type = state.module.find_type("Data").expect("Data exists");
    let field = state.module.types.find_field(data_type, "R").expect("field R");

    // Integer widens to Real on the way in.
    state
        .set_field_value(&handle, field, Value::Integer(4))
        .expect("widening conversion applies");
    assert_eq!(state.get_field_value(&handle, field).unwrap(), Value::Real(4.0));

    // Incompatible types throw.
    let error = state
        .set_field_value(&handle, field, Value::Boolean(true))
        .expect_err("boolean cannot convert to Real");
    assert_eq!(error.kind, ExceptionKind::InvalidCast);
}
