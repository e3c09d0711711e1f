//! VM execution tracing: the hook points debug events ride on.
//!
//! The dispatcher emits `OpcodePreStep`/`OpcodePostStep` at each dispatch and
//! `EnterFunction`/`ExitFunction` at frame boundaries when debug events are
//! enabled. Tracers collect or forward them; the default [`NoopTracer`] costs
//! a single flag check per dispatch.

use crate::{ids::FunctionId, location::CodeLocation};

/// One recorded execution event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    OpcodePreStep {
        function: FunctionId,
        pc: usize,
        location: Option<CodeLocation>,
    },
    OpcodePostStep {
        function: FunctionId,
        pc: usize,
    },
    EnterFunction {
        function: FunctionId,
        name: String,
    },
    ExitFunction {
        function: FunctionId,
        name: String,
    },
    BreakpointHit {
        function: FunctionId,
        pc: usize,
        location: Option<CodeLocation>,
    },
}

/// Hook points the VM calls at key execution events.
///
/// Implementations must not re-enter the state that is calling them.
pub trait VmTracer: std::fmt::Debug {
    fn opcode_pre_step(&mut self, function: FunctionId, pc: usize, location: Option<&CodeLocation>) {
        let _ = (function, pc, location);
    }

    fn opcode_post_step(&mut self, function: FunctionId, pc: usize) {
        let _ = (function, pc);
    }

    fn enter_function(&mut self, function: FunctionId, name: &str) {
        let _ = (function, name);
    }

    fn exit_function(&mut self, function: FunctionId, name: &str) {
        let _ = (function, name);
    }

    fn breakpoint_hit(&mut self, function: FunctionId, pc: usize, location: Option<&CodeLocation>) {
        let _ = (function, pc, location);
    }
}

/// The production default: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Logs every event to stderr; for debugging the VM itself.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn opcode_pre_step(&mut self, function: FunctionId, pc: usize, location: Option<&CodeLocation>) {
        match location {
            Some(location) => eprintln!("step {function:?}@{pc} ({location})"),
            None => eprintln!("step {function:?}@{pc}"),
        }
    }

    fn enter_function(&mut self, _function: FunctionId, name: &str) {
        eprintln!("enter {name}");
    }

    fn exit_function(&mut self, _function: FunctionId, name: &str) {
        eprintln!("exit {name}");
    }
}

/// Records every event for post-mortem inspection in tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl VmTracer for RecordingTracer {
    fn opcode_pre_step(&mut self, function: FunctionId, pc: usize, location: Option<&CodeLocation>) {
        self.events.push(TraceEvent::OpcodePreStep {
            function,
            pc,
            location: location.cloned(),
        });
    }

    fn opcode_post_step(&mut self, function: FunctionId, pc: usize) {
        self.events.push(TraceEvent::OpcodePostStep { function, pc });
    }

    fn enter_function(&mut self, function: FunctionId, name: &str) {
        self.events.push(TraceEvent::EnterFunction {
            function,
            name: name.to_owned(),
        });
    }

    fn exit_function(&mut self, function: FunctionId, name: &str) {
        self.events.push(TraceEvent::ExitFunction {
            function,
            name: name.to_owned(),
        });
    }

    fn breakpoint_hit(&mut self, function: FunctionId, pc: usize, location: Option<&CodeLocation>) {
        self.events.push(TraceEvent::BreakpointHit {
            function,
            pc,
            location: location.cloned(),
        });
    }
}
