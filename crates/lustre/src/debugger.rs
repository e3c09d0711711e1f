//! Debugger wire messages and breakpoint bookkeeping.
//!
//! Messages are JSON with a `type` discriminator, carried over a host-owned
//! transport (the reference transport is a WebSocket with separate
//! receive/send threads behind a single-producer queue; the VM thread polls
//! on its own cadence). The transport itself lives outside this crate; here
//! are the message types and the mapping from `(origin, line)` breakpoints to
//! instruction locations.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    ids::FunctionId,
    library::Module,
    location::CodeLocation,
    vm::{ExecutableState, StackTrace},
};

/// Commands a debugger front end sends to the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebuggerCommand {
    Pause,
    Resume,
    StepOver,
    StepIn,
    StepOut,
    SetBreakpoint { origin: String, line: u32, enabled: bool },
    Query { expression: String },
}

/// Events the state sends back to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebuggerEvent {
    Paused {
        location: CodeLocation,
        stack: StackTrace,
    },
    Resumed,
    BreakpointAdded {
        origin: String,
        line: u32,
    },
    BreakpointRemoved {
        origin: String,
        line: u32,
    },
    Exception {
        thrown: String,
        location: Option<CodeLocation>,
    },
    ConsoleWrite {
        text: String,
    },
}

/// Maps source breakpoints onto instruction positions and keeps them in sync
/// with a state.
#[derive(Debug, Default)]
pub struct Debugger {
    active: AHashSet<(String, u32)>,
}

impl Debugger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a command to the attached state, producing the events to send
    /// back.
    pub fn handle_command(&mut self, state: &mut ExecutableState, command: &DebuggerCommand) -> Vec<DebuggerEvent> {
        match command {
            DebuggerCommand::SetBreakpoint { origin, line, enabled } => {
                self.set_breakpoint(state, origin, *line, *enabled)
            }
            // Pause/resume/stepping drive the cooperative loop through the
            // tracer; acknowledged here, enacted by the host's run loop.
            DebuggerCommand::Resume => vec![DebuggerEvent::Resumed],
            DebuggerCommand::Pause
            | DebuggerCommand::StepOver
            | DebuggerCommand::StepIn
            | DebuggerCommand::StepOut
            | DebuggerCommand::Query { .. } => Vec::new(),
        }
    }

    fn set_breakpoint(
        &mut self,
        state: &mut ExecutableState,
        origin: &str,
        line: u32,
        enabled: bool,
    ) -> Vec<DebuggerEvent> {
        let Some((function, pc)) = resolve_location(&state.module, origin, line) else {
            return Vec::new();
        };
        let key = (origin.to_owned(), line);
        if enabled {
            if state.set_breakpoint(function, pc) {
                self.active.insert(key);
                return vec![DebuggerEvent::BreakpointAdded {
                    origin: origin.to_owned(),
                    line,
                }];
            }
        } else if state.clear_breakpoint(function, pc) {
            self.active.remove(&key);
            return vec![DebuggerEvent::BreakpointRemoved {
                origin: origin.to_owned(),
                line,
            }];
        }
        Vec::new()
    }
}

/// Finds the first instruction whose debug range covers `(origin, line)`.
#[must_use]
pub fn resolve_location(module: &Module, origin: &str, line: u32) -> Option<(FunctionId, usize)> {
    for (index, function) in module.functions.iter().enumerate() {
        let Some(code) = function.code.as_ref() else {
            continue;
        };
        for entry in &code.debug_ranges {
            if entry.location.origin == origin && entry.location.primary_line == line {
                return Some((FunctionId::from(index), entry.op_index as usize));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_as_tagged_json() {
        let command = DebuggerCommand::SetBreakpoint {
            origin: "Player.lus".to_owned(),
            line: 12,
            enabled: true,
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"set_breakpoint\""));
        let back: DebuggerCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn events_carry_discriminators() {
        let event = DebuggerEvent::ConsoleWrite {
            text: "hello".to_owned(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"console_write\""));
    }
}
