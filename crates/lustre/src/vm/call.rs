//! The `Call` wrapper: staging parameters and `this`, enforcing the write
//! discipline, and invoking a function on an executable state.
//!
//! A call tracks which parameters, `this`, and the return have been written;
//! `invoke` refuses to run until everything the signature requires is in
//! place. Native functions receive the same wrapper around their already
//! pushed frame.

use crate::{
    ids::{FunctionId, LibraryId},
    value::{Handle, Value},
    vm::{
        CallingStateGuard, ExceptionKind, ExceptionRaise, ExecResult, ExecutableState, StateEvent, VmError,
        exceptions::{StackTrace, StackTraceFrame},
    },
};

/// One staged (or native-in-progress) invocation.
pub struct Call<'a> {
    state: &'a mut ExecutableState,
    function: FunctionId,
    frame_base: u32,
    /// Depth to run back down to; the staged frame sits above it.
    base_depth: usize,
    /// Bitmask of parameters written so far.
    written_parameters: u64,
    this_written: bool,
    /// Native contexts skip the write discipline: the VM already populated
    /// the frame.
    native_context: bool,
}

impl<'a> Call<'a> {
    /// Wraps the VM-populated top frame for a native implementation.
    pub(crate) fn for_native(state: &'a mut ExecutableState) -> Self {
        let frame = state.frames.last().expect("native call has a frame");
        let function = frame.function;
        let frame_base = frame.frame_base;
        let base_depth = state.frames.len() - 1;
        Self {
            state,
            function,
            frame_base,
            base_depth,
            written_parameters: u64::MAX,
            this_written: true,
            native_context: true,
        }
    }

    /// The function being invoked.
    #[must_use]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The executing state, for natives that allocate, throw, or introspect.
    pub fn state(&mut self) -> &mut ExecutableState {
        self.state
    }

    /// Writes parameter `index`.
    pub fn set_parameter(&mut self, index: usize, value: Value) -> ExecResult<()> {
        let param_count = self.state.module.function(self.function).signature.params.len();
        if index >= param_count {
            return Err(self.state.raise(
                ExceptionKind::Internal,
                format!("function takes {param_count} parameter(s), index {index} written"),
            ));
        }
        let slot = self.frame_base + self.state.module.function(self.function).parameter_slot(index);
        self.state.add_reference_value(&value);
        self.state.stack[slot as usize] = value;
        self.state.register_cleanup(slot);
        self.written_parameters |= 1 << index;
        Ok(())
    }

    /// Writes `this` for an instance function.
    pub fn set_this(&mut self, this_handle: Handle) -> ExecResult<()> {
        let Some(this_slot) = self.state.module.function(self.function).this_slot() else {
            return Err(self
                .state
                .raise(ExceptionKind::Internal, "this written on a static call".to_owned()));
        };
        let slot = self.frame_base + this_slot;
        let value = Value::Handle(this_handle);
        self.state.add_reference_value(&value);
        self.state.stack[slot as usize] = value;
        self.state.register_cleanup(slot);
        self.this_written = true;
        Ok(())
    }

    /// Reads parameter `index` (native implementations).
    #[must_use]
    pub fn parameter(&self, index: usize) -> Value {
        let slot = self.frame_base + self.state.module.function(self.function).parameter_slot(index);
        self.state.stack[slot as usize].clone()
    }

    /// The `this` handle (native implementations).
    #[must_use]
    pub fn this_handle(&self) -> Option<Handle> {
        let this_slot = self.state.module.function(self.function).this_slot()?;
        match &self.state.stack[(self.frame_base + this_slot) as usize] {
            Value::Handle(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Writes the return slot (native implementations).
    pub fn set_return(&mut self, value: Value) {
        self.state.add_reference_value(&value);
        self.state.stack[self.frame_base as usize] = value;
    }

    /// Writes a field of `this` directly (native constructors).
    pub fn write_this_field(&mut self, offset: u32, value: Value) -> ExecResult<()> {
        let Some(this_handle) = self.this_handle() else {
            return Err(self
                .state
                .raise(ExceptionKind::NullReference, "native member call without this".to_owned()));
        };
        match self.state.resolve_handle(&this_handle) {
            crate::handles::Resolved::HeapObject(slot) => {
                self.state.add_reference_value(&value);
                if let Some(object) = self.state.heap.get_mut(slot) {
                    let old = std::mem::replace(&mut object.fields[offset as usize], value);
                    self.state.release_value(old);
                }
                Ok(())
            }
            crate::handles::Resolved::StackLocation(slot) => {
                self.state.add_reference_value(&value);
                let old = std::mem::replace(&mut self.state.stack[(slot + offset) as usize], value);
                self.state.release_value(old);
                Ok(())
            }
            crate::handles::Resolved::Null => Err(self
                .state
                .raise(ExceptionKind::NullReference, "native member call on a null object".to_owned())),
        }
    }

    /// Throws from a native implementation.
    pub fn throw(&mut self, kind: ExceptionKind, message: impl Into<String>) -> VmError {
        self.state.raise(kind, message.into())
    }

    /// Runs the staged call to completion, returning the return value for
    /// non-void functions.
    ///
    /// Every parameter (and `this` for instance functions) must have been
    /// written; partial staging is a host bug reported as an error rather
    /// than undefined execution.
    pub fn invoke(mut self) -> Result<Option<Value>, ExceptionRaise> {
        debug_assert!(!self.native_context, "native contexts are invoked by the VM");
        let declared = self.state.module.function(self.function);
        let param_count = declared.signature.params.len();
        let needs_this = declared.this_slot().is_some();
        let returns_value = declared.signature.return_type != self.state.module.core.void;

        for index in 0..param_count {
            if self.written_parameters & (1 << index) == 0 {
                return Err(self.stage_error(format!("parameter {index} was never written")));
            }
        }
        if needs_this && !self.this_written {
            return Err(self.stage_error("this was never written".to_owned()));
        }

        let _guard = CallingStateGuard::bind(self.state);
        let native = self.state.module.function(self.function).native;
        let result = match native {
            Some(native) => {
                let outcome = {
                    let mut native_call = Call {
                        state: &mut *self.state,
                        function: self.function,
                        frame_base: self.frame_base,
                        base_depth: self.base_depth,
                        written_parameters: u64::MAX,
                        this_written: true,
                        native_context: true,
                    };
                    native(&mut native_call)
                };
                self.state.pop_frame();
                outcome
            }
            None => self.state.run_to_depth(self.base_depth),
        };

        match result {
            Ok(()) => {
                let value = returns_value.then(|| std::mem::take(&mut self.state.stack[self.frame_base as usize]));
                if self.base_depth == 0 {
                    self.state.hit_stack_overflow = false;
                }
                Ok(value)
            }
            Err(error) => Err(self.state.report_invoke_error(error, self.base_depth)),
        }
    }

    fn stage_error(&mut self, message: String) -> ExceptionRaise {
        // Tear the staged frame down; nothing ran.
        self.state.unwind_to(self.base_depth);
        ExceptionRaise {
            handle: Handle::null(self.state.module.core.exception),
            kind: ExceptionKind::Internal,
            message,
            trace: StackTrace::default(),
            location: None,
        }
    }
}

impl ExecutableState {
    /// Stages a call to `function`, pushing its frame so parameters can be
    /// written into place.
    pub fn begin_call(&mut self, function: FunctionId) -> ExecResult<Call<'_>> {
        if self.fatal {
            return Err(VmError::Fatal(crate::vm::FatalKind::NestedStackOverflow));
        }
        let function = self.resolve_patched(function);
        let base_depth = self.frames.len();
        self.push_frame(function)?;
        let frame_base = self.frames.last().expect("frame just pushed").frame_base;
        Ok(Call {
            state: self,
            function,
            frame_base,
            base_depth,
            written_parameters: 0,
            this_written: false,
            native_context: false,
        })
    }

    /// Finds a library-level function by name and arity.
    #[must_use]
    pub fn find_function(&self, name: &str, arity: usize) -> Option<FunctionId> {
        for library in self.module.libraries.iter().rev() {
            if let Some(set) = library.function_names.get(name) {
                for &function in set {
                    if self.module.function(function).signature.params.len() == arity {
                        return Some(function);
                    }
                }
            }
        }
        None
    }

    /// Compiles, stages, and runs a library-level function by name.
    pub fn invoke_by_name(&mut self, name: &str, arguments: Vec<Value>) -> Result<Option<Value>, ExceptionRaise> {
        let Some(function) = self.find_function(name, arguments.len()) else {
            return Err(ExceptionRaise {
                handle: Handle::null(self.module.core.exception),
                kind: ExceptionKind::Internal,
                message: format!("function '{name}' with {} parameter(s) was not found", arguments.len()),
                trace: StackTrace::default(),
                location: None,
            });
        };
        let mut call = match self.begin_call(function) {
            Ok(call) => call,
            Err(error) => return Err(self.report_invoke_error(error, 0)),
        };
        let mut staging_failure = None;
        for (index, value) in arguments.into_iter().enumerate() {
            if let Err(error) = call.set_parameter(index, value) {
                staging_failure = Some((error, call.base_depth));
                break;
            }
        }
        if let Some((error, base)) = staging_failure {
            drop(call);
            return Err(self.report_invoke_error(error, base));
        }
        call.invoke()
    }

    /// Runs a library's entry function (its loose top-level statements).
    pub fn invoke_entry(&mut self, library: LibraryId) -> Result<Option<Value>, ExceptionRaise> {
        let Some(entry) = self.module.library(library).entry_function else {
            return Ok(None);
        };
        let call = match self.begin_call(entry) {
            Ok(call) => call,
            Err(error) => return Err(self.report_invoke_error(error, 0)),
        };
        call.invoke()
    }

    /// Converts an interpreter error into a host-facing report: records it,
    /// raises the matching event, and reclaims the exception object.
    fn report_invoke_error(&mut self, error: VmError, base_depth: usize) -> ExceptionRaise {
        self.unwind_to(base_depth);
        if base_depth == 0 {
            self.hit_stack_overflow = false;
        }
        match error {
            VmError::Exception(raise) => {
                let raise = *raise;
                self.exception_report.record(raise.clone());
                self.events.push(StateEvent::UnhandledException {
                    exception: raise.clone(),
                });
                // The report carries everything as plain data; the heap
                // object itself can go (aliases read as null, never dangle).
                if !raise.handle.is_null() {
                    let _ = self.destroy_object(&raise.handle.clone());
                }
                raise
            }
            VmError::Fatal(kind) => {
                self.fatal = true;
                let raise = ExceptionRaise {
                    handle: Handle::null(self.module.core.exception),
                    kind: ExceptionKind::Internal,
                    message: format!("fatal error: {kind:?}"),
                    trace: StackTrace {
                        frames: vec![StackTraceFrame {
                            function: "<fatal>".to_owned(),
                            location: None,
                        }],
                    },
                    location: None,
                };
                self.events.push(StateEvent::FatalError {
                    kind,
                    reason: raise.message.clone(),
                });
                raise
            }
        }
    }
}
