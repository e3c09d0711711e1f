//! The virtual machine: executable states, frames, scopes, dispatch, and the
//! layered exception/timeout semantics.
//!
//! Scheduling is single-threaded cooperative: a state is owned by one thread
//! at a time, no opcode yields, and all suspension happens at host-controlled
//! boundaries. Exception unwinding threads a `Result` through the dispatch
//! loop; the contract is that scope cleanup runs in reverse insertion order
//! and native callbacks observe the pending report after every re-entry.

mod call;
pub mod exceptions;
pub mod natives;
mod patching;
mod reflection;

use std::{
    cell::Cell,
    time::Instant,
};

use ahash::{AHashMap, AHashSet};

pub use call::Call;
pub use exceptions::{ExceptionKind, ExceptionRaise, ExceptionReport, ExecResult, FatalKind, StackTrace, VmError};
pub use patching::PatchError;

use crate::{
    handles::{
        HandleManagers, HeapArena, HeapFlags, ObjectRef, ReleaseResult, Resolved, ScopeRegistry,
    },
    ids::{FieldId, FunctionId, HandleManagerId, TypeId},
    library::Module,
    location::CodeLocation,
    opcode::{BinaryOp, CastOperator, CopyMode, Instruction, Operand, OperandKind, UnaryOp},
    string_builder::StringBuilder,
    tracer::{NoopTracer, VmTracer},
    types::{Primitive, TypeCopyMode},
    value::{AnyValue, Delegate, Handle, Value},
    vm::exceptions::StackTraceFrame,
};

/// Usable stack slots before the overflow reserve.
pub const STACK_SLOTS: u32 = 8192;
/// Extra slots enabled after a stack overflow so destructors and the
/// exception itself can run.
pub const OVERFLOW_RESERVE_SLOTS: u32 = 1024;
/// How many dispatches between timeout charges.
const TIMEOUT_CHECK_INTERVAL: u32 = 64;

thread_local! {
    /// The state currently executing on this thread, if any. Bound natives
    /// receive the state explicitly; this exists for host-boundary code that
    /// cannot.
    static CALLING_STATE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// The id of the state currently executing on this thread.
#[must_use]
pub fn calling_state_id() -> Option<u64> {
    CALLING_STATE.get()
}

/// Events a state reports to its host.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// An exception propagated out of the outermost invoke uncaught.
    UnhandledException { exception: ExceptionRaise },
    /// The state is unusable from here on.
    FatalError { kind: FatalKind, reason: String },
    /// A heap object survived to state shutdown.
    MemoryLeak {
        type_name: String,
        allocated_at: Option<CodeLocation>,
    },
}

/// An active timeout budget. Only the topmost entry accumulates, bounding
/// the charge cost to a fixed fraction per frame.
#[derive(Debug, Clone)]
struct Timeout {
    remaining_nanos: i128,
    owning_frame: usize,
    seconds: u32,
}

/// Runtime record of one lexical scope: a unique uid (stack handles store it
/// to become null safely) plus the values to destroy when the scope ends.
#[derive(Debug, Default)]
pub struct PerScopeData {
    pub uid: u64,
    /// Absolute stack slots holding `any` values to release.
    anys: Vec<u32>,
    /// Absolute stack slots holding handles to release.
    handles: Vec<u32>,
    /// Absolute stack slots holding delegates to release.
    delegates: Vec<u32>,
    /// Stack-constructed objects whose destructors run at scope end.
    stack_objects: Vec<Handle>,
}

impl PerScopeData {
    fn clear(&mut self) {
        self.uid = 0;
        self.anys.clear();
        self.handles.clear();
        self.delegates.clear();
        self.stack_objects.clear();
    }

    /// True when nothing remains registered (checked after normal exits).
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.anys.is_empty() && self.handles.is_empty() && self.delegates.is_empty() && self.stack_objects.is_empty()
    }
}

/// Stack record for one in-flight function call.
#[derive(Debug, Default)]
pub struct PerFrameData {
    pub frame_base: u32,
    pub function: FunctionId,
    pub pc: usize,
    /// Live scopes, innermost last.
    scopes: Vec<PerScopeData>,
    /// Timeout entries this frame pushed (popped on unwind).
    timeout_count: u32,
}

/// The staged call between `PrepForFunctionCall` and `FunctionCall`.
#[derive(Debug, Clone)]
struct PendingCall {
    function: FunctionId,
}

/// An isolated execution state: stack, frames, handle managers, statics,
/// patched maps, and the timeout stack.
#[derive(Debug)]
pub struct ExecutableState {
    pub module: Module,
    stack: Vec<Value>,
    frames: Vec<PerFrameData>,
    recycled_frames: Vec<PerFrameData>,
    recycled_scopes: Vec<PerScopeData>,
    heap: HeapArena,
    managers: HandleManagers,
    scope_registry: ScopeRegistry,
    /// Static field storage, keyed by field identity; populated on first
    /// access by running the field's initializer.
    statics: AHashMap<FieldId, Value>,
    statics_initializing: AHashSet<FieldId>,
    /// Old function -> replacement installed by library patching.
    patched_functions: AHashMap<FunctionId, FunctionId>,
    /// Old type -> replacement installed by library patching.
    patched_types: AHashMap<TypeId, TypeId>,
    timeouts: Vec<Timeout>,
    string_builders: Vec<StringBuilder>,
    pending_call: Option<PendingCall>,
    events: Vec<StateEvent>,
    dispatch_counter: u32,
    last_timeout_check: Instant,
    hit_stack_overflow: bool,
    fatal: bool,
    /// Externally set breakpoints: the original instruction per overwritten
    /// location, written back when the breakpoint is removed.
    external_breakpoints: AHashMap<(FunctionId, usize), Instruction>,
    tracer: Box<dyn VmTracer>,
    debug_events_enabled: bool,
    state_id: u64,
    /// The report native callbacks consult after each invoke.
    pub exception_report: ExceptionReport,
}

impl ExecutableState {
    #[must_use]
    pub fn new(module: Module) -> Self {
        static NEXT_STATE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let state_id = NEXT_STATE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            module,
            stack: vec![Value::Empty; (STACK_SLOTS + OVERFLOW_RESERVE_SLOTS) as usize],
            frames: Vec::new(),
            recycled_frames: Vec::new(),
            recycled_scopes: Vec::new(),
            heap: HeapArena::new(),
            managers: HandleManagers::new(),
            scope_registry: ScopeRegistry::default(),
            statics: AHashMap::new(),
            statics_initializing: AHashSet::new(),
            patched_functions: AHashMap::new(),
            patched_types: AHashMap::new(),
            timeouts: Vec::new(),
            string_builders: Vec::new(),
            pending_call: None,
            events: Vec::new(),
            dispatch_counter: 0,
            last_timeout_check: Instant::now(),
            hit_stack_overflow: false,
            fatal: false,
            external_breakpoints: AHashMap::new(),
            tracer: Box::new(NoopTracer),
            debug_events_enabled: false,
            state_id,
            exception_report: ExceptionReport::default(),
        }
    }

    /// Installs a tracer and turns on per-opcode debug events.
    pub fn enable_debug_events(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
        self.debug_events_enabled = true;
    }

    /// Events raised since the last drain.
    pub fn drain_events(&mut self) -> Vec<StateEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_event(&mut self, event: StateEvent) {
        self.events.push(event);
    }

    /// Live heap object count, for leak assertions in hosts and tests.
    #[must_use]
    pub fn live_heap_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// Whether a fatal error has made the state unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    // --- breakpoints ---

    /// Overwrites the instruction at `(function, pc)` with a breakpoint,
    /// remembering the original.
    pub fn set_breakpoint(&mut self, function: FunctionId, pc: usize) -> bool {
        let resolved = self.resolve_patched(function);
        let Some(code) = self.module.function_mut(resolved).code.as_mut() else {
            return false;
        };
        if pc >= code.ops.len() {
            return false;
        }
        let original = std::mem::replace(&mut code.ops[pc], Instruction::Breakpoint);
        self.external_breakpoints.insert((resolved, pc), original);
        true
    }

    /// Restores the original instruction at a breakpoint.
    pub fn clear_breakpoint(&mut self, function: FunctionId, pc: usize) -> bool {
        let resolved = self.resolve_patched(function);
        let Some(original) = self.external_breakpoints.remove(&(resolved, pc)) else {
            return false;
        };
        if let Some(code) = self.module.function_mut(resolved).code.as_mut() {
            code.ops[pc] = original;
        }
        true
    }

    // --- the dispatch loop ---

    /// Executes frames until the depth drops back to `base`, unwinding on
    /// errors.
    fn run_to_depth(&mut self, base: usize) -> ExecResult<()> {
        loop {
            if self.frames.len() <= base {
                return Ok(());
            }
            if let Err(error) = self.execute_next() {
                self.unwind_to(base);
                if let VmError::Fatal(kind) = &error {
                    self.fatal = true;
                    self.push_event(StateEvent::FatalError {
                        kind: kind.clone(),
                        reason: "fatal error during execution".to_owned(),
                    });
                }
                return Err(error);
            }
        }
    }

    /// Advances the program counter, dispatches one instruction, and returns
    /// control. Timeouts are charged every few dispatches.
    fn execute_next(&mut self) -> ExecResult<()> {
        self.dispatch_counter += 1;
        if self.dispatch_counter >= TIMEOUT_CHECK_INTERVAL {
            self.dispatch_counter = 0;
            self.charge_timeouts()?;
        }

        let frame = self.frames.last().expect("execute_next with no frame");
        let function_id = frame.function;
        let at = frame.pc;

        let instruction = {
            let Some(code) = self.module.function(function_id).code.as_ref() else {
                return self.do_return();
            };
            if at >= code.ops.len() {
                return self.do_return();
            }
            code.ops[at].clone()
        };

        if self.debug_events_enabled {
            let location = self
                .module
                .function(function_id)
                .code
                .as_ref()
                .and_then(|code| code.location_at(at))
                .cloned();
            self.tracer.opcode_pre_step(function_id, at, location.as_ref());
        }

        self.frames.last_mut().expect("frame exists").pc = at + 1;
        let result = self.execute_instruction(&instruction, at, function_id);
        if self.debug_events_enabled {
            self.tracer.opcode_post_step(function_id, at);
        }
        result
    }

    fn execute_instruction(&mut self, instruction: &Instruction, at: usize, function_id: FunctionId) -> ExecResult<()> {
        match instruction {
            Instruction::Nop => Ok(()),
            Instruction::Copy {
                source,
                destination,
                mode,
            } => self.do_copy(source, destination, *mode),
            Instruction::BinaryRValue {
                op,
                left,
                right,
                output,
            } => {
                let left_value = self.read_operand(left)?;
                let right_value = self.read_operand(right)?;
                let result = self.apply_binary(*op, &left_value, &right_value)?;
                self.store_local_raw(*output, result);
                Ok(())
            }
            Instruction::BinaryLValue { op, output, right } => {
                let current = self.read_operand(output)?;
                let right_value = self.read_operand(right)?;
                let result = self.apply_binary(*op, &current, &right_value)?;
                self.write_operand(output, result, CopyMode::Assignment)
            }
            Instruction::UnaryRValue { op, operand, output } => {
                let value = self.read_operand(operand)?;
                let result = self.apply_unary(*op, &value)?;
                self.store_local_raw(*output, result);
                Ok(())
            }
            Instruction::UnaryLValue { op, operand } => {
                let value = self.read_operand(operand)?;
                let result = self.apply_unary(*op, &value)?;
                self.write_operand(operand, result, CopyMode::Assignment)
            }
            Instruction::TypeCast {
                operator,
                source,
                output,
            } => {
                let value = self.read_operand(source)?;
                let converted = self.apply_cast(*operator, value)?;
                self.store_local_owned(*output, converted);
                Ok(())
            }
            Instruction::If {
                condition,
                jump_offset,
                on_true,
            } => {
                let value = self.read_operand(condition)?;
                let Some(truth) = value.as_condition() else {
                    return Err(self.raise(ExceptionKind::Internal, "condition was not a Boolean".to_owned()));
                };
                if truth == *on_true {
                    self.jump_relative(at, *jump_offset);
                }
                Ok(())
            }
            Instruction::Jump { jump_offset } => {
                self.jump_relative(at, *jump_offset);
                Ok(())
            }
            Instruction::PrepForFunctionCall {
                delegate,
                jump_offset_if_static,
            } => {
                let value = self.read_operand(delegate)?;
                let Value::Delegate(delegate_value) = value else {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to call a null delegate".to_owned()));
                };
                if delegate_value.function.0 == u32::MAX {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to call a null delegate".to_owned()));
                }
                let function = self.resolve_patched(delegate_value.function);
                match &delegate_value.this_handle {
                    Some(this_handle) => {
                        // Write `this` into the callee frame.
                        let this_slot = self.module.function(function).this_slot();
                        let Some(this_slot) = this_slot else {
                            return Err(self.raise(
                                ExceptionKind::Internal,
                                "instance delegate to a static function".to_owned(),
                            ));
                        };
                        let abs = self.next_frame_base()? + this_slot;
                        self.add_reference_value(&Value::Handle(this_handle.clone()));
                        self.stack[abs as usize] = Value::Handle(this_handle.clone());
                        self.pending_call = Some(PendingCall { function });
                    }
                    None => {
                        self.pending_call = Some(PendingCall { function });
                        if *jump_offset_if_static != 0 {
                            self.jump_relative(at, *jump_offset_if_static);
                        }
                    }
                }
                Ok(())
            }
            Instruction::FunctionCall => {
                let pending = self
                    .pending_call
                    .take()
                    .ok_or_else(|| self.raise(ExceptionKind::Internal, "function call without prep".to_owned()))?;
                self.call_staged(pending.function)
            }
            Instruction::Return => self.do_return(),
            Instruction::CreateType {
                created_type,
                save_handle,
                reference_counted,
            } => {
                let created = self.resolve_patched_type(*created_type);
                let size = self
                    .module
                    .types
                    .bound(created)
                    .map_or(1, |bound| bound.size_slots.max(1));
                let manager = self
                    .module
                    .types
                    .bound(created)
                    .map_or(HandleManagerId::HEAP, |bound| bound.manager);
                let flags = if *reference_counted {
                    HeapFlags::ReferenceCounted
                } else {
                    HeapFlags::NonReferenceCounted
                };
                let location = self
                    .module
                    .function(function_id)
                    .code
                    .as_ref()
                    .and_then(|code| code.location_at(at))
                    .cloned();
                let handle = self
                    .managers
                    .get_mut(manager)
                    .allocate(&mut self.heap, created, size, flags, location)
                    .ok_or_else(|| self.raise(ExceptionKind::Internal, "this manager cannot allocate".to_owned()))?;
                // The allocation's initial reference belongs to this scope
                // registration.
                let abs = self.local_abs(*save_handle);
                self.stack[abs as usize] = Value::Handle(handle);
                self.register_cleanup(abs);
                Ok(())
            }
            Instruction::CreateLocalType {
                created_type,
                save_handle,
                stack_local,
            } => {
                let created = self.resolve_patched_type(*created_type);
                let payload_abs = self.local_abs(*stack_local);
                let scope_uid = self
                    .frames
                    .last()
                    .and_then(|frame| frame.scopes.last())
                    .map_or(0, |scope| scope.uid);
                let handle = self.managers.get_mut(HandleManagerId::STACK).object_to_handle(
                    &self.heap,
                    ObjectRef::Stack {
                        scope_uid,
                        slot: payload_abs,
                    },
                    created,
                );
                let abs = self.local_abs(*save_handle);
                self.stack[abs as usize] = Value::Handle(handle.clone());
                if let Some(scope) = self.frames.last_mut().and_then(|frame| frame.scopes.last_mut()) {
                    scope.stack_objects.push(handle);
                }
                Ok(())
            }
            Instruction::DeleteObject { object } => {
                let value = self.read_operand(object)?;
                let Value::Handle(handle) = value else {
                    return Err(self.raise(ExceptionKind::NonDeletableObject, "only objects can be deleted".to_owned()));
                };
                if handle.is_null() || matches!(self.resolve_handle(&handle), Resolved::Null) {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to delete a null object".to_owned()));
                }
                if !self.managers.get(handle.manager).can_delete(&self.heap, &handle) {
                    return Err(self.raise(
                        ExceptionKind::NonDeletableObject,
                        "this object cannot be deleted".to_owned(),
                    ));
                }
                self.destroy_object(&handle)
            }
            Instruction::ThrowException { exception } => {
                let value = self.read_operand(exception)?;
                let Value::Handle(handle) = value else {
                    return Err(self.raise(ExceptionKind::NullReference, "thrown value was not an object".to_owned()));
                };
                if matches!(self.resolve_handle(&handle), Resolved::Null) {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to throw a null exception".to_owned()));
                }
                let message = self
                    .read_object_field(&handle, 0)
                    .ok()
                    .map_or_else(String::new, |value| value.to_string());
                Err(self.raise_with_handle(ExceptionKind::Custom, message, handle))
            }
            Instruction::ToHandle {
                source,
                save_local,
                handle_type,
            } => {
                let handle = match source.kind {
                    OperandKind::Local => {
                        let abs = self.local_abs(source.index + source.field_offset);
                        let scope_uid = self
                            .frames
                            .last()
                            .and_then(|frame| frame.scopes.last())
                            .map_or(0, |scope| scope.uid);
                        self.managers.get_mut(HandleManagerId::STACK).object_to_handle(
                            &self.heap,
                            ObjectRef::Stack {
                                scope_uid,
                                slot: abs,
                            },
                            *handle_type,
                        )
                    }
                    _ => match self.read_operand(source)? {
                        Value::Handle(handle) => handle,
                        _ => Handle::null(*handle_type),
                    },
                };
                self.store_local_owned(*save_local, Value::Handle(handle));
                Ok(())
            }
            Instruction::CreateStaticDelegate { function, save_local } => {
                let function = self.resolve_patched(*function);
                self.store_local_owned(
                    *save_local,
                    Value::Delegate(Delegate {
                        function,
                        this_handle: None,
                    }),
                );
                Ok(())
            }
            Instruction::CreateInstanceDelegate {
                function,
                this_operand,
                save_local,
                can_be_virtual,
            } => {
                let value = self.read_operand(this_operand)?;
                let Value::Handle(this_handle) = value else {
                    return Err(self.raise(ExceptionKind::NullReference, "instance call on a non-object".to_owned()));
                };
                if matches!(self.resolve_handle(&this_handle), Resolved::Null) {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned()));
                }
                let mut function = self.resolve_patched(*function);
                if *can_be_virtual {
                    function = self.resolve_virtual(function, &this_handle);
                }
                self.store_local_owned(
                    *save_local,
                    Value::Delegate(Delegate {
                        function,
                        this_handle: Some(this_handle),
                    }),
                );
                Ok(())
            }
            Instruction::TypeId {
                compile_time_type,
                expression,
                save_local,
            } => {
                let value = self.read_operand(expression)?;
                let dynamic = match &value {
                    Value::Handle(handle) => self.dynamic_type(handle).unwrap_or(*compile_time_type),
                    Value::Any(any) => any.stored_type,
                    _ => *compile_time_type,
                };
                self.store_local_raw(*save_local, Value::TypeRef(dynamic));
                Ok(())
            }
            Instruction::MemberId { member, save_local } => {
                self.store_local_raw(*save_local, Value::MemberRef(*member));
                Ok(())
            }
            Instruction::BeginStringBuilder => {
                self.string_builders.push(StringBuilder::new());
                Ok(())
            }
            Instruction::AddToStringBuilder { value, .. } => {
                let value = self.read_operand(value)?;
                if let Some(builder) = self.string_builders.last_mut() {
                    builder.write_value(&value);
                }
                Ok(())
            }
            Instruction::EndStringBuilder { save_local } => {
                let builder = self
                    .string_builders
                    .pop()
                    .ok_or_else(|| self.raise(ExceptionKind::Internal, "string builder underflow".to_owned()))?;
                self.store_local_raw(*save_local, Value::string(builder.into_string()));
                Ok(())
            }
            Instruction::BeginScope => {
                self.push_scope();
                Ok(())
            }
            Instruction::EndScope => {
                self.pop_scope();
                Ok(())
            }
            Instruction::BeginTimeout { seconds } => {
                self.timeouts.push(Timeout {
                    remaining_nanos: i128::from(*seconds) * 1_000_000_000,
                    owning_frame: self.frames.len() - 1,
                    seconds: *seconds,
                });
                if let Some(frame) = self.frames.last_mut() {
                    frame.timeout_count += 1;
                }
                self.last_timeout_check = Instant::now();
                Ok(())
            }
            Instruction::EndTimeout => {
                self.timeouts.pop();
                if let Some(frame) = self.frames.last_mut() {
                    frame.timeout_count = frame.timeout_count.saturating_sub(1);
                }
                Ok(())
            }
            Instruction::Breakpoint => {
                if self.debug_events_enabled {
                    let location = self
                        .module
                        .function(function_id)
                        .code
                        .as_ref()
                        .and_then(|code| code.location_at(at))
                        .cloned();
                    self.tracer.breakpoint_hit(function_id, at, location.as_ref());
                }
                // Execute the instruction the breakpoint overwrote.
                let original = self.external_breakpoints.get(&(function_id, at)).cloned();
                match original {
                    Some(original) => self.execute_instruction(&original, at, function_id),
                    None => Ok(()),
                }
            }
        }
    }

    fn jump_relative(&mut self, at: usize, offset: i32) {
        let target = i64::try_from(at).expect("pc exceeds i64") + i64::from(offset);
        let target = usize::try_from(target).expect("jump produced a negative pc");
        self.frames.last_mut().expect("frame exists").pc = target;
    }

    // --- timeouts ---

    /// Charges elapsed time against the topmost timeout; exceeding the
    /// budget throws.
    fn charge_timeouts(&mut self) -> ExecResult<()> {
        let elapsed = self.last_timeout_check.elapsed();
        self.last_timeout_check = Instant::now();
        let Some(top) = self.timeouts.last_mut() else {
            return Ok(());
        };
        top.remaining_nanos -= i128::try_from(elapsed.as_nanos()).unwrap_or(i128::MAX);
        if top.remaining_nanos <= 0 {
            let seconds = top.seconds;
            let plural = if seconds == 1 { "" } else { "s" };
            return Err(self.raise(
                ExceptionKind::Timeout,
                format!("exceeded the timeout of {seconds} second{plural}"),
            ));
        }
        Ok(())
    }

    // --- frames and scopes ---

    fn next_frame_base(&mut self) -> ExecResult<u32> {
        let base = match self.frames.last() {
            Some(frame) => {
                let required = self
                    .module
                    .function(frame.function)
                    .code
                    .as_ref()
                    .map_or_else(|| self.module.function(frame.function).first_local_slot(), |code| code.required_stack);
                frame.frame_base + required
            }
            None => 0,
        };
        Ok(base)
    }

    fn stack_limit(&self) -> u32 {
        if self.hit_stack_overflow {
            STACK_SLOTS + OVERFLOW_RESERVE_SLOTS
        } else {
            STACK_SLOTS
        }
    }

    /// Pushes a frame for `function` at the next frame base. Parameters and
    /// `this` must already be in place; they are registered for cleanup in
    /// the frame's root scope here.
    fn push_frame(&mut self, function: FunctionId) -> ExecResult<()> {
        let base = self.next_frame_base()?;
        let declared = self.module.function(function);
        let required = declared
            .code
            .as_ref()
            .map_or_else(|| declared.first_local_slot(), |code| code.required_stack);
        let first_local = declared.first_local_slot();
        let param_count = declared.signature.params.len();
        let has_this = declared.this_slot().is_some();
        let name = declared.name.clone();

        if base + required > self.stack_limit() {
            // Switch to the overflow reserve so destructors and the
            // exception itself can run; a second overflow is fatal.
            if self.hit_stack_overflow {
                return Err(VmError::Fatal(FatalKind::NestedStackOverflow));
            }
            self.hit_stack_overflow = true;
            return Err(self.raise(ExceptionKind::StackOverflow, "the stack overflowed".to_owned()));
        }

        // Clear the return slot and locals; parameter slots were written by
        // the caller.
        self.stack[base as usize] = Value::Empty;
        for slot in first_local..required {
            self.stack[(base + slot) as usize] = Value::Empty;
        }

        let mut frame = self.recycled_frames.pop().unwrap_or_default();
        frame.frame_base = base;
        frame.function = function;
        frame.pc = 0;
        frame.timeout_count = 0;
        frame.scopes.clear();
        self.frames.push(frame);

        // The frame's root scope owns the parameters and `this`.
        self.push_scope();
        for index in 0..param_count {
            let abs = base + 1 + u32::try_from(index).expect("parameter index exceeds u32");
            self.register_cleanup_if_managed(abs);
        }
        if has_this {
            let this_slot = 1 + u32::try_from(param_count).expect("parameter count exceeds u32");
            self.register_cleanup_if_managed(base + this_slot);
        }

        if self.debug_events_enabled {
            self.tracer.enter_function(function, &name);
        }
        Ok(())
    }

    /// Invokes the staged function: bytecode frames stay pushed for the
    /// dispatch loop; natives run to completion here.
    fn call_staged(&mut self, function: FunctionId) -> ExecResult<()> {
        self.push_frame(function)?;
        if let Some(native) = self.module.function(function).native {
            let result = {
                let mut call = Call::for_native(self);
                native(&mut call)
            };
            self.pop_frame();
            return result;
        }
        Ok(())
    }

    fn do_return(&mut self) -> ExecResult<()> {
        self.pop_frame();
        Ok(())
    }

    fn pop_frame(&mut self) {
        let Some(mut frame) = self.frames.pop() else {
            return;
        };
        // Scopes unwind in reverse, destroying registered values.
        while let Some(scope) = frame.scopes.pop() {
            self.destroy_scope(scope);
        }
        // Timeouts owned by this frame die with it.
        for _ in 0..frame.timeout_count {
            self.timeouts.pop();
        }
        if self.debug_events_enabled {
            let name = self.module.function(frame.function).name.clone();
            self.tracer.exit_function(frame.function, &name);
        }
        self.recycled_frames.push(frame);
    }

    fn unwind_to(&mut self, base: usize) {
        while self.frames.len() > base {
            self.pop_frame();
        }
    }

    fn push_scope(&mut self) {
        let mut scope = self.recycled_scopes.pop().unwrap_or_default();
        scope.clear();
        scope.uid = self.scope_registry.enter();
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.push(scope);
        }
    }

    fn pop_scope(&mut self) {
        let scope = self.frames.last_mut().and_then(|frame| frame.scopes.pop());
        if let Some(scope) = scope {
            self.destroy_scope(scope);
        }
    }

    /// Destroys a scope's registered values in reverse insertion order, then
    /// retires its uid so stack handles into it read as null.
    fn destroy_scope(&mut self, mut scope: PerScopeData) {
        let uid = scope.uid;
        let anys = std::mem::take(&mut scope.anys);
        let delegates = std::mem::take(&mut scope.delegates);
        let handles = std::mem::take(&mut scope.handles);
        let stack_objects = std::mem::take(&mut scope.stack_objects);

        for &slot in anys.iter().rev() {
            let value = std::mem::take(&mut self.stack[slot as usize]);
            self.release_value(value);
        }
        for &slot in delegates.iter().rev() {
            let value = std::mem::take(&mut self.stack[slot as usize]);
            self.release_value(value);
        }
        for &slot in handles.iter().rev() {
            let value = std::mem::take(&mut self.stack[slot as usize]);
            self.release_value(value);
        }
        // Stack-constructed objects run their destructors before the scope
        // uid is retired (their handles are still valid inside destructors).
        for handle in stack_objects.into_iter().rev() {
            self.run_destructors(&handle);
            self.release_object_fields(&handle);
        }

        self.scope_registry.retire(uid);
        scope.clear();
        self.recycled_scopes.push(scope);
    }

    // --- operand access ---

    fn local_abs(&self, index: u32) -> u32 {
        let base = self.frames.last().map_or(0, |frame| frame.frame_base);
        base + index
    }

    fn resolve_handle(&self, handle: &Handle) -> Resolved {
        self.managers
            .get(handle.manager)
            .resolve(&self.heap, &self.scope_registry, handle)
    }

    /// The most-derived type of a handle's referent.
    fn dynamic_type(&self, handle: &Handle) -> Option<TypeId> {
        match self.resolve_handle(handle) {
            Resolved::HeapObject(slot) => self.heap.get(slot).map(|object| object.header.type_id),
            Resolved::StackLocation(_) => Some(handle.stored_type),
            Resolved::Null => None,
        }
    }

    fn read_object_field(&mut self, handle: &Handle, offset: u32) -> ExecResult<Value> {
        match self.resolve_handle(handle) {
            Resolved::HeapObject(slot) => {
                let object = match self.heap.get(slot) {
                    Some(object) => object,
                    None => return Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned())),
                };
                Ok(object.fields.get(offset as usize).cloned().unwrap_or_default())
            }
            Resolved::StackLocation(slot) => Ok(self.stack[(slot + offset) as usize].clone()),
            Resolved::Null => {
                Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned()))
            }
        }
    }

    fn read_operand(&mut self, operand: &Operand) -> ExecResult<Value> {
        match operand.kind {
            OperandKind::Constant => {
                let function = self.frames.last().expect("frame exists").function;
                let code = self
                    .module
                    .function(function)
                    .code
                    .as_ref()
                    .expect("constant read in a function without code");
                Ok(code.constants[operand.index as usize].clone())
            }
            OperandKind::Local => Ok(self.stack[(self.local_abs(operand.index) + operand.field_offset) as usize].clone()),
            OperandKind::Field => {
                let holder = self.stack[self.local_abs(operand.index) as usize].clone();
                let Value::Handle(handle) = holder else {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned()));
                };
                self.read_object_field(&handle, operand.field_offset)
            }
            OperandKind::StaticField => {
                let field = operand.static_field.expect("static operand carries its field");
                self.ensure_static_initialized(field)?;
                Ok(self.statics.get(&field).cloned().unwrap_or_default())
            }
            OperandKind::Property | OperandKind::NotSet => {
                Err(self.raise(ExceptionKind::Internal, "unresolved operand".to_owned()))
            }
        }
    }

    /// Writes a value through an operand with copy-mode semantics: reference
    /// counting, scope registration, and value-type payload cloning.
    fn write_operand(&mut self, operand: &Operand, value: Value, mode: CopyMode) -> ExecResult<()> {
        // Value-type payloads copy on every store so each variable owns a
        // distinct object.
        let value = self.clone_if_value_type(value)?;

        match mode {
            CopyMode::Assignment => {
                let old = self.read_destination(operand)?;
                self.add_reference_value(&value);
                self.write_destination(operand, value)?;
                self.release_value(old);
                Ok(())
            }
            CopyMode::Initialize => {
                self.add_reference_value(&value);
                let registered_slot = match operand.kind {
                    OperandKind::Local => Some(self.local_abs(operand.index) + operand.field_offset),
                    _ => None,
                };
                let managed = matches!(value, Value::Handle(_) | Value::Delegate(_) | Value::Any(_));
                self.write_destination(operand, value)?;
                if managed && let Some(slot) = registered_slot {
                    self.register_cleanup(slot);
                }
                Ok(())
            }
            CopyMode::ToParameter => {
                self.add_reference_value(&value);
                let base = self.next_frame_base()?;
                let abs = base + operand.index;
                if abs >= self.stack_limit() {
                    if self.hit_stack_overflow {
                        return Err(VmError::Fatal(FatalKind::NestedStackOverflow));
                    }
                    self.hit_stack_overflow = true;
                    return Err(self.raise(ExceptionKind::StackOverflow, "the stack overflowed".to_owned()));
                }
                self.stack[abs as usize] = value;
                Ok(())
            }
            CopyMode::ToReturn => {
                self.add_reference_value(&value);
                let abs = self.frames.last().map_or(0, |frame| frame.frame_base);
                self.stack[abs as usize] = value;
                Ok(())
            }
            CopyMode::FromReturn => {
                // Ownership transfers from the callee's return slot.
                let base = self.next_frame_base()?;
                let returned = std::mem::take(&mut self.stack[base as usize]);
                let managed = matches!(returned, Value::Handle(_) | Value::Delegate(_) | Value::Any(_));
                let registered_slot = match operand.kind {
                    OperandKind::Local => Some(self.local_abs(operand.index) + operand.field_offset),
                    _ => None,
                };
                self.write_destination(operand, returned)?;
                if managed && let Some(slot) = registered_slot {
                    self.register_cleanup(slot);
                }
                Ok(())
            }
        }
    }

    /// The `Copy` opcode: reads the source (the callee return slot for
    /// `FromReturn`) and writes with mode semantics.
    fn do_copy(&mut self, source: &Operand, destination: &Operand, mode: CopyMode) -> ExecResult<()> {
        if mode == CopyMode::FromReturn {
            return self.write_operand(destination, Value::Empty, mode);
        }
        let value = self.read_operand(source)?;
        self.write_operand(destination, value, mode)
    }

    /// Reads the current value of a destination without null-throwing on
    /// empty slots (for release-before-overwrite).
    fn read_destination(&mut self, operand: &Operand) -> ExecResult<Value> {
        match operand.kind {
            OperandKind::Local => {
                let abs = self.local_abs(operand.index) + operand.field_offset;
                Ok(std::mem::take(&mut self.stack[abs as usize]))
            }
            _ => self.read_operand(operand).or(Ok(Value::Empty)),
        }
    }

    fn write_destination(&mut self, operand: &Operand, value: Value) -> ExecResult<()> {
        match operand.kind {
            OperandKind::Local => {
                let abs = self.local_abs(operand.index) + operand.field_offset;
                self.stack[abs as usize] = value;
                Ok(())
            }
            OperandKind::Field => {
                let holder = self.stack[self.local_abs(operand.index) as usize].clone();
                let Value::Handle(handle) = holder else {
                    return Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned()));
                };
                match self.resolve_handle(&handle) {
                    Resolved::HeapObject(slot) => {
                        let offset = operand.field_offset as usize;
                        let object = match self.heap.get_mut(slot) {
                            Some(object) => object,
                            None => return Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned())),
                        };
                        if offset >= object.fields.len() {
                            object.fields.resize(offset + 1, Value::Empty);
                        }
                        object.fields[offset] = value;
                        Ok(())
                    }
                    Resolved::StackLocation(slot) => {
                        self.stack[(slot + operand.field_offset) as usize] = value;
                        Ok(())
                    }
                    Resolved::Null => {
                        Err(self.raise(ExceptionKind::NullReference, "attempted to access a member of a null object".to_owned()))
                    }
                }
            }
            OperandKind::StaticField => {
                let field = operand.static_field.expect("static operand carries its field");
                self.statics.insert(field, value);
                Ok(())
            }
            OperandKind::Constant | OperandKind::Property | OperandKind::NotSet => {
                Err(self.raise(ExceptionKind::Internal, "write to a read-only operand".to_owned()))
            }
        }
    }

    /// Raw store into a local, for primitive results that never carry
    /// manual reference counts.
    fn store_local_raw(&mut self, index: u32, value: Value) {
        let abs = self.local_abs(index);
        self.stack[abs as usize] = value;
    }

    /// Store into a local taking ownership of a managed value: registers it
    /// in the current scope so its reference is released at scope end.
    fn store_local_owned(&mut self, index: u32, value: Value) {
        let managed = matches!(value, Value::Handle(_) | Value::Delegate(_) | Value::Any(_));
        self.add_reference_value(&value);
        let abs = self.local_abs(index);
        self.stack[abs as usize] = value;
        if managed {
            self.register_cleanup(abs);
        }
    }

    fn register_cleanup(&mut self, abs_slot: u32) {
        let kind = match &self.stack[abs_slot as usize] {
            Value::Handle(_) => 0,
            Value::Delegate(_) => 1,
            Value::Any(_) => 2,
            _ => return,
        };
        let Some(scope) = self.frames.last_mut().and_then(|frame| frame.scopes.last_mut()) else {
            return;
        };
        match kind {
            0 => scope.handles.push(abs_slot),
            1 => scope.delegates.push(abs_slot),
            _ => scope.anys.push(abs_slot),
        }
    }

    fn register_cleanup_if_managed(&mut self, abs_slot: u32) {
        self.register_cleanup(abs_slot);
    }

    // --- reference counting ---

    fn add_reference_value(&mut self, value: &Value) {
        match value {
            Value::Handle(handle) => {
                self.managers.get_mut(handle.manager).add_reference(&mut self.heap, handle);
            }
            Value::Delegate(delegate) => {
                if let Some(this_handle) = &delegate.this_handle {
                    self.managers
                        .get_mut(this_handle.manager)
                        .add_reference(&mut self.heap, this_handle);
                }
            }
            Value::Any(any) => self.add_reference_value(&any.value.clone()),
            _ => {}
        }
    }

    /// Releases a reference; a count reaching zero runs the destructor and
    /// deletes.
    fn release_value(&mut self, value: Value) {
        match value {
            Value::Handle(handle) => {
                let result = self
                    .managers
                    .get_mut(handle.manager)
                    .release_reference(&mut self.heap, &handle);
                if result == ReleaseResult::DeleteObject {
                    let _ = self.destroy_object(&handle);
                }
            }
            Value::Delegate(delegate) => {
                if let Some(this_handle) = delegate.this_handle {
                    self.release_value(Value::Handle(this_handle));
                }
            }
            Value::Any(any) => self.release_value(any.value),
            _ => {}
        }
    }

    /// Runs destructors (derived first), releases field references, and
    /// frees the object; every alias dereferences to null afterwards.
    fn destroy_object(&mut self, handle: &Handle) -> ExecResult<()> {
        self.run_destructors(handle);
        self.release_object_fields(handle);
        self.managers.get_mut(handle.manager).delete(&mut self.heap, handle);
        Ok(())
    }

    fn run_destructors(&mut self, handle: &Handle) {
        let Some(mut current) = self.dynamic_type(handle) else {
            return;
        };
        loop {
            let destructor = self.module.types.bound(current).and_then(|bound| bound.destructor);
            if let Some(destructor) = destructor {
                // Destructor failures do not propagate; the object is going
                // away regardless.
                let _ = self.invoke_with_this(destructor, handle.clone());
            }
            match self.module.types.bound(current).and_then(|bound| bound.parent) {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }

    fn release_object_fields(&mut self, handle: &Handle) {
        match self.resolve_handle(handle) {
            Resolved::HeapObject(slot) => {
                let fields: Vec<Value> = self
                    .heap
                    .get_mut(slot)
                    .map(|object| object.fields.iter_mut().map(std::mem::take).collect())
                    .unwrap_or_default();
                for field in fields {
                    self.release_value(field);
                }
            }
            Resolved::StackLocation(slot) => {
                let size = self
                    .module
                    .types
                    .bound(handle.stored_type)
                    .map_or(1, |bound| bound.size_slots.max(1));
                for offset in 0..size {
                    let value = std::mem::take(&mut self.stack[(slot + offset) as usize]);
                    self.release_value(value);
                }
            }
            Resolved::Null => {}
        }
    }

    /// Deep-copies a value-type payload so the destination owns a distinct
    /// object.
    fn clone_if_value_type(&mut self, value: Value) -> ExecResult<Value> {
        let Value::Handle(handle) = &value else {
            return Ok(value);
        };
        if handle.is_null() {
            return Ok(value);
        }
        let is_value_type = self
            .module
            .types
            .bound(handle.stored_type)
            .is_some_and(|bound| bound.copy_mode == TypeCopyMode::Value && !bound.is_enum);
        if !is_value_type {
            return Ok(value);
        }
        let Some(dynamic) = self.dynamic_type(handle) else {
            return Ok(value);
        };
        let size = self
            .module
            .types
            .bound(dynamic)
            .map_or(1, |bound| bound.size_slots.max(1));
        let fields: Vec<Value> = match self.resolve_handle(handle) {
            Resolved::HeapObject(slot) => self
                .heap
                .get(slot)
                .map(|object| object.fields.clone())
                .unwrap_or_default(),
            Resolved::StackLocation(slot) => (0..size)
                .map(|offset| self.stack[(slot + offset) as usize].clone())
                .collect(),
            Resolved::Null => return Ok(value),
        };
        let clone = self
            .managers
            .get_mut(HandleManagerId::HEAP)
            .allocate(&mut self.heap, dynamic, size, HeapFlags::ReferenceCounted, None)
            .ok_or_else(|| self.raise(ExceptionKind::Internal, "allocation failed".to_owned()))?;
        for field in &fields {
            self.add_reference_value(field);
        }
        if let Resolved::HeapObject(slot) = self.resolve_handle(&clone)
            && let Some(object) = self.heap.get_mut(slot)
        {
            for (index, field) in fields.into_iter().enumerate() {
                if index < object.fields.len() {
                    object.fields[index] = field;
                }
            }
            // The store that follows owns the first reference; without this
            // the copy-mode add-reference would double count.
            object.header.reference_count = 0;
        }
        Ok(Value::Handle(clone))
    }

    // --- statics ---

    /// First access to a static field runs its initializer in the calling
    /// state.
    fn ensure_static_initialized(&mut self, field: FieldId) -> ExecResult<()> {
        if self.statics.contains_key(&field) {
            return Ok(());
        }
        if !self.statics_initializing.insert(field) {
            return Err(self.raise(
                ExceptionKind::InvalidStaticInitializer,
                "a static field's initializer read the field it initializes".to_owned(),
            ));
        }
        let descriptor = self.module.field(field);
        let default = self.module.types.default_value(descriptor.value_type);
        let initializer = descriptor.initializer;
        self.statics.insert(field, default);
        let result = match initializer {
            Some(initializer) => self.invoke_static_internal(initializer),
            None => Ok(()),
        };
        self.statics_initializing.remove(&field);
        result
    }

    // --- patching and virtual dispatch ---

    /// Follows patch redirects to the newest installed function.
    fn resolve_patched(&self, mut function: FunctionId) -> FunctionId {
        let mut hops = 0;
        while let Some(&next) = self.patched_functions.get(&function) {
            function = next;
            hops += 1;
            if hops > self.patched_functions.len() {
                break;
            }
        }
        function
    }

    fn resolve_patched_type(&self, mut ty: TypeId) -> TypeId {
        let mut hops = 0;
        while let Some(&next) = self.patched_types.get(&ty) {
            ty = next;
            hops += 1;
            if hops > self.patched_types.len() {
                break;
            }
        }
        ty
    }

    /// Re-resolves a virtual function against the handle's dynamic type
    /// through the virtual-table index.
    fn resolve_virtual(&self, function: FunctionId, this_handle: &Handle) -> FunctionId {
        let Some(owner) = self.module.function(function).owner else {
            return function;
        };
        let Some(dynamic) = self.dynamic_type(this_handle) else {
            return function;
        };
        if dynamic == owner {
            return function;
        }
        let Some(owner_bound) = self.module.types.bound(owner) else {
            return function;
        };
        let Some(index) = owner_bound.virtual_table.iter().position(|&f| {
            self.resolve_patched(f) == function || f == function
        }) else {
            return function;
        };
        let Some(dynamic_bound) = self.module.types.bound(dynamic) else {
            return function;
        };
        dynamic_bound
            .virtual_table
            .get(index)
            .map_or(function, |&f| self.resolve_patched(f))
    }

    // --- invocation helpers ---

    /// Runs an instance function with `this` and no parameters (destructors,
    /// pre-constructors invoked from VM internals).
    fn invoke_with_this(&mut self, function: FunctionId, this_handle: Handle) -> ExecResult<()> {
        let function = self.resolve_patched(function);
        let declared = self.module.function(function);
        let Some(this_slot) = declared.this_slot() else {
            return Err(self.raise(ExceptionKind::Internal, "instance invoke of a static function".to_owned()));
        };
        let base = self.next_frame_base()?;
        self.add_reference_value(&Value::Handle(this_handle.clone()));
        self.stack[(base + this_slot) as usize] = Value::Handle(this_handle);
        let depth = self.frames.len();
        self.call_staged(function)?;
        self.run_to_depth(depth)
    }

    /// Runs a static function with no parameters.
    fn invoke_static_internal(&mut self, function: FunctionId) -> ExecResult<()> {
        let function = self.resolve_patched(function);
        let depth = self.frames.len();
        self.call_staged(function)?;
        self.run_to_depth(depth)
    }

    // --- exceptions ---

    fn current_location(&self) -> Option<CodeLocation> {
        let frame = self.frames.last()?;
        let code = self.module.function(frame.function).code.as_ref()?;
        // pc already advanced past the executing instruction.
        code.location_at(frame.pc.saturating_sub(1)).cloned()
    }

    /// Captures the current call stack, innermost first.
    fn capture_trace(&self) -> StackTrace {
        let frames = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let declared = self.module.function(frame.function);
                StackTraceFrame {
                    function: declared.name.clone(),
                    location: declared
                        .code
                        .as_ref()
                        .and_then(|code| code.location_at(frame.pc.saturating_sub(1)))
                        .cloned(),
                }
            })
            .collect();
        StackTrace { frames }
    }

    /// Constructs an exception object and the error that unwinds to the
    /// host.
    fn raise(&mut self, kind: ExceptionKind, message: String) -> VmError {
        let handle = self.allocate_exception_object(&message);
        self.raise_with_handle(kind, message, handle)
    }

    fn raise_with_handle(&mut self, kind: ExceptionKind, message: String, handle: Handle) -> VmError {
        VmError::Exception(Box::new(ExceptionRaise {
            handle,
            kind,
            message,
            trace: self.capture_trace(),
            location: self.current_location(),
        }))
    }

    fn allocate_exception_object(&mut self, message: &str) -> Handle {
        let exception_type = self.module.core.exception;
        let handle = self
            .managers
            .get_mut(HandleManagerId::HEAP)
            .allocate(&mut self.heap, exception_type, 1, HeapFlags::NonReferenceCounted, None);
        match handle {
            Some(handle) => {
                if let Resolved::HeapObject(slot) = self.resolve_handle(&handle)
                    && let Some(object) = self.heap.get_mut(slot)
                {
                    object.fields[0] = Value::string(message);
                }
                handle
            }
            None => Handle::null(exception_type),
        }
    }

    /// Releases the exception object once the host is done with a report.
    pub fn release_exception(&mut self, raise: &ExceptionRaise) {
        if !raise.handle.is_null() {
            let _ = self.destroy_object(&raise.handle.clone());
        }
    }

    // --- arithmetic ---

    fn apply_binary(&mut self, op: BinaryOp, left: &Value, right: &Value) -> ExecResult<Value> {
        use BinaryOp as B;
        if op.is_comparison() && matches!(op, B::Equal | B::NotEqual) {
            let equal = self.values_equal(left, right);
            return Ok(Value::Boolean(if op == B::Equal { equal } else { !equal }));
        }
        match (left, right) {
            (Value::Integer(a), Value::Integer(b)) => self.integer_binary(op, i64::from(*a), i64::from(*b), |v| {
                Value::Integer(v as i32)
            }),
            (Value::Byte(a), Value::Byte(b)) => {
                self.integer_binary(op, i64::from(*a), i64::from(*b), |v| Value::Byte(v as u8))
            }
            (Value::DoubleInteger(a), Value::DoubleInteger(b)) => {
                self.integer_binary(op, *a, *b, Value::DoubleInteger)
            }
            (Value::Real(a), Value::Real(b)) => Ok(real_binary(op, f64::from(*a), f64::from(*b), |v| Value::Real(v as f32))),
            (Value::DoubleReal(a), Value::DoubleReal(b)) => Ok(real_binary(op, *a, *b, Value::DoubleReal)),
            (Value::Str(a), Value::Str(b)) if op == B::Add => {
                let mut text = String::with_capacity(a.len() + b.len());
                text.push_str(a);
                text.push_str(b);
                Ok(Value::string(text))
            }
            (Value::Real2(a), Value::Real2(b)) => Ok(Value::Real2(vector_zip(op, a, b))),
            (Value::Real3(a), Value::Real3(b)) => Ok(Value::Real3(vector_zip(op, a, b))),
            (Value::Real4(a), Value::Real4(b)) => Ok(Value::Real4(vector_zip(op, a, b))),
            (Value::Integer2(a), Value::Integer2(b)) => Ok(Value::Integer2(int_vector_zip(op, a, b))),
            (Value::Integer3(a), Value::Integer3(b)) => Ok(Value::Integer3(int_vector_zip(op, a, b))),
            (Value::Integer4(a), Value::Integer4(b)) => Ok(Value::Integer4(int_vector_zip(op, a, b))),
            (Value::Real2(a), Value::Real(s)) => Ok(Value::Real2(vector_scale(op, a, *s))),
            (Value::Real3(a), Value::Real(s)) => Ok(Value::Real3(vector_scale(op, a, *s))),
            (Value::Real4(a), Value::Real(s)) => Ok(Value::Real4(vector_scale(op, a, *s))),
            (Value::Real(s), Value::Real2(a)) if op == B::Multiply => Ok(Value::Real2(vector_scale(op, a, *s))),
            (Value::Real(s), Value::Real3(a)) if op == B::Multiply => Ok(Value::Real3(vector_scale(op, a, *s))),
            (Value::Real(s), Value::Real4(a)) if op == B::Multiply => Ok(Value::Real4(vector_scale(op, a, *s))),
            (Value::Real3x3(a), Value::Real3x3(b)) if op == B::Multiply => Ok(Value::Real3x3(Box::new(mat3_mul(a, b)))),
            (Value::Real4x4(a), Value::Real4x4(b)) if op == B::Multiply => Ok(Value::Real4x4(Box::new(mat4_mul(a, b)))),
            (Value::Real3x3(m), Value::Real3(v)) if op == B::Multiply => Ok(Value::Real3(mat3_vec(m, v))),
            (Value::Real4x4(m), Value::Real4(v)) if op == B::Multiply => Ok(Value::Real4(mat4_vec(m, v))),
            _ => Err(self.raise(
                ExceptionKind::Internal,
                format!("operator applied to incompatible values ({left} and {right})"),
            )),
        }
    }

    fn integer_binary(
        &mut self,
        op: BinaryOp,
        a: i64,
        b: i64,
        wrap: impl Fn(i64) -> Value,
    ) -> ExecResult<Value> {
        use BinaryOp as B;
        let value = match op {
            B::Add => wrap(a.wrapping_add(b)),
            B::Subtract => wrap(a.wrapping_sub(b)),
            B::Multiply => wrap(a.wrapping_mul(b)),
            B::Divide => {
                if b == 0 {
                    return Err(self.raise(ExceptionKind::DivideByZero, "attempted to divide by zero".to_owned()));
                }
                wrap(a.wrapping_div(b))
            }
            B::Modulo => {
                if b == 0 {
                    return Err(self.raise(ExceptionKind::DivideByZero, "attempted to divide by zero".to_owned()));
                }
                wrap(a.wrapping_rem(b))
            }
            B::BitwiseAnd => wrap(a & b),
            B::BitwiseOr => wrap(a | b),
            B::BitwiseXor => wrap(a ^ b),
            B::ShiftLeft => wrap(a.wrapping_shl(u32::try_from(b.rem_euclid(64)).unwrap_or(0))),
            B::ShiftRight => wrap(a.wrapping_shr(u32::try_from(b.rem_euclid(64)).unwrap_or(0))),
            B::Less => Value::Boolean(a < b),
            B::LessEqual => Value::Boolean(a <= b),
            B::Greater => Value::Boolean(a > b),
            B::GreaterEqual => Value::Boolean(a >= b),
            B::Equal | B::NotEqual => unreachable!("equality handled before dispatch"),
        };
        Ok(value)
    }

    fn apply_unary(&mut self, op: UnaryOp, value: &Value) -> ExecResult<Value> {
        let result = match (op, value) {
            (UnaryOp::Negate, Value::Integer(v)) => Value::Integer(v.wrapping_neg()),
            (UnaryOp::Negate, Value::DoubleInteger(v)) => Value::DoubleInteger(v.wrapping_neg()),
            (UnaryOp::Negate, Value::Real(v)) => Value::Real(-v),
            (UnaryOp::Negate, Value::DoubleReal(v)) => Value::DoubleReal(-v),
            (UnaryOp::Negate, Value::Real2(v)) => Value::Real2(v.map(|c| -c)),
            (UnaryOp::Negate, Value::Real3(v)) => Value::Real3(v.map(|c| -c)),
            (UnaryOp::Negate, Value::Real4(v)) => Value::Real4(v.map(|c| -c)),
            (UnaryOp::LogicalNot, Value::Boolean(v)) => Value::Boolean(!v),
            (UnaryOp::BitwiseNot, Value::Byte(v)) => Value::Byte(!v),
            (UnaryOp::BitwiseNot, Value::Integer(v)) => Value::Integer(!v),
            (UnaryOp::BitwiseNot, Value::DoubleInteger(v)) => Value::DoubleInteger(!v),
            (UnaryOp::Increment, Value::Byte(v)) => Value::Byte(v.wrapping_add(1)),
            (UnaryOp::Increment, Value::Integer(v)) => Value::Integer(v.wrapping_add(1)),
            (UnaryOp::Increment, Value::DoubleInteger(v)) => Value::DoubleInteger(v.wrapping_add(1)),
            (UnaryOp::Increment, Value::Real(v)) => Value::Real(v + 1.0),
            (UnaryOp::Increment, Value::DoubleReal(v)) => Value::DoubleReal(v + 1.0),
            (UnaryOp::Decrement, Value::Byte(v)) => Value::Byte(v.wrapping_sub(1)),
            (UnaryOp::Decrement, Value::Integer(v)) => Value::Integer(v.wrapping_sub(1)),
            (UnaryOp::Decrement, Value::DoubleInteger(v)) => Value::DoubleInteger(v.wrapping_sub(1)),
            (UnaryOp::Decrement, Value::Real(v)) => Value::Real(v - 1.0),
            (UnaryOp::Decrement, Value::DoubleReal(v)) => Value::DoubleReal(v - 1.0),
            _ => {
                return Err(self.raise(
                    ExceptionKind::Internal,
                    format!("unary operator applied to an incompatible value ({value})"),
                ));
            }
        };
        Ok(result)
    }

    fn values_equal(&self, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Handle(a), Value::Handle(b)) => {
                if a.manager == b.manager {
                    self.managers
                        .get(a.manager)
                        .is_equal(&self.heap, &self.scope_registry, a, b)
                } else {
                    matches!(self.resolve_handle(a), Resolved::Null) && matches!(self.resolve_handle(b), Resolved::Null)
                }
            }
            (Value::Delegate(a), Value::Delegate(b)) => {
                a.function == b.function
                    && match (&a.this_handle, &b.this_handle) {
                        (Some(x), Some(y)) => self.values_equal(&Value::Handle(x.clone()), &Value::Handle(y.clone())),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (Value::Any(a), Value::Any(b)) => a.stored_type == b.stored_type && self.values_equal(&a.value, &b.value),
            _ => left == right,
        }
    }

    fn apply_cast(&mut self, operator: CastOperator, value: Value) -> ExecResult<Value> {
        match operator {
            CastOperator::Primitive { to, .. } => Ok(convert_scalar(&value, to)),
            CastOperator::ToAny { related } => {
                // Store the most-derived type when the value is a handle.
                let stored_type = match &value {
                    Value::Handle(handle) => self.dynamic_type(handle).unwrap_or(related),
                    _ => related,
                };
                Ok(Value::Any(Box::new(AnyValue {
                    stored_type,
                    value,
                })))
            }
            CastOperator::FromAny { related } => {
                let Value::Any(any) = value else {
                    return Err(self.raise(ExceptionKind::InvalidCast, "value was not an any".to_owned()));
                };
                let compatible = any.stored_type == related
                    || self.module.types.is_subtype_of(any.stored_type, related)
                    || self.module.is_error_type(related);
                if !compatible {
                    let stored = self.module.types.name_of(any.stored_type).to_owned();
                    let wanted = self.module.types.name_of(related).to_owned();
                    return Err(self.raise(
                        ExceptionKind::InvalidCast,
                        format!("the any stored '{stored}', not '{wanted}'"),
                    ));
                }
                Ok(any.value)
            }
            CastOperator::Downcast { to } => {
                let Value::Handle(mut handle) = value else {
                    return Err(self.raise(ExceptionKind::InvalidCast, "downcast on a non-handle".to_owned()));
                };
                if handle.is_null() {
                    return Ok(Value::Handle(Handle::null(to)));
                }
                let Some(dynamic) = self.dynamic_type(&handle) else {
                    return Ok(Value::Handle(Handle::null(to)));
                };
                if !self.module.types.is_subtype_of(dynamic, to) {
                    let from = self.module.types.name_of(dynamic).to_owned();
                    let wanted = self.module.types.name_of(to).to_owned();
                    return Err(self.raise(
                        ExceptionKind::InvalidCast,
                        format!("cannot cast an object of type '{from}' to '{wanted}'"),
                    ));
                }
                handle.stored_type = to;
                Ok(Value::Handle(handle))
            }
            CastOperator::Upcast { to } => match value {
                Value::Handle(mut handle) => {
                    if self.module.types.bound(to).is_some() {
                        handle.stored_type = to;
                    }
                    Ok(Value::Handle(handle))
                }
                other => Ok(other),
            },
            CastOperator::NullToHandle { to } => Ok(Value::Handle(Handle::null(to))),
            CastOperator::EnumToInteger => Ok(value),
        }
    }

    // --- shutdown ---

    /// Tears down every manager, reporting surviving heap objects as leaks.
    pub fn shutdown(&mut self) -> Vec<StateEvent> {
        self.unwind_to(0);
        let mut reports = Vec::new();
        for manager in self.managers.iter_mut() {
            reports.extend(manager.delete_all(&mut self.heap));
        }
        for report in reports {
            let type_name = self.module.types.name_of(report.type_id).to_owned();
            self.push_event(StateEvent::MemoryLeak {
                type_name,
                allocated_at: report.allocated_at,
            });
        }
        self.drain_events()
    }
}

impl Drop for ExecutableState {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// --- scalar/vector helpers ---

fn real_binary(op: BinaryOp, a: f64, b: f64, wrap: impl Fn(f64) -> Value) -> Value {
    use BinaryOp as B;
    match op {
        B::Add => wrap(a + b),
        B::Subtract => wrap(a - b),
        B::Multiply => wrap(a * b),
        B::Divide => wrap(a / b),
        B::Modulo => wrap(a % b),
        B::Less => Value::Boolean(a < b),
        B::LessEqual => Value::Boolean(a <= b),
        B::Greater => Value::Boolean(a > b),
        B::GreaterEqual => Value::Boolean(a >= b),
        // Bitwise forms are rejected during analysis; equality earlier.
        _ => Value::Boolean(false),
    }
}

fn vector_zip<const N: usize>(op: BinaryOp, a: &[f32; N], b: &[f32; N]) -> [f32; N] {
    let mut out = [0.0; N];
    for i in 0..N {
        out[i] = match op {
            BinaryOp::Add => a[i] + b[i],
            BinaryOp::Subtract => a[i] - b[i],
            BinaryOp::Multiply => a[i] * b[i],
            BinaryOp::Divide => a[i] / b[i],
            _ => 0.0,
        };
    }
    out
}

fn int_vector_zip<const N: usize>(op: BinaryOp, a: &[i32; N], b: &[i32; N]) -> [i32; N] {
    let mut out = [0; N];
    for i in 0..N {
        out[i] = match op {
            BinaryOp::Add => a[i].wrapping_add(b[i]),
            BinaryOp::Subtract => a[i].wrapping_sub(b[i]),
            BinaryOp::Multiply => a[i].wrapping_mul(b[i]),
            BinaryOp::Divide => {
                if b[i] == 0 {
                    0
                } else {
                    a[i].wrapping_div(b[i])
                }
            }
            _ => 0,
        };
    }
    out
}

fn vector_scale<const N: usize>(op: BinaryOp, a: &[f32; N], s: f32) -> [f32; N] {
    let mut out = *a;
    for component in &mut out {
        *component = match op {
            BinaryOp::Multiply => *component * s,
            BinaryOp::Divide => *component / s,
            _ => *component,
        };
    }
    out
}

fn mat3_mul(a: &[f32; 9], b: &[f32; 9]) -> [f32; 9] {
    let mut out = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            let mut sum = 0.0;
            for k in 0..3 {
                sum += a[row * 3 + k] * b[k * 3 + col];
            }
            out[row * 3 + col] = sum;
        }
    }
    out
}

fn mat4_mul(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0; 16];
    for row in 0..4 {
        for col in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[row * 4 + k] * b[k * 4 + col];
            }
            out[row * 4 + col] = sum;
        }
    }
    out
}

fn mat3_vec(m: &[f32; 9], v: &[f32; 3]) -> [f32; 3] {
    let mut out = [0.0; 3];
    for (row, item) in out.iter_mut().enumerate() {
        *item = m[row * 3] * v[0] + m[row * 3 + 1] * v[1] + m[row * 3 + 2] * v[2];
    }
    out
}

fn mat4_vec(m: &[f32; 16], v: &[f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (row, item) in out.iter_mut().enumerate() {
        *item = m[row * 4] * v[0] + m[row * 4 + 1] * v[1] + m[row * 4 + 2] * v[2] + m[row * 4 + 3] * v[3];
    }
    out
}

/// Scalar numeric conversion to a target primitive.
fn convert_scalar(value: &Value, to: Primitive) -> Value {
    let as_f64 = match value {
        Value::Byte(v) => f64::from(*v),
        Value::Integer(v) => f64::from(*v),
        Value::DoubleInteger(v) => *v as f64,
        Value::Real(v) => f64::from(*v),
        Value::DoubleReal(v) => *v,
        other => return other.clone(),
    };
    let as_i64 = match value {
        Value::Byte(v) => i64::from(*v),
        Value::Integer(v) => i64::from(*v),
        Value::DoubleInteger(v) => *v,
        Value::Real(v) => *v as i64,
        Value::DoubleReal(v) => *v as i64,
        _ => 0,
    };
    match to {
        Primitive::Byte => Value::Byte(as_i64 as u8),
        Primitive::Integer => Value::Integer(as_i64 as i32),
        Primitive::DoubleInteger => Value::DoubleInteger(as_i64),
        Primitive::Real => Value::Real(as_f64 as f32),
        Primitive::DoubleReal => Value::DoubleReal(as_f64),
        _ => value.clone(),
    }
}

// --- thread-local calling state plumbing ---

pub(crate) struct CallingStateGuard {
    previous: Option<u64>,
}

impl CallingStateGuard {
    pub(crate) fn bind(state: &ExecutableState) -> Self {
        let previous = CALLING_STATE.replace(Some(state.state_id));
        Self { previous }
    }
}

impl Drop for CallingStateGuard {
    fn drop(&mut self) {
        CALLING_STATE.set(self.previous);
    }
}
