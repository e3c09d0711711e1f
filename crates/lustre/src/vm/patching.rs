//! Live library patching: installing a newer library over an older one
//! without restarting the state.
//!
//! Patching is only legal while no call frames exist. Every patched old
//! function redirects to its replacement; functions the patch removed
//! rebind to a generated dummy that returns the default-zero value. Heap
//! objects of patched types stay valid: their headers are updated in place
//! and newly added fields live in the tail reserve every allocation carries.

use ahash::AHashMap;

use crate::{
    analyzer::analyze,
    codegen::generate,
    diagnostics::{CompilationErrors, ErrorEvent},
    front::parser::parse_entries,
    function::{Function, FunctionKind},
    handles::HEAP_PATCH_RESERVE_SLOTS,
    ids::{FunctionId, LibraryId, TypeId},
    location::CodeEntry,
    value::Value,
    vm::{Call, ExecResult, ExecutableState},
};

/// Why a patch could not be installed.
#[derive(Debug)]
pub enum PatchError {
    /// Patching requires an empty call stack.
    CallStackNotEmpty,
    /// The replacement library did not compile.
    Compilation(Vec<ErrorEvent>),
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallStackNotEmpty => write!(f, "cannot patch while call frames exist"),
            Self::Compilation(events) => {
                writeln!(f, "the patch library failed to compile:")?;
                for event in events {
                    writeln!(f, "{event}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PatchError {}

/// The native bound to functions a patch removed: returns the default-zero
/// value of its own signature.
fn patch_dummy_native(call: &mut Call<'_>) -> ExecResult<()> {
    let return_type = {
        let function = call.function();
        let state = call.state();
        state.module.function(function).signature.return_type
    };
    let value = {
        let state = call.state();
        if return_type == state.module.core.void {
            return Ok(());
        }
        state.module.types.default_value(return_type)
    };
    call.set_return(value);
    Ok(())
}

/// A structural function key for matching old functions to replacements
/// across libraries (type ids differ, so types compare by name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionKey {
    owner: Option<String>,
    name: String,
    kind: &'static str,
    is_static: bool,
    parameter_types: Vec<String>,
}

impl ExecutableState {
    /// Compiles `entries` as a replacement library and installs it over the
    /// previous definitions of the same names.
    pub fn patch_library(&mut self, entries: &[CodeEntry], library_name: &str) -> Result<LibraryId, PatchError> {
        if !self.frames.is_empty() {
            return Err(PatchError::CallStackNotEmpty);
        }

        let mut errors = CompilationErrors::new();
        let mut tree = parse_entries(entries, &mut errors);
        if errors.was_error {
            return Err(PatchError::Compilation(errors.into_events()));
        }
        let output = analyze(&mut self.module, &mut tree, library_name, entries.to_vec(), &mut errors);
        if errors.was_error {
            return Err(PatchError::Compilation(errors.into_events()));
        }
        generate(&mut self.module, &tree, &output);

        self.install_patches(output.library);
        Ok(output.library)
    }

    fn install_patches(&mut self, new_library: LibraryId) {
        self.install_type_patches(new_library);
        self.install_function_patches(new_library);
        self.update_heap_headers();
    }

    /// Redirects the previous type of each name the new library declares.
    fn install_type_patches(&mut self, new_library: LibraryId) {
        let new_types: Vec<TypeId> = self.module.library(new_library).types.clone();
        for new_type in new_types {
            let name = self.module.types.name_of(new_type).to_owned();
            let previous = self
                .module
                .libraries
                .iter()
                .take(new_library.index())
                .rev()
                .find_map(|library| library.type_names.get(&name).copied());
            if let Some(previous) = previous
                && previous != new_type
            {
                self.patched_types.insert(previous, new_type);
            }
        }
    }

    /// Updates live heap object headers to the patched types, growing
    /// payloads into the tail reserve when the patch added fields.
    fn update_heap_headers(&mut self) {
        let live_slots: Vec<u32> = self.heap.iter_live().map(|(slot, _)| slot).collect();
        for slot in live_slots {
            let Some(current_type) = self.heap.get(slot).map(|object| object.header.type_id) else {
                continue;
            };
            let patched = self.resolve_patched_type(current_type);
            if patched == current_type {
                continue;
            }
            let new_size = self
                .module
                .types
                .bound(patched)
                .map_or(0, |bound| bound.size_slots.max(1))
                + HEAP_PATCH_RESERVE_SLOTS;
            if let Some(object) = self.heap.get_mut(slot) {
                object.header.type_id = patched;
                if (new_size as usize) > object.fields.len() {
                    object.fields.resize(new_size as usize, Value::Empty);
                }
            }
        }
    }

    /// Redirects every old function whose declaring name the new library
    /// redefines; removed functions rebind to the dummy.
    fn install_function_patches(&mut self, new_library: LibraryId) {
        let replacement_index: AHashMap<FunctionKey, FunctionId> = self
            .module
            .library(new_library)
            .functions
            .iter()
            .map(|&function| (self.function_key(function), function))
            .collect();

        // Names (types and free functions) the new library redefines.
        let redefined_types: ahash::AHashSet<String> = self
            .module
            .library(new_library)
            .type_names
            .keys()
            .cloned()
            .collect();
        let redefined_functions: ahash::AHashSet<String> = self
            .module
            .library(new_library)
            .function_names
            .keys()
            .cloned()
            .collect();

        let mut redirects: Vec<(FunctionId, Option<FunctionId>)> = Vec::new();
        for library in self.module.libraries.iter().take(new_library.index()) {
            for &old in &library.functions {
                let declared = self.module.function(old);
                if declared.kind == FunctionKind::PatchDummy {
                    continue;
                }
                let covered = match declared.owner {
                    Some(owner) => redefined_types.contains(self.module.types.name_of(owner)),
                    None => redefined_functions.contains(&declared.name),
                };
                if !covered {
                    continue;
                }
                let key = self.function_key(old);
                redirects.push((old, replacement_index.get(&key).copied()));
            }
        }

        for (old, replacement) in redirects {
            let target = match replacement {
                Some(replacement) => replacement,
                None => self.create_patch_dummy(old),
            };
            if target != old {
                self.patched_functions.insert(old, target);
            }
        }
    }

    fn function_key(&self, function: FunctionId) -> FunctionKey {
        let declared = self.module.function(function);
        FunctionKey {
            owner: declared.owner.map(|owner| self.module.types.name_of(owner).to_owned()),
            name: declared.name.clone(),
            kind: declared.kind.into(),
            is_static: declared.is_static,
            parameter_types: declared
                .signature
                .params
                .iter()
                .map(|param| self.module.types.name_of(param.ty).to_owned())
                .collect(),
        }
    }

    /// A dummy sharing the removed function's signature, so stale delegates
    /// call into a well-defined default instead of missing code.
    fn create_patch_dummy(&mut self, removed: FunctionId) -> FunctionId {
        let template = self.module.function(removed).clone();
        self.module.add_function(Function {
            name: template.name,
            owner: template.owner,
            signature: template.signature,
            delegate_type: template.delegate_type,
            kind: FunctionKind::PatchDummy,
            is_static: template.is_static,
            is_virtual: false,
            is_override: false,
            attributes: Vec::new(),
            location: template.location,
            code: None,
            native: Some(patch_dummy_native),
        })
    }
}
