//! Handle managers: the uniform interface for heap, stack, pointer, and
//! string references.
//!
//! A handle carries the id of its manager, so dereferencing is a single
//! indexed call. Managers resolve handles to storage locations but never own
//! the VM's borrows: heap payloads live in the [`HeapArena`] owned by the
//! executing state, stack payloads live on the state's stack, and the
//! managers translate handles into [`Resolved`] locations the VM reads and
//! writes through.

use ahash::AHashMap;
use bitflags::bitflags;

use crate::{
    ids::{HandleManagerId, TypeId},
    location::CodeLocation,
    value::{Handle, HandleData, Value},
};

/// Extra slots reserved at the tail of every heap payload so a library patch
/// can add fields without moving memory.
pub const HEAP_PATCH_RESERVE_SLOTS: u32 = 4;

bitflags! {
    /// Flags stored in every heap object header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeapObjectFlags: u8 {
        /// The object opted out of reference counting at allocation; it still
        /// supports safe handle behavior and must be deleted explicitly.
        const NON_REFERENCE_COUNTED = 1;
        /// The full native constructor chain completed; destructors are only
        /// safe once this is set.
        const NATIVE_FULLY_CONSTRUCTED = 2;
        /// Registered by the host through the pointer manager: never
        /// deletable, never reported as a leak.
        const HOST_REGISTERED = 4;
    }
}

/// Allocation flags passed to `allocate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeapFlags {
    /// A regular reference counted object.
    #[default]
    ReferenceCounted,
    /// Lives until explicitly deleted, but handles still null out safely.
    NonReferenceCounted,
}

/// What the core should do after a reference release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    /// The count hit zero: the core must run the destructor and delete.
    DeleteObject,
    /// Still alive (or the manager handled teardown itself).
    TakeNoAction,
}

/// The header implicitly allocated in front of every heap payload.
///
/// A handle dereferences successfully only while its recorded uid matches the
/// header's; deletion advances the uid, so every alias reads as null from
/// then on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeader {
    /// The dynamic type; updated in place by library patching.
    pub type_id: TypeId,
    pub uid: u64,
    pub reference_count: u32,
    pub flags: HeapObjectFlags,
}

/// One live heap object: header plus field slots (with tail reserve).
#[derive(Debug)]
pub struct HeapObject {
    pub header: ObjectHeader,
    pub fields: Vec<Value>,
    /// Where the allocating opcode was, for leak reports.
    pub allocated_at: Option<CodeLocation>,
}

/// The slot arena that backs heap (and pointer-registered) objects.
///
/// Slots are recycled through a free list; uids distinguish a recycled slot
/// from the object that used to live there.
#[derive(Debug, Default)]
pub struct HeapArena {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
}

impl HeapArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: HeapObject) -> u32 {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize] = Some(object);
            slot
        } else {
            let slot = u32::try_from(self.slots.len()).expect("heap slot count exceeds u32");
            self.slots.push(Some(object));
            slot
        }
    }

    #[must_use]
    pub fn get(&self, slot: u32) -> Option<&HeapObject> {
        self.slots.get(slot as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut HeapObject> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    pub fn remove(&mut self, slot: u32) -> Option<HeapObject> {
        let object = self.slots.get_mut(slot as usize)?.take()?;
        self.free.push(slot);
        Some(object)
    }

    /// Live `(slot, object)` pairs, in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = (u32, &HeapObject)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|object| (i as u32, object)))
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Tracks which scope uids are still live so stack handles can null out the
/// moment their scope exits.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    live: ahash::AHashSet<u64>,
    next_uid: u64,
}

impl ScopeRegistry {
    /// Issues a fresh scope uid and marks it live.
    pub fn enter(&mut self) -> u64 {
        self.next_uid += 1;
        self.live.insert(self.next_uid);
        self.next_uid
    }

    /// Retires a scope; handles recording its uid dereference to null from
    /// here on.
    pub fn retire(&mut self, uid: u64) {
        self.live.remove(&uid);
    }

    #[must_use]
    pub fn is_live(&self, uid: u64) -> bool {
        self.live.contains(&uid)
    }
}

/// A storage location to initialize a handle from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRef {
    Heap { slot: u32 },
    Stack { scope_uid: u64, slot: u32 },
    Pointer { key: u64 },
}

/// Where a dereferenced handle's payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Invalidated, out of scope, or literally null.
    Null,
    /// Fields live in the arena object at this slot.
    HeapObject(u32),
    /// Fields live on the VM stack starting at this absolute slot.
    StackLocation(u32),
}

/// A surviving heap object reported at state shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakReport {
    pub type_id: TypeId,
    pub allocated_at: Option<CodeLocation>,
}

/// The uniform interface every handle flavor implements.
///
/// Objects allocated within the language go through the heap manager; hosts
/// can register shared managers for their own handle types, which must then
/// be thread safe.
pub trait HandleManager: std::fmt::Debug {
    /// The manager's name, for debugging and exception messages.
    fn name(&self) -> &'static str;

    /// Initializes a handle that will later dereference back to `object`.
    fn object_to_handle(&mut self, heap: &HeapArena, object: ObjectRef, stored_type: TypeId) -> Handle;

    /// Dereferences a handle to the location of its payload, or null.
    fn resolve(&self, heap: &HeapArena, scopes: &ScopeRegistry, handle: &Handle) -> Resolved;

    /// Allocates managed storage and returns a handle to it. Only the heap
    /// manager supports this by default.
    fn allocate(
        &mut self,
        heap: &mut HeapArena,
        ty: TypeId,
        size_slots: u32,
        flags: HeapFlags,
        location: Option<CodeLocation>,
    ) -> Option<Handle> {
        let _ = (heap, ty, size_slots, flags, location);
        None
    }

    /// Adds a reference. The default assumes the object is global and never
    /// dies.
    fn add_reference(&mut self, heap: &mut HeapArena, handle: &Handle) {
        let _ = (heap, handle);
    }

    /// Releases a reference and says whether the core should now delete.
    /// May destroy the object itself, in which case it returns
    /// `TakeNoAction`.
    fn release_reference(&mut self, heap: &mut HeapArena, handle: &Handle) -> ReleaseResult {
        let _ = (heap, handle);
        ReleaseResult::TakeNoAction
    }

    /// Frees the object's memory; every alias must dereference to null
    /// afterwards. Destructors have already run. Only called when
    /// `can_delete` is true and the handle is not null.
    fn delete(&mut self, heap: &mut HeapArena, handle: &Handle) {
        let _ = (heap, handle);
    }

    /// Whether the language `delete` is legal on this handle. Returning
    /// false produces a non-deletable-object exception.
    fn can_delete(&self, heap: &HeapArena, handle: &Handle) -> bool {
        let _ = (heap, handle);
        false
    }

    /// Hash for containers; all null handles hash to 0.
    fn hash(&self, heap: &HeapArena, scopes: &ScopeRegistry, handle: &Handle) -> u64 {
        match self.resolve(heap, scopes, handle) {
            Resolved::Null => 0,
            Resolved::HeapObject(slot) => u64::from(slot) + 1,
            Resolved::StackLocation(slot) => (u64::from(slot) << 32) | 1,
        }
    }

    /// Structural handle equality; the default compares resolved locations.
    fn is_equal(&self, heap: &HeapArena, scopes: &ScopeRegistry, a: &Handle, b: &Handle) -> bool {
        self.resolve(heap, scopes, a) == self.resolve(heap, scopes, b)
    }

    /// Deletes everything this manager still holds at state shutdown and
    /// reports what was still alive as leaks.
    fn delete_all(&mut self, heap: &mut HeapArena) -> Vec<LeakReport> {
        let _ = heap;
        Vec::new()
    }
}

/// Manages heap objects allocated by the language.
#[derive(Debug, Default)]
pub struct HeapManager {
    uid_counter: u64,
}

impl HeapManager {
    fn next_uid(&mut self) -> u64 {
        self.uid_counter += 1;
        self.uid_counter
    }
}

impl HandleManager for HeapManager {
    fn name(&self) -> &'static str {
        "Heap"
    }

    fn object_to_handle(&mut self, heap: &HeapArena, object: ObjectRef, stored_type: TypeId) -> Handle {
        // The arena is the live-object set: a freed slot yields a null
        // handle rather than resurrecting whatever lived there.
        let ObjectRef::Heap { slot } = object else {
            return Handle::null(stored_type);
        };
        match heap.get(slot) {
            Some(live) => Handle {
                manager: HandleManagerId::HEAP,
                stored_type,
                data: HandleData::Heap {
                    slot,
                    uid: live.header.uid,
                },
            },
            None => Handle::null(stored_type),
        }
    }

    fn resolve(&self, heap: &HeapArena, _scopes: &ScopeRegistry, handle: &Handle) -> Resolved {
        let HandleData::Heap { slot, uid } = handle.data else {
            return Resolved::Null;
        };
        match heap.get(slot) {
            // A different object may occupy the same slot; the uid is the
            // proof this handle's referent is still the one allocated.
            Some(object) if object.header.uid == uid => Resolved::HeapObject(slot),
            _ => Resolved::Null,
        }
    }

    fn allocate(
        &mut self,
        heap: &mut HeapArena,
        ty: TypeId,
        size_slots: u32,
        flags: HeapFlags,
        location: Option<CodeLocation>,
    ) -> Option<Handle> {
        let uid = self.next_uid();
        let object_flags = match flags {
            HeapFlags::ReferenceCounted => HeapObjectFlags::empty(),
            HeapFlags::NonReferenceCounted => HeapObjectFlags::NON_REFERENCE_COUNTED,
        };
        let total = (size_slots + HEAP_PATCH_RESERVE_SLOTS) as usize;
        let slot = heap.insert(HeapObject {
            header: ObjectHeader {
                type_id: ty,
                uid,
                reference_count: 1,
                flags: object_flags,
            },
            fields: vec![Value::Empty; total],
            allocated_at: location,
        });
        Some(Handle {
            manager: HandleManagerId::HEAP,
            stored_type: ty,
            data: HandleData::Heap { slot, uid },
        })
    }

    fn add_reference(&mut self, heap: &mut HeapArena, handle: &Handle) {
        let HandleData::Heap { slot, uid } = handle.data else {
            return;
        };
        if let Some(object) = heap.get_mut(slot)
            && object.header.uid == uid
            && !object.header.flags.contains(HeapObjectFlags::NON_REFERENCE_COUNTED)
        {
            object.header.reference_count += 1;
        }
    }

    fn release_reference(&mut self, heap: &mut HeapArena, handle: &Handle) -> ReleaseResult {
        let HandleData::Heap { slot, uid } = handle.data else {
            return ReleaseResult::TakeNoAction;
        };
        let Some(object) = heap.get_mut(slot) else {
            return ReleaseResult::TakeNoAction;
        };
        if object.header.uid != uid || object.header.flags.contains(HeapObjectFlags::NON_REFERENCE_COUNTED) {
            return ReleaseResult::TakeNoAction;
        }
        object.header.reference_count = object.header.reference_count.saturating_sub(1);
        if object.header.reference_count == 0 {
            ReleaseResult::DeleteObject
        } else {
            ReleaseResult::TakeNoAction
        }
    }

    fn delete(&mut self, heap: &mut HeapArena, handle: &Handle) {
        let HandleData::Heap { slot, uid } = handle.data else {
            return;
        };
        if heap.get(slot).is_some_and(|object| object.header.uid == uid) {
            heap.remove(slot);
        }
    }

    fn can_delete(&self, heap: &HeapArena, handle: &Handle) -> bool {
        let HandleData::Heap { slot, uid } = handle.data else {
            return false;
        };
        heap.get(slot).is_some_and(|object| object.header.uid == uid)
    }

    fn delete_all(&mut self, heap: &mut HeapArena) -> Vec<LeakReport> {
        let leaked: Vec<(u32, LeakReport)> = heap
            .iter_live()
            .filter(|(_, object)| !object.header.flags.contains(HeapObjectFlags::HOST_REGISTERED))
            .map(|(slot, object)| {
                (
                    slot,
                    LeakReport {
                        type_id: object.header.type_id,
                        allocated_at: object.allocated_at.clone(),
                    },
                )
            })
            .collect();
        let mut reports = Vec::with_capacity(leaked.len());
        for (slot, report) in leaked {
            heap.remove(slot);
            reports.push(report);
        }
        reports
    }
}

/// Manages objects constructed in stack frames.
///
/// Allocates nothing: the handle encodes the owning scope's uid and the
/// absolute stack slot, and nulls out once the scope is retired.
#[derive(Debug, Default)]
pub struct StackManager;

impl HandleManager for StackManager {
    fn name(&self) -> &'static str {
        "Stack"
    }

    fn object_to_handle(&mut self, _heap: &HeapArena, object: ObjectRef, stored_type: TypeId) -> Handle {
        let ObjectRef::Stack { scope_uid, slot } = object else {
            return Handle::null(stored_type);
        };
        Handle {
            manager: HandleManagerId::STACK,
            stored_type,
            data: HandleData::Stack { scope_uid, slot },
        }
    }

    fn resolve(&self, _heap: &HeapArena, scopes: &ScopeRegistry, handle: &Handle) -> Resolved {
        let HandleData::Stack { scope_uid, slot } = handle.data else {
            return Resolved::Null;
        };
        if scopes.is_live(scope_uid) {
            Resolved::StackLocation(slot)
        } else {
            Resolved::Null
        }
    }
}

/// Manages raw host pointers, assumed global: never reference counted, never
/// deletable.
#[derive(Debug, Default)]
pub struct PointerManager {
    objects: AHashMap<u64, u32>,
    next_key: u64,
}

impl PointerManager {
    /// Registers a host object's payload, returning the key to build handles
    /// with.
    pub fn register(&mut self, heap: &mut HeapArena, type_id: TypeId, fields: Vec<Value>) -> u64 {
        self.next_key += 1;
        let slot = heap.insert(HeapObject {
            header: ObjectHeader {
                type_id,
                uid: 0,
                reference_count: 0,
                flags: HeapObjectFlags::HOST_REGISTERED,
            },
            fields,
            allocated_at: None,
        });
        self.objects.insert(self.next_key, slot);
        self.next_key
    }
}

impl HandleManager for PointerManager {
    fn name(&self) -> &'static str {
        "Pointer"
    }

    fn object_to_handle(&mut self, _heap: &HeapArena, object: ObjectRef, stored_type: TypeId) -> Handle {
        let ObjectRef::Pointer { key } = object else {
            return Handle::null(stored_type);
        };
        Handle {
            manager: HandleManagerId::POINTER,
            stored_type,
            data: HandleData::Pointer { key },
        }
    }

    fn resolve(&self, _heap: &HeapArena, _scopes: &ScopeRegistry, handle: &Handle) -> Resolved {
        let HandleData::Pointer { key } = handle.data else {
            return Resolved::Null;
        };
        match self.objects.get(&key) {
            Some(&slot) => Resolved::HeapObject(slot),
            None => Resolved::Null,
        }
    }
}

/// Manages string handles, whose payload is carried inline.
///
/// Strings are not field addressable; equality is structural and hashing is
/// by content.
#[derive(Debug, Default)]
pub struct StringManager;

impl HandleManager for StringManager {
    fn name(&self) -> &'static str {
        "String"
    }

    fn object_to_handle(&mut self, _heap: &HeapArena, _object: ObjectRef, stored_type: TypeId) -> Handle {
        Handle::null(stored_type)
    }

    fn resolve(&self, _heap: &HeapArena, _scopes: &ScopeRegistry, _handle: &Handle) -> Resolved {
        Resolved::Null
    }

    fn hash(&self, _heap: &HeapArena, _scopes: &ScopeRegistry, handle: &Handle) -> u64 {
        use std::hash::{Hash, Hasher};
        let HandleData::Str(text) = &handle.data else {
            return 0;
        };
        let mut hasher = ahash::AHasher::default();
        text.hash(&mut hasher);
        hasher.finish()
    }

    fn is_equal(&self, _heap: &HeapArena, _scopes: &ScopeRegistry, a: &Handle, b: &Handle) -> bool {
        match (&a.data, &b.data) {
            (HandleData::Str(left), HandleData::Str(right)) => left == right,
            (HandleData::Empty, HandleData::Empty) => true,
            _ => false,
        }
    }
}

/// The per-state collection of managers, indexed by [`HandleManagerId`].
#[derive(Debug)]
pub struct HandleManagers {
    managers: Vec<Box<dyn HandleManager>>,
}

impl Default for HandleManagers {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleManagers {
    /// The four built-in managers, at their fixed ids.
    #[must_use]
    pub fn new() -> Self {
        Self {
            managers: vec![
                Box::new(HeapManager::default()),
                Box::new(StackManager),
                Box::new(PointerManager::default()),
                Box::new(StringManager),
            ],
        }
    }

    /// Registers a shared manager, returning its id. Shared managers must be
    /// internally thread safe.
    pub fn add_shared(&mut self, manager: Box<dyn HandleManager>) -> HandleManagerId {
        let id = HandleManagerId(u16::try_from(self.managers.len()).expect("manager count exceeds u16"));
        self.managers.push(manager);
        id
    }

    #[must_use]
    pub fn get(&self, id: HandleManagerId) -> &dyn HandleManager {
        self.managers[id.index()].as_ref()
    }

    pub fn get_mut(&mut self, id: HandleManagerId) -> &mut dyn HandleManager {
        self.managers[id.index()].as_mut()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn HandleManager>> {
        self.managers.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (HeapArena, ScopeRegistry, HeapManager) {
        (HeapArena::new(), ScopeRegistry::default(), HeapManager::default())
    }

    #[test]
    fn allocate_and_resolve() {
        let (mut heap, scopes, mut manager) = setup();
        let handle = manager
            .allocate(&mut heap, TypeId(7), 2, HeapFlags::ReferenceCounted, None)
            .unwrap();
        assert_eq!(manager.resolve(&heap, &scopes, &handle), Resolved::HeapObject(0));
        // Tail reserve is part of the payload.
        let object = heap.get(0).unwrap();
        assert_eq!(object.fields.len(), (2 + HEAP_PATCH_RESERVE_SLOTS) as usize);
    }

    #[test]
    fn deleted_object_nulls_all_aliases() {
        let (mut heap, scopes, mut manager) = setup();
        let handle = manager
            .allocate(&mut heap, TypeId(1), 1, HeapFlags::ReferenceCounted, None)
            .unwrap();
        let alias = handle.clone();
        manager.delete(&mut heap, &handle);
        assert_eq!(manager.resolve(&heap, &scopes, &alias), Resolved::Null);
    }

    #[test]
    fn recycled_slot_does_not_resurrect() {
        let (mut heap, scopes, mut manager) = setup();
        let first = manager
            .allocate(&mut heap, TypeId(1), 1, HeapFlags::ReferenceCounted, None)
            .unwrap();
        manager.delete(&mut heap, &first);
        // New object reuses slot 0 but has a fresh uid.
        let second = manager
            .allocate(&mut heap, TypeId(1), 1, HeapFlags::ReferenceCounted, None)
            .unwrap();
        assert_eq!(manager.resolve(&heap, &scopes, &second), Resolved::HeapObject(0));
        assert_eq!(manager.resolve(&heap, &scopes, &first), Resolved::Null);
    }

    #[test]
    fn refcount_release_requests_delete_at_zero() {
        let (mut heap, _scopes, mut manager) = setup();
        let handle = manager
            .allocate(&mut heap, TypeId(1), 1, HeapFlags::ReferenceCounted, None)
            .unwrap();
        manager.add_reference(&mut heap, &handle);
        assert_eq!(manager.release_reference(&mut heap, &handle), ReleaseResult::TakeNoAction);
        assert_eq!(manager.release_reference(&mut heap, &handle), ReleaseResult::DeleteObject);
    }

    #[test]
    fn non_refcounted_objects_ignore_releases() {
        let (mut heap, _scopes, mut manager) = setup();
        let handle = manager
            .allocate(&mut heap, TypeId(1), 1, HeapFlags::NonReferenceCounted, None)
            .unwrap();
        assert_eq!(manager.release_reference(&mut heap, &handle), ReleaseResult::TakeNoAction);
    }

    #[test]
    fn stack_handles_null_after_scope_retires() {
        let mut scopes = ScopeRegistry::default();
        let heap = HeapArena::new();
        let mut manager = StackManager;
        let uid = scopes.enter();
        let handle = manager.object_to_handle(&heap, ObjectRef::Stack { scope_uid: uid, slot: 12 }, TypeId(3));
        assert_eq!(manager.resolve(&heap, &scopes, &handle), Resolved::StackLocation(12));
        scopes.retire(uid);
        assert_eq!(manager.resolve(&heap, &scopes, &handle), Resolved::Null);
    }

    #[test]
    fn delete_all_reports_leaks() {
        let (mut heap, _scopes, mut manager) = setup();
        let location = CodeLocation::point("leak.lus", 3, 1);
        manager
            .allocate(&mut heap, TypeId(9), 1, HeapFlags::ReferenceCounted, Some(location.clone()))
            .unwrap();
        let reports = manager.delete_all(&mut heap);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].type_id, TypeId(9));
        assert_eq!(reports[0].allocated_at, Some(location));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn string_manager_structural_equality_and_hash() {
        let heap = HeapArena::new();
        let scopes = ScopeRegistry::default();
        let manager = StringManager;
        let a = Handle {
            manager: HandleManagerId::STRING,
            stored_type: TypeId(0),
            data: HandleData::Str("claws".into()),
        };
        let b = Handle {
            manager: HandleManagerId::STRING,
            stored_type: TypeId(0),
            data: HandleData::Str("claws".into()),
        };
        assert!(manager.is_equal(&heap, &scopes, &a, &b));
        assert_eq!(
            manager.hash(&heap, &scopes, &a),
            manager.hash(&heap, &scopes, &b)
        );
    }
}
