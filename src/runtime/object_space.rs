//! Object space: the registry of host values reachable from guest code.
//!
//! Guest code never sees host values directly. It holds [`Handle`]s, and the
//! object space maps each live handle to `(value, refcount)`. An identity index
//! deduplicates repeated retains of the same value so one value has at most
//! one live handle.
//!
//! Handle `0` is never allocated and handle `1` is the realm's global object.
//! The global entry is pinned: the space holds one reference of its own, so
//! balanced retain/release pairs from guest code can never free it.
//!
//! Two slot layouts are provided behind [`SlotStorage`]:
//! - [`DenseSlots`]: a `Vec` indexed by handle; freed slots go on a free list
//!   and are handed out again.
//! - [`SparseSlots`]: a map keyed by handle; handles grow monotonically.

use std::collections::HashMap;
use std::fmt;

use super::config::SpaceRepr;
use super::error::BridgeError;
use super::value::{HostValue, IdentityKey};

/// A 32-bit reference to a live host value, valid only on its owning thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Never refers to a value.
    pub const INVALID: Handle = Handle(0);
    /// The host's global object.
    pub const GLOBAL: Handle = Handle(1);
    /// First handle available to ordinary values.
    pub const FIRST_DYNAMIC: u32 = 2;

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Reinterpret an i32 register as a handle (bit pattern preserved).
    #[inline]
    pub const fn from_wire(wire: i32) -> Self {
        Self(wire as u32)
    }

    /// The handle as an i32 register (bit pattern preserved).
    #[inline]
    pub const fn to_wire(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// One live entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: HostValue,
    pub refcount: u32,
}

/// Storage of entries by handle.
pub trait SlotStorage: Send {
    /// Store a new entry and return its handle. Never returns a live handle.
    fn allocate(&mut self, entry: Entry) -> Handle;
    /// Place an entry at a fixed handle (used for the reserved global).
    fn install(&mut self, handle: Handle, entry: Entry);
    fn get(&self, handle: Handle) -> Option<&Entry>;
    fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry>;
    fn remove(&mut self, handle: Handle) -> Option<Entry>;
    /// Number of live entries.
    fn len(&self) -> usize;
}

/// Slot array with a free list.
#[derive(Debug)]
pub struct DenseSlots {
    slots: Vec<Option<Entry>>,
    free_list: Vec<u32>,
    live: usize,
}

impl DenseSlots {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(Handle::FIRST_DYNAMIC as usize));
        slots.resize_with(Handle::FIRST_DYNAMIC as usize, || None);
        Self {
            slots,
            free_list: Vec::new(),
            live: 0,
        }
    }
}

impl SlotStorage for DenseSlots {
    fn allocate(&mut self, entry: Entry) -> Handle {
        self.live += 1;
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(entry);
            Handle(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(entry));
            Handle(idx)
        }
    }

    fn install(&mut self, handle: Handle, entry: Entry) {
        let idx = handle.0 as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        if self.slots[idx].replace(entry).is_none() {
            self.live += 1;
        }
    }

    fn get(&self, handle: Handle) -> Option<&Entry> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.slots.get_mut(handle.0 as usize)?.as_mut()
    }

    fn remove(&mut self, handle: Handle) -> Option<Entry> {
        let entry = self.slots.get_mut(handle.0 as usize)?.take()?;
        self.live -= 1;
        if handle.0 >= Handle::FIRST_DYNAMIC {
            self.free_list.push(handle.0);
        }
        Some(entry)
    }

    fn len(&self) -> usize {
        self.live
    }
}

/// Map keyed by handle with monotonic allocation.
#[derive(Debug)]
pub struct SparseSlots {
    entries: HashMap<u32, Entry>,
    next: u32,
}

impl Default for SparseSlots {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next: Handle::FIRST_DYNAMIC,
        }
    }
}

impl SlotStorage for SparseSlots {
    fn allocate(&mut self, entry: Entry) -> Handle {
        let id = self.next;
        // Wrapping past u32::MAX would hand out 0 and 1; skip them and anything still live.
        loop {
            self.next = self.next.wrapping_add(1).max(Handle::FIRST_DYNAMIC);
            if !self.entries.contains_key(&self.next) {
                break;
            }
        }
        self.entries.insert(id, entry);
        Handle(id)
    }

    fn install(&mut self, handle: Handle, entry: Entry) {
        self.entries.insert(handle.0, entry);
    }

    fn get(&self, handle: Handle) -> Option<&Entry> {
        self.entries.get(&handle.0)
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.entries.get_mut(&handle.0)
    }

    fn remove(&mut self, handle: Handle) -> Option<Entry> {
        self.entries.remove(&handle.0)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Refcounted handle registry for one thread.
pub struct ObjectSpace {
    slots: Box<dyn SlotStorage>,
    by_identity: HashMap<IdentityKey, Handle>,
    repr: SpaceRepr,
}

impl fmt::Debug for ObjectSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSpace")
            .field("repr", &self.repr)
            .field("live", &self.slots.len())
            .finish()
    }
}

impl ObjectSpace {
    /// A space whose handle `1` refers to `global`.
    pub fn new(repr: SpaceRepr, initial_capacity: usize, global: HostValue) -> Self {
        let slots: Box<dyn SlotStorage> = match repr {
            SpaceRepr::Dense => Box::new(DenseSlots::with_capacity(initial_capacity)),
            SpaceRepr::Sparse => Box::new(SparseSlots::default()),
        };
        let mut space = Self {
            slots,
            by_identity: HashMap::new(),
            repr,
        };
        space.by_identity.insert(global.identity(), Handle::GLOBAL);
        space.slots.install(
            Handle::GLOBAL,
            Entry {
                value: global,
                refcount: 1,
            },
        );
        space
    }

    pub fn repr(&self) -> SpaceRepr {
        self.repr
    }

    /// Return the handle for `value`, allocating one on first sight.
    pub fn retain(&mut self, value: HostValue) -> Handle {
        let key = value.identity();
        if let Some(&handle) = self.by_identity.get(&key) {
            if let Some(entry) = self.slots.get_mut(handle) {
                entry.refcount += 1;
                return handle;
            }
        }
        let handle = self.slots.allocate(Entry { value, refcount: 1 });
        self.by_identity.insert(key, handle);
        crate::bridge_trace!("object-space", "alloc {:?}", handle);
        handle
    }

    /// Add a reference to a live handle.
    pub fn retain_by_ref(&mut self, handle: Handle) -> Result<Handle, BridgeError> {
        let entry = self
            .slots
            .get_mut(handle)
            .ok_or_else(|| BridgeError::invalid(handle, "retain"))?;
        entry.refcount += 1;
        Ok(handle)
    }

    /// Drop one reference; the entry goes away with its last reference.
    pub fn release(&mut self, handle: Handle) -> Result<(), BridgeError> {
        let entry = self
            .slots
            .get_mut(handle)
            .ok_or_else(|| BridgeError::invalid(handle, "release"))?;
        if entry.refcount > 1 || handle == Handle::GLOBAL {
            entry.refcount = entry.refcount.saturating_sub(1).max(1);
            return Ok(());
        }
        if let Some(entry) = self.slots.remove(handle) {
            let key = entry.value.identity();
            // Only unmap the identity if it still points here.
            if self.by_identity.get(&key) == Some(&handle) {
                self.by_identity.remove(&key);
            }
            crate::bridge_trace!("object-space", "free {:?}", handle);
        }
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Result<&HostValue, BridgeError> {
        self.slots
            .get(handle)
            .map(|e| &e.value)
            .ok_or_else(|| BridgeError::invalid(handle, "read"))
    }

    /// Current refcount, `None` if the handle is not live.
    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.slots.get(handle).map(|e| e.refcount)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.get(handle).is_some()
    }

    /// Handle currently assigned to `value`, if any.
    pub fn lookup(&self, value: &HostValue) -> Option<Handle> {
        self.by_identity.get(&value.identity()).copied()
    }

    /// Number of live entries, including the global object.
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }
}
