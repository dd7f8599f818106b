//! A realm is one thread's host environment.
//!
//! It owns the thread's object space, the sticky exception slot and the global
//! object, and dispatches calls into the shared import table. Everything except
//! the finalizer queue must be touched from the owning thread only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, ThreadId};

use super::r#async::executor::Scheduler;
use super::r#async::promise::HostPromise;
use super::abi::{LibraryFeatures, RawKind, RawValue, WireValue};
use super::closure::ClosureTable;
use super::config::RuntimeConfig;
use super::error::{BridgeError, HostException, ProtocolMisuse, ThreadIndex, fatal};
use super::object_space::{Handle, ObjectSpace};
use super::value::{HostObject, HostValue, lock};

/// A host-side import: receives the calling realm and the lowered arguments.
pub type ImportFn =
    Arc<dyn Fn(&Realm, &[WireValue]) -> Result<WireValue, HostValue> + Send + Sync>;

/// Imports shared by every realm of one runtime.
#[derive(Clone, Default)]
pub struct ImportTable {
    entries: Arc<RwLock<HashMap<String, ImportFn>>>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(&Realm, &[WireValue]) -> Result<WireValue, HostValue> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<ImportFn> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        f.debug_struct("ImportTable").field("names", &names).finish()
    }
}

pub struct Realm {
    thread: ThreadIndex,
    owner: ThreadId,
    this: Weak<Realm>,
    space: Mutex<ObjectSpace>,
    exception: Mutex<Option<HostValue>>,
    global: HostObject,
    features: LibraryFeatures,
    imports: ImportTable,
    scheduler: Arc<dyn Scheduler>,
    /// Handles whose guest references were dropped, awaiting release.
    finalizers: Mutex<Vec<Handle>>,
    /// Strings lowered for the next import call, not yet dispatched.
    lowered: Mutex<Vec<Handle>>,
    /// Lowered strings of each import call in progress, innermost last.
    frames: Mutex<Vec<Vec<Handle>>>,
    pub(crate) closures: ClosureTable,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("thread", &self.thread)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Create a realm owned by the calling thread.
    pub fn new(
        thread: ThreadIndex,
        config: &RuntimeConfig,
        features: LibraryFeatures,
        imports: ImportTable,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let global = HostObject::with_class("global");
        let space = ObjectSpace::new(
            config.object_space,
            config.initial_capacity,
            HostValue::Object(global.clone()),
        );
        Arc::new_cyclic(|this| Realm {
            thread,
            owner: thread::current().id(),
            this: this.clone(),
            space: Mutex::new(space),
            exception: Mutex::new(None),
            global,
            features,
            imports,
            scheduler,
            finalizers: Mutex::new(Vec::new()),
            lowered: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            closures: ClosureTable::new(),
        })
    }

    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    pub fn features(&self) -> LibraryFeatures {
        self.features
    }

    pub fn global(&self) -> &HostObject {
        &self.global
    }

    pub fn imports(&self) -> &ImportTable {
        &self.imports
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Realm>> {
        self.this.upgrade()
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Abort unless called from the owning thread.
    #[track_caller]
    pub fn assert_owner(&self) {
        if !self.is_owner_thread() {
            fatal(ProtocolMisuse::ForeignThreadAccess { owner: self.thread });
        }
    }

    #[track_caller]
    fn space(&self) -> MutexGuard<'_, ObjectSpace> {
        self.assert_owner();
        lock(&self.space)
    }

    // ---------------------------------------------------------------------
    // Object space
    // ---------------------------------------------------------------------

    pub fn retain(&self, value: HostValue) -> Handle {
        self.space().retain(value)
    }

    pub fn retain_by_ref(&self, handle: Handle) -> Result<Handle, BridgeError> {
        self.space().retain_by_ref(handle)
    }

    pub fn release(&self, handle: Handle) -> Result<(), BridgeError> {
        self.space().release(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<HostValue, BridgeError> {
        self.space().get(handle).cloned()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.space().contains(handle)
    }

    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.space().refcount(handle)
    }

    pub fn live_count(&self) -> usize {
        self.space().live_count()
    }

    /// Queue `handle` for release by the host's finalizer. Safe from any thread.
    pub fn schedule_finalizer(&self, handle: Handle) {
        let first = {
            let mut pending = lock(&self.finalizers);
            pending.push(handle);
            pending.len() == 1
        };
        if first {
            let realm = self.this.clone();
            self.scheduler.queue_microtask(Box::new(move || {
                if let Some(realm) = realm.upgrade() {
                    realm.collect_garbage();
                }
            }));
        }
    }

    /// Run pending finalizers now; returns how many handles were released.
    pub fn collect_garbage(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.finalizers));
        if pending.is_empty() {
            return 0;
        }
        let mut space = self.space();
        let mut released = 0;
        for handle in pending {
            match space.release(handle) {
                Ok(()) => released += 1,
                Err(e) => crate::bridge_trace!("finalizer", "{}", e),
            }
        }
        released
    }

    // ---------------------------------------------------------------------
    // Sticky exception slot
    // ---------------------------------------------------------------------

    /// Record a thrown value. An unchecked earlier exception is replaced.
    pub fn set_exception(&self, thrown: HostValue) {
        let mut slot = lock(&self.exception);
        if let Some(previous) = slot.as_ref() {
            crate::bridge_trace!(
                "exception",
                "{}: overwriting unchecked exception `{}`",
                self.thread,
                previous
            );
        }
        *slot = Some(thrown);
    }

    /// Clear and return the pending exception.
    pub fn take_exception(&self) -> Option<HostValue> {
        lock(&self.exception).take()
    }

    pub fn has_pending_exception(&self) -> bool {
        lock(&self.exception).is_some()
    }

    /// Drain the slot into a `Result`.
    pub fn check_exception(&self) -> Result<(), BridgeError> {
        match self.take_exception() {
            Some(thrown) => Err(BridgeError::HostException(HostException::new(thrown))),
            None => Ok(()),
        }
    }

    /// Invoke the import `name`. A throw lands in the sticky slot and the
    /// result is `Void`.
    ///
    /// Strings lowered for the call belong to it: whatever the import did not
    /// consume is released once it returns, thrown or not.
    pub fn invoke_import(&self, name: &str, args: &[WireValue]) -> WireValue {
        self.assert_owner();
        let owned = std::mem::take(&mut *lock(&self.lowered));
        lock(&self.frames).push(owned);

        let outcome = match self.imports.get(name) {
            Some(import) => import(self, args),
            None => Err(HostValue::type_error(&format!(
                "{} is not an imported function",
                name
            ))),
        };

        let leftovers = lock(&self.frames).pop().unwrap_or_default();
        for handle in leftovers {
            if let Err(e) = self.release(handle) {
                crate::bridge_trace!("import", "{}: {}", name, e);
            }
        }

        match outcome {
            Ok(ret) => ret,
            Err(thrown) => {
                self.set_exception(thrown);
                WireValue::Void
            }
        }
    }

    // ---------------------------------------------------------------------
    // Strings
    // ---------------------------------------------------------------------

    /// Materialize a host string and return an owned handle to it.
    pub fn make_string(&self, text: &str) -> Handle {
        self.retain(HostValue::string(text))
    }

    /// UTF-8 length of the string behind `handle`.
    pub fn string_len(&self, handle: Handle) -> Result<usize, BridgeError> {
        match self.get(handle)? {
            HostValue::String(s) => Ok(s.len()),
            other => Err(BridgeError::mismatch("string", other.type_of())),
        }
    }

    /// Copy the string's bytes into `buf`; returns the number copied.
    pub fn decode_string(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, BridgeError> {
        match self.get(handle)? {
            HostValue::String(s) => {
                let n = s.len().min(buf.len());
                buf[..n].copy_from_slice(&s.as_bytes()[..n]);
                Ok(n)
            }
            other => Err(BridgeError::mismatch("string", other.type_of())),
        }
    }

    /// Materialize a string argument for an import call. The call owns the
    /// handle until the import consumes it.
    pub fn lower_string(&self, text: &str) -> Handle {
        let handle = self.make_string(text);
        lock(&self.lowered).push(handle);
        handle
    }

    /// Take `handle` off the current call's unconsumed strings, if it is there.
    fn claim_lowered(&self, handle: Handle) {
        let mut frames = lock(&self.frames);
        let mut pending = lock(&self.lowered);
        let list = match frames.last_mut() {
            Some(frame) if frame.contains(&handle) => frame,
            _ => &mut *pending,
        };
        if let Some(i) = list.iter().position(|h| *h == handle) {
            list.swap_remove(i);
        }
    }

    /// Decode the string behind an owned handle and release the handle,
    /// whether or not it held a string.
    pub fn load_string(&self, handle: Handle) -> Result<String, BridgeError> {
        self.claim_lowered(handle);
        let decoded = self.string_len(handle).and_then(|len| {
            let mut buf = vec![0u8; len];
            let copied = self.decode_string(handle, &mut buf)?;
            buf.truncate(copied);
            String::from_utf8(buf).map_err(|e| BridgeError::mismatch("utf-8 string", e))
        });
        if self.contains(handle) {
            self.release(handle)?;
        }
        decoded
    }

    // ---------------------------------------------------------------------
    // Helpers for import implementations
    // ---------------------------------------------------------------------

    fn arg(&self, args: &[WireValue], index: usize) -> Result<WireValue, HostValue> {
        args.get(index).copied().ok_or_else(|| {
            HostValue::type_error(&format!("missing argument {}", index))
        })
    }

    /// String argument; consumes the handle the caller lowered.
    pub fn string_arg(&self, args: &[WireValue], index: usize) -> Result<String, HostValue> {
        let handle = self
            .arg(args, index)?
            .as_handle()
            .map_err(|e| HostValue::type_error(&e.to_string()))?;
        self.load_string(handle)
            .map_err(|e| HostValue::type_error(&e.to_string()))
    }

    /// Object argument; the handle stays owned by the caller.
    pub fn object_arg(&self, args: &[WireValue], index: usize) -> Result<HostObject, HostValue> {
        let handle = self
            .arg(args, index)?
            .as_handle()
            .map_err(|e| HostValue::type_error(&e.to_string()))?;
        match self.get(handle) {
            Ok(HostValue::Object(obj)) => Ok(obj),
            Ok(other) => Err(HostValue::type_error(&format!(
                "expected an object, got {}",
                other.type_of()
            ))),
            Err(e) => Err(HostValue::type_error(&e.to_string())),
        }
    }

    pub fn number_arg(&self, args: &[WireValue], index: usize) -> Result<f64, HostValue> {
        match self.arg(args, index)? {
            WireValue::F64(v) => Ok(v),
            WireValue::F32(v) => Ok(v as f64),
            WireValue::I32(v) => Ok(v as f64),
            WireValue::Void => Err(HostValue::type_error("expected a number")),
        }
    }

    pub fn bool_arg(&self, args: &[WireValue], index: usize) -> Result<bool, HostValue> {
        match self.arg(args, index)? {
            WireValue::I32(v) => Ok(v != 0),
            _ => Err(HostValue::type_error("expected a boolean")),
        }
    }

    pub fn return_string(&self, text: &str) -> WireValue {
        WireValue::I32(self.make_string(text).to_wire())
    }

    /// Return a value by handle; the caller receives one reference.
    pub fn return_object(&self, value: HostValue) -> WireValue {
        WireValue::I32(self.retain(value).to_wire())
    }

    // ---------------------------------------------------------------------
    // Reflective API
    // ---------------------------------------------------------------------

    /// Encode `value`, retaining strings and objects for the receiver.
    pub fn lower_raw(&self, value: &HostValue) -> RawValue {
        match value {
            HostValue::Undefined => RawValue::undefined(),
            HostValue::Null => RawValue::null(),
            HostValue::Bool(b) => RawValue::boolean(*b),
            HostValue::Number(n) => RawValue::number(*n),
            HostValue::String(_) => RawValue::with_handle(RawKind::String, self.retain(value.clone())),
            HostValue::Object(obj) => {
                let kind = if obj.is_callable() {
                    RawKind::Function
                } else {
                    RawKind::Object
                };
                RawValue::with_handle(kind, self.retain(value.clone()))
            }
        }
    }

    /// Decode `raw` without taking ownership of any handle it carries.
    pub fn lift_raw(&self, raw: RawValue) -> Result<HostValue, BridgeError> {
        match raw.kind {
            RawKind::Undefined => Ok(HostValue::Undefined),
            RawKind::Null => Ok(HostValue::Null),
            RawKind::Boolean => Ok(HostValue::Bool(raw.payload1 != 0)),
            RawKind::Number => Ok(HostValue::Number(raw.payload2)),
            RawKind::String | RawKind::Object | RawKind::Function => {
                self.get(Handle::from_wire(raw.payload1))
            }
        }
    }

    fn object_at(&self, handle: Handle) -> Result<HostObject, BridgeError> {
        match self.get(handle)? {
            HostValue::Object(obj) => Ok(obj),
            other => Err(BridgeError::mismatch("object", other.type_of())),
        }
    }

    fn lift_args(&self, args: &[RawValue]) -> Result<Vec<HostValue>, BridgeError> {
        args.iter().map(|raw| self.lift_raw(*raw)).collect()
    }

    fn settle(&self, outcome: Result<HostValue, HostValue>) -> Result<RawValue, BridgeError> {
        match outcome {
            Ok(value) => Ok(self.lower_raw(&value)),
            Err(thrown) => {
                self.set_exception(thrown);
                self.check_exception()?;
                Ok(RawValue::undefined())
            }
        }
    }

    pub fn get_property(&self, object: Handle, name: &str) -> Result<RawValue, BridgeError> {
        let obj = self.object_at(object)?;
        Ok(self.lower_raw(&obj.get(name)))
    }

    pub fn set_property(&self, object: Handle, name: &str, value: RawValue) -> Result<(), BridgeError> {
        let obj = self.object_at(object)?;
        obj.set(name, self.lift_raw(value)?);
        Ok(())
    }

    /// Call a function with `this` undefined.
    pub fn call_function(&self, function: Handle, args: &[RawValue]) -> Result<RawValue, BridgeError> {
        let func = self.object_at(function)?;
        let args = self.lift_args(args)?;
        self.settle(func.call(&HostValue::Undefined, &args))
    }

    /// Call the method `name` of `object` with `this` bound to it.
    pub fn call_method(
        &self,
        object: Handle,
        name: &str,
        args: &[RawValue],
    ) -> Result<RawValue, BridgeError> {
        let obj = self.object_at(object)?;
        let args = self.lift_args(args)?;
        let outcome = match obj.get(name) {
            HostValue::Object(method) => method.call(&HostValue::Object(obj), &args),
            _ => Err(HostValue::type_error(&format!("{} is not a function", name))),
        };
        self.settle(outcome)
    }

    /// Invoke a constructor with `new`.
    pub fn construct(&self, constructor: Handle, args: &[RawValue]) -> Result<RawValue, BridgeError> {
        let ctor = self.object_at(constructor)?;
        let args = self.lift_args(args)?;
        self.settle(ctor.construct(&args))
    }

    // ---------------------------------------------------------------------
    // Promises
    // ---------------------------------------------------------------------

    /// A pending host promise whose reactions run on this realm's thread.
    pub fn new_promise(&self) -> HostPromise {
        HostPromise::new(self.scheduler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::host_loop::HostLoop;

    fn realm(host_loop: &HostLoop) -> Arc<Realm> {
        Realm::new(
            ThreadIndex(0),
            &RuntimeConfig::default(),
            LibraryFeatures::negotiate(true),
            ImportTable::new(),
            host_loop.scheduler(),
        )
    }

    #[test]
    fn test_global_is_handle_one() {
        let host_loop = HostLoop::new();
        let realm = realm(&host_loop);
        let global = realm.get(Handle::GLOBAL).unwrap();
        assert!(global.as_object().unwrap().ptr_eq(realm.global()));
    }

    #[test]
    fn test_exception_slot_overwrite_keeps_latest() {
        let host_loop = HostLoop::new();
        let realm = realm(&host_loop);
        realm.set_exception(HostValue::error("first"));
        realm.set_exception(HostValue::error("second"));
        let err = realm.check_exception().unwrap_err();
        assert_eq!(err.as_host_exception().unwrap().message(), "second");
        assert!(realm.check_exception().is_ok());
    }

    #[test]
    fn test_reflective_calls() {
        let host_loop = HostLoop::new();
        let realm = realm(&host_loop);

        let counter = HostObject::new();
        counter.set("count", 1.0);
        counter.set(
            "bump",
            HostObject::function(|this, args| {
                let obj = this.as_object().cloned().unwrap_or_default();
                let by = args.first().and_then(HostValue::as_number).unwrap_or(1.0);
                let next = obj.get("count").as_number().unwrap_or(0.0) + by;
                obj.set("count", next);
                Ok(HostValue::Number(next))
            }),
        );
        let h = realm.retain(HostValue::Object(counter.clone()));

        let out = realm.call_method(h, "bump", &[RawValue::number(4.0)]).unwrap();
        assert_eq!(out, RawValue::number(5.0));

        realm.set_property(h, "label", RawValue::boolean(true)).unwrap();
        assert_eq!(counter.get("label").as_bool(), Some(true));

        let err = realm.call_method(h, "missing", &[]).unwrap_err();
        assert!(err.as_host_exception().is_some());
        assert!(!realm.has_pending_exception());
    }

    #[test]
    fn test_finalizers_release_on_microtask() {
        let host_loop = HostLoop::new();
        let realm = realm(&host_loop);
        let h = realm.retain(HostValue::Object(HostObject::new()));
        realm.schedule_finalizer(h);
        assert!(realm.contains(h));
        host_loop.run_until_idle();
        assert!(!realm.contains(h));
    }

    #[test]
    #[should_panic(expected = "accessed from another thread")]
    fn test_foreign_thread_access_is_fatal() {
        let host_loop = HostLoop::new();
        let realm = realm(&host_loop);
        let shared = realm.clone();
        let result = std::thread::spawn(move || {
            shared.retain(HostValue::Null);
        })
        .join();
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }
}
