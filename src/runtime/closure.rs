//! Guest closures callable from the host.
//!
//! A [`JsClosure`] registers a guest function in its realm's closure table
//! under a [`HostFuncRef`] and hands the host a function object that
//! dispatches back into that table. Arguments travel as owned [`RawValue`]s;
//! the result comes back the same way.
//!
//! The table entry is freed by [`JsClosure::release`] when weak references
//! were not negotiated. With weak references it is freed once the host drops
//! its last copy of the function object. References are never reused, so a
//! late free can only ever hit its own entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::abi::{BridgeLower, RawValue, WireValue};
use super::bridged::{DynValue, HostRef};
use super::error::BridgeError;
use super::realm::Realm;
use super::value::{HostObject, HostValue, lock};

/// A guest function as the host sees it: arguments in, result or thrown value out.
pub type GuestFn = dyn Fn(&[DynValue]) -> Result<DynValue, HostValue> + Send + Sync;

/// Identifies a guest closure inside one realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFuncRef(u32);

impl HostFuncRef {
    pub fn from_raw(raw: u32) -> Self {
        HostFuncRef(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HostFuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-func#{}", self.0)
    }
}

pub(crate) struct ClosureTable {
    next: AtomicU32,
    entries: Mutex<HashMap<HostFuncRef, Arc<GuestFn>>>,
}

impl ClosureTable {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, f: Arc<GuestFn>) -> HostFuncRef {
        let func = HostFuncRef(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).insert(func, f);
        func
    }

    fn get(&self, func: HostFuncRef) -> Option<Arc<GuestFn>> {
        lock(&self.entries).get(&func).cloned()
    }

    fn remove(&self, func: HostFuncRef) -> bool {
        let removed = lock(&self.entries).remove(&func);
        removed.is_some()
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Frees its closure when the host drops the function object, if the host
/// finalizes objects.
struct FinalizeGuard {
    realm: Weak<Realm>,
    func: HostFuncRef,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        let Some(realm) = self.realm.upgrade() else {
            return;
        };
        if realm.features().weak_refs() && realm.free_host_function(self.func) {
            crate::bridge_trace!("closure", "{} finalized in {}", self.func, realm.thread());
        }
    }
}

impl Realm {
    /// Register `f` and return the reference the host calls it by.
    pub fn register_host_function(&self, f: Arc<GuestFn>) -> HostFuncRef {
        let func = self.closures.insert(f);
        crate::bridge_trace!("closure", "register {} in {}", func, self.thread());
        func
    }

    /// Drop the closure behind `func`. Returns whether it was registered.
    /// Safe from any thread.
    pub fn free_host_function(&self, func: HostFuncRef) -> bool {
        self.closures.remove(func)
    }

    pub fn host_function_count(&self) -> usize {
        self.closures.len()
    }

    /// Run the closure behind `func`. The closure owns `argv`'s handles for
    /// the duration of the call; the caller owns any handle in the result.
    pub fn call_host_function(
        &self,
        func: HostFuncRef,
        argv: &[RawValue],
    ) -> Result<RawValue, HostValue> {
        self.assert_owner();
        let Some(closure) = self.closures.get(func) else {
            return Err(HostValue::type_error(&format!(
                "{} was called after it was released",
                func
            )));
        };
        let realm = self
            .upgrade()
            .ok_or_else(|| HostValue::error("realm is shutting down"))?;

        let args = argv
            .iter()
            .map(|raw| DynValue::lift(&realm, *raw))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HostValue::type_error(&e.to_string()))?;
        let outcome = closure(&args);
        for arg in args {
            if let Err(e) = arg.release() {
                crate::bridge_trace!("closure", "{}: {}", func, e);
            }
        }
        outcome.map(|value| value.into_owned_raw(self))
    }

    /// A host function object that calls back into `func`.
    fn host_function_object(&self, func: HostFuncRef) -> HostObject {
        let realm = self.upgrade().map_or_else(Weak::new, |r| Arc::downgrade(&r));
        let guard = FinalizeGuard {
            realm: realm.clone(),
            func,
        };
        HostObject::function(move |_this, args| {
            let _guard = &guard;
            let realm = realm
                .upgrade()
                .ok_or_else(|| HostValue::error("realm is shutting down"))?;
            let argv: Vec<RawValue> = args.iter().map(|a| realm.lower_raw(a)).collect();
            let raw = realm.call_host_function(func, &argv)?;
            let value = realm
                .lift_raw(raw)
                .map_err(|e| HostValue::type_error(&e.to_string()))?;
            if let Some(handle) = raw.handle() {
                if let Err(e) = realm.release(handle) {
                    crate::bridge_trace!("closure", "{}: {}", func, e);
                }
            }
            Ok(value)
        })
    }
}

/// A guest closure exposed to the host as a function object.
pub struct JsClosure {
    func: HostFuncRef,
    object: HostRef,
}

impl fmt::Debug for JsClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsClosure")
            .field("func", &self.func)
            .field("object", &self.object)
            .finish()
    }
}

impl JsClosure {
    pub fn new<F>(realm: &Arc<Realm>, f: F) -> Self
    where
        F: Fn(&[DynValue]) -> Result<DynValue, HostValue> + Send + Sync + 'static,
    {
        let func = realm.register_host_function(Arc::new(f));
        let object = realm.host_function_object(func);
        Self {
            func,
            object: HostRef::retain(realm, HostValue::Object(object)),
        }
    }

    pub fn host_func_ref(&self) -> HostFuncRef {
        self.func
    }

    pub fn host_ref(&self) -> &HostRef {
        &self.object
    }

    /// A new reference to the function object, e.g. to store on a host object.
    pub fn to_dyn(&self) -> Result<DynValue, BridgeError> {
        Ok(DynValue::Function(self.object.try_clone()?))
    }

    /// Call through the host, as host code would.
    pub fn call(&self, args: &[DynValue]) -> Result<DynValue, BridgeError> {
        let function = self.to_dyn()?;
        let result = function.call(args);
        function.release()?;
        result
    }

    /// Give up the guest's reference. Without weak references this also
    /// frees the closure; later host calls throw.
    pub fn release(self) -> Result<(), BridgeError> {
        let realm = self.object.realm().clone();
        if !realm.features().weak_refs() {
            realm.free_host_function(self.func);
        }
        self.object.release()
    }
}

impl BridgeLower for JsClosure {
    /// Borrowed, like [`HostRef`].
    fn lower(&self, realm: &Realm) -> WireValue {
        self.object.lower(realm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::host_loop::HostLoop;
    use crate::runtime::config::RuntimeConfig;
    use crate::runtime::context::BridgeRuntime;
    use std::sync::atomic::AtomicBool;

    fn runtime(weak_refs: bool) -> BridgeRuntime {
        BridgeRuntime::new(RuntimeConfig {
            weak_refs,
            ..RuntimeConfig::default()
        })
    }

    /// `evalClosure(f, ...args)` calls `f(...args)` from the host side.
    fn install_eval_closure(realm: &Realm) {
        realm.global().set(
            "evalClosure",
            HostObject::function(|_, args| match args.first() {
                Some(HostValue::Object(f)) => f.call(&HostValue::Undefined, &args[1..]),
                _ => Err(HostValue::type_error("evalClosure needs a function")),
            }),
        );
    }

    fn eval_closure(eval: &DynValue, closure: &JsClosure, arg: DynValue) -> DynValue {
        let args = [closure.to_dyn().unwrap(), arg];
        let out = eval.call(&args).unwrap();
        for arg in args {
            arg.release().unwrap();
        }
        out
    }

    fn echo_first(args: &[DynValue]) -> Result<DynValue, HostValue> {
        Ok(match args.first() {
            Some(DynValue::Number(n)) => DynValue::Number(*n),
            Some(DynValue::String(s)) => DynValue::String(s.clone()),
            Some(DynValue::Bool(b)) => DynValue::Bool(*b),
            _ => DynValue::Undefined,
        })
    }

    #[test]
    fn test_closure_lifetime_with_explicit_release() {
        let runtime = runtime(false);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();
        install_eval_closure(realm);
        let global = cx.global().unwrap();
        let eval = global.get("evalClosure").unwrap();

        let c1 = JsClosure::new(realm, echo_first);
        let out = eval_closure(&eval, &c1, DynValue::Number(1.0));
        assert_eq!(out.as_number(), Some(1.0));
        let out = eval_closure(&eval, &c1, DynValue::from("hello"));
        assert_eq!(out.as_str(), Some("hello"));
        c1.release().unwrap();
        assert_eq!(realm.host_function_count(), 0);

        // Kept by a host container and called later.
        let store = HostObject::new();
        let list = HostObject::new();
        let slot = store.clone();
        list.set(
            "push",
            HostObject::function(move |_, args| {
                slot.set("0", args.first().cloned().unwrap_or_default());
                Ok(HostValue::Number(1.0))
            }),
        );
        let list = DynValue::from_host(realm, &HostValue::Object(list)).unwrap();
        let c2 = JsClosure::new(realm, |_| Ok(DynValue::Number(3.0)));
        let pushed = [c2.to_dyn().unwrap()];
        list.call_method("push", &pushed).unwrap();
        for value in pushed {
            value.release().unwrap();
        }
        let stored = DynValue::from_host(realm, &store.get("0")).unwrap();
        assert_eq!(stored.type_of(), "function");
        assert_eq!(stored.call(&[]).unwrap().as_number(), Some(3.0));

        // Once released, the host's copy throws instead of running.
        c2.release().unwrap();
        let err = stored.call(&[]).unwrap_err();
        let message = err.as_host_exception().unwrap().message();
        assert!(message.contains("was called after it was released"), "{}", message);

        let c3 = JsClosure::new(realm, |_| Ok(DynValue::Undefined));
        assert_eq!(c3.call(&[]).unwrap().type_of(), "undefined");
        let c4 = JsClosure::new(realm, |_| Ok(DynValue::Number(4.0)));
        assert_eq!(c4.call(&[]).unwrap().as_number(), Some(4.0));
        c3.release().unwrap();
        c4.release().unwrap();
        assert_eq!(realm.host_function_count(), 0);

        for value in [stored, list, eval, global] {
            value.release().unwrap();
        }
    }

    #[test]
    fn test_host_function_registration() {
        let runtime = runtime(false);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();
        install_eval_closure(realm);

        // prop_6.call_host_1() calls this.host_func_1() from the host side.
        let prop_6 = HostObject::new();
        prop_6.set(
            "call_host_1",
            HostObject::function(|this, _| {
                match this.as_object().map(|obj| obj.get("host_func_1")) {
                    Some(HostValue::Object(f)) => f.call(this, &[]),
                    _ => Err(HostValue::type_error("host_func_1 is not set")),
                }
            }),
        );
        let holder = HostObject::new();
        holder.set("prop_6", prop_6);
        realm.global().set("globalObject1", holder);

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let host_func_1 = JsClosure::new(realm, move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(DynValue::Number(1.0))
        });

        let global = cx.global().unwrap();
        let holder = global.get("globalObject1").unwrap();
        let prop_6 = holder.get("prop_6").unwrap();
        let f = host_func_1.to_dyn().unwrap();
        prop_6.set("host_func_1", &f).unwrap();
        f.release().unwrap();

        let out = prop_6.call_method("call_host_1", &[]).unwrap();
        assert_eq!(out.as_number(), Some(1.0));
        assert!(called.load(Ordering::SeqCst));
        host_func_1.release().unwrap();

        let host_func_2 = JsClosure::new(realm, |args| {
            Ok(match args.first() {
                Some(DynValue::Number(n)) => DynValue::Number(n * 2.0),
                Some(other) => DynValue::String(other.type_of().to_string()),
                None => DynValue::Undefined,
            })
        });
        let eval = global.get("evalClosure").unwrap();
        let doubled = eval_closure(&eval, &host_func_2, DynValue::Number(3.0));
        assert_eq!(doubled.as_number(), Some(6.0));
        let described = eval_closure(&eval, &host_func_2, DynValue::Bool(true));
        assert_eq!(described.as_str(), Some("boolean"));
        host_func_2.release().unwrap();
        assert_eq!(realm.host_function_count(), 0);

        for value in [prop_6, holder, eval, global] {
            value.release().unwrap();
        }
    }

    #[test]
    fn test_thrown_value_reaches_host() {
        let runtime = runtime(false);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();

        let c = JsClosure::new(realm, |_| Err(HostValue::error("from guest")));
        let err = c.call(&[]).unwrap_err();
        assert_eq!(err.as_host_exception().unwrap().message(), "from guest");
        assert!(!realm.has_pending_exception());
        c.release().unwrap();
    }

    #[test]
    fn test_closure_arguments_are_released() {
        let runtime = runtime(false);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();

        let c = JsClosure::new(realm, |args| Ok(DynValue::Number(args.len() as f64)));
        let live = realm.live_count();
        let argv = [
            realm.lower_raw(&HostValue::string("text")),
            realm.lower_raw(&HostValue::Object(HostObject::new())),
            RawValue::number(1.0),
        ];
        let out = realm.call_host_function(c.host_func_ref(), &argv).unwrap();
        assert_eq!(out.payload2, 3.0);
        assert_eq!(realm.live_count(), live);
        c.release().unwrap();
    }

    #[test]
    fn test_weak_refs_finalize_dropped_closures() {
        let runtime = runtime(true);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();

        let c = JsClosure::new(realm, |_| Ok(DynValue::Null));
        assert_eq!(realm.host_function_count(), 1);
        // Releasing drops the guest's reference but leaves the closure to the finalizer.
        let kept = JsClosure::new(realm, |_| Ok(DynValue::Null));
        let copy = kept.to_dyn().unwrap();
        kept.release().unwrap();
        assert_eq!(realm.host_function_count(), 2);
        assert_eq!(copy.call(&[]).unwrap().type_of(), "object");

        drop(c);
        drop(copy);
        host_loop.run_until_idle();
        assert_eq!(realm.host_function_count(), 0);
    }

    #[test]
    fn test_finalizer_churn_keeps_live_closures() {
        let runtime = runtime(true);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();

        let holder = HostObject::new();
        for i in 0..200 {
            let c = JsClosure::new(realm, move |_| Ok(DynValue::Number(i as f64)));
            holder.set(&format!("c{}", i), c.host_ref().value().unwrap());
        }
        // Temporaries land on recycled handles; finalizing them must not free the sources.
        for i in 0..1_000 {
            let temp = JsClosure::new(realm, move |_| Ok(DynValue::Number(-(i as f64))));
            if i % 3 == 0 {
                HostObject::new().set("scratch", temp.host_ref().value().unwrap());
            }
            if i % 50 == 0 {
                host_loop.run_until_idle();
            }
        }
        host_loop.run_until_idle();
        assert_eq!(realm.host_function_count(), 200);

        for i in 0..200 {
            let HostValue::Object(f) = holder.get(&format!("c{}", i)) else {
                panic!("c{} missing", i);
            };
            let out = f.call(&HostValue::Undefined, &[]).unwrap();
            assert_eq!(out.as_number(), Some(i as f64));
        }
    }
}
