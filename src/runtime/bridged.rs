//! Guest-side references to host values.
//!
//! [`HostRef`] owns one reference to a handle in its realm's object space.
//! [`DynValue`] is a dynamically typed guest value. [`BridgedClass`] is the
//! shape generated glue gives to a host class imported as a guest type.

use std::fmt;
use std::sync::Arc;

use super::abi::{BridgeLift, BridgeLower, RawKind, RawValue, WireValue, call_import};
use super::error::BridgeError;
use super::object_space::Handle;
use super::realm::Realm;
use super::value::HostValue;

/// One owned reference to a host value.
///
/// Give the reference back with [`release`](HostRef::release). Dropping it
/// instead hands the handle to the host finalizer when weak references were
/// negotiated; otherwise the handle stays live.
pub struct HostRef {
    handle: Handle,
    realm: Arc<Realm>,
    released: bool,
}

impl HostRef {
    /// Adopt one reference the caller already owns.
    pub fn from_owned(realm: &Arc<Realm>, handle: Handle) -> Self {
        Self {
            handle,
            realm: realm.clone(),
            released: false,
        }
    }

    /// Retain `value` in `realm` and own the new reference.
    pub fn retain(realm: &Arc<Realm>, value: HostValue) -> Self {
        let handle = realm.retain(value);
        Self::from_owned(realm, handle)
    }

    /// A reference to the realm's global object.
    pub fn global(realm: &Arc<Realm>) -> Result<Self, BridgeError> {
        let handle = realm.retain_by_ref(Handle::GLOBAL)?;
        Ok(Self::from_owned(realm, handle))
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }

    pub fn value(&self) -> Result<HostValue, BridgeError> {
        self.realm.get(self.handle)
    }

    /// A second owned reference to the same handle.
    pub fn try_clone(&self) -> Result<Self, BridgeError> {
        let handle = self.realm.retain_by_ref(self.handle)?;
        Ok(Self::from_owned(&self.realm, handle))
    }

    pub fn release(mut self) -> Result<(), BridgeError> {
        self.released = true;
        self.realm.release(self.handle)
    }

    /// Give up ownership without releasing; the caller now owns the reference.
    pub fn into_raw(mut self) -> Handle {
        self.released = true;
        self.handle
    }
}

impl Drop for HostRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.realm.features().weak_refs() {
            self.realm.schedule_finalizer(self.handle);
        } else {
            crate::bridge_trace!(
                "leak",
                "{:?} in {} dropped without release",
                self.handle,
                self.realm.thread()
            );
        }
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({} in {})", self.handle.raw(), self.realm.thread())
    }
}

impl BridgeLower for HostRef {
    /// Borrowed: the callee does not take the reference.
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::I32(self.handle.to_wire())
    }
}

impl BridgeLift for HostRef {
    fn lift(realm: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        let handle = Handle::lift(realm, wire)?;
        Ok(HostRef::from_owned(realm, handle))
    }
}

/// A dynamically typed guest value.
#[derive(Debug)]
pub enum DynValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(HostRef),
    Function(HostRef),
}

impl DynValue {
    /// Lift an owned raw value. String handles are decoded and released;
    /// object handles are adopted.
    pub fn lift(realm: &Arc<Realm>, raw: RawValue) -> Result<Self, BridgeError> {
        Ok(match raw.kind {
            RawKind::Undefined => DynValue::Undefined,
            RawKind::Null => DynValue::Null,
            RawKind::Boolean => DynValue::Bool(raw.payload1 != 0),
            RawKind::Number => DynValue::Number(raw.payload2),
            RawKind::String => DynValue::String(realm.load_string(Handle::from_wire(raw.payload1))?),
            RawKind::Object => {
                DynValue::Object(HostRef::from_owned(realm, Handle::from_wire(raw.payload1)))
            }
            RawKind::Function => {
                DynValue::Function(HostRef::from_owned(realm, Handle::from_wire(raw.payload1)))
            }
        })
    }

    /// Bring a host value into the guest.
    pub fn from_host(realm: &Arc<Realm>, value: &HostValue) -> Result<Self, BridgeError> {
        Self::lift(realm, realm.lower_raw(value))
    }

    /// The realm's global object.
    pub fn global(realm: &Arc<Realm>) -> Result<Self, BridgeError> {
        Ok(DynValue::Object(HostRef::global(realm)?))
    }

    fn target(&self) -> Result<&HostRef, BridgeError> {
        match self {
            DynValue::Object(r) | DynValue::Function(r) => Ok(r),
            other => Err(BridgeError::mismatch("object", other.type_of())),
        }
    }

    /// Encode as an argument. Strings need a temporary handle, pushed onto
    /// `temps` for the caller to release after the call.
    fn lower_arg(&self, realm: &Realm, temps: &mut Vec<Handle>) -> RawValue {
        match self {
            DynValue::Undefined => RawValue::undefined(),
            DynValue::Null => RawValue::null(),
            DynValue::Bool(b) => RawValue::boolean(*b),
            DynValue::Number(n) => RawValue::number(*n),
            DynValue::String(s) => {
                let handle = realm.make_string(s);
                temps.push(handle);
                RawValue::with_handle(RawKind::String, handle)
            }
            DynValue::Object(r) => RawValue::with_handle(RawKind::Object, r.handle()),
            DynValue::Function(r) => RawValue::with_handle(RawKind::Function, r.handle()),
        }
    }

    /// Encode as a result; the receiver owns any handle it carries.
    pub(crate) fn into_owned_raw(self, realm: &Realm) -> RawValue {
        match self {
            DynValue::String(s) => RawValue::with_handle(RawKind::String, realm.make_string(&s)),
            DynValue::Object(r) => RawValue::with_handle(RawKind::Object, r.into_raw()),
            DynValue::Function(r) => RawValue::with_handle(RawKind::Function, r.into_raw()),
            scalar => scalar.lower_arg(realm, &mut Vec::new()),
        }
    }

    fn with_raw_args<T>(
        realm: &Arc<Realm>,
        args: &[DynValue],
        call: impl FnOnce(&[RawValue]) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut temps = Vec::new();
        let raw: Vec<RawValue> = args.iter().map(|a| a.lower_arg(realm, &mut temps)).collect();
        let result = call(&raw);
        for handle in temps {
            realm.release(handle)?;
        }
        result
    }

    pub fn get(&self, name: &str) -> Result<DynValue, BridgeError> {
        let target = self.target()?;
        let realm = target.realm();
        let raw = realm.get_property(target.handle(), name)?;
        DynValue::lift(realm, raw)
    }

    pub fn set(&self, name: &str, value: &DynValue) -> Result<(), BridgeError> {
        let target = self.target()?;
        let realm = target.realm();
        Self::with_raw_args(realm, std::slice::from_ref(value), |raw| {
            realm.set_property(target.handle(), name, raw[0])
        })
    }

    /// Call this function with `this` undefined.
    pub fn call(&self, args: &[DynValue]) -> Result<DynValue, BridgeError> {
        let target = self.target()?;
        let realm = target.realm();
        let raw = Self::with_raw_args(realm, args, |raw| realm.call_function(target.handle(), raw))?;
        DynValue::lift(realm, raw)
    }

    pub fn call_method(&self, name: &str, args: &[DynValue]) -> Result<DynValue, BridgeError> {
        let target = self.target()?;
        let realm = target.realm();
        let raw =
            Self::with_raw_args(realm, args, |raw| realm.call_method(target.handle(), name, raw))?;
        DynValue::lift(realm, raw)
    }

    /// Invoke this constructor with `new`.
    pub fn construct(&self, args: &[DynValue]) -> Result<DynValue, BridgeError> {
        let target = self.target()?;
        let realm = target.realm();
        let raw = Self::with_raw_args(realm, args, |raw| realm.construct(target.handle(), raw))?;
        DynValue::lift(realm, raw)
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            DynValue::Undefined => "undefined",
            DynValue::Null | DynValue::Object(_) => "object",
            DynValue::Bool(_) => "boolean",
            DynValue::Number(_) => "number",
            DynValue::String(_) => "string",
            DynValue::Function(_) => "function",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            DynValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_host_ref(&self) -> Option<&HostRef> {
        self.target().ok()
    }

    /// Release the reference held by an object or function value.
    pub fn release(self) -> Result<(), BridgeError> {
        match self {
            DynValue::Object(r) | DynValue::Function(r) => r.release(),
            _ => Ok(()),
        }
    }
}

impl From<bool> for DynValue {
    fn from(b: bool) -> Self {
        DynValue::Bool(b)
    }
}

impl From<f64> for DynValue {
    fn from(n: f64) -> Self {
        DynValue::Number(n)
    }
}

impl From<&str> for DynValue {
    fn from(s: &str) -> Self {
        DynValue::String(s.to_string())
    }
}

/// A host class imported as a guest type.
///
/// Imports are named `<NAMESPACE>_<CLASS>_<member>`: `init` constructs and
/// returns a handle, `<prop>_get`/`<prop>_set` access properties, and any
/// other member is a method. Every member takes the instance handle first.
pub trait BridgedClass: Sized {
    const NAMESPACE: &'static str;
    const CLASS: &'static str;

    fn from_host_ref(object: HostRef) -> Self;
    fn host_ref(&self) -> &HostRef;
    fn into_host_ref(self) -> HostRef;

    fn import_name(member: &str) -> String {
        format!("{}_{}_{}", Self::NAMESPACE, Self::CLASS, member)
    }

    /// Call `<ns>_<Type>_init` and wrap the handle it returns.
    fn construct(realm: &Arc<Realm>, args: &[WireValue]) -> Result<Self, BridgeError> {
        let object: HostRef = call_import(realm, &Self::import_name("init"), args)?;
        Ok(Self::from_host_ref(object))
    }

    fn call_method<R: BridgeLift>(&self, method: &str, args: &[WireValue]) -> Result<R, BridgeError> {
        let this = self.host_ref();
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(this.lower(this.realm()));
        full.extend_from_slice(args);
        call_import(this.realm(), &Self::import_name(method), &full)
    }

    fn get_property<R: BridgeLift>(&self, property: &str) -> Result<R, BridgeError> {
        self.call_method(&format!("{}_get", property), &[])
    }

    fn set_property<V: BridgeLower + ?Sized>(&self, property: &str, value: &V) -> Result<(), BridgeError> {
        let wire = value.lower(self.host_ref().realm());
        self.call_method(&format!("{}_set", property), &[wire])
    }

    /// Release the host companion.
    fn release(self) -> Result<(), BridgeError> {
        self.into_host_ref().release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::host_loop::HostLoop;
    use crate::runtime::config::RuntimeConfig;
    use crate::runtime::context::BridgeRuntime;
    use crate::runtime::value::HostObject;

    #[test]
    fn test_try_clone_and_release() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let first = cx.retain(HostValue::Object(HostObject::new()));
        let handle = first.handle();
        let second = first.try_clone().unwrap();
        assert_eq!(cx.realm().refcount(handle), Some(2));
        first.release().unwrap();
        second.release().unwrap();
        assert!(!cx.realm().contains(handle));
    }

    #[test]
    fn test_drop_without_weak_refs_keeps_handle() {
        let config = RuntimeConfig {
            weak_refs: false,
            ..RuntimeConfig::default()
        };
        let runtime = BridgeRuntime::new(config);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let handle = cx.retain(HostValue::Object(HostObject::new())).handle();
        host_loop.run_until_idle();
        assert!(cx.realm().contains(handle));
    }

    #[test]
    fn test_drop_with_weak_refs_finalizes() {
        let config = RuntimeConfig {
            weak_refs: true,
            ..RuntimeConfig::default()
        };
        let runtime = BridgeRuntime::new(config);
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let handle = cx.retain(HostValue::Object(HostObject::new())).handle();
        assert!(cx.realm().contains(handle));
        host_loop.run_until_idle();
        assert!(!cx.realm().contains(handle));
    }

    #[test]
    fn test_dyn_value_reflection() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let math = HostObject::new();
        math.set(
            "max",
            HostObject::function(|_, args| {
                let best = args
                    .iter()
                    .filter_map(HostValue::as_number)
                    .fold(f64::NEG_INFINITY, f64::max);
                Ok(HostValue::Number(best))
            }),
        );
        cx.realm().global().set("Math", math);

        let global = cx.global().unwrap();
        let math = global.get("Math").unwrap();
        assert_eq!(math.type_of(), "object");
        let max = math
            .call_method("max", &[1.0.into(), 7.0.into(), 3.0.into()])
            .unwrap();
        assert_eq!(max.as_number(), Some(7.0));

        global.set("greeting", &"hi".into()).unwrap();
        assert_eq!(global.get("greeting").unwrap().as_str(), Some("hi"));

        let live_before = cx.realm().live_count();
        math.release().unwrap();
        global.release().unwrap();
        assert_eq!(cx.realm().live_count(), live_before - 1);
    }
}
