//! Wire representation of values crossing the guest/host boundary.
//!
//! Every generated call site follows the same convention:
//! - Booleans lower to a 0/1 `i32`; integers and `f64` pass unchanged, with NaN
//!   payloads and infinities preserved bit for bit. `f32` has its own register.
//! - Strings lower to a handle referencing a host string. Lifting one runs the
//!   two-step decode (length query, then byte copy) and releases the handle.
//! - Host objects pass as a plain handle.
//! - After the call returns, the realm's sticky exception slot is checked. A
//!   pending exception is cleared and surfaced as [`BridgeError::HostException`].
//!
//! [`call_import`] bundles the call and the check so no call site can skip it.

use std::fmt;
use std::sync::Arc;

use super::error::{BridgeError, HostException};
use super::object_space::Handle;
use super::realm::Realm;

/// Version of the boundary convention exported to generated glue.
pub const ABI_VERSION: u32 = 1;

/// Prefix of every exported C entry point.
pub const ABI_NAME: &str = "hostbridge";

/// One register's worth of value at the boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WireValue {
    I32(i32),
    F64(f64),
    F32(f32),
    /// No value; returned by imports without a result.
    Void,
}

impl WireValue {
    pub fn as_i32(self) -> Result<i32, BridgeError> {
        match self {
            WireValue::I32(v) => Ok(v),
            other => Err(BridgeError::mismatch("i32", other)),
        }
    }

    pub fn as_f64(self) -> Result<f64, BridgeError> {
        match self {
            WireValue::F64(v) => Ok(v),
            other => Err(BridgeError::mismatch("f64", other)),
        }
    }

    pub fn as_f32(self) -> Result<f32, BridgeError> {
        match self {
            WireValue::F32(v) => Ok(v),
            other => Err(BridgeError::mismatch("f32", other)),
        }
    }

    pub fn as_handle(self) -> Result<Handle, BridgeError> {
        self.as_i32().map(Handle::from_wire)
    }
}

/// Capability bitmask negotiated once at startup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LibraryFeatures(i32);

impl LibraryFeatures {
    /// Ephemeral weak references and finalizers are available.
    pub const WEAK_REFS: i32 = 1 << 0;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn contains(self, flag: i32) -> bool {
        self.0 & flag == flag
    }

    pub const fn with(self, flag: i32) -> Self {
        Self(self.0 | flag)
    }

    pub fn weak_refs(self) -> bool {
        self.contains(Self::WEAK_REFS)
    }

    /// Features the library offers under the given settings.
    pub fn negotiate(weak_refs: bool) -> Self {
        let mut features = Self::empty();
        if weak_refs {
            features = features.with(Self::WEAK_REFS);
        }
        features
    }
}

impl fmt::Debug for LibraryFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryFeatures({:#b}", self.0)?;
        if self.weak_refs() {
            write!(f, " weak-refs")?;
        }
        write!(f, ")")
    }
}

/// Kind tag of a [`RawValue`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawKind {
    Boolean = 0,
    String = 1,
    Number = 2,
    Object = 3,
    Null = 4,
    Undefined = 5,
    Function = 6,
}

impl RawKind {
    pub fn from_u32(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => RawKind::Boolean,
            1 => RawKind::String,
            2 => RawKind::Number,
            3 => RawKind::Object,
            4 => RawKind::Null,
            5 => RawKind::Undefined,
            6 => RawKind::Function,
            _ => return None,
        })
    }
}

/// Tagged value used by the reflective API.
///
/// | kind      | payload1        | payload2 |
/// |-----------|-----------------|----------|
/// | Boolean   | 0 or 1          | -        |
/// | String    | string handle   | -        |
/// | Number    | -               | value    |
/// | Object    | object handle   | -        |
/// | Function  | function handle | -        |
/// | Null      | -               | -        |
/// | Undefined | -               | -        |
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawValue {
    pub kind: RawKind,
    pub payload1: i32,
    pub payload2: f64,
}

impl RawValue {
    #[inline]
    pub fn undefined() -> Self {
        Self {
            kind: RawKind::Undefined,
            payload1: 0,
            payload2: 0.0,
        }
    }

    #[inline]
    pub fn null() -> Self {
        Self {
            kind: RawKind::Null,
            payload1: 0,
            payload2: 0.0,
        }
    }

    #[inline]
    pub fn boolean(b: bool) -> Self {
        Self {
            kind: RawKind::Boolean,
            payload1: b as i32,
            payload2: 0.0,
        }
    }

    #[inline]
    pub fn number(n: f64) -> Self {
        Self {
            kind: RawKind::Number,
            payload1: 0,
            payload2: n,
        }
    }

    #[inline]
    pub fn with_handle(kind: RawKind, handle: Handle) -> Self {
        Self {
            kind,
            payload1: handle.to_wire(),
            payload2: 0.0,
        }
    }

    /// The handle carried by string, object and function values.
    pub fn handle(&self) -> Option<Handle> {
        match self.kind {
            RawKind::String | RawKind::Object | RawKind::Function => {
                Some(Handle::from_wire(self.payload1))
            }
            _ => None,
        }
    }
}

/// Conversion of a guest value into its wire form.
pub trait BridgeLower {
    fn lower(&self, realm: &Realm) -> WireValue;
}

/// Conversion of a wire value back into a guest value.
pub trait BridgeLift: Sized {
    fn lift(realm: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError>;
}

impl<T: BridgeLower + ?Sized> BridgeLower for &T {
    fn lower(&self, realm: &Realm) -> WireValue {
        (**self).lower(realm)
    }
}

impl BridgeLower for bool {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::I32(*self as i32)
    }
}

impl BridgeLift for bool {
    fn lift(_: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        Ok(wire.as_i32()? != 0)
    }
}

impl BridgeLower for i32 {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::I32(*self)
    }
}

impl BridgeLift for i32 {
    fn lift(_: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        wire.as_i32()
    }
}

impl BridgeLower for u32 {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::I32(*self as i32)
    }
}

impl BridgeLift for u32 {
    fn lift(_: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        Ok(wire.as_i32()? as u32)
    }
}

impl BridgeLower for f64 {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::F64(*self)
    }
}

impl BridgeLift for f64 {
    fn lift(_: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        wire.as_f64()
    }
}

impl BridgeLower for f32 {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::F32(*self)
    }
}

impl BridgeLift for f32 {
    fn lift(_: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        wire.as_f32()
    }
}

impl BridgeLower for str {
    /// Materializes a host string owned by the next import call.
    fn lower(&self, realm: &Realm) -> WireValue {
        WireValue::I32(realm.lower_string(self).to_wire())
    }
}

impl BridgeLower for String {
    fn lower(&self, realm: &Realm) -> WireValue {
        self.as_str().lower(realm)
    }
}

impl BridgeLift for String {
    fn lift(realm: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        realm.load_string(wire.as_handle()?)
    }
}

impl BridgeLower for Handle {
    fn lower(&self, _: &Realm) -> WireValue {
        WireValue::I32(self.to_wire())
    }
}

impl BridgeLift for Handle {
    fn lift(realm: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        let handle = wire.as_handle()?;
        if !realm.contains(handle) {
            return Err(BridgeError::invalid(handle, "lift"));
        }
        Ok(handle)
    }
}

impl BridgeLift for () {
    fn lift(_: &Arc<Realm>, _: WireValue) -> Result<Self, BridgeError> {
        Ok(())
    }
}

/// Call the import `name` and check the sticky exception slot before lifting
/// its result.
pub fn call_import<R: BridgeLift>(
    realm: &Arc<Realm>,
    name: &str,
    args: &[WireValue],
) -> Result<R, BridgeError> {
    let ret = realm.invoke_import(name, args);
    if let Some(thrown) = realm.take_exception() {
        return Err(BridgeError::HostException(HostException::new(thrown)));
    }
    R::lift(realm, ret)
}
