//! Extern "C" entry points for generated glue.
//!
//! Each stub acts on the realm attached to the calling thread (see
//! [`context::current`](super::context::current)). The calling convention is:
//! - Handles are passed and returned as `u32`; `0` means "no handle".
//! - Status results are `i32`: a non-negative value on success, `-1` on failure.
//! - With no realm attached, every stub fails.

use std::ptr;

use super::abi::{ABI_VERSION, LibraryFeatures, RawValue};
use super::closure::HostFuncRef;
use super::context::with_current;
use super::object_space::Handle;

// =========================================================================
// Negotiation
// =========================================================================

#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_abi_version() -> u32 {
    ABI_VERSION
}

/// Feature bitmask of the attached runtime, or what the build offers by
/// default when no runtime is attached.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_library_features() -> i32 {
    with_current(|cx| cx.runtime().features().bits())
        .unwrap_or_else(|| LibraryFeatures::negotiate(cfg!(feature = "weak-refs")).bits())
}

// =========================================================================
// Reference counting
// =========================================================================

/// Add a reference to a live handle. Returns the handle, or 0.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_retain(handle: u32) -> u32 {
    with_current(|cx| cx.realm().retain_by_ref(Handle::from_raw(handle)))
        .and_then(Result::ok)
        .map_or(0, Handle::raw)
}

/// Drop a reference. Returns 0, or -1 if the handle was not live.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_release(handle: u32) -> i32 {
    match with_current(|cx| cx.realm().release(Handle::from_raw(handle))) {
        Some(Ok(())) => 0,
        _ => -1,
    }
}

// =========================================================================
// Exceptions
// =========================================================================

/// Drain the sticky exception slot. Returns an owned handle to the thrown
/// value, or 0 when nothing is pending.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_take_exception() -> u32 {
    with_current(|cx| {
        let realm = cx.realm();
        realm.take_exception().map(|thrown| realm.retain(thrown))
    })
    .flatten()
    .map_or(0, Handle::raw)
}

// =========================================================================
// Strings
// =========================================================================

/// Materialize a host string from UTF-8 bytes. Returns an owned handle, or 0.
///
/// # Safety
/// `data` must point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostbridge_make_string(data: *const u8, len: usize) -> u32 {
    if data.is_null() && len != 0 {
        return 0;
    }
    let bytes = if len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return 0;
    };
    with_current(|cx| cx.realm().make_string(text)).map_or(0, Handle::raw)
}

/// UTF-8 byte length of a string handle, or -1.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_string_len(handle: u32) -> i32 {
    match with_current(|cx| cx.realm().string_len(Handle::from_raw(handle))) {
        Some(Ok(len)) => i32::try_from(len).unwrap_or(-1),
        _ => -1,
    }
}

/// Copy a string's bytes into `buf`. Returns the number of bytes written, or -1.
///
/// # Safety
/// `buf` must point to `cap` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostbridge_string_decode(handle: u32, buf: *mut u8, cap: usize) -> i32 {
    if buf.is_null() && cap != 0 {
        return -1;
    }
    let out = if cap == 0 {
        &mut [][..]
    } else {
        unsafe { std::slice::from_raw_parts_mut(buf, cap) }
    };
    match with_current(|cx| cx.realm().decode_string(Handle::from_raw(handle), out)) {
        Some(Ok(n)) => i32::try_from(n).unwrap_or(-1),
        _ => -1,
    }
}

// =========================================================================
// Host functions
// =========================================================================

/// Allocate an argument vector of `argc` undefined values for a host
/// function call. Free it with [`hostbridge_cleanup_host_function_call`].
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_prepare_host_function_call(argc: usize) -> *mut RawValue {
    let argv: Box<[RawValue]> = vec![RawValue::undefined(); argc].into_boxed_slice();
    Box::into_raw(argv).cast::<RawValue>()
}

/// # Safety
/// `argv` and `argc` must come from one [`hostbridge_prepare_host_function_call`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostbridge_cleanup_host_function_call(argv: *mut RawValue, argc: usize) {
    if argv.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(argv, argc)) });
}

/// Run the guest closure behind `func`. The closure takes the handles in
/// `argv`; the caller owns any handle written to `out`.
///
/// Returns 0 with the result in `out`, 1 if the closure threw (the thrown
/// value is in the exception slot), or -1 on failure.
///
/// # Safety
/// `argv` must point to `argc` readable values and `out` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hostbridge_call_host_function(
    func: u32,
    argv: *const RawValue,
    argc: usize,
    out: *mut RawValue,
) -> i32 {
    if out.is_null() || (argv.is_null() && argc != 0) {
        return -1;
    }
    let args = if argc == 0 {
        &[][..]
    } else {
        // SAFETY: checked non-null; the caller guarantees `argc` values.
        unsafe { std::slice::from_raw_parts(argv, argc) }
    };
    let outcome = with_current(|cx| {
        let realm = cx.realm();
        match realm.call_host_function(HostFuncRef::from_raw(func), args) {
            Ok(result) => (0, result),
            Err(thrown) => {
                realm.set_exception(thrown);
                (1, RawValue::undefined())
            }
        }
    });
    match outcome {
        Some((status, result)) => {
            // SAFETY: checked non-null; the caller guarantees it is writable.
            unsafe { out.write(result) };
            status
        }
        None => -1,
    }
}

/// Free the closure behind `func`. Returns 0, or -1 if it was not registered.
#[unsafe(no_mangle)]
pub extern "C" fn hostbridge_free_host_function(func: u32) -> i32 {
    match with_current(|cx| cx.realm().free_host_function(HostFuncRef::from_raw(func))) {
        Some(true) => 0,
        _ => -1,
    }
}
