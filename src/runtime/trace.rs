//! Diagnostic tracing for the bridge runtime.
//!
//! Lines go to stderr as `[time tag] message` when tracing is switched on,
//! either by `HOSTBRIDGE_TRACE` in the environment or by
//! [`RuntimeConfig::trace`](super::config::RuntimeConfig).

use std::sync::atomic::{AtomicU8, Ordering};

const UNSET: u8 = 0;
const OFF: u8 = 1;
const ON: u8 = 2;

static TRACE_STATE: AtomicU8 = AtomicU8::new(UNSET);

/// Turn tracing on or off for the whole process.
pub fn set_enabled(enabled: bool) {
    TRACE_STATE.store(if enabled { ON } else { OFF }, Ordering::Relaxed);
}

/// Whether trace lines are printed. The environment is consulted once.
#[inline]
pub fn enabled() -> bool {
    match TRACE_STATE.load(Ordering::Relaxed) {
        ON => true,
        OFF => false,
        _ => {
            let on = std::env::var("HOSTBRIDGE_TRACE").is_ok_and(|v| v != "0");
            // A concurrent set_enabled wins over the environment.
            let _ = TRACE_STATE.compare_exchange(
                UNSET,
                if on { ON } else { OFF },
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            TRACE_STATE.load(Ordering::Relaxed) == ON
        }
    }
}

#[doc(hidden)]
pub fn emit(tag: &str, message: std::fmt::Arguments<'_>) {
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    eprintln!("[{} {}] {}", now, tag, message);
}

/// Print a diagnostic line under `tag` when tracing is enabled.
#[macro_export]
macro_rules! bridge_trace {
    ($tag:expr, $($arg:tt)*) => {
        if $crate::runtime::trace::enabled() {
            $crate::runtime::trace::emit($tag, format_args!($($arg)*));
        }
    };
}
