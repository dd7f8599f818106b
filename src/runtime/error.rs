//! Bridge error definitions.
//!
//! Recoverable failures surface as [`BridgeError`]. Caller defects surface as
//! [`ProtocolMisuse`] through [`fatal`], which never returns.

use std::fmt;

use super::object_space::Handle;
use super::value::{HostObject, HostValue};

/// Identifies a worker thread inside one [`BridgeRuntime`](super::context::BridgeRuntime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIndex(pub u32);

impl fmt::Display for ThreadIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// A host value thrown across the boundary.
#[derive(Clone, Debug)]
pub struct HostException {
    value: HostValue,
}

impl HostException {
    pub fn new(value: HostValue) -> Self {
        Self { value }
    }

    /// The thrown value itself.
    pub fn value(&self) -> &HostValue {
        &self.value
    }

    pub fn into_value(self) -> HostValue {
        self.value
    }

    /// The host's error text: an error object's `message`, or the thrown
    /// value rendered as a string.
    pub fn message(&self) -> String {
        match &self.value {
            HostValue::Object(obj) => match obj.get("message") {
                HostValue::String(m) => m.to_string(),
                _ => self.value.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub fn class(&self) -> Option<&str> {
        self.value.as_object().and_then(HostObject::class)
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            Some(class) => write!(f, "{}: {}", class, self.message()),
            None => write!(f, "uncaught host exception: {}", self.message()),
        }
    }
}

impl std::error::Error for HostException {}

/// Recoverable bridge failures.
#[derive(Clone, Debug)]
pub enum BridgeError {
    /// A handle that is not live in this object space.
    InvalidReference { handle: Handle, operation: &'static str },

    /// A foreign call threw.
    HostException(HostException),

    /// A wire or raw value was not of the kind the caller lifts.
    TypeMismatch { expected: &'static str, found: String },

    /// The thread a transfer needs has detached from the runtime.
    ThreadUnavailable(ThreadIndex),

    /// The transfer's result channel closed before it was fulfilled.
    TransferAborted,
}

impl BridgeError {
    pub fn invalid(handle: Handle, operation: &'static str) -> Self {
        BridgeError::InvalidReference { handle, operation }
    }

    pub fn mismatch(expected: &'static str, found: impl fmt::Debug) -> Self {
        BridgeError::TypeMismatch {
            expected,
            found: format!("{:?}", found),
        }
    }

    pub fn is_invalid_reference(&self) -> bool {
        matches!(self, BridgeError::InvalidReference { .. })
    }

    pub fn as_host_exception(&self) -> Option<&HostException> {
        match self {
            BridgeError::HostException(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::InvalidReference { handle, operation } => write!(
                f,
                "attempted to {} invalid reference {}",
                operation,
                handle.raw()
            ),
            BridgeError::HostException(e) => write!(f, "{}", e),
            BridgeError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            BridgeError::ThreadUnavailable(thread) => {
                write!(f, "{} is not attached to the runtime", thread)
            }
            BridgeError::TransferAborted => {
                write!(f, "transfer aborted before the object was delivered")
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::HostException(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HostException> for BridgeError {
    fn from(e: HostException) -> Self {
        BridgeError::HostException(e)
    }
}

/// Caller defects with no safe continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMisuse {
    /// `receive` called a second time on one transfer token.
    DoubleReceive { correlation: u64 },
    /// A transfer was resumed after it had already been fulfilled.
    AlreadyFulfilled { correlation: u64 },
    /// A transfer request arrived with no continuation registered for it.
    UnregisteredContinuation { correlation: u64 },
    /// Work was scheduled on an executor before a scheduler was installed.
    NotInstalled { thread: String },
    /// A realm was touched from a thread other than its owner.
    ForeignThreadAccess { owner: ThreadIndex },
}

impl fmt::Display for ProtocolMisuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMisuse::DoubleReceive { correlation } => write!(
                f,
                "transfer #{} is already received; receive may be called only once",
                correlation
            ),
            ProtocolMisuse::AlreadyFulfilled { correlation } => {
                write!(f, "transfer #{} was already fulfilled", correlation)
            }
            ProtocolMisuse::UnregisteredContinuation { correlation } => write!(
                f,
                "transfer #{} has no registered continuation",
                correlation
            ),
            ProtocolMisuse::NotInstalled { thread } => write!(
                f,
                "executor for thread `{}` used before a scheduler was installed",
                thread
            ),
            ProtocolMisuse::ForeignThreadAccess { owner } => write!(
                f,
                "realm owned by {} accessed from another thread",
                owner
            ),
        }
    }
}

/// Abort the current thread for a caller defect.
#[track_caller]
pub fn fatal(misuse: ProtocolMisuse) -> ! {
    panic!("protocol misuse: {}", misuse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_exception_message() {
        let e = HostException::new(HostValue::error("TestError"));
        assert_eq!(e.message(), "TestError");
        assert_eq!(e.class(), Some("Error"));
        assert_eq!(e.to_string(), "Error: TestError");

        let plain = HostException::new(HostValue::string("oops"));
        assert_eq!(plain.message(), "oops");
        assert_eq!(plain.to_string(), "uncaught host exception: oops");
    }

    #[test]
    fn test_invalid_reference_display() {
        let err = BridgeError::invalid(Handle::from_raw(42), "read");
        assert!(err.is_invalid_reference());
        assert_eq!(err.to_string(), "attempted to read invalid reference 42");
    }

    #[test]
    #[should_panic(expected = "protocol misuse: transfer #7 is already received")]
    fn test_fatal_panics() {
        fatal(ProtocolMisuse::DoubleReceive { correlation: 7 });
    }
}
