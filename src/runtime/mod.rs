//! Runtime kernel underneath generated bridge glue
//!
//! This module provides the primitives every generated call site relies on:
//! - The per-thread handle registry (object_space.rs)
//! - Wire marshalling and the call-then-check convention (abi.rs)
//! - The per-thread host environment and sticky exception slot (realm.rs)
//! - Guest-side references and bridged classes (bridged.rs)
//! - Guest closures the host can call (closure.rs)
//! - Cooperative scheduling on the host event loop (async/)
//! - Cross-thread object transfer (transfer.rs)
//! - The explicit runtime context and workers (context.rs)
//! - Extern "C" stubs callable from generated glue (stubs.rs)

pub mod abi;
pub mod r#async;
pub mod bridged;
pub mod closure;
pub mod config;
pub mod context;
pub mod error;
pub mod object_space;
pub mod realm;
pub mod stubs;
pub mod trace;
pub mod transfer;
pub mod value;

pub use abi::{ABI_VERSION, BridgeLift, BridgeLower, LibraryFeatures, RawKind, RawValue, WireValue, call_import};
pub use r#async::{Executor, HostLoop, HostPromise, JoinHandle, JsPromise, LoopHandle, Scheduler};
pub use bridged::{BridgedClass, DynValue, HostRef};
pub use closure::{GuestFn, HostFuncRef, JsClosure};
pub use config::{ConfigError, RuntimeConfig, SpaceRepr};
pub use context::{BridgeRuntime, ThreadContext};
#[cfg(feature = "multithreaded")]
pub use context::WorkerHandle;
pub use error::{BridgeError, HostException, ProtocolMisuse, ThreadIndex};
pub use object_space::{Handle, ObjectSpace};
pub use realm::{ImportTable, Realm};
pub use transfer::{Receive, TransferState, Transferring};
pub use value::{HostObject, HostValue};
