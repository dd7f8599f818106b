//! Handing a host object from one thread's object space to another's.
//!
//! The owning thread creates a [`Transferring`] token from a reference it
//! holds; the token takes one extra reference on the source handle. The token
//! is `Send` and is consumed by exactly one [`Transferring::receive`] on the
//! destination thread:
//!
//! 1. The destination registers a continuation under the token's correlation
//!    id and posts a request to the source thread's loop.
//! 2. The source thread takes the continuation, reads the value and drops the
//!    token's reference.
//! 3. The destination thread retains the value in its own object space and
//!    resumes the continuation with the new handle.
//!
//! Only correlation ids and host values cross threads; handles never do.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

#[cfg(feature = "multithreaded")]
use super::r#async::executor::Scheduler;
use super::r#async::host_loop::KeepAlive;
use super::bridged::HostRef;
#[cfg(feature = "multithreaded")]
use super::context::BridgeRuntime;
use super::context::ThreadContext;
use super::error::{BridgeError, ProtocolMisuse, ThreadIndex, fatal};
use super::object_space::Handle;
use super::realm::Realm;
use super::value::lock;

/// Lifecycle of a transfer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Requested,
    Fulfilled,
}

/// Resumes a pending `receive` with the destination handle.
pub(crate) type Continuation = oneshot::Sender<Result<Handle, BridgeError>>;

struct TransferInner {
    source_handle: Handle,
    source_thread: ThreadIndex,
    source_realm: Arc<Realm>,
    correlation: u64,
    state: Mutex<TransferState>,
}

impl Drop for TransferInner {
    fn drop(&mut self) {
        // Never requested: give back the token's reference.
        if *lock(&self.state) == TransferState::Created {
            self.source_realm.schedule_finalizer(self.source_handle);
        }
    }
}

/// A cross-thread capability for one handle.
#[derive(Clone)]
pub struct Transferring {
    inner: Arc<TransferInner>,
}

impl fmt::Debug for Transferring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transferring")
            .field("source_handle", &self.inner.source_handle)
            .field("source_thread", &self.inner.source_thread)
            .field("correlation", &self.inner.correlation)
            .field("state", &self.state())
            .finish()
    }
}

impl Transferring {
    /// Take an extra reference on `object` for the token.
    pub(crate) fn new(object: &HostRef, correlation: u64) -> Result<Self, BridgeError> {
        let realm = object.realm();
        let source_handle = realm.retain_by_ref(object.handle())?;
        Ok(Self {
            inner: Arc::new(TransferInner {
                source_handle,
                source_thread: realm.thread(),
                source_realm: realm.clone(),
                correlation,
                state: Mutex::new(TransferState::Created),
            }),
        })
    }

    pub fn source_handle(&self) -> Handle {
        self.inner.source_handle
    }

    pub fn source_thread(&self) -> ThreadIndex {
        self.inner.source_thread
    }

    pub fn correlation(&self) -> u64 {
        self.inner.correlation
    }

    pub fn state(&self) -> TransferState {
        *lock(&self.inner.state)
    }

    /// Claim the object on the calling thread. May be called once per token.
    #[track_caller]
    pub fn receive(&self, cx: &ThreadContext) -> Receive {
        let claimed = {
            let mut state = lock(&self.inner.state);
            if *state == TransferState::Created {
                *state = TransferState::Requested;
                true
            } else {
                false
            }
        };
        if !claimed {
            fatal(ProtocolMisuse::DoubleReceive {
                correlation: self.inner.correlation,
            });
        }

        #[cfg(feature = "multithreaded")]
        if cx.thread() != self.inner.source_thread {
            return self.request(cx);
        }
        self.receive_local(cx)
    }

    /// Same realm (or single-threaded build): the token's reference becomes
    /// the receiver's.
    fn receive_local(&self, _cx: &ThreadContext) -> Receive {
        self.fulfil();
        let object = HostRef::from_owned(&self.inner.source_realm, self.inner.source_handle);
        Receive::ready(Ok(object))
    }

    #[cfg(feature = "multithreaded")]
    fn request(&self, cx: &ThreadContext) -> Receive {
        let runtime = cx.runtime();
        let Some((_, source_loop)) = runtime.thread_entry(self.inner.source_thread) else {
            return Receive::ready(Err(BridgeError::ThreadUnavailable(self.inner.source_thread)));
        };

        let (reply, rx) = oneshot::channel();
        if runtime
            .register_continuation(self.inner.correlation, self.inner.source_thread, cx.thread(), reply)
            .is_err()
        {
            return Receive::ready(Err(BridgeError::ThreadUnavailable(self.inner.source_thread)));
        }
        let keep_alive = cx.loop_handle().keep_alive();
        crate::bridge_trace!(
            "transfer",
            "#{} requested by {} from {}",
            self.inner.correlation,
            cx.thread(),
            self.inner.source_thread
        );

        let token = self.clone();
        let rt = runtime.clone();
        source_loop.queue_microtask(Box::new(move || serve_request(&rt, &token)));

        Receive {
            state: ReceiveState::Waiting {
                rx,
                realm: cx.realm().clone(),
                _keep_alive: keep_alive,
            },
        }
    }

    /// Mark the token delivered.
    #[track_caller]
    pub(crate) fn fulfil(&self) {
        let mut state = lock(&self.inner.state);
        if *state == TransferState::Fulfilled {
            drop(state);
            fatal(ProtocolMisuse::AlreadyFulfilled {
                correlation: self.inner.correlation,
            });
        }
        *state = TransferState::Fulfilled;
    }
}

/// Runs on the source thread.
#[cfg(feature = "multithreaded")]
fn serve_request(runtime: &BridgeRuntime, token: &Transferring) {
    let correlation = token.inner.correlation;
    // Detaching failed the continuation already.
    if !runtime.is_attached(token.inner.source_thread) {
        crate::bridge_trace!("transfer", "#{}: source detached before serving", correlation);
        return;
    }
    let Some((destination, reply)) = runtime.take_continuation(correlation) else {
        fatal(ProtocolMisuse::UnregisteredContinuation { correlation });
    };

    let realm = &token.inner.source_realm;
    let handle = token.inner.source_handle;
    let outcome = realm
        .get(handle)
        .and_then(|value| realm.release(handle).map(|()| value));

    let Some((dest_realm, dest_loop)) = runtime.thread_entry(destination) else {
        crate::bridge_trace!("transfer", "#{}: {} detached before delivery", correlation, destination);
        return;
    };
    let token = token.clone();
    dest_loop.queue_microtask(Box::new(move || {
        let result = outcome.map(|value| dest_realm.retain(value));
        token.fulfil();
        crate::bridge_trace!("transfer", "#{} fulfilled on {}", correlation, destination);
        if let Err(Ok(orphan)) = reply.send(result) {
            let _ = dest_realm.release(orphan);
        }
    }));
}

enum ReceiveState {
    Ready(Option<Result<HostRef, BridgeError>>),
    Waiting {
        rx: oneshot::Receiver<Result<Handle, BridgeError>>,
        realm: Arc<Realm>,
        _keep_alive: KeepAlive,
    },
}

/// Future returned by [`Transferring::receive`].
pub struct Receive {
    state: ReceiveState,
}

impl Receive {
    fn ready(result: Result<HostRef, BridgeError>) -> Self {
        Self {
            state: ReceiveState::Ready(Some(result)),
        }
    }
}

impl Future for Receive {
    type Output = Result<HostRef, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReceiveState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(BridgeError::TransferAborted)))
            }
            ReceiveState::Waiting { rx, realm, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(Ok(handle))) => Poll::Ready(Ok(HostRef::from_owned(realm, handle))),
                Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::TransferAborted)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::host_loop::HostLoop;
    use crate::runtime::context::BridgeRuntime;
    use crate::runtime::config::RuntimeConfig;
    use crate::runtime::value::{HostObject, HostValue};

    #[test]
    fn test_token_holds_extra_reference() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        let token = cx.transfer(&object).unwrap();
        assert_eq!(token.state(), TransferState::Created);
        assert_eq!(cx.realm().refcount(object.handle()), Some(2));

        object.release().unwrap();
        assert!(cx.realm().contains(token.source_handle()));
    }

    #[test]
    fn test_same_thread_receive_returns_source_handle() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        let token = cx.transfer(&object).unwrap();
        let task_cx = cx.clone();
        let task_token = token.clone();
        let mut handle = cx.spawn(async move { task_token.receive(&task_cx).await });
        host_loop.run_until_idle();

        let received = handle.try_result().unwrap().unwrap().unwrap();
        assert_eq!(received.handle(), object.handle());
        assert_eq!(token.state(), TransferState::Fulfilled);
        received.release().unwrap();
        object.release().unwrap();
    }

    #[test]
    fn test_unreceived_token_returns_reference() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        drop(cx.transfer(&object).unwrap());
        host_loop.run_until_idle();
        assert_eq!(cx.realm().refcount(object.handle()), Some(1));
        object.release().unwrap();
    }

    #[test]
    #[should_panic(expected = "protocol misuse: transfer #")]
    fn test_second_receive_is_fatal() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        let token = cx.transfer(&object).unwrap();
        let _first = token.receive(&cx);
        let _second = token.receive(&cx);
    }

    #[test]
    #[should_panic(expected = "was already fulfilled")]
    fn test_resuming_fulfilled_token_is_fatal() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        let token = cx.transfer(&object).unwrap();
        let _received = token.receive(&cx);
        token.fulfil();
    }

    #[cfg(feature = "multithreaded")]
    #[test]
    #[should_panic(expected = "has no registered continuation")]
    fn test_request_without_continuation_is_fatal() {
        let runtime = BridgeRuntime::new(RuntimeConfig::default());
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);

        let object = cx.retain(HostValue::Object(HostObject::new()));
        let token = cx.transfer(&object).unwrap();
        serve_request(&runtime, &token);
    }
}
