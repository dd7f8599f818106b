//! Host promises and the guest-side view of them.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::executor::Scheduler;
use crate::runtime::abi::{BridgeLift, WireValue};
use crate::runtime::bridged::{DynValue, HostRef};
use crate::runtime::error::{BridgeError, HostException};
use crate::runtime::realm::Realm;
use crate::runtime::value::{HostObject, HostValue, lock};

/// Settlement of a promise: `Ok` fulfilled, `Err` rejected.
pub type Outcome = Result<HostValue, HostValue>;

type Reaction = Box<dyn FnOnce(Outcome) + Send>;

enum PromiseState {
    Pending(Vec<Reaction>),
    Settled(Outcome),
}

struct PromiseInner {
    state: Mutex<PromiseState>,
    scheduler: Arc<dyn Scheduler>,
}

/// A host promise. Reactions always run as microtasks, never inline.
#[derive(Clone)]
pub struct HostPromise {
    inner: Arc<PromiseInner>,
}

impl HostPromise {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState::Pending(Vec::new())),
                scheduler,
            }),
        }
    }

    /// Wrap this promise in a host object. Call once per promise: each
    /// object has its own identity.
    pub fn to_object(&self) -> HostObject {
        HostObject::from_promise(self.clone())
    }

    pub fn resolve(&self, value: HostValue) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, reason: HostValue) -> bool {
        self.settle(Err(reason))
    }

    /// First settlement wins; later ones return `false`.
    fn settle(&self, outcome: Outcome) -> bool {
        let reactions = {
            let mut state = lock(&self.inner.state);
            match &mut *state {
                PromiseState::Settled(_) => return false,
                PromiseState::Pending(reactions) => {
                    let reactions = std::mem::take(reactions);
                    *state = PromiseState::Settled(outcome.clone());
                    reactions
                }
            }
        };
        for reaction in reactions {
            let outcome = outcome.clone();
            self.inner
                .scheduler
                .queue_microtask(Box::new(move || reaction(outcome)));
        }
        true
    }

    /// Register a reaction to run once the promise settles.
    pub fn then<F>(&self, reaction: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let mut state = lock(&self.inner.state);
        match &mut *state {
            PromiseState::Pending(reactions) => reactions.push(Box::new(reaction)),
            PromiseState::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                self.inner
                    .scheduler
                    .queue_microtask(Box::new(move || reaction(outcome)));
            }
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &*lock(&self.inner.state) {
            PromiseState::Pending(_) => None,
            PromiseState::Settled(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }
}

impl fmt::Debug for HostPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            None => write!(f, "HostPromise(<pending>)"),
            Some(Ok(v)) => write!(f, "HostPromise(fulfilled: {})", v),
            Some(Err(e)) => write!(f, "HostPromise(rejected: {})", e),
        }
    }
}

/// Guest-side reference to a host promise.
#[derive(Debug)]
pub struct JsPromise {
    object: HostRef,
}

impl JsPromise {
    /// Adopt a reference, checking that it points at a promise.
    pub fn from_ref(object: HostRef) -> Result<Self, BridgeError> {
        let value = object.value()?;
        if value.as_object().and_then(HostObject::as_promise).is_none() {
            return Err(BridgeError::mismatch("promise", value.type_of()));
        }
        Ok(Self { object })
    }

    pub fn host_ref(&self) -> &HostRef {
        &self.object
    }

    pub fn into_ref(self) -> HostRef {
        self.object
    }

    fn host_promise(&self) -> Result<HostPromise, BridgeError> {
        let value = self.object.value()?;
        value
            .as_object()
            .and_then(HostObject::as_promise)
            .cloned()
            .ok_or_else(|| BridgeError::mismatch("promise", value.type_of()))
    }

    /// Wait for settlement. A rejection surfaces as a host exception.
    pub async fn value(&self) -> Result<DynValue, BridgeError> {
        let realm = self.object.realm().clone();
        let promise = self.host_promise()?;
        let (tx, rx) = oneshot::channel();
        promise.then(move |outcome| {
            let _ = tx.send(outcome);
        });
        match rx.await {
            Ok(Ok(value)) => DynValue::from_host(&realm, &value),
            Ok(Err(reason)) => Err(BridgeError::HostException(HostException::new(reason))),
            Err(_) => Err(BridgeError::HostException(HostException::new(
                HostValue::error("promise dropped before settling"),
            ))),
        }
    }
}

impl BridgeLift for JsPromise {
    fn lift(realm: &Arc<Realm>, wire: WireValue) -> Result<Self, BridgeError> {
        JsPromise::from_ref(HostRef::lift(realm, wire)?)
    }
}
