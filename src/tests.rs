use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::runtime::abi::{BridgeLower, WireValue, call_import};
use crate::runtime::r#async::host_loop::HostLoop;
use crate::runtime::r#async::promise::JsPromise;
use crate::runtime::bridged::{BridgedClass, HostRef};
use crate::runtime::config::{RuntimeConfig, SpaceRepr};
use crate::runtime::context::BridgeRuntime;
use crate::runtime::error::BridgeError;
use crate::runtime::realm::Realm;
use crate::runtime::value::{HostObject, HostValue};

/// Glue in the shape generated for an imported `Greeter` class.
struct Greeter {
    object: HostRef,
}

impl BridgedClass for Greeter {
    const NAMESPACE: &'static str = "bjs";
    const CLASS: &'static str = "Greeter";

    fn from_host_ref(object: HostRef) -> Self {
        Self { object }
    }

    fn host_ref(&self) -> &HostRef {
        &self.object
    }

    fn into_host_ref(self) -> HostRef {
        self.object
    }
}

impl Greeter {
    fn new(realm: &Arc<Realm>, name: &str) -> Result<Self, BridgeError> {
        Self::construct(realm, &[name.lower(realm)])
    }

    fn name(&self) -> Result<String, BridgeError> {
        self.get_property("name")
    }

    fn set_name(&self, name: &str) -> Result<(), BridgeError> {
        self.set_property("name", name)
    }

    fn age(&self) -> Result<f64, BridgeError> {
        self.get_property("age")
    }

    fn greet(&self) -> Result<String, BridgeError> {
        self.call_method("greet", &[])
    }

    fn change_name(&self, name: &str) -> Result<(), BridgeError> {
        let arg = name.lower(self.host_ref().realm());
        self.call_method("changeName", &[arg])
    }
}

/// Host side of `Greeter`.
fn register_greeter(runtime: &BridgeRuntime) {
    runtime.register_import("bjs_Greeter_init", |realm, args| {
        let name = realm.string_arg(args, 0)?;
        let greeter = HostObject::with_class("Greeter");
        greeter.set("name", name);
        greeter.set("age", 42.0);
        Ok(realm.return_object(greeter.into()))
    });
    runtime.register_import("bjs_Greeter_name_get", |realm, args| {
        let this = realm.object_arg(args, 0)?;
        Ok(realm.return_string(this.get("name").as_str().unwrap_or_default()))
    });
    runtime.register_import("bjs_Greeter_name_set", |realm, args| {
        let this = realm.object_arg(args, 0)?;
        this.set("name", realm.string_arg(args, 1)?);
        Ok(WireValue::Void)
    });
    runtime.register_import("bjs_Greeter_age_get", |realm, args| {
        let this = realm.object_arg(args, 0)?;
        Ok(WireValue::F64(this.get("age").as_number().unwrap_or(f64::NAN)))
    });
    runtime.register_import("bjs_Greeter_greet", |realm, args| {
        let this = realm.object_arg(args, 0)?;
        Ok(realm.return_string(&format!("Hello, {}!", this.get("name"))))
    });
    runtime.register_import("bjs_Greeter_changeName", |realm, args| {
        let this = realm.object_arg(args, 0)?;
        let name = realm.string_arg(args, 1)?;
        if name.is_empty() {
            return Err(HostValue::error("name must not be empty"));
        }
        this.set("name", name);
        Ok(WireValue::Void)
    });
}

/// Host functions that throw `TestError` when asked to.
fn register_throwers(runtime: &BridgeRuntime) {
    runtime.register_import("bjs_jsThrowOrVoid", |realm, args| {
        if realm.bool_arg(args, 0)? {
            return Err(HostValue::error("TestError"));
        }
        Ok(WireValue::Void)
    });
    runtime.register_import("bjs_jsThrowOrNumber", |realm, args| {
        if realm.bool_arg(args, 0)? {
            return Err(HostValue::error("TestError"));
        }
        Ok(WireValue::F64(1.0))
    });
    runtime.register_import("bjs_jsThrowOrString", |realm, args| {
        if realm.bool_arg(args, 0)? {
            return Err(HostValue::error("TestError"));
        }
        Ok(realm.return_string("Hello, world!"))
    });
}

#[test]
fn test_retain_twice_release_twice() {
    for repr in [SpaceRepr::Dense, SpaceRepr::Sparse] {
        let runtime = BridgeRuntime::new(RuntimeConfig {
            object_space: repr,
            ..RuntimeConfig::default()
        });
        let host_loop = HostLoop::new();
        let cx = runtime.attach_current_thread(&host_loop);
        let realm = cx.realm();

        let value = HostValue::Object(HostObject::new());
        let first = realm.retain(value.clone());
        let second = realm.retain(value.clone());
        assert_eq!(first, second);

        realm.release(first).unwrap();
        realm.release(second).unwrap();
        let err = realm.get(first).unwrap_err();
        assert!(err.is_invalid_reference(), "{}: {}", repr, err);
    }
}

#[test]
fn test_bridged_class_lifecycle() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    register_greeter(&runtime);
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let realm = cx.realm();
    let live_before = realm.live_count();

    let greeter = Greeter::new(realm, "Alice").unwrap();
    assert_eq!(greeter.greet().unwrap(), "Hello, Alice!");
    assert_eq!(greeter.age().unwrap(), 42.0);

    greeter.change_name("Bob").unwrap();
    assert_eq!(greeter.name().unwrap(), "Bob");
    greeter.set_name("Carol").unwrap();
    assert_eq!(greeter.greet().unwrap(), "Hello, Carol!");

    let err = greeter.change_name("").unwrap_err();
    assert_eq!(err.as_host_exception().unwrap().message(), "name must not be empty");
    assert_eq!(greeter.name().unwrap(), "Carol");

    // Strings lowered for each call were consumed by the imports.
    assert_eq!(realm.live_count(), live_before + 1);

    let handle = greeter.host_ref().handle();
    greeter.release().unwrap();
    assert!(realm.get(handle).unwrap_err().is_invalid_reference());
    assert_eq!(realm.live_count(), live_before);
}

#[test]
fn test_throwing_import_yields_one_error() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    register_throwers(&runtime);
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let realm = cx.realm();

    let err = call_import::<()>(realm, "bjs_jsThrowOrVoid", &[true.lower(realm)]).unwrap_err();
    assert_eq!(err.as_host_exception().unwrap().message(), "TestError");
    assert!(!realm.has_pending_exception());

    call_import::<()>(realm, "bjs_jsThrowOrVoid", &[false.lower(realm)]).unwrap();
    assert_eq!(
        call_import::<f64>(realm, "bjs_jsThrowOrNumber", &[false.lower(realm)]).unwrap(),
        1.0
    );

    let err = call_import::<String>(realm, "bjs_jsThrowOrString", &[true.lower(realm)]).unwrap_err();
    assert_eq!(err.to_string(), "Error: TestError");
    assert_eq!(
        call_import::<String>(realm, "bjs_jsThrowOrString", &[false.lower(realm)]).unwrap(),
        "Hello, world!"
    );
}

#[test]
fn test_enqueue_is_fifo() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["A", "B", "C"] {
        let order = order.clone();
        cx.executor().enqueue(move || order.lock().unwrap().push(tag));
    }
    assert!(order.lock().unwrap().is_empty());
    host_loop.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn test_zero_delay_timers_run_in_order() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let order = order.clone();
        cx.executor()
            .enqueue_after(move || order.lock().unwrap().push(tag), Duration::ZERO);
    }
    assert!(order.lock().unwrap().is_empty());
    host_loop.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn test_past_deadline_defers_to_next_tick() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let ran = Arc::new(Mutex::new(false));

    std::thread::sleep(Duration::from_millis(2));
    let flag = ran.clone();
    cx.executor()
        .enqueue_at(move || *flag.lock().unwrap() = true, Duration::ZERO);
    assert!(!*ran.lock().unwrap());
    host_loop.run_until_idle();
    assert!(*ran.lock().unwrap());
}

#[test]
fn test_awaiting_host_promise() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    runtime.register_import("bjs_fetchAnswer", |realm, args| {
        let fail = realm.bool_arg(args, 0)?;
        let promise = realm.new_promise();
        let object = promise.to_object();
        realm.scheduler().set_timeout(
            1.0,
            Box::new(move || {
                if fail {
                    promise.reject(HostValue::error("unreachable"));
                } else {
                    promise.resolve(HostValue::Number(42.0));
                }
            }),
        );
        Ok(realm.return_object(object.into()))
    });
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);

    let realm = cx.realm().clone();
    let mut handle = cx.spawn(async move {
        let ok: JsPromise = call_import(&realm, "bjs_fetchAnswer", &[false.lower(&realm)])?;
        let answer = ok.value().await?.as_number();
        ok.into_ref().release()?;

        let bad: JsPromise = call_import(&realm, "bjs_fetchAnswer", &[true.lower(&realm)])?;
        let rejected = bad.value().await.unwrap_err();
        bad.into_ref().release()?;
        Ok::<_, BridgeError>((answer, rejected.to_string()))
    });
    host_loop.run_until_idle();

    let (answer, rejected) = handle.try_result().unwrap().unwrap().unwrap();
    assert_eq!(answer, Some(42.0));
    assert_eq!(rejected, "Error: unreachable");
}

#[cfg(feature = "multithreaded")]
#[test]
fn test_transfer_to_worker_rehomes_object() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);

    // Occupy slots so the source handle differs from the worker's first handle.
    let padding: Vec<HostRef> = (0..3)
        .map(|_| cx.retain(HostValue::Object(HostObject::new())))
        .collect();
    let payload = HostObject::with_class("Payload");
    payload.set("answer", 42.0);
    let object = cx.retain(HostValue::Object(payload.clone()));
    let source_handle = object.handle();

    let token = cx.transfer(&object).unwrap();
    assert_eq!(cx.realm().refcount(source_handle), Some(2));

    let guard = cx.loop_handle().keep_alive();
    let (tx, rx) = mpsc::channel();
    let worker = runtime
        .spawn_worker(move |wcx| {
            let task_cx = wcx.clone();
            wcx.spawn(async move {
                let received = token.receive(&task_cx).await.unwrap();
                let same_object = received
                    .value()
                    .unwrap()
                    .as_object()
                    .is_some_and(|o| o.ptr_eq(&payload));
                tx.send((received.handle(), received.realm().thread(), same_object))
                    .unwrap();
                received.release().unwrap();
                drop(guard);

                // A token is good for exactly one receive.
                let _ = token.receive(&task_cx);
            });
        })
        .unwrap();

    host_loop.run_until_idle();
    let (handle, thread, same_object) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(handle, source_handle);
    assert_ne!(thread, cx.thread());
    assert!(same_object);
    assert_eq!(cx.realm().refcount(source_handle), Some(1));

    let panic = worker.join().unwrap_err();
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(message.starts_with("protocol misuse: transfer #"), "{}", message);

    object.release().unwrap();
    for r in padding {
        r.release().unwrap();
    }
}

#[cfg(feature = "multithreaded")]
#[test]
fn test_receive_from_detached_thread() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let object = cx.retain(HostValue::string("payload"));
    let token = cx.transfer(&object).unwrap();
    let source = cx.thread();
    cx.detach();

    let (tx, rx) = mpsc::channel();
    let worker = runtime
        .spawn_worker(move |wcx| {
            let task_cx = wcx.clone();
            wcx.spawn(async move {
                let outcome = token.receive(&task_cx).await;
                tx.send(outcome.map(|r| r.into_raw())).unwrap();
            });
        })
        .unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Err(BridgeError::ThreadUnavailable(thread)) => assert_eq!(thread, source),
        other => panic!("expected ThreadUnavailable, got {:?}", other),
    }
    worker.terminate();
    worker.join().unwrap();
    drop(object);
}

#[cfg(feature = "multithreaded")]
#[test]
fn test_source_detach_fails_waiting_receive() {
    let runtime = BridgeRuntime::new(RuntimeConfig::default());
    let host_loop = HostLoop::new();
    let cx = runtime.attach_current_thread(&host_loop);
    let object = cx.retain(HostValue::Object(HostObject::new()));
    let token = cx.transfer(&object).unwrap();
    let source = cx.thread();

    let (tx, rx) = mpsc::channel();
    let worker = runtime
        .spawn_worker(move |wcx| {
            let task_cx = wcx.clone();
            wcx.spawn(async move {
                let outcome = token.receive(&task_cx).await;
                tx.send(outcome.map(|r| r.into_raw())).unwrap();
            });
        })
        .unwrap();

    // The request sits in this loop's inbox; detach before serving it.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while runtime.pending_transfers() == 0 {
        assert!(std::time::Instant::now() < deadline, "receive never registered");
        std::thread::sleep(Duration::from_millis(1));
    }
    cx.detach();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        Err(BridgeError::ThreadUnavailable(thread)) => assert_eq!(thread, source),
        other => panic!("expected ThreadUnavailable, got {:?}", other),
    }
    assert_eq!(runtime.pending_transfers(), 0);

    // Serving the stale request afterwards is a no-op.
    host_loop.run_until_idle();
    worker.terminate();
    worker.join().unwrap();
    drop(object);
}
