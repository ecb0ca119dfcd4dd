//! Engine tests against a recording transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use crate::pending::IdGen;
use crate::*;

/// Transport that records every envelope the engine sends.
#[derive(Clone, Default)]
struct Wire {
    sent: Arc<Mutex<Vec<Envelope>>>,
}

impl Wire {
    fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    fn of_kind(&self, kind: Kind) -> Vec<Envelope> {
        self.sent().into_iter().filter(|e| e.kind() == kind).collect()
    }

    fn last_deliver_id(&self) -> CallId {
        self.of_kind(Kind::Deliver).last().expect("no deliver sent").id()
    }
}

impl Sender for Wire {
    fn send(&self, envelope: Envelope) {
        self.sent.lock().unwrap().push(envelope);
    }
}

type Outcome = (Option<Payload>, Option<Payload>);

/// Collects terminal outcomes of deliveries.
#[derive(Clone, Default)]
struct Replies {
    seen: Arc<Mutex<Vec<Outcome>>>,
}

impl Replies {
    fn options(&self) -> DeliverOptions {
        let seen = self.seen.clone();
        DeliverOptions::new().on_reply(move |param, error| seen.lock().unwrap().push((param, error)))
    }

    fn all(&self) -> Vec<Outcome> {
        self.seen.lock().unwrap().clone()
    }
}

fn reason(r: Reason) -> Option<Payload> {
    Some(r.into_payload())
}

fn connected() -> (Npc, Wire) {
    let npc = Npc::builder().name("test").build();
    let wire = Wire::default();
    npc.connect(wire.clone());
    (npc, wire)
}

// --- Outbound deliveries ---

#[tokio::test]
async fn test_deliver_sends_envelopes_with_fresh_ids() {
    let (npc, wire) = connected();

    npc.deliver("first", Some(json!(1)), DeliverOptions::new());
    npc.deliver("second", None, DeliverOptions::new());
    npc.settle().await;

    let sent = wire.sent();
    assert_eq!(sent, vec![
        Envelope::deliver(1, "first", Some(json!(1))),
        Envelope::deliver(2, "second", None),
    ]);
}

#[tokio::test]
async fn test_ack_completes_exactly_once() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    npc.deliver("echo", Some(json!("x")), replies.options());
    npc.settle().await;
    let id = wire.last_deliver_id();

    npc.receive(Envelope::ack(id, Some(json!("x")), None));
    npc.receive(Envelope::ack(id, Some(json!("again")), None));
    npc.receive(Envelope::cancel(id));
    npc.settle().await;

    assert_eq!(replies.all(), vec![(Some(json!("x")), None)]);
}

#[tokio::test]
async fn test_notify_is_ordered_and_silent_after_completion() {
    let (npc, wire) = connected();
    let replies = Replies::default();
    let progress = Arc::new(Mutex::new(Vec::new()));

    let sink = progress.clone();
    let options = replies.options().on_notify(move |param| sink.lock().unwrap().push(param));
    npc.deliver("count", None, options);
    npc.settle().await;
    let id = wire.last_deliver_id();

    npc.receive(Envelope::notify(id, Some(json!(1))));
    npc.receive(Envelope::notify(id, Some(json!(2))));
    npc.receive(Envelope::ack(id, Some(json!(3)), None));
    npc.receive(Envelope::notify(id, Some(json!(4))));
    npc.settle().await;

    assert_eq!(*progress.lock().unwrap(), vec![Some(json!(1)), Some(json!(2))]);
    assert_eq!(replies.all(), vec![(Some(json!(3)), None)]);
}

#[tokio::test]
async fn test_unknown_ids_are_ignored() {
    let (npc, wire) = connected();

    npc.receive(Envelope::ack(42, Some(json!(true)), None));
    npc.receive(Envelope::notify(42, None));
    npc.receive(Envelope::cancel(42));
    npc.settle().await;

    assert!(wire.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_once_and_cancels_remotely() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    npc.deliver("slow", None, replies.options().timeout(Duration::from_millis(50)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    npc.settle().await;

    let id = wire.last_deliver_id();
    assert_eq!(replies.all(), vec![(None, reason(Reason::Timedout))]);
    assert_eq!(wire.of_kind(Kind::Cancel), vec![Envelope::cancel(id)]);

    // A late ack loses the race.
    npc.receive(Envelope::ack(id, Some(json!("late")), None));
    npc.settle().await;
    assert_eq!(replies.all().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ack_disarms_timer() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    npc.deliver("fast", None, replies.options().timeout(Duration::from_millis(50)));
    npc.settle().await;
    npc.receive(Envelope::ack(wire.last_deliver_id(), Some(json!("ok")), None));
    tokio::time::sleep(Duration::from_millis(200)).await;
    npc.settle().await;

    assert_eq!(replies.all(), vec![(Some(json!("ok")), None)]);
    assert!(wire.of_kind(Kind::Cancel).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_arms_nothing() {
    let (npc, _wire) = connected();
    let replies = Replies::default();

    npc.deliver("forever", None, replies.options().timeout(Duration::ZERO));
    tokio::time::sleep(Duration::from_secs(60)).await;
    npc.settle().await;

    assert!(replies.all().is_empty());
}

#[tokio::test]
async fn test_cancel_handle_wins_once() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    let handle = npc.deliver("slow", None, replies.options());
    handle.cancel();
    handle.clone().cancel();
    npc.settle().await;

    let id = wire.last_deliver_id();
    assert_eq!(replies.all(), vec![(None, reason(Reason::Cancelled))]);
    assert_eq!(wire.of_kind(Kind::Cancel), vec![Envelope::cancel(id)]);

    npc.receive(Envelope::ack(id, None, None));
    npc.settle().await;
    assert_eq!(replies.all().len(), 1);
}

#[tokio::test]
async fn test_deliver_without_transport_replies_disconnected() {
    let npc = Npc::new();
    let replies = Replies::default();

    let handle = npc.deliver("anything", None, replies.options());
    handle.cancel();
    npc.settle().await;

    assert_eq!(replies.all(), vec![(None, reason(Reason::Disconnected))]);
}

#[tokio::test]
async fn test_disconnect_drains_every_pending_delivery() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    for method in ["a", "b", "c"] {
        npc.deliver(method, None, replies.options());
    }
    npc.settle().await;
    let ids: Vec<CallId> = wire.of_kind(Kind::Deliver).iter().map(Envelope::id).collect();

    npc.disconnect();
    npc.settle().await;
    assert_eq!(replies.all(), vec![(None, reason(Reason::Disconnected)); 3]);

    // Nothing is left to complete after reconnecting.
    npc.connect(wire.clone());
    for id in ids {
        npc.receive(Envelope::ack(id, Some(json!("late")), None));
    }
    npc.settle().await;
    assert_eq!(replies.all().len(), 3);
}

#[tokio::test]
async fn test_operations_after_disconnect_behave_unconnected() {
    let (npc, wire) = connected();
    let replies = Replies::default();

    npc.disconnect();
    npc.emit("ping", None);
    npc.deliver("ping", None, replies.options());
    npc.settle().await;

    assert!(wire.sent().is_empty());
    assert_eq!(replies.all(), vec![(None, reason(Reason::Disconnected))]);
}

#[tokio::test]
async fn test_connect_replaces_previous_transport() {
    let (npc, first) = connected();
    let replies = Replies::default();

    npc.deliver("old", None, replies.options());
    let second = Wire::default();
    npc.connect(second.clone());
    npc.deliver("new", None, DeliverOptions::new());
    npc.settle().await;

    assert_eq!(replies.all(), vec![(None, reason(Reason::Disconnected))]);
    assert_eq!(first.of_kind(Kind::Deliver).len(), 1);
    assert_eq!(second.of_kind(Kind::Deliver).len(), 1);
    assert_eq!(second.sent()[0].method(), Some("new"));
}

#[tokio::test]
async fn test_dropping_last_handle_fails_pending_deliveries() {
    let (npc, _wire) = connected();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let options = DeliverOptions::new().on_reply(move |param, error| {
        let _ = tx.send((param, error));
    });
    npc.deliver("never", None, options);
    drop(npc);

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(outcome, (None, reason(Reason::Disconnected)));
}

// --- Inbound calls ---

#[tokio::test]
async fn test_unregistered_deliver_acks_unimplemented() {
    let (npc, wire) = connected();

    npc.receive(Envelope::deliver(7, "missing", Some(json!(1))));
    npc.settle().await;

    assert_eq!(wire.sent(), vec![Envelope::ack(7, None, reason(Reason::Unimplemented))]);
}

#[tokio::test]
async fn test_unregistered_emit_is_dropped() {
    let (npc, wire) = connected();

    npc.receive(Envelope::emit("missing", Some(json!(1))));
    npc.settle().await;

    assert!(wire.sent().is_empty());
}

#[tokio::test]
async fn test_emit_handler_gets_inert_capabilities() {
    let (npc, wire) = connected();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    npc.on("log", move |param, notify, reply| {
        notify.notify(Some(json!("progress")));
        let replied = reply.ok(json!("ignored"));
        sink.lock().unwrap().push((param, replied));
        None
    });
    npc.receive(Envelope::emit("log", Some(json!("hello"))));
    npc.settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![(Some(json!("hello")), false)]);
    assert!(wire.sent().is_empty());
}

#[tokio::test]
async fn test_handler_notifies_then_replies_once() {
    let (npc, wire) = connected();

    npc.on("count", |_param, notify, reply| {
        notify.notify(Some(json!(1)));
        notify.notify(Some(json!(2)));
        assert!(reply.ok(json!(3)));
        assert!(!reply.err(json!("twice")));
        notify.notify(Some(json!(4)));
        None
    });
    npc.receive(Envelope::deliver(9, "count", None));
    npc.settle().await;
    npc.settle().await;

    assert_eq!(wire.sent(), vec![
        Envelope::notify(9, Some(json!(1))),
        Envelope::notify(9, Some(json!(2))),
        Envelope::ack(9, Some(json!(3)), None),
    ]);
}

#[tokio::test]
async fn test_peer_cancel_runs_thunk_once_and_suppresses_reply() {
    let (npc, wire) = connected();
    let cancels = Arc::new(AtomicUsize::new(0));
    let parked: Arc<Mutex<Option<Reply>>> = Arc::default();

    let counter = cancels.clone();
    let slot = parked.clone();
    npc.on("slow", move |_param, _notify, reply| {
        *slot.lock().unwrap() = Some(reply);
        let counter = counter.clone();
        Some(Cancel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    });
    npc.receive(Envelope::deliver(5, "slow", None));
    npc.receive(Envelope::cancel(5));
    npc.receive(Envelope::cancel(5));
    npc.settle().await;

    assert_eq!(cancels.load(Ordering::SeqCst), 1);

    let reply = parked.lock().unwrap().take().unwrap();
    assert!(reply.is_completed());
    assert!(!reply.ok(json!("too late")));
    npc.settle().await;
    assert!(wire.sent().is_empty());
}

#[tokio::test]
async fn test_reply_retires_cancel_thunk() {
    let (npc, wire) = connected();
    let cancels = Arc::new(AtomicUsize::new(0));

    let counter = cancels.clone();
    npc.on("quick", move |param, _notify, reply| {
        reply.reply(param, None);
        let counter = counter.clone();
        Some(Cancel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    });
    npc.receive(Envelope::deliver(3, "quick", Some(json!("x"))));
    npc.receive(Envelope::cancel(3));
    npc.settle().await;
    npc.settle().await;

    assert_eq!(cancels.load(Ordering::SeqCst), 0);
    assert_eq!(wire.sent(), vec![Envelope::ack(3, Some(json!("x")), None)]);
}

#[tokio::test]
async fn test_disconnect_cancels_inbound_calls() {
    let (npc, _wire) = connected();
    let cancels = Arc::new(AtomicUsize::new(0));

    let counter = cancels.clone();
    npc.on("slow", move |_param, _notify, _reply| {
        let counter = counter.clone();
        Some(Cancel::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    });
    npc.receive(Envelope::deliver(1, "slow", None));
    npc.receive(Envelope::deliver(2, "slow", None));
    npc.disconnect();
    npc.receive(Envelope::cancel(1));
    npc.settle().await;

    assert_eq!(cancels.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_late_reply_does_not_reach_a_new_transport() {
    let (npc, old) = connected();
    let parked: Arc<Mutex<Option<(Notify, Reply)>>> = Arc::default();

    let slot = parked.clone();
    npc.on("slow", move |_param, notify, reply| {
        *slot.lock().unwrap() = Some((notify, reply));
        None
    });
    npc.receive(Envelope::deliver(1, "slow", None));
    npc.settle().await;

    npc.disconnect();
    let new = Wire::default();
    npc.connect(new.clone());
    npc.settle().await;

    let (notify, reply) = parked.lock().unwrap().take().expect("handler ran");
    notify.notify(Some(json!("stale progress")));
    reply.ok(json!("stale"));
    npc.settle().await;
    npc.settle().await;

    assert!(new.sent().is_empty(), "{:?}", new.sent());
    assert!(old.sent().is_empty());
}

#[tokio::test]
async fn test_disconnect_if_ignores_replaced_transport() {
    let npc = Npc::new();
    let first = Wire::default();
    let second = Wire::default();
    let replies = Replies::default();

    let old = npc.connect(first.clone());
    let current = npc.connect(second.clone());
    assert_ne!(old, current);

    npc.deliver("kept", None, replies.options());
    npc.disconnect_if(old);
    npc.settle().await;
    assert!(replies.all().is_empty());
    assert_eq!(second.of_kind(Kind::Deliver).len(), 1);

    npc.disconnect_if(current);
    npc.settle().await;
    assert_eq!(replies.all(), vec![(None, reason(Reason::Disconnected))]);
}

#[tokio::test]
async fn test_receive_from_replaced_transport_is_dropped() {
    let npc = Npc::new();
    let replies = Replies::default();
    let old = npc.connect(Wire::default());
    let wire = Wire::default();
    let current = npc.connect(wire.clone());

    npc.deliver("m", None, replies.options());
    npc.settle().await;
    let id = wire.last_deliver_id();

    npc.receive_from(old, Envelope::ack(id, Some(json!("wrong peer")), None));
    npc.settle().await;
    assert!(replies.all().is_empty());

    npc.receive_from(current, Envelope::ack(id, Some(json!("right peer")), None));
    npc.settle().await;
    assert_eq!(replies.all(), vec![(Some(json!("right peer")), None)]);
}

#[tokio::test]
async fn test_abort_handle_as_cancel_thunk() {
    let (npc, wire) = connected();

    npc.on("work", |_param, _notify, reply| {
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            reply.ok(json!("finished"));
        });
        Some(task.abort_handle().into())
    });
    npc.receive(Envelope::deliver(11, "work", None));
    npc.receive(Envelope::cancel(11));
    npc.settle().await;
    tokio::task::yield_now().await;
    npc.settle().await;

    assert!(wire.sent().is_empty());
}

#[tokio::test]
async fn test_last_registration_wins_and_off_unregisters() {
    let (npc, wire) = connected();

    npc.on("who", |_param, _notify, reply| {
        reply.ok(json!("first"));
        None
    });
    npc.on("who", |_param, _notify, reply| {
        reply.ok(json!("second"));
        None
    });
    npc.receive(Envelope::deliver(1, "who", None));
    npc.settle().await;
    npc.off("who");
    npc.receive(Envelope::deliver(2, "who", None));
    npc.settle().await;

    assert_eq!(wire.sent(), vec![
        Envelope::ack(1, Some(json!("second")), None),
        Envelope::ack(2, None, reason(Reason::Unimplemented)),
    ]);
}

#[tokio::test]
async fn test_reentrant_handler_does_not_deadlock() {
    let (npc, wire) = connected();

    let weak = npc.downgrade();
    npc.on("ping", move |_param, _notify, reply| {
        if let Some(npc) = weak.upgrade() {
            npc.emit("pong", None);
            npc.deliver("pong", None, DeliverOptions::new());
        }
        reply.ok(json!("done"));
        None
    });
    npc.receive(Envelope::deliver(1, "ping", None));
    npc.settle().await;
    npc.settle().await;

    let kinds: Vec<Kind> = wire.sent().iter().map(Envelope::kind).collect();
    assert_eq!(kinds, vec![Kind::Emit, Kind::Deliver, Kind::Ack]);
}

// --- request() ---

/// Connects `npc` to a transport that answers every deliver itself.
fn auto_ack(npc: &Npc, error: Option<Payload>) {
    let weak = npc.downgrade();
    npc.connect(move |envelope: Envelope| {
        if envelope.kind() != Kind::Deliver {
            return;
        }
        if let Some(npc) = weak.upgrade() {
            let param = if error.is_some() { None } else { envelope.param().cloned() };
            npc.receive(Envelope::ack(envelope.id(), param, error.clone()));
        }
    });
}

#[tokio::test]
async fn test_request_resolves_with_param() {
    let npc = Npc::new();
    auto_ack(&npc, None);

    let outcome = npc.request("echo", Some(json!({"a": 1})), None).await;
    assert_eq!(outcome, Ok(Some(json!({"a": 1}))));
}

#[tokio::test]
async fn test_request_resolves_with_error() {
    let npc = Npc::new();
    auto_ack(&npc, Some(json!("boom")));

    let outcome = npc.request("echo", None, None).await;
    assert_eq!(outcome, Err(json!("boom")));
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out() {
    let (npc, wire) = connected();

    let outcome = npc.request("slow", None, Some(Duration::from_millis(10))).await;
    assert_eq!(outcome, Err(Reason::Timedout.into_payload()));
    npc.settle().await;
    assert_eq!(wire.of_kind(Kind::Cancel).len(), 1);
}

#[tokio::test]
async fn test_dropped_request_cancels_the_call() {
    let (npc, wire) = connected();

    let pending = npc.request("slow", None, None);
    let abandoned = tokio::time::timeout(Duration::from_millis(10), pending).await;
    assert!(abandoned.is_err());
    npc.settle().await;

    let id = wire.last_deliver_id();
    assert_eq!(wire.of_kind(Kind::Cancel), vec![Envelope::cancel(id)]);
}

// --- Id allocation ---

#[test]
fn test_ids_start_at_one() {
    let mut ids = IdGen::default();
    assert_eq!(ids.next(|_| false), 1);
    assert_eq!(ids.next(|_| false), 2);
}

#[test]
fn test_ids_wrap_to_min_and_skip_zero() {
    let mut ids = IdGen::starting_after(CallId::MAX);
    assert_eq!(ids.next(|_| false), CallId::MIN);

    let mut ids = IdGen::starting_after(-1);
    assert_eq!(ids.next(|_| false), 1);
}

#[test]
fn test_ids_skip_outstanding_calls() {
    let mut ids = IdGen::default();
    let outstanding = [1, 2, 4];
    assert_eq!(ids.next(|id| outstanding.contains(&id)), 3);
    assert_eq!(ids.next(|id| outstanding.contains(&id)), 5);
}

// --- Envelope and Reason ---

#[test]
fn test_envelope_display_omits_absent_fields() {
    let deliver = Envelope::deliver(3, "echo", Some(json!("hi")));
    assert_eq!(deliver.to_string(), r#"{typ: deliver, id: 3, method: echo, param: "hi"}"#);

    let ack = Envelope::ack(3, None, Some(json!("timedout")));
    assert_eq!(ack.to_string(), r#"{typ: ack, id: 3, error: "timedout"}"#);

    assert_eq!(Envelope::cancel(8).to_string(), "{typ: cancel, id: 8}");
}

#[test]
fn test_envelope_serialized_shape() {
    let value = serde_json::to_value(Envelope::deliver(7, "echo", Some(json!([1, 2])))).unwrap();
    assert_eq!(value, json!({"typ": 1, "id": 7, "method": "echo", "param": [1, 2]}));

    let value = serde_json::to_value(Envelope::cancel(7)).unwrap();
    assert_eq!(value, json!({"typ": 4, "id": 7}));
}

#[test]
fn test_envelope_rejects_invalid_shapes() {
    let unknown = serde_json::from_value::<Envelope>(json!({"typ": 9, "id": 1}));
    assert!(unknown.unwrap_err().to_string().contains("unknown envelope kind"));

    let missing = serde_json::from_value::<Envelope>(json!({"typ": 1, "id": 1}));
    assert!(missing.unwrap_err().to_string().contains("missing its method"));

    let unexpected = serde_json::from_value::<Envelope>(json!({"typ": 3, "id": 1, "method": "x"}));
    assert!(unexpected.unwrap_err().to_string().contains("must not carry a method"));
}

#[test]
fn test_envelope_defaults_missing_id() {
    let emit: Envelope = serde_json::from_value(json!({"typ": 0, "method": "log"})).unwrap();
    assert_eq!(emit, Envelope::emit("log", None));
}

#[test]
fn test_envelope_null_payload_is_absent() {
    let ack = Envelope::ack(1, Some(serde_json::Value::Null), Some(serde_json::Value::Null));
    assert_eq!(ack, Envelope::ack(1, None, None));
    assert_eq!(ack.param(), None);

    let value = serde_json::to_value(&ack).unwrap();
    assert_eq!(value, json!({"typ": 3, "id": 1}));
    assert_eq!(serde_json::from_value::<Envelope>(value).unwrap(), ack);

    let read: Envelope = serde_json::from_value(json!({"typ": 2, "id": 4, "param": null})).unwrap();
    assert_eq!(read, Envelope::notify(4, None));
}

#[test]
fn test_reason_payloads() {
    for reason in [Reason::Disconnected, Reason::Timedout, Reason::Cancelled, Reason::Unimplemented] {
        assert_eq!(Reason::from_payload(&reason.into_payload()), Some(reason));
    }
    assert_eq!(Reason::from_payload(&json!("boom")), None);
    assert_eq!(Reason::from_payload(&json!(3)), None);
}
