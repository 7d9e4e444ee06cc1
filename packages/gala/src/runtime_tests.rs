use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use soiree::Pool;

use crate::job::failure_kind;
use crate::testing::{FailingDispatcher, RecordingDispatcher};
use crate::{
    Context, ContextFlag, Definition, EmitMode, Envelope, FailureKind, GalaError, HandlerContext, Headers,
    QueueClass, Registration, Runtime, Topic, TopicPayload, TypedContextCodec,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MemberChanged {
    operation: String,
    member_id: u64,
}

impl TopicPayload for MemberChanged {
    fn operation(&self) -> Option<&str> {
        Some(&self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Actor {
    id: String,
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
#[error("member {0} rejected")]
struct Rejected(u64);

type Calls = Arc<Mutex<Vec<String>>>;

fn member_topic() -> Topic<MemberChanged> {
    Topic::new("member.changed")
}

fn changed(operation: &str, member_id: u64) -> MemberChanged {
    MemberChanged {
        operation: operation.to_string(),
        member_id,
    }
}

fn runtime_with_topic(mode: EmitMode) -> Runtime {
    let runtime = Runtime::new();
    Registration::json(member_topic())
        .emit_mode(mode)
        .register(runtime.registry())
        .unwrap();
    runtime
}

fn recording(calls: &Calls, label: &str) -> Definition<MemberChanged> {
    let calls = calls.clone();
    let label = label.to_string();
    Definition::new(&member_topic(), label.clone()).handle(move |_, member: MemberChanged| {
        let calls = calls.clone();
        let label = label.clone();
        async move {
            calls
                .lock()
                .unwrap()
                .push(format!("{label}:{}", member.operation));
            anyhow::Ok(())
        }
    })
}

fn counting(counter: &Arc<AtomicUsize>, name: &str) -> Definition<MemberChanged> {
    let counter = counter.clone();
    Definition::new(&member_topic(), name).handle(move |_, _| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })
}

// ============================================================================
// Inline dispatch
// ============================================================================

#[tokio::test]
async fn test_inline_emit_runs_listeners_in_registration_order() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let calls = Calls::default();
    runtime
        .registry()
        .register_listeners([recording(&calls, "first"), recording(&calls, "second")])
        .unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    assert!(receipt.accepted);
    assert!(receipt.error.is_none());
    assert!(receipt.event_id.is_some());
    assert_eq!(*calls.lock().unwrap(), vec!["first:CREATE", "second:CREATE"]);
}

#[tokio::test]
async fn test_operation_filters_select_listeners() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let calls = Calls::default();
    runtime
        .registry()
        .register_listeners([
            recording(&calls, "on_create").operations(["CREATE"]),
            recording(&calls, "on_delete").operations(["DELETE", " "]),
            recording(&calls, "audit"),
        ])
        .unwrap();

    let ctx = Context::background();
    for operation in ["CREATE", "DELETE", "UPDATE"] {
        let receipt = runtime
            .emit_typed(&ctx, &member_topic(), &changed(operation, 7), Headers::new())
            .await;
        assert!(receipt.accepted, "{operation} rejected: {:?}", receipt.error);
    }

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "on_create:CREATE",
            "audit:CREATE",
            "on_delete:DELETE",
            "audit:DELETE",
            "audit:UPDATE",
        ]
    );
    assert!(runtime.registry().interested_in(member_topic().name(), Some("UPDATE")));
}

#[tokio::test]
async fn test_listener_resolves_injected_dependencies() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    runtime.injector().provide(Outbox::default());

    Definition::new(&member_topic(), "send_welcome")
        .handle(|ctx: HandlerContext, member: MemberChanged| async move {
            let outbox = ctx.resolve::<Outbox>()?;
            outbox
                .sent
                .lock()
                .unwrap()
                .push(format!("welcome {} via {}", member.member_id, ctx.topic()));
            anyhow::Ok(())
        })
        .attach(runtime.registry())
        .unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 3), Headers::new())
        .await;
    assert!(receipt.accepted);

    let outbox = runtime.injector().resolve::<Outbox>().unwrap();
    assert_eq!(
        *outbox.sent.lock().unwrap(),
        vec!["welcome 3 via member.changed".to_string()]
    );
}

#[tokio::test]
async fn test_missing_dependency_fails_listener() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    Definition::new(&member_topic(), "send_welcome")
        .handle(|ctx: HandlerContext, _| async move {
            ctx.resolve::<Outbox>()?;
            anyhow::Ok(())
        })
        .attach(runtime.registry())
        .unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 3), Headers::new())
        .await;

    let error = receipt.error.unwrap();
    let listener = error.listener_error().unwrap();
    assert!(matches!(
        listener.cause.downcast_ref::<GalaError>(),
        Some(GalaError::DependencyNotProvided { .. })
    ));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_listener_error_stops_later_listeners() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let later = Arc::new(AtomicUsize::new(0));

    Definition::new(&member_topic(), "reject_member")
        .handle(|_, member: MemberChanged| async move {
            Err::<(), _>(anyhow::Error::new(Rejected(member.member_id)))
        })
        .attach(runtime.registry())
        .unwrap();
    counting(&later, "never_runs").attach(runtime.registry()).unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 9), Headers::new())
        .await;

    assert!(!receipt.accepted);
    assert!(receipt.event_id.is_some());
    assert_eq!(later.load(Ordering::SeqCst), 0);

    let error = receipt.error.unwrap();
    let listener = error.listener_error().unwrap();
    assert_eq!(listener.listener, "reject_member");
    assert!(!listener.panicked);
    assert!(!listener.is_panic());
    assert!(listener.cause.downcast_ref::<Rejected>().is_some());
    assert!(listener.source().is_some());
    assert_eq!(failure_kind(&error), FailureKind::Retryable);
}

#[tokio::test]
async fn test_listener_panic_is_captured() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let later = Arc::new(AtomicUsize::new(0));

    Definition::new(&member_topic(), "explodes")
        .handle(|_, member: MemberChanged| async move {
            if member.member_id == 0 {
                panic!("member id must not be zero");
            }
            anyhow::Ok(())
        })
        .attach(runtime.registry())
        .unwrap();
    counting(&later, "never_runs").attach(runtime.registry()).unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 0), Headers::new())
        .await;

    let error = receipt.error.unwrap();
    let listener = error.listener_error().unwrap();
    assert_eq!(listener.listener, "explodes");
    assert!(listener.panicked);
    assert!(listener.is_panic());
    match listener.cause.downcast_ref::<GalaError>() {
        Some(GalaError::ListenerPanicked { message }) => {
            assert!(message.contains("member id must not be zero"));
        }
        other => panic!("expected ListenerPanicked cause, got {other:?}"),
    }
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_emit_to_unregistered_topic_has_no_event_id() {
    let runtime = Runtime::new();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    assert!(receipt.event_id.is_none());
    assert!(matches!(receipt.error, Some(GalaError::TopicNotRegistered { .. })));
}

#[tokio::test]
async fn test_emit_with_wrong_payload_type_is_rejected() {
    let runtime = runtime_with_topic(EmitMode::Inline);

    let receipt = runtime
        .emit_with_headers(
            &Context::background(),
            member_topic().name(),
            &"not a member",
            Headers::new(),
        )
        .await;

    assert!(receipt.event_id.is_none());
    assert!(matches!(receipt.error, Some(GalaError::PayloadTypeMismatch { .. })));
}

#[tokio::test]
async fn test_listener_typed_for_another_payload_fails_dispatch() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let json_topic: Topic<serde_json::Value> = Topic::new("member.changed");

    Definition::new(&json_topic, "untyped_listener")
        .handle(|_, _| async { anyhow::Ok(()) })
        .attach(runtime.registry())
        .unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    let error = receipt.error.unwrap();
    let listener = error.listener_error().unwrap();
    assert!(matches!(
        listener.cause.downcast_ref::<GalaError>(),
        Some(GalaError::PayloadTypeMismatch { .. })
    ));
}

// ============================================================================
// Durable and dual routing
// ============================================================================

#[tokio::test]
async fn test_durable_emit_requires_dispatcher() {
    let runtime = runtime_with_topic(EmitMode::Durable);

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    assert!(receipt.event_id.is_some());
    assert!(matches!(
        receipt.error,
        Some(GalaError::DurableDispatcherRequired { .. })
    ));
}

#[tokio::test]
async fn test_durable_emit_hands_envelope_to_dispatcher() {
    let spy = RecordingDispatcher::new();
    let runtime = Runtime::builder().durable_dispatcher(spy.clone()).build();
    let topic = member_topic().with_schema_version(3);
    Registration::json(topic.clone())
        .emit_mode(EmitMode::Durable)
        .queue_class(QueueClass::INTEGRATION)
        .register(runtime.registry())
        .unwrap();
    let calls = Calls::default();
    runtime.registry().attach_listener(recording(&calls, "inline_only")).unwrap();

    let receipt = runtime
        .emit_typed(
            &Context::background(),
            &topic,
            &changed("CREATE", 5),
            Headers::new().with_idempotency_key("member-5-created"),
        )
        .await;

    assert!(receipt.accepted);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(spy.calls(), 1);

    let envelope = &spy.envelopes()[0];
    assert_eq!(Some(&envelope.id), receipt.event_id.as_ref());
    assert_eq!(envelope.schema_version, 3);
    assert_eq!(envelope.headers.idempotency_key.as_deref(), Some("member-5-created"));
    assert_eq!(spy.policies()[0].queue_class, QueueClass::INTEGRATION);

    let decoded: MemberChanged = serde_json::from_slice(&envelope.payload).unwrap();
    assert_eq!(decoded, changed("CREATE", 5));
}

#[tokio::test]
async fn test_dual_mode_runs_inline_once_and_reports_durable_failure() {
    let failing = FailingDispatcher::new();
    let runtime = Runtime::builder().durable_dispatcher(failing.clone()).build();
    Registration::json(member_topic())
        .emit_mode(EmitMode::Dual)
        .register(runtime.registry())
        .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    counting(&counter, "inline_listener").attach(runtime.registry()).unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    assert!(receipt.event_id.is_some());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(failing.calls(), 1);

    let error = receipt.error.unwrap();
    assert!(error
        .flatten()
        .any(|e| matches!(e, GalaError::JobInsertFailed { .. })));
}

#[tokio::test]
async fn test_dual_mode_joins_both_failures() {
    let runtime = Runtime::builder()
        .durable_dispatcher(FailingDispatcher::new())
        .build();
    Registration::json(member_topic())
        .emit_mode(EmitMode::Dual)
        .register(runtime.registry())
        .unwrap();
    Definition::new(&member_topic(), "reject_member")
        .handle(|_, member: MemberChanged| async move {
            Err::<(), _>(anyhow::Error::new(Rejected(member.member_id)))
        })
        .attach(runtime.registry())
        .unwrap();

    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 2), Headers::new())
        .await;

    let error = receipt.error.unwrap();
    assert_eq!(error.flatten().count(), 2);
    assert!(error.listener_error().is_some());
}

#[tokio::test]
async fn test_emit_mode_override_ignores_topic_mode() {
    let spy = RecordingDispatcher::new();
    let runtime = Runtime::builder().durable_dispatcher(spy.clone()).build();
    Registration::json(member_topic())
        .emit_mode(EmitMode::Inline)
        .register(runtime.registry())
        .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    counting(&counter, "inline_listener").attach(runtime.registry()).unwrap();

    let receipt = runtime
        .emit_with_mode(
            &Context::background(),
            member_topic().name(),
            &changed("CREATE", 1),
            Headers::new(),
            EmitMode::Durable,
        )
        .await;

    assert!(receipt.accepted);
    assert_eq!(spy.calls(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Context across the durable boundary
// ============================================================================

#[tokio::test]
async fn test_durable_replay_restores_context_values_and_flags() {
    let spy = RecordingDispatcher::new();
    let runtime = Runtime::builder().durable_dispatcher(spy.clone()).build();
    runtime
        .context_manager()
        .register(TypedContextCodec::<Actor>::new("actor"))
        .unwrap();
    Registration::json(member_topic())
        .emit_mode(EmitMode::Durable)
        .register(runtime.registry())
        .unwrap();

    let seen: Arc<Mutex<Option<(Option<Actor>, bool)>>> = Arc::default();
    Definition::new(&member_topic(), "audit")
        .handle({
            let seen = seen.clone();
            move |ctx: HandlerContext, _| {
                let seen = seen.clone();
                async move {
                    let actor = ctx.context.value::<Actor>().cloned();
                    let bypass = ctx.context.has_flag(&ContextFlag::WORKFLOW_BYPASS);
                    *seen.lock().unwrap() = Some((actor, bypass));
                    anyhow::Ok(())
                }
            }
        })
        .attach(runtime.registry())
        .unwrap();

    let emit_ctx = Context::background()
        .with_value(Actor { id: "member-1".into() })
        .with_flag(ContextFlag::WORKFLOW_BYPASS);
    let receipt = runtime
        .emit_typed(&emit_ctx, &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;
    assert!(receipt.accepted);

    let envelope = spy.envelopes().remove(0);
    assert!(envelope.context_snapshot.values.contains_key("actor"));
    assert_eq!(envelope.context_snapshot.flags.get("workflow_bypass"), Some(&true));

    // Round-trip through the wire format before replaying.
    let envelope = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
    runtime
        .dispatch_envelope(&Context::background(), envelope)
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, Some((Some(Actor { id: "member-1".into() }), true)));
}

#[tokio::test]
async fn test_emit_envelope_keeps_id_and_captures_missing_snapshot() {
    let spy = RecordingDispatcher::new();
    let runtime = Runtime::builder().durable_dispatcher(spy.clone()).build();
    runtime
        .context_manager()
        .register(TypedContextCodec::<Actor>::new("actor"))
        .unwrap();
    Registration::json(member_topic())
        .emit_mode(EmitMode::Durable)
        .register(runtime.registry())
        .unwrap();

    let payload = serde_json::to_vec(&changed("UPDATE", 4)).unwrap();
    let envelope = Envelope::new("member.changed", payload).with_id("evt-prebuilt");
    let ctx = Context::background().with_value(Actor { id: "admin".into() });

    runtime.emit_envelope(&ctx, envelope).await.unwrap();

    let recorded = &spy.envelopes()[0];
    assert_eq!(recorded.id.as_str(), "evt-prebuilt");
    assert_eq!(
        recorded.context_snapshot.values.get("actor"),
        Some(&serde_json::json!({"id": "admin"}))
    );
}

#[tokio::test]
async fn test_emit_envelope_rejects_unregistered_topic() {
    let runtime = Runtime::builder()
        .durable_dispatcher(RecordingDispatcher::new())
        .build();

    let err = runtime
        .emit_envelope(&Context::background(), Envelope::new("nobody.listens", b"{}".to_vec()))
        .await
        .unwrap_err();

    assert!(matches!(err, GalaError::TopicNotRegistered { .. }));
}

// ============================================================================
// Dispatch validation
// ============================================================================

#[tokio::test]
async fn test_dispatch_rejects_undecodable_payload() {
    let runtime = runtime_with_topic(EmitMode::Inline);

    let err = runtime
        .dispatch_envelope(
            &Context::background(),
            Envelope::new("member.changed", b"not json".to_vec()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, GalaError::PayloadDecodeFailed { .. }));
    assert_eq!(failure_kind(&err), FailureKind::NonRetryable);
}

#[tokio::test]
async fn test_dispatch_rejects_newer_schema_version() {
    let runtime = runtime_with_topic(EmitMode::Inline);
    let payload = serde_json::to_vec(&changed("CREATE", 1)).unwrap();

    let err = runtime
        .dispatch_envelope(
            &Context::background(),
            Envelope::new("member.changed", payload).with_schema_version(2),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GalaError::UnsupportedSchemaVersion {
            version: 2,
            supported: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_dispatch_accepts_older_schema_version() {
    let runtime = Runtime::new();
    let topic = member_topic().with_schema_version(2);
    Registration::json(topic.clone()).register(runtime.registry()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    counting(&counter, "listener").attach(runtime.registry()).unwrap();

    let payload = serde_json::to_vec(&changed("CREATE", 1)).unwrap();
    runtime
        .dispatch_envelope(&Context::background(), Envelope::new("member.changed", payload))
        .await
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Pool-backed inline dispatch
// ============================================================================

#[tokio::test]
async fn test_inline_pool_dispatches_in_background() {
    let pool = Pool::builder().name("gala-test").max_workers(2).build();
    let runtime = Runtime::builder().inline_pool(pool.clone()).build();
    Registration::json(member_topic()).register(runtime.registry()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    counting(&counter, "listener").attach(runtime.registry()).unwrap();

    for member_id in 0..5 {
        let receipt = runtime
            .emit_typed(
                &Context::background(),
                &member_topic(),
                &changed("CREATE", member_id),
                Headers::new(),
            )
            .await;
        assert!(receipt.accepted);
    }

    pool.wait_idle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_released_pool_rejects_emits() {
    let pool = Pool::new(1);
    let runtime = Runtime::builder().inline_pool(pool.clone()).build();
    Registration::json(member_topic()).register(runtime.registry()).unwrap();

    pool.release();
    let receipt = runtime
        .emit_typed(&Context::background(), &member_topic(), &changed("CREATE", 1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    assert!(matches!(receipt.error, Some(GalaError::DispatcherClosed)));
}
