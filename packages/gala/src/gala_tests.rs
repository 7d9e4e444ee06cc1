use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::job::{JobState, DISPATCH_JOB_KIND};
use crate::testing::RecordingJobClient;
use crate::{
    Context, Definition, DispatchJobArgs, DispatchMode, DispatchWorker, EmitMode, Envelope, Gala, GalaConfig,
    GalaError, Headers, JobClient, JobInsert, JobWorker, JobWorkerConfig, MemoryJobQueue, QueueClass,
    Registration, Runtime, Topic, TopicPayload,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvoiceIssued {
    invoice_id: u64,
}

impl TopicPayload for InvoiceIssued {}

fn invoice_topic() -> Topic<InvoiceIssued> {
    Topic::new("invoice.issued")
}

fn invoice(invoice_id: u64) -> InvoiceIssued {
    InvoiceIssued { invoice_id }
}

fn in_memory_config() -> GalaConfig {
    GalaConfig {
        dispatch_mode: DispatchMode::InMemory,
        worker_count: 2,
        ..Default::default()
    }
}

fn durable_config() -> GalaConfig {
    GalaConfig {
        dispatch_mode: DispatchMode::Durable,
        poll_interval: Duration::from_millis(10),
        fetch_cooldown: Duration::from_millis(1),
        ..Default::default()
    }
}

fn count_invoices(gala: &Gala, counter: &Arc<AtomicUsize>) {
    let counter = counter.clone();
    Definition::new(&invoice_topic(), "count_invoices")
        .handle(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .attach(gala.registry())
        .unwrap();
}

fn dispatch_job(args: Vec<u8>) -> JobInsert {
    JobInsert {
        kind: DISPATCH_JOB_KIND.to_string(),
        args,
        queue: "gala".to_string(),
        max_attempts: None,
        tags: Vec::new(),
        metadata: BTreeMap::new(),
    }
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn test_durable_mode_requires_job_client_and_store() {
    let err = Gala::builder(durable_config()).build().unwrap_err();
    assert!(matches!(err, GalaError::JobClientRequired));

    let err = Gala::builder(durable_config())
        .job_client(Arc::new(RecordingJobClient::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, GalaError::JobStoreRequired));
}

#[test]
fn test_in_memory_mode_needs_no_job_queue() {
    let gala = Gala::builder(in_memory_config()).build().unwrap();
    assert_eq!(gala.dispatch_mode(), DispatchMode::InMemory);
    assert!(!gala.runtime().has_durable_dispatcher());
    assert_eq!(gala.runtime().inline_pool().map(|pool| pool.max_workers()), Some(2));
}

// ============================================================================
// In-memory mode
// ============================================================================

#[tokio::test]
async fn test_in_memory_emit_overrides_topic_mode_and_drains() {
    let gala = Gala::builder(in_memory_config()).build().unwrap();
    Registration::json(invoice_topic())
        .emit_mode(EmitMode::Durable)
        .register(gala.registry())
        .unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    count_invoices(&gala, &counter);

    gala.start_workers().unwrap();
    for invoice_id in 0..3 {
        let receipt = gala
            .emit_typed(&Context::background(), &invoice_topic(), &invoice(invoice_id), Headers::new())
            .await;
        assert!(receipt.accepted, "{:?}", receipt.error);
    }

    gala.wait_idle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    gala.close().await;
}

#[tokio::test]
async fn test_emit_after_close_is_a_dispatch_failure() {
    let gala = Gala::builder(in_memory_config()).build().unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();

    gala.close().await;
    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    match receipt.error {
        Some(GalaError::DispatchFailed { event_id, source }) => {
            assert_eq!(Some(event_id), receipt.event_id);
            assert!(matches!(*source, GalaError::DispatcherClosed));
        }
        other => panic!("expected DispatchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unregistered_topic_error_is_not_wrapped() {
    let gala = Gala::builder(in_memory_config()).build().unwrap();

    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(1), Headers::new())
        .await;

    assert!(receipt.event_id.is_none());
    assert!(matches!(receipt.error, Some(GalaError::TopicNotRegistered { .. })));
}

// ============================================================================
// Durable mode
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_durable_emit_is_processed_by_workers() {
    let queue = MemoryJobQueue::new();
    let gala = Gala::builder(durable_config())
        .job_queue(queue.clone())
        .build()
        .unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    count_invoices(&gala, &counter);

    for invoice_id in 0..2 {
        let receipt = gala
            .emit_typed(&Context::background(), &invoice_topic(), &invoice(invoice_id), Headers::new())
            .await;
        assert!(receipt.accepted, "{:?}", receipt.error);
    }
    assert_eq!(queue.len(), 2);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    gala.start_workers().unwrap();
    tokio::time::timeout(Duration::from_secs(10), gala.wait_idle())
        .await
        .unwrap();
    gala.stop_workers().await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(queue.jobs_in_state(JobState::Completed).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_durable_listener_failure_is_retried_until_discarded() {
    let queue = MemoryJobQueue::new();
    let gala = Gala::builder(GalaConfig {
        max_retries: 2,
        ..durable_config()
    })
    .job_queue(queue.clone())
    .build()
    .unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    Definition::new(&invoice_topic(), "post_to_ledger")
        .handle({
            let attempts = attempts.clone();
            move |_, _| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("ledger unavailable"))
                }
            }
        })
        .attach(gala.registry())
        .unwrap();

    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(1), Headers::new())
        .await;
    assert!(receipt.accepted);

    gala.start_workers().unwrap();
    tokio::time::timeout(Duration::from_secs(10), gala.wait_idle())
        .await
        .unwrap();
    gala.close().await;

    let job = &queue.jobs()[0];
    assert_eq!(job.state, JobState::Discarded);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.errors.len(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_durable_insert_failure_is_wrapped() {
    let gala = Gala::builder(durable_config())
        .job_client(Arc::new(RecordingJobClient::failing("database is down")))
        .job_store(Arc::new(MemoryJobQueue::new()))
        .build()
        .unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();

    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(1), Headers::new())
        .await;

    assert!(!receipt.accepted);
    let error = receipt.error.unwrap();
    assert!(error.listener_error().is_none());
    match error {
        GalaError::DispatchFailed { source, .. } => {
            assert!(matches!(*source, GalaError::JobInsertFailed { .. }));
        }
        other => panic!("expected DispatchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_durable_routes_queue_class_and_max_attempts() {
    let client = RecordingJobClient::new();
    let gala = Gala::builder(GalaConfig {
        max_retries: 4,
        ..durable_config()
    })
    .job_client(Arc::new(client.clone()))
    .job_store(Arc::new(MemoryJobQueue::new()))
    .queue_for(QueueClass::INTEGRATION, "integrations")
    .build()
    .unwrap();
    Registration::json(invoice_topic())
        .queue_class(QueueClass::INTEGRATION)
        .register(gala.registry())
        .unwrap();

    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(8), Headers::new())
        .await;
    assert!(receipt.accepted);

    let inserted = client.inserted();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].queue, "integrations");
    assert_eq!(inserted[0].max_attempts, Some(4));
    assert_eq!(inserted[0].kind, DISPATCH_JOB_KIND);
}

#[tokio::test]
async fn test_emit_envelope_keeps_prebuilt_id_in_job() {
    let queue = MemoryJobQueue::new();
    let gala = Gala::builder(durable_config())
        .job_queue(queue.clone())
        .build()
        .unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();

    let payload = serde_json::to_vec(&invoice(3)).unwrap();
    gala.emit_envelope(
        &Context::background(),
        Envelope::new("invoice.issued", payload).with_id("evt-invoice-3"),
    )
    .await
    .unwrap();

    let job = &queue.jobs()[0];
    assert_eq!(job.insert.metadata["event_id"], "evt-invoice-3");
    let args = DispatchJobArgs::from_bytes(&job.insert.args).unwrap();
    assert_eq!(args.envelope.id.as_str(), "evt-invoice-3");
}

#[tokio::test]
async fn test_disabled_gala_does_not_start_workers() {
    let queue = MemoryJobQueue::new();
    let gala = Gala::builder(GalaConfig {
        enabled: false,
        ..durable_config()
    })
    .job_queue(queue.clone())
    .build()
    .unwrap();
    Registration::json(invoice_topic()).register(gala.registry()).unwrap();

    let receipt = gala
        .emit_typed(&Context::background(), &invoice_topic(), &invoice(1), Headers::new())
        .await;
    assert!(receipt.accepted);

    gala.start_workers().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gala.stop_workers().await;

    assert_eq!(queue.jobs_in_state(JobState::Available).len(), 1);
}

// ============================================================================
// Job worker
// ============================================================================

#[tokio::test]
async fn test_worker_discards_undecodable_envelope_without_retry() {
    let queue = MemoryJobQueue::new();
    let id = queue.insert(dispatch_job(b"{}".to_vec())).await.unwrap();
    let worker = JobWorker::with_config(
        Arc::new(queue.clone()),
        DispatchWorker::new(Runtime::new()),
        JobWorkerConfig::default(),
    );

    let processed = worker
        .run_once("gala", 10, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(processed, 1);
    let job = queue.job(id).unwrap();
    assert_eq!(job.state, JobState::Discarded);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn test_worker_discards_unknown_job_kind() {
    let queue = MemoryJobQueue::new();
    let id = queue
        .insert(JobInsert {
            kind: "send_email_v1".to_string(),
            ..dispatch_job(Vec::new())
        })
        .await
        .unwrap();
    let worker = JobWorker::new(Arc::new(queue.clone()), DispatchWorker::new(Runtime::new()));

    worker
        .run_once("gala", 1, &CancellationToken::new())
        .await
        .unwrap();

    let job = queue.job(id).unwrap();
    assert_eq!(job.state, JobState::Discarded);
    assert!(job.errors[0].contains("send_email_v1"));
}

#[tokio::test]
async fn test_worker_completes_dispatch_job() {
    let runtime = Runtime::new();
    Registration::json(invoice_topic()).register(runtime.registry()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    Definition::new(&invoice_topic(), "count_invoices")
        .handle({
            let counter = counter.clone();
            move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        })
        .attach(runtime.registry())
        .unwrap();

    let queue = MemoryJobQueue::new();
    let envelope = Envelope::new("invoice.issued", serde_json::to_vec(&invoice(1)).unwrap());
    let args = DispatchJobArgs::new(envelope).to_bytes().unwrap();
    let id = queue.insert(dispatch_job(args)).await.unwrap();

    let worker = JobWorker::new(Arc::new(queue.clone()), DispatchWorker::new(runtime));
    worker
        .run_once("gala", 10, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(queue.job(id).unwrap().state, JobState::Completed);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(worker.running().await, 0);
}

#[tokio::test]
async fn test_dispatch_worker_without_runtime_fails() {
    let worker = DispatchWorker::with_provider(|| None);
    let job = crate::ClaimedJob {
        id: uuid::Uuid::now_v7(),
        kind: DISPATCH_JOB_KIND.to_string(),
        queue: "gala".to_string(),
        args: Vec::new(),
        attempt: 1,
        max_attempts: 3,
    };

    let err = worker.work(&Context::background(), &job).await.unwrap_err();
    assert!(matches!(err, GalaError::RuntimeProviderRequired));
}
