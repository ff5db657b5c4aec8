//! Integration tests for end-to-end convergence
//!
//! These tests tell the story of desired records converging through the full
//! runner: worker pool, work queue, controller and adapters, against the
//! in-memory store and external system. They use short intervals so each
//! story completes in well under a second of wall time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use converge::adapter::kinds::{sample_registry, topic_schema, TABLE_KIND, TOPIC_KIND};
use converge::adapter::memory::{MemoryExternalSystem, Operation};
use converge::adapter::{AdapterRegistry, ClientAdapter, ExternalClient, Lookup, ResourceAdapter};
use converge::attributes::{ExternalAttributes, Field, Spec};
use converge::config::ControllerConfig;
use converge::controller::{reconcile, Context};
use converge::error::{ErrorClass, ExternalError};
use converge::events::NoopEventPublisher;
use converge::resource::{ConditionStatus, ResourceKey, SYNCED};
use converge::retry::RetryConfig;
use converge::runner::Runner;
use converge::store::MemoryStore;
use converge::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        call_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(100),
        short_requeue: Duration::from_millis(10),
        terminal_requeue: Duration::from_millis(200),
        backoff: RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        },
        apply_retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
    }
}

fn context(store: Arc<MemoryStore>, adapters: AdapterRegistry) -> Arc<Context> {
    Arc::new(
        Context::builder(store)
            .adapters(adapters)
            .events(Arc::new(NoopEventPublisher))
            .config(fast_config())
            .build(),
    )
}

fn topic(name: &str) -> ResourceKey {
    ResourceKey::new(TOPIC_KIND, name)
}

fn full_topic_spec() -> Spec {
    Spec::new()
        .with("DisplayName", Field::text("Orders"))
        .with("Policy", Field::json(json!({"Version": "2012-10-17"})))
        .with(
            "DeliveryPolicy",
            Field::json(json!({"healthyRetryPolicy": {"numRetries": 3}})),
        )
}

/// A running controller plus handles to its collaborators
struct Harness {
    store: Arc<MemoryStore>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

impl Harness {
    fn start(store: Arc<MemoryStore>, adapters: AdapterRegistry) -> Self {
        let runner = Runner::new(context(store.clone(), adapters));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(token).await });
        Self {
            store,
            shutdown,
            handle,
        }
    }

    fn is_ready(&self, key: &ResourceKey) -> bool {
        self.store
            .record(key)
            .is_some_and(|record| record.status.is_ready())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("runner task should not panic")
            .expect("runner should stop cleanly");
    }
}

/// Poll `condition` until it holds or five seconds pass
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Client for a system that never answers successfully
struct UnreachableClient;

#[async_trait]
impl ExternalClient for UnreachableClient {
    async fn describe(&self, _id: &str) -> Result<ExternalAttributes, ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }

    async fn create(
        &self,
        _name: &str,
        _attributes: &ExternalAttributes,
    ) -> Result<String, ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }

    async fn set_attribute(&self, _id: &str, _key: &str, _value: &str) -> Result<(), ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }

    async fn delete(&self, _id: &str) -> Result<(), ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }

    async fn find_by_name(&self, _name: &str) -> Result<Lookup, ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }
}

/// Wraps the in-memory system and records how many calls overlap
struct OverlapTracker {
    inner: MemoryExternalSystem,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl OverlapTracker {
    fn new() -> Self {
        Self {
            inner: MemoryExternalSystem::new(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    async fn track<T>(&self, call: impl std::future::Future<Output = T>) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = call.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ExternalClient for OverlapTracker {
    async fn describe(&self, id: &str) -> Result<ExternalAttributes, ExternalError> {
        self.track(self.inner.describe(id)).await
    }

    async fn create(
        &self,
        name: &str,
        attributes: &ExternalAttributes,
    ) -> Result<String, ExternalError> {
        self.track(self.inner.create(name, attributes)).await
    }

    async fn set_attribute(&self, id: &str, key: &str, value: &str) -> Result<(), ExternalError> {
        self.track(self.inner.set_attribute(id, key, value)).await
    }

    async fn delete(&self, id: &str) -> Result<(), ExternalError> {
        self.track(self.inner.delete(id)).await
    }

    async fn find_by_name(&self, name: &str) -> Result<Lookup, ExternalError> {
        self.track(self.inner.find_by_name(name)).await
    }
}

// =============================================================================
// Stories: Convergence Through The Runner
// =============================================================================

/// Story: a batch of records across both kinds converges with a small worker
/// pool, one create per record
#[tokio::test]
async fn story_many_resources_converge() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());

    let mut keys = Vec::new();
    for i in 0..12 {
        let key = topic(&format!("topic-{i}"));
        store.apply(key.clone(), Spec::new().with("DisplayName", Field::text(format!("Topic {i}"))));
        keys.push(key);
    }
    for i in 0..4 {
        let key = ResourceKey::new(TABLE_KIND, format!("table-{i}"));
        store.apply(
            key.clone(),
            Spec::new()
                .with("KeySchema", Field::list(["id"]))
                .with("BillingMode", Field::text("PAY_PER_REQUEST"))
                .with("Tags", Field::set(["team=core", "env=prod"])),
        );
        keys.push(key);
    }

    let harness = Harness::start(store, sample_registry(system.clone()));
    assert!(
        eventually(|| keys.iter().all(|key| harness.is_ready(key))).await,
        "every record should become ready"
    );

    assert_eq!(system.calls(Operation::Create), 16);
    assert_eq!(system.len(), 16);
    harness.stop().await;
}

/// Story: one record whose system is unreachable and one of an unknown kind
/// keep failing, while every other record still converges
#[tokio::test]
async fn story_failing_resources_do_not_block_others() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    let adapters = sample_registry(system.clone()).with(Arc::new(ClientAdapter::new(
        "Flaky",
        topic_schema(),
        Arc::new(UnreachableClient),
    )));

    let flaky = ResourceKey::new("Flaky", "unreachable");
    let unknown = ResourceKey::new("Queue", "jobs");
    store.apply(flaky.clone(), Spec::new());
    store.apply(unknown.clone(), Spec::new());

    let healthy: Vec<ResourceKey> = (0..6).map(|i| topic(&format!("healthy-{i}"))).collect();
    for key in &healthy {
        store.apply(key.clone(), Spec::new().with("DisplayName", Field::text("ok")));
    }

    let harness = Harness::start(store.clone(), adapters);
    assert!(eventually(|| healthy.iter().all(|key| harness.is_ready(key))).await);

    for key in [&flaky, &unknown] {
        let synced = store
            .record(key)
            .and_then(|record| record.status.get_condition(SYNCED).cloned());
        assert!(
            synced.is_some_and(|c| c.status == ConditionStatus::False),
            "{key} should report its failure"
        );
    }
    assert!(store.record(&flaky).expect("record").external_name.is_none());
    harness.stop().await;
}

/// Story: deleting a record removes the external resource exactly once and
/// retires the record
#[tokio::test]
async fn story_delete_through_the_runner() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());

    let harness = Harness::start(store.clone(), sample_registry(system.clone()));
    assert!(eventually(|| harness.is_ready(&key)).await);

    store.request_deletion(&key);
    assert!(eventually(|| store.record(&key).is_none()).await);
    assert!(system.is_empty());
    assert_eq!(system.calls(Operation::Delete), 1);
    assert!(store.retired(&key).is_some());

    // a second delete of the same identifier is a no-op success
    let adapter = ClientAdapter::new(TOPIC_KIND, topic_schema(), system.clone());
    assert!(adapter.delete("arn:1").await.is_ok());
    harness.stop().await;
}

/// Story: the first create's response is lost; the runner retries, finds
/// the resource by name, and never creates a duplicate
#[tokio::test]
async fn story_lost_create_ack_recovered_without_duplicate() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    system.lose_next_create_ack();
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());

    let harness = Harness::start(store.clone(), sample_registry(system.clone()));
    assert!(eventually(|| harness.is_ready(&key)).await);

    assert_eq!(system.calls(Operation::Create), 1);
    assert_eq!(system.ids_for_name("Topic/orders"), ["arn:1"]);
    assert_eq!(
        store.record(&key).expect("record").external_name.as_deref(),
        Some("arn:1")
    );
    harness.stop().await;
}

/// Story: an out-of-band edit is caught by the drift poll and reverted
#[tokio::test]
async fn story_drift_is_reverted_by_polling() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());

    let harness = Harness::start(store.clone(), sample_registry(system.clone()));
    assert!(eventually(|| harness.is_ready(&key)).await);

    system.mutate("arn:1", "DisplayName", "hijacked");
    assert!(
        eventually(|| {
            system
                .get("arn:1")
                .is_some_and(|attrs| attrs["DisplayName"] == "Orders")
        })
        .await
    );
    assert!(eventually(|| harness.is_ready(&key)).await);
    harness.stop().await;
}

/// Story: a flood of change notifications for one record never puts it in
/// the hands of two workers at once
#[tokio::test]
async fn story_one_worker_per_identity() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(OverlapTracker::new());
    let adapters = AdapterRegistry::new().with(Arc::new(ClientAdapter::new(
        TOPIC_KIND,
        topic_schema(),
        client.clone(),
    )));
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());

    let harness = Harness::start(store.clone(), adapters);
    for i in 0..50 {
        let name = if i % 2 == 0 { "Orders" } else { "Orders!" };
        store.apply(
            key.clone(),
            full_topic_spec().with("DisplayName", Field::text(name)),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    store.apply(key.clone(), full_topic_spec());
    assert!(eventually(|| harness.is_ready(&key)).await);

    assert_eq!(client.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(client.inner.calls(Operation::Create), 1);
    harness.stop().await;
}

// =============================================================================
// Stories: Pass-By-Pass Properties
// =============================================================================

/// Story: k drifted attributes against a cooperative system converge within
/// k passes
#[tokio::test]
async fn story_k_differences_converge_within_k_passes() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());
    let ctx = context(store.clone(), sample_registry(system.clone()));

    reconcile(key.clone(), ctx.clone()).await.expect("create");
    reconcile(key.clone(), ctx.clone()).await.expect("sync");
    assert!(store.record(&key).expect("record").status.is_ready());

    system.mutate("arn:1", "DisplayName", "drifted");
    system.mutate("arn:1", "Policy", r#"{"Version":"2008-10-17"}"#);
    system.mutate("arn:1", "DeliveryPolicy", "{}");
    let k = 3;

    let mut passes = 0;
    while !store.record(&key).expect("record").status.is_ready() || passes == 0 {
        assert!(passes < k, "did not converge within {k} passes");
        reconcile(key.clone(), ctx.clone()).await.expect("pass");
        passes += 1;
    }
    assert!(passes <= k);
}

/// Story: a hard failure on the second of three changes keeps the first,
/// and the next pass applies only what still differs
#[tokio::test]
async fn story_partial_apply_resumes_where_it_stopped() {
    let store = Arc::new(MemoryStore::new());
    let system = Arc::new(MemoryExternalSystem::new());
    let key = topic("orders");
    store.apply(key.clone(), full_topic_spec());
    let ctx = context(store.clone(), sample_registry(system.clone()));

    reconcile(key.clone(), ctx.clone()).await.expect("create");
    reconcile(key.clone(), ctx.clone()).await.expect("sync");

    system.mutate("arn:1", "DisplayName", "drifted");
    system.mutate("arn:1", "Policy", r#"{"Version":"2008-10-17"}"#);
    system.mutate("arn:1", "DeliveryPolicy", "{}");
    system.fail_attribute(
        "Policy",
        ExternalError::terminal("InvalidParameter: Policy"),
        1,
    );

    let err = reconcile(key.clone(), ctx.clone()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Terminal);
    assert_eq!(err.pending_keys(), ["Policy", "DeliveryPolicy"]);

    reconcile(key.clone(), ctx.clone()).await.expect("resume");
    reconcile(key.clone(), ctx.clone()).await.expect("confirm");

    let written: Vec<String> = system.writes().into_iter().map(|w| w.key).collect();
    assert_eq!(written, ["DisplayName", "Policy", "DeliveryPolicy"]);
    assert!(store.record(&key).expect("record").status.is_ready());
}
