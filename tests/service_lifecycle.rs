use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use maternal_sync::{
    config::{MonitorConfig, ProcessorConfig, SyncConfig},
    connectivity::{NetworkProbe, ProbeError, RawNetworkState},
    core::store::SyncStore,
    dispatch::{DispatchOutcome, MutationOptions},
    mutation::MutationSpec,
    persist::{DurableCache, memory::MemoryCache},
    query::QueryArgs,
    remote::{FnMutation, OperationRegistry, RemoteError, RemoteMutation, RemoteQuery},
    runtime::service::SyncService,
    types::{MutationOp, NetworkStatus, SyncIndicator, TableName},
};

struct Probe {
    tx: Mutex<Option<mpsc::UnboundedSender<RawNetworkState>>>,
    state: RawNetworkState,
}

impl Probe {
    fn new(state: RawNetworkState) -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            state,
        })
    }

    fn emit(&self, state: RawNetworkState) {
        if let Some(tx) = self.tx.lock().expect("lock").as_ref() {
            let _ = tx.send(state);
        }
    }
}

#[async_trait]
impl NetworkProbe for Probe {
    fn listen(&self) -> mpsc::UnboundedReceiver<RawNetworkState> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().expect("lock") = Some(tx);
        rx
    }

    async fn probe(&self) -> Result<RawNetworkState, ProbeError> {
        Ok(self.state)
    }
}

struct BookletList;

#[async_trait]
impl RemoteQuery for BookletList {
    type Output = Vec<String>;

    fn name(&self) -> &str {
        "booklets.mine"
    }

    async fn fetch(&self, _args: &Value) -> Result<Vec<String>, RemoteError> {
        Ok(vec!["Pregnancy 2026".to_string()])
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        monitor: MonitorConfig { debounce_ms: 200 },
        processor: ProcessorConfig {
            trigger_debounce_ms: 50,
            inter_mutation_delay_ms: 10,
            max_retries: 3,
            retry_delay_ms: 500,
        },
        ..SyncConfig::default()
    }
}

fn recording_remote(log: Arc<Mutex<Vec<Value>>>) -> Arc<dyn RemoteMutation> {
    Arc::new(FnMutation(move |payload: Value| {
        let log = Arc::clone(&log);
        async move {
            log.lock().expect("lock").push(payload);
            Ok::<Value, RemoteError>(json!({ "id": "server-1" }))
        }
    }))
}

#[tokio::test(start_paused = true)]
async fn interrupted_mutation_is_replayed_after_restart() {
    let cache: Arc<dyn DurableCache> = Arc::new(MemoryCache::new());
    {
        let mut store = SyncStore::new();
        let id = store.queue_mutation(MutationSpec::new(
            TableName::Medications,
            MutationOp::Create,
            json!({ "name": "Iron" }),
        ));
        store.mark_syncing(id);
        cache.save_sync_state(&store.export_snapshot()).expect("save");
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = OperationRegistry::new();
    registry.register(TableName::Medications, MutationOp::Create, recording_remote(log.clone()));

    let service = SyncService::start(
        Arc::clone(&cache),
        Probe::new(RawNetworkState::online()),
        registry,
        config(),
    )
    .await
    .expect("start");
    assert_eq!(service.network_status(), NetworkStatus::Online);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(*log.lock().expect("lock"), vec![json!({ "name": "Iron" })]);
    assert_eq!(service.pending_count().await.expect("count"), 0);
    assert_eq!(service.indicator().await.expect("indicator"), SyncIndicator::Synced);

    service.shutdown().await.expect("shutdown");
    let restored = cache.load_sync_store().expect("load");
    assert!(restored.queue().is_empty());
    assert_eq!(restored.entity_meta(TableName::Medications).map(|m| m.version), Some(1));
}

#[tokio::test(start_paused = true)]
async fn offline_writes_drain_once_connectivity_settles() {
    let cache: Arc<dyn DurableCache> = Arc::new(MemoryCache::new());
    let probe = Probe::new(RawNetworkState::offline());
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = OperationRegistry::new();
    registry.register(TableName::IntakeLogs, MutationOp::Create, recording_remote(log.clone()));

    let service = SyncService::start(Arc::clone(&cache), probe.clone(), registry, config())
        .await
        .expect("start");
    assert_eq!(service.indicator().await.expect("indicator"), SyncIndicator::Offline);

    let mut write = service.mutation(
        recording_remote(log.clone()),
        MutationOptions::new(TableName::IntakeLogs, MutationOp::Create),
    );
    for n in 0..3 {
        let out = write.mutate(json!({ "n": n })).await.expect("mutate");
        assert!(matches!(out, DispatchOutcome::Queued(_)));
    }
    assert!(write.state().is_queued);
    assert_eq!(service.pending_count().await.expect("count"), 3);
    assert!(log.lock().expect("lock").is_empty());

    let mut query = service.query(Arc::new(BookletList), QueryArgs::Args(json!({})));
    assert!(query.state().is_offline);
    assert!(!query.sync_live().await);

    probe.emit(RawNetworkState::online());
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let seen: Vec<Value> = log.lock().expect("lock").clone();
    assert_eq!(seen, vec![json!({ "n": 0 }), json!({ "n": 1 }), json!({ "n": 2 })]);
    assert_eq!(service.indicator().await.expect("indicator"), SyncIndicator::Synced);

    assert!(!query.state().is_offline);
    assert!(query.sync_live().await);
    assert_eq!(query.state().data, Some(vec!["Pregnancy 2026".to_string()]));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn failed_writes_can_be_retried_from_the_service() {
    let cache: Arc<dyn DurableCache> = Arc::new(MemoryCache::new());
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    let flaky: Arc<dyn RemoteMutation> = Arc::new(FnMutation(move |_payload: Value| {
        let counter = Arc::clone(&counter);
        async move {
            let mut n = counter.lock().expect("lock");
            *n += 1;
            if *n == 1 {
                Err(RemoteError::validation("Booklet is locked"))
            } else {
                Ok(Value::Null)
            }
        }
    }));
    let mut registry = OperationRegistry::new();
    registry.register(TableName::Booklets, MutationOp::Update, flaky);

    let service = SyncService::start(
        Arc::clone(&cache),
        Probe::new(RawNetworkState::online()),
        registry,
        config(),
    )
    .await
    .expect("start");

    service
        .store()
        .queue_mutation(
            MutationSpec::new(TableName::Booklets, MutationOp::Update, json!({ "id": "b-1" }))
                .with_entity_id("b-1"),
        )
        .await
        .expect("queue");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let failed = service.failed_mutations().await.expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("Booklet is locked"));
    assert_eq!(service.indicator().await.expect("indicator"), SyncIndicator::Failed);

    assert_eq!(service.retry_all_failed().await.expect("retry"), 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(service.failed_mutations().await.expect("failed").is_empty());
    assert_eq!(service.pending_count().await.expect("count"), 0);
    assert_eq!(*attempts.lock().expect("lock"), 2);

    service.shutdown().await.expect("shutdown");
}
