use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use serde_json::{Value, json};

use maternal_sync::{
    config::RuntimeConfig,
    core::store::SyncStore,
    dispatch::{DispatchError, DispatchOutcome, MutationDispatcher, MutationHandle, MutationOptions, MutationState},
    mutation::MutationStatus,
    persist::{DurableCache, memory::MemoryCache},
    query::QueryCache,
    remote::{FnMutation, RemoteError, RemoteErrorKind, RemoteMutation},
    runtime::handle::{SyncStoreHandle, spawn_sync_store},
    types::{MutationOp, NetworkStatus, TableName, now_ms},
};

async fn store_with(status: NetworkStatus) -> SyncStoreHandle {
    let handle = spawn_sync_store(SyncStore::new(), None, RuntimeConfig::default());
    handle.set_network_status(status).await.expect("network");
    handle
}

fn queries() -> QueryCache {
    let backend: Arc<dyn DurableCache> = Arc::new(MemoryCache::new());
    QueryCache::new(backend)
}

fn counting_remote(calls: Arc<AtomicUsize>, result: Result<Value, RemoteError>) -> Arc<dyn RemoteMutation> {
    Arc::new(FnMutation(move |payload: Value| {
        let calls = Arc::clone(&calls);
        let result = result.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            result.map(|v| json!({ "echo": payload, "result": v }))
        }
    }))
}

fn med_options() -> MutationOptions {
    MutationOptions::new(TableName::Medications, MutationOp::Update)
        .with_entity_id(|args| args.get("id").and_then(Value::as_str).map(str::to_string))
}

#[tokio::test]
async fn online_write_executes_and_invalidates_table_queries() {
    let store = store_with(NetworkStatus::Online).await;
    let queries = queries();
    let med_key = QueryCache::key_for("medications.byBooklet", &json!({ "bookletId": "b-1" }));
    let lab_key = QueryCache::key_for("lab_requests.byBooklet", &json!({ "bookletId": "b-1" }));
    queries.write(&med_key, &json!(["Iron"]), now_ms());
    queries.write(&lab_key, &json!(["CBC"]), now_ms());

    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = MutationDispatcher::new(
        counting_remote(calls.clone(), Ok(json!("ok"))),
        med_options(),
        store.clone(),
        queries.clone(),
    );

    let out = dispatcher
        .dispatch(json!({ "id": "med-1", "dosage": "650mg" }))
        .await
        .expect("dispatch");
    assert!(matches!(out, DispatchOutcome::Completed(ref v) if v["result"] == json!("ok")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queries.read::<Value>(&med_key).is_none());
    assert!(queries.read::<Value>(&lab_key).is_some());
    assert!(store.pending_mutations().await.expect("pending").is_empty());
}

#[tokio::test]
async fn offline_write_is_queued_with_exact_payload() {
    let store = store_with(NetworkStatus::Offline).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = MutationDispatcher::new(
        counting_remote(calls.clone(), Ok(json!("ok"))),
        med_options(),
        store.clone(),
        queries(),
    );

    let args = json!({ "id": "med-9", "dosage": "325mg", "frequency": "daily" });
    let out = dispatcher.dispatch(args.clone()).await.expect("dispatch");
    let DispatchOutcome::Queued(id) = out else {
        panic!("expected queued outcome, got {out:?}");
    };
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let rec = store.get(id).await.expect("get").expect("record");
    assert_eq!(rec.status, MutationStatus::Pending);
    assert_eq!(rec.table, TableName::Medications);
    assert_eq!(rec.operation, MutationOp::Update);
    assert_eq!(rec.entity_id.as_deref(), Some("med-9"));
    assert_eq!(rec.payload, args);
}

#[tokio::test]
async fn unknown_network_attempts_the_write() {
    let store = spawn_sync_store(SyncStore::new(), None, RuntimeConfig::default());
    assert_eq!(store.network_status(), NetworkStatus::Unknown);

    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = MutationDispatcher::new(
        counting_remote(calls.clone(), Ok(json!(1))),
        med_options(),
        store,
        queries(),
    );
    let out = dispatcher.dispatch(json!({ "id": "m" })).await.expect("dispatch");
    assert!(matches!(out, DispatchOutcome::Completed(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn online_failure_is_returned_and_not_queued() {
    let store = store_with(NetworkStatus::Online).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = MutationDispatcher::new(
        counting_remote(calls.clone(), Err(RemoteError::timeout("Request timed out"))),
        med_options(),
        store.clone(),
        queries(),
    );

    let err = dispatcher.dispatch(json!({ "id": "m" })).await.expect_err("remote error");
    match err {
        DispatchError::Remote(remote) => assert_eq!(remote.kind, RemoteErrorKind::Timeout),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(store.snapshot().await.expect("snapshot").queue.is_empty());
}

#[tokio::test]
async fn optimistic_update_failures_are_swallowed() {
    let store = store_with(NetworkStatus::Offline).await;
    let applied = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&applied);

    let options = med_options().with_optimistic_update(move |args| {
        seen.fetch_add(1, Ordering::SeqCst);
        if args.get("explode").is_some() {
            panic!("optimistic update bug");
        }
        Err("local store unavailable".into())
    });
    let dispatcher = MutationDispatcher::new(
        counting_remote(Arc::new(AtomicUsize::new(0)), Ok(json!(null))),
        options,
        store.clone(),
        queries(),
    );

    let first = dispatcher.dispatch(json!({ "id": "a" })).await.expect("dispatch");
    let second = dispatcher
        .dispatch(json!({ "id": "b", "explode": true }))
        .await
        .expect("dispatch after panic");
    assert!(matches!(first, DispatchOutcome::Queued(_)));
    assert!(matches!(second, DispatchOutcome::Queued(_)));
    assert_eq!(applied.load(Ordering::SeqCst), 2);
    assert_eq!(store.pending_mutations().await.expect("pending").len(), 2);
}

#[tokio::test]
async fn mutation_handle_tracks_flags_and_resets() {
    let store = store_with(NetworkStatus::Offline).await;
    let dispatcher = Arc::new(MutationDispatcher::new(
        counting_remote(Arc::new(AtomicUsize::new(0)), Err(RemoteError::validation("invalid dosage"))),
        med_options(),
        store.clone(),
        queries(),
    ));
    let mut handle = MutationHandle::new(dispatcher);

    let out = handle.mutate(json!({ "id": "m1" })).await.expect("queued");
    let DispatchOutcome::Queued(id) = out else {
        panic!("expected queue");
    };
    let state = handle.state();
    assert!(!state.is_pending);
    assert!(state.is_queued);
    assert_eq!(state.queue_id, Some(id));
    assert!(state.error.is_none());

    store.set_network_status(NetworkStatus::Online).await.expect("online");
    handle.mutate(json!({ "id": "m2" })).await.expect_err("validation");
    let state = handle.state();
    assert!(!state.is_queued);
    assert_eq!(state.error.as_deref(), Some("invalid dosage"));

    handle.reset();
    assert_eq!(handle.state(), &MutationState::default());
}
