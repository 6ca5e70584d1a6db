use proptest::prelude::*;

use maternal_sync::{
    core::store::SyncStore,
    mutation::{MutationSpec, MutationStatus},
    types::{MutationId, MutationOp, SyncStatus, TableName},
};
use serde_json::json;

#[derive(Debug, Clone)]
enum Action {
    Enqueue { table: u8 },
    Sync { target: u8 },
    Succeed { target: u8 },
    RetryableFailure { target: u8 },
    Fail { target: u8 },
    UserRetry { target: u8 },
    Discard { target: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0u8..6).prop_map(|table| Action::Enqueue { table }),
        1 => (0u8..32).prop_map(|target| Action::Sync { target }),
        1 => (0u8..32).prop_map(|target| Action::Succeed { target }),
        1 => (0u8..32).prop_map(|target| Action::RetryableFailure { target }),
        1 => (0u8..32).prop_map(|target| Action::Fail { target }),
        1 => (0u8..32).prop_map(|target| Action::UserRetry { target }),
        1 => (0u8..32).prop_map(|target| Action::Discard { target }),
    ]
}

fn pick(ids: &[MutationId], target: u8) -> Option<MutationId> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[usize::from(target) % ids.len()])
    }
}

proptest! {
    #[test]
    fn queue_invariants_hold_under_random_transitions(actions in prop::collection::vec(action_strategy(), 1..120)) {
        let mut store = SyncStore::new();
        let mut enqueued: Vec<MutationId> = Vec::new();

        for action in actions {
            let before = store.revision();
            match action {
                Action::Enqueue { table } => {
                    let table = TableName::ALL[usize::from(table) % TableName::ALL.len()];
                    let id = store.queue_mutation(MutationSpec::new(table, MutationOp::Create, json!({ "i": enqueued.len() })));
                    enqueued.push(id);
                    prop_assert!(store.revision() > before);
                }
                Action::Sync { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        let was_pending = store.get(id).is_some_and(|m| m.status == MutationStatus::Pending);
                        prop_assert_eq!(store.mark_syncing(id), was_pending);
                    }
                }
                Action::Succeed { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        let existed = store.get(id).is_some();
                        prop_assert_eq!(store.remove_mutation(id), existed);
                        prop_assert!(store.get(id).is_none());
                    }
                }
                Action::RetryableFailure { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        let prior = store.get(id).map(|m| m.retry_count);
                        store.increment_retry(id, "timeout");
                        if let Some(prior) = prior {
                            prop_assert_eq!(store.get(id).map(|m| m.retry_count), Some(prior + 1));
                        }
                    }
                }
                Action::Fail { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        if store.mark_failed(id, "rejected") {
                            prop_assert_eq!(store.sync_status(), SyncStatus::HasFailures);
                        }
                    }
                }
                Action::UserRetry { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        let was_failed = store.get(id).is_some_and(|m| m.status == MutationStatus::Failed);
                        prop_assert_eq!(store.retry_mutation(id).is_ok(), was_failed);
                        if was_failed {
                            prop_assert_eq!(store.get(id).map(|m| m.retry_count), Some(0));
                        }
                    }
                }
                Action::Discard { target } => {
                    if let Some(id) = pick(&enqueued, target) {
                        let allowed = store.get(id).is_some_and(|m| m.status != MutationStatus::Syncing);
                        prop_assert_eq!(store.discard_mutation(id).is_ok(), allowed);
                    }
                }
            }

            prop_assert!(store.revision() >= before);

            // Replay order: timestamp non-decreasing, ties in enqueue order.
            let pending = store.pending_in_order();
            for pair in pending.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                let pos = |id: MutationId| enqueued.iter().position(|e| *e == id);
                prop_assert!(pos(pair[0].id) < pos(pair[1].id));
            }
            prop_assert!(pending.iter().all(|m| m.status == MutationStatus::Pending));

            // Failures and status agree outside of a pass.
            prop_assert_eq!(store.has_failures(), store.sync_status() == SyncStatus::HasFailures);

            // Every id is unique.
            let mut ids: Vec<MutationId> = store.queue().iter().map(|m| m.id).collect();
            let n = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), n);
        }
    }

    #[test]
    fn rehydrated_store_keeps_order_and_drops_syncing(count in 1usize..24, syncing in prop::collection::vec(any::<bool>(), 24)) {
        let mut store = SyncStore::new();
        let ids: Vec<MutationId> = (0..count)
            .map(|i| store.queue_mutation(MutationSpec::new(TableName::IntakeLogs, MutationOp::Create, json!({ "i": i }))))
            .collect();
        for (id, flag) in ids.iter().zip(syncing.iter()) {
            if *flag {
                store.mark_syncing(*id);
            }
        }

        let restored = SyncStore::from_snapshot(store.export_snapshot());
        let order: Vec<MutationId> = restored.pending_in_order().iter().map(|m| m.id).collect();
        prop_assert_eq!(order, ids);
    }
}
