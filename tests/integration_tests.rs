//! Integration Tests
//!
//! End-to-end tests for the store, history and persistence pipeline.

use std::rc::Rc;
use std::time::Duration;

use pomoflow::history::{HistoryConfig, HistoryJournal, HistoryManager};
use pomoflow::persistence::{
    load_latest, DirectoryStore, FixedQuota, FlatFileStore, MemoryStore, PersistenceQueue,
    QueueConfig, StorageBackend, TransactionOutcome,
};
use pomoflow::store::{Collection, DomainFacade, TaskStore};
use pomoflow::{EngineConfig, PomoflowError, Workspace};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;
use tokio::task::LocalSet;

fn memory_queue() -> (PersistenceQueue, Rc<MemoryStore>, Rc<MemoryStore>) {
    let primary = Rc::new(MemoryStore::new("primary"));
    let backup = Rc::new(MemoryStore::new("backup"));
    let queue = PersistenceQueue::new(QueueConfig::default(), primary.clone(), backup.clone());
    (queue, primary, backup)
}

// === Undo / Redo ===

#[test]
fn test_undo_removes_created_task() {
    let store = Rc::new(TaskStore::new());
    let history = HistoryManager::new(store.clone(), HistoryConfig::default());

    assert!(history.save_state("before create"));
    store
        .create_item(Collection::Tasks, json!({"id": "T1", "title": "Plan sprint"}))
        .unwrap();
    assert_eq!(store.count(Collection::Tasks), 1);

    assert!(history.undo());
    assert!(store.item(Collection::Tasks, "T1").is_none());
    assert!(history.can_redo());

    assert!(history.redo());
    assert_eq!(
        store.item(Collection::Tasks, "T1"),
        Some(json!({"id": "T1", "title": "Plan sprint"}))
    );
}

#[test]
fn test_undo_restores_exact_prior_state() {
    let store = Rc::new(TaskStore::new());
    let history = HistoryManager::new(store.clone(), HistoryConfig::default());
    store
        .create_item(Collection::Projects, json!({"id": "p1", "name": "Home"}))
        .unwrap();
    store.update_settings(json!({"theme": "dark"})).unwrap();
    let before = store.to_json();

    history.save_state("rename and retheme");
    store
        .update_item(Collection::Projects, "p1", json!({"name": "Garden"}))
        .unwrap();
    store.update_settings(json!({"theme": "light"})).unwrap();

    assert!(history.undo());
    assert_eq!(store.to_json(), before);
}

#[test]
fn test_history_capacity_drops_oldest() {
    let store = Rc::new(TaskStore::new());
    let history = HistoryManager::new(store.clone(), HistoryConfig::default());
    for i in 0..60 {
        history.save_state(&format!("step {}", i));
        store
            .create_item(Collection::Tasks, json!({"id": format!("t{}", i)}))
            .unwrap();
    }

    assert_eq!(history.undo_count(), 50);
    assert_eq!(history.undo_labels().last().map(String::as_str), Some("step 10"));
    while history.undo() {}
    // The ten oldest steps are gone, so their tasks survive a full unwind.
    assert_eq!(store.count(Collection::Tasks), 10);
}

#[test]
fn test_journal_survives_reopen() {
    let temp = tempdir().unwrap();
    let journal_path = temp.path().join("history.json");

    let store = Rc::new(TaskStore::new());
    let history = HistoryManager::new(store.clone(), HistoryConfig::default())
        .with_journal(HistoryJournal::new(&journal_path));
    history.save_state("first");
    store
        .create_item(Collection::Tasks, json!({"id": "a"}))
        .unwrap();
    history.save_state("second");

    let reopened = Rc::new(TaskStore::new());
    let history = HistoryManager::new(reopened.clone(), HistoryConfig::default())
        .with_journal(HistoryJournal::new(&journal_path));
    assert_eq!(history.load_journal(), 2);
    assert_eq!(history.undo_labels(), vec!["second", "first"]);
}

// === Persistence ===

#[tokio::test(start_paused = true)]
async fn test_store_mutations_coalesce_into_one_transaction() {
    LocalSet::new()
        .run_until(async {
            let (queue, primary, backup) = memory_queue();
            let store = TaskStore::with_queue(queue.clone());

            store
                .create_item(Collection::Tasks, json!({"id": "1"}))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .create_item(Collection::Tasks, json!({"id": "2"}))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .update_item(Collection::Tasks, "1", json!({"title": "renamed"}))
                .unwrap();
            assert_eq!(queue.recent_transactions().len(), 0);

            tokio::time::sleep(Duration::from_millis(510)).await;
            let transactions = queue.recent_transactions();
            assert_eq!(transactions.len(), 1);
            assert_eq!(transactions[0].operations.len(), 3);
            assert_eq!(transactions[0].outcome, TransactionOutcome::Success);

            assert_eq!(
                primary.get("tasks/1"),
                Some(json!({"id": "1", "title": "renamed"}))
            );
            assert_eq!(backup.len(), 2);
        })
        .await;
}

#[tokio::test]
async fn test_quota_abort_writes_nothing() {
    LocalSet::new()
        .run_until(async {
            let primary = Rc::new(MemoryStore::new("primary"));
            let backup = Rc::new(MemoryStore::new("backup"));
            let quota = Rc::new(FixedQuota::new(96, 100));
            let queue = PersistenceQueue::with_quota(
                QueueConfig::default(),
                primary.clone(),
                backup.clone(),
                quota.clone(),
            );
            let store = TaskStore::with_queue(queue.clone());
            store
                .create_item(Collection::Tasks, json!({"id": "big"}))
                .unwrap();

            let err = queue.flush_queue().await.unwrap_err();
            assert!(matches!(err, PomoflowError::QuotaExceeded { .. }));
            assert_eq!(primary.write_count(), 0);
            assert_eq!(backup.write_count(), 0);
            assert_eq!(queue.stats().quota_aborts, 1);

            // The store itself is unaffected; a later write goes through.
            quota.set_usage(10);
            store
                .create_item(Collection::Tasks, json!({"id": "small"}))
                .unwrap();
            let report = queue.flush_queue().await.unwrap();
            assert!(report.is_success());
            assert_eq!(store.count(Collection::Tasks), 2);
        })
        .await;
}

#[tokio::test]
async fn test_rehydrate_from_disk_and_fall_back_to_backup() {
    let temp = tempdir().unwrap();
    let primary_dir = temp.path().join("store");
    let backup_file = temp.path().join("backup.json");

    LocalSet::new()
        .run_until(async {
            let primary: Rc<dyn StorageBackend> = Rc::new(DirectoryStore::new(&primary_dir));
            let backup: Rc<dyn StorageBackend> = Rc::new(FlatFileStore::new(&backup_file));
            let queue = PersistenceQueue::new(QueueConfig::default(), primary, backup);
            let store = TaskStore::with_queue(queue.clone());
            store
                .create_item(Collection::Tasks, json!({"id": "a", "title": "A"}))
                .unwrap();
            store
                .create_item(Collection::Tasks, json!({"id": "b", "title": "B"}))
                .unwrap();
            store
                .create_item(Collection::Projects, json!({"id": "p", "name": "P"}))
                .unwrap();
            assert!(queue.flush_queue().await.unwrap().is_success());

            store.delete_item(Collection::Tasks, "b").unwrap();
            store.update_settings(json!({"pomodoroMinutes": 25})).unwrap();
            assert!(queue.flush_queue().await.unwrap().is_success());
        })
        .await;

    let primary = DirectoryStore::new(&primary_dir);
    let backup = FlatFileStore::new(&backup_file);
    let records = load_latest(&primary, &backup).await.unwrap();
    let store = TaskStore::from_records(&records, None);
    assert_eq!(store.count(Collection::Tasks), 1);
    assert_eq!(store.count(Collection::Projects), 1);
    assert_eq!(store.settings(), json!({"pomodoroMinutes": 25}));

    std::fs::remove_dir_all(&primary_dir).unwrap();
    let records = load_latest(&primary, &backup).await.unwrap();
    let store = TaskStore::from_records(&records, None);
    assert_eq!(
        store.item(Collection::Tasks, "a"),
        Some(json!({"id": "a", "title": "A"}))
    );
}

// === Workspace ===

#[tokio::test]
async fn test_workspace_undo_is_persisted() {
    let temp = tempdir().unwrap();
    let config = EngineConfig {
        data_dir: temp.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let local = LocalSet::new();

    local
        .run_until(async {
            let workspace = Workspace::open(config.clone()).await.unwrap();
            workspace.add_task(json!({"id": "keep"})).unwrap();
            workspace.add_task(json!({"id": "drop"})).unwrap();
            workspace.flush().await.unwrap();

            assert!(workspace.history.undo());
            workspace.flush().await.unwrap();
        })
        .await;

    local
        .run_until(async {
            let workspace = Workspace::open(config.clone()).await.unwrap();
            assert!(workspace.store.item(Collection::Tasks, "keep").is_some());
            assert!(workspace.store.item(Collection::Tasks, "drop").is_none());
            assert_eq!(workspace.history.undo_count(), 1);
        })
        .await;
}
