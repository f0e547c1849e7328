//! A data directory opened as one running engine.
//!
//! Wires the two local stores, the quota probe, the persistence queue, the
//! live store, the history manager and the sync coordinator together the way
//! the CLI and embedders use them.

use std::rc::Rc;

use serde_json::Value as Json;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{PomoflowError, Result};
use crate::history::{HistoryConfig, HistoryJournal, HistoryManager};
use crate::persistence::{
    load_latest, DirectoryQuota, DirectoryStore, FlatFileStore, PersistenceQueue, QueueConfig,
    StorageBackend, TransactionReport,
};
use crate::settings::LocalSettings;
use crate::store::{item_id, Collection, DomainFacade, TaskStore};
use crate::sync::{enabled_provider, RemoteProvider, SyncCoordinator, SyncState};

pub struct Workspace {
    pub config: EngineConfig,
    pub settings: Rc<LocalSettings>,
    pub queue: PersistenceQueue,
    pub store: Rc<TaskStore>,
    pub history: HistoryManager,
    pub sync: SyncCoordinator,
}

impl Workspace {
    /// Open the data directory described by `config`, rehydrating the store
    /// and the persisted history window. Must run inside a `LocalSet` once
    /// anything is written.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let settings = Rc::new(LocalSettings::open(&config.local_settings_file()));
        let provider = enabled_provider(&config.sync, settings.clone())?;
        Self::assemble(config, settings, provider).await
    }

    /// Like [`Workspace::open`], syncing through `provider` instead of the
    /// one configured.
    pub async fn open_with_provider(
        config: EngineConfig,
        provider: Rc<dyn RemoteProvider>,
    ) -> Result<Self> {
        let settings = Rc::new(LocalSettings::open(&config.local_settings_file()));
        Self::assemble(config, settings, Some(provider)).await
    }

    async fn assemble(
        config: EngineConfig,
        settings: Rc<LocalSettings>,
        provider: Option<Rc<dyn RemoteProvider>>,
    ) -> Result<Self> {
        let primary_dir = config.primary_store_dir();
        let backup_file = config.backup_store_file();
        let primary: Rc<dyn StorageBackend> = Rc::new(DirectoryStore::new(&primary_dir));
        let backup: Rc<dyn StorageBackend> = Rc::new(FlatFileStore::new(&backup_file));
        let quota = Rc::new(DirectoryQuota::new(
            &[primary_dir.as_path(), backup_file.as_path()],
            config.storage_budget_bytes,
        ));

        let records = load_latest(primary.as_ref(), backup.as_ref()).await?;
        let queue =
            PersistenceQueue::with_quota(QueueConfig::from(&config), primary, backup, quota);
        let store = Rc::new(TaskStore::from_records(&records, Some(queue.clone())));

        let history = HistoryManager::new(store.clone(), HistoryConfig::from(&config))
            .with_journal(HistoryJournal::new(&config.history_journal_file()));
        let restored = history.load_journal();
        debug!(entries = restored, "History journal loaded");

        let provider_kind = provider
            .as_ref()
            .map_or(config.sync.active_provider, |p| p.kind());
        let state = SyncState::load(&config.sync_state_file(), provider_kind);
        let sync = SyncCoordinator::new(&config.sync, store.clone(), provider, state)
            .with_state_file(config.sync_state_file());
        queue.set_sync_trigger(sync.trigger());

        info!(
            data_dir = %config.data_dir.display(),
            tasks = store.count(Collection::Tasks),
            projects = store.count(Collection::Projects),
            "Workspace opened"
        );

        Ok(Self {
            config,
            settings,
            queue,
            store,
            history,
            sync,
        })
    }

    /// Snapshot, then create `task`. Returns the new task's id. A task the
    /// store would reject leaves no history entry behind.
    pub fn add_task(&self, task: Json) -> Result<String> {
        if !task.is_object() {
            return Err(PomoflowError::Validation {
                reason: "task must be an object".to_string(),
            });
        }
        let id = item_id(&task).ok_or_else(|| PomoflowError::Validation {
            reason: "task has no id".to_string(),
        })?;
        if self.store.item(Collection::Tasks, &id).is_some() {
            return Err(PomoflowError::DuplicateItem {
                collection: Collection::Tasks.to_string(),
                id,
            });
        }
        self.history
            .save_state_for(&format!("Create task {}", id), &[Collection::Tasks.as_str()]);
        self.store.create_item(Collection::Tasks, task)?;
        Ok(id)
    }

    /// Attach this device to a remote another device already uploaded.
    pub fn link_remote(&self, remote_id: &str) -> Result<()> {
        self.sync.link(remote_id)
    }

    /// Write everything pending now.
    pub async fn flush(&self) -> Result<TransactionReport> {
        self.queue.flush_queue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MemoryProvider;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::task::LocalSet;

    fn config_in(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reopen_rehydrates_store_and_history() {
        let temp = tempdir().unwrap();
        let local = LocalSet::new();
        local
            .run_until(async {
                let workspace = Workspace::open(config_in(temp.path())).await.unwrap();
                workspace
                    .add_task(json!({"id": "t1", "title": "Write report"}))
                    .unwrap();
                let report = workspace.flush().await.unwrap();
                assert!(report.is_success());
                assert_eq!(workspace.history.undo_count(), 1);
            })
            .await;

        local
            .run_until(async {
                let workspace = Workspace::open(config_in(temp.path())).await.unwrap();
                assert!(workspace.store.item(Collection::Tasks, "t1").is_some());
                assert_eq!(workspace.history.undo_labels(), vec!["Create task t1"]);

                assert!(workspace.history.undo());
                assert!(workspace.store.item(Collection::Tasks, "t1").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_rejected_task_leaves_no_history() {
        let temp = tempdir().unwrap();
        LocalSet::new()
            .run_until(async {
                let workspace = Workspace::open(config_in(temp.path())).await.unwrap();
                workspace.add_task(json!({"id": "t1"})).unwrap();

                assert!(matches!(
                    workspace.add_task(json!({"id": "t1"})),
                    Err(PomoflowError::DuplicateItem { .. })
                ));
                assert!(matches!(
                    workspace.add_task(json!({"title": "no id"})),
                    Err(PomoflowError::Validation { .. })
                ));
                assert_eq!(workspace.history.undo_count(), 1);
                assert_eq!(workspace.store.count(Collection::Tasks), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_second_device_links_and_pulls() {
        let laptop_dir = tempdir().unwrap();
        let phone_dir = tempdir().unwrap();
        let remote = Rc::new(MemoryProvider::new());
        let local = LocalSet::new();

        let remote_id = local
            .run_until(async {
                let laptop =
                    Workspace::open_with_provider(config_in(laptop_dir.path()), remote.clone())
                        .await
                        .unwrap();
                laptop.add_task(json!({"id": "t1", "title": "Shared"})).unwrap();
                laptop.flush().await.unwrap();
                // Let the sync the flush triggered finish.
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                assert!(laptop.sync.sync_now().await);
                laptop.sync.state().remote_id.unwrap()
            })
            .await;

        local
            .run_until(async {
                let phone =
                    Workspace::open_with_provider(config_in(phone_dir.path()), remote.clone())
                        .await
                        .unwrap();
                assert!(!phone.sync.sync_from_cloud().await);

                phone.link_remote(&remote_id).unwrap();
                assert!(phone.sync.sync_from_cloud().await);
                assert!(phone.store.item(Collection::Tasks, "t1").is_some());
            })
            .await;

        // The link is kept in the phone's sync state.
        let saved = SyncState::load(
            &config_in(phone_dir.path()).sync_state_file(),
            crate::config::ProviderKind::Memory,
        );
        assert_eq!(saved.remote_id, Some(remote_id));
    }

    #[tokio::test]
    async fn test_no_enabled_provider_never_syncs() {
        let temp = tempdir().unwrap();
        LocalSet::new()
            .run_until(async {
                let workspace = Workspace::open(config_in(temp.path())).await.unwrap();
                assert!(workspace.sync.status().provider.is_none());
                assert!(!workspace.sync.sync_now().await);
            })
            .await;
    }
}
