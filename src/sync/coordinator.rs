//! Cloud Sync Coordinator
//!
//! Uploads the local state to the active remote provider and merges newer
//! remote state back through the store facade. Triggered periodically while
//! online, on an offline to online transition, and after successful local
//! writes.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ProviderKind, SyncConfig};
use crate::error::PomoflowError;
use crate::persistence::SyncTrigger;
use crate::store::{latest_modification, Collection, DomainFacade};
use crate::sync::merge::{MergePlan, MergeSummary};
use crate::sync::provider::{RemoteProvider, RemoteRef, SyncPayload, PAYLOAD_VERSION};
use crate::sync::state::SyncState;

/// Snapshot of the coordinator for display.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub provider: Option<ProviderKind>,
    pub online: bool,
    pub has_credential: bool,
    pub in_flight: bool,
    pub remote_id: Option<String>,
    pub remote_url: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub device_name: String,
}

/// What the last `sync_from_cloud` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Remote was not newer; nothing applied.
    UpToDate,
    Merged(MergeSummary),
}

struct CoordinatorInner {
    interval: Duration,
    facade: Rc<dyn DomainFacade>,
    provider: Option<Rc<dyn RemoteProvider>>,
    state: RefCell<SyncState>,
    state_path: RefCell<Option<PathBuf>>,
    online: watch::Sender<bool>,
    in_flight: Cell<bool>,
    last_error: RefCell<Option<String>>,
    last_pull: Cell<Option<PullOutcome>>,
    credential_warned: Cell<bool>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Rc<CoordinatorInner>,
}

/// Clears the in-flight flag on drop.
struct InFlight<'a>(&'a Cell<bool>);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Running trigger loop. Dropping the handle stops it.
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SyncCoordinator {
    /// `provider` is `None` when no provider is enabled; every sync then
    /// reports `false`.
    pub fn new(
        config: &SyncConfig,
        facade: Rc<dyn DomainFacade>,
        provider: Option<Rc<dyn RemoteProvider>>,
        state: SyncState,
    ) -> Self {
        let (online, _) = watch::channel(state.online);
        Self {
            inner: Rc::new(CoordinatorInner {
                interval: config.interval(),
                facade,
                provider,
                state: RefCell::new(state),
                state_path: RefCell::new(None),
                online,
                in_flight: Cell::new(false),
                last_error: RefCell::new(None),
                last_pull: Cell::new(None),
                credential_warned: Cell::new(false),
            }),
        }
    }

    /// Persist the sync state to `path` after every change.
    pub fn with_state_file(self, path: PathBuf) -> Self {
        *self.inner.state_path.borrow_mut() = Some(path);
        self
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Record connectivity. Going online wakes the trigger loop, which
    /// syncs immediately.
    pub fn set_online(&self, online: bool) {
        self.inner.state.borrow_mut().online = online;
        let changed = self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Attach to a remote blob another device created. The next pull reads
    /// from it and the next push updates it.
    pub fn link(&self, remote_id: &str) -> crate::error::Result<()> {
        let remote_id = remote_id.trim();
        if remote_id.is_empty() {
            return Err(PomoflowError::Validation {
                reason: "remote id must not be empty".to_string(),
            });
        }
        {
            let mut state = self.inner.state.borrow_mut();
            if state.remote_id.as_deref() == Some(remote_id) {
                return Ok(());
            }
            state.clear_remote();
            state.remote_id = Some(remote_id.to_string());
        }
        info!(remote = %remote_id, "Linked to remote");
        self.persist_state();
        Ok(())
    }

    pub fn last_pull(&self) -> Option<PullOutcome> {
        self.inner.last_pull.get()
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.inner.state.borrow();
        SyncStatus {
            provider: self.inner.provider.as_ref().map(|p| p.kind()),
            online: self.is_online(),
            has_credential: self
                .inner
                .provider
                .as_ref()
                .map_or(false, |p| p.has_credential()),
            in_flight: self.inner.in_flight.get(),
            remote_id: state.remote_id.clone(),
            remote_url: state.remote_url.clone(),
            last_sync: state.last_sync_timestamp,
            last_error: self.inner.last_error.borrow().clone(),
            device_name: state.device_name.clone(),
        }
    }

    /// Fire-and-forget sync, for use as the persistence queue's trigger.
    /// Must be called inside a `LocalSet`.
    pub fn request_sync(&self) {
        let coordinator = self.clone();
        tokio::task::spawn_local(async move {
            coordinator.sync_now().await;
        });
    }

    /// A trigger that does not keep the coordinator alive.
    pub fn trigger(&self) -> SyncTrigger {
        let weak: Weak<CoordinatorInner> = Rc::downgrade(&self.inner);
        Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                SyncCoordinator { inner }.request_sync();
            }
        })
    }

    /// Spawn the periodic and connectivity trigger loop.
    pub fn start(&self) -> SyncHandle {
        let coordinator = self.clone();
        let period = self.inner.interval;
        let task = tokio::task::spawn_local(async move {
            let mut online = coordinator.inner.online.subscribe();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if coordinator.is_online() {
                            debug!("Periodic sync");
                            coordinator.sync_now().await;
                        }
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = *online.borrow_and_update();
                        if now_online {
                            info!("Back online, syncing");
                            coordinator.sync_now().await;
                        }
                    }
                }
            }
        });
        SyncHandle { task }
    }

    /// The provider, if one is enabled and has a credential.
    fn ready_provider(&self) -> Option<Rc<dyn RemoteProvider>> {
        let Some(provider) = self.inner.provider.clone() else {
            debug!("Sync skipped: no provider enabled");
            return None;
        };
        if !provider.has_credential() {
            self.warn_missing_credential(provider.kind());
            return None;
        }
        Some(provider)
    }

    fn warn_missing_credential(&self, kind: ProviderKind) {
        if !self.inner.credential_warned.replace(true) {
            warn!(provider = %kind, "No credential configured; continuing local-only");
        }
        *self.inner.last_error.borrow_mut() = Some(
            PomoflowError::CredentialMissing {
                provider: kind.to_string(),
            }
            .to_string(),
        );
    }

    fn record_failure(&self, direction: &str, error: PomoflowError) {
        match &error {
            PomoflowError::CredentialMissing { provider } => {
                if !self.inner.credential_warned.replace(true) {
                    warn!(provider = %provider, "No credential configured; continuing local-only");
                }
            }
            other => warn!(direction, error = %other, "Sync failed; local state untouched"),
        }
        *self.inner.last_error.borrow_mut() = Some(error.to_string());
    }

    fn persist_state(&self) {
        let path = self.inner.state_path.borrow();
        let Some(path) = path.as_ref() else {
            return;
        };
        if let Err(e) = self.inner.state.borrow().save(path) {
            warn!(error = %e, "Failed to save sync state");
        }
    }

    fn build_payload(&self) -> SyncPayload {
        let facade = self.inner.facade.as_ref();
        let state = self.inner.state.borrow();
        SyncPayload {
            version: PAYLOAD_VERSION,
            timestamp: Utc::now(),
            device_id: state.device_id.clone(),
            device_name: state.device_name.clone(),
            tasks: facade.items(Collection::Tasks),
            projects: facade.items(Collection::Projects),
            settings: facade.settings(),
        }
    }

    async fn upload(
        &self,
        provider: &dyn RemoteProvider,
        existing: Option<&RemoteRef>,
        payload: &SyncPayload,
    ) -> crate::error::Result<RemoteRef> {
        match provider.upload(existing, payload).await {
            Err(PomoflowError::RemoteStatus { status: 404, .. }) if existing.is_some() => {
                warn!(provider = %provider.kind(), "Remote copy is gone, creating a new one");
                provider.upload(None, payload).await
            }
            other => other,
        }
    }

    /// Upload the local state. Returns `false` without touching the network
    /// when offline, unconfigured, or another sync is running.
    pub async fn sync_now(&self) -> bool {
        if !self.is_online() {
            debug!("Sync skipped: offline");
            return false;
        }
        let Some(provider) = self.ready_provider() else {
            return false;
        };
        let Some(_guard) = InFlight::acquire(&self.inner.in_flight) else {
            debug!("Sync skipped: another sync in progress");
            return false;
        };

        let payload = self.build_payload();
        let hash = payload.content_hash();
        let (existing, last_hash) = {
            let state = self.inner.state.borrow();
            (state.remote(), state.last_uploaded_hash.clone())
        };
        if existing.is_some() && last_hash.as_deref() == Some(hash.as_str()) {
            debug!("Sync skipped: content unchanged since last upload");
            return true;
        }

        match self.upload(provider.as_ref(), existing.as_ref(), &payload).await {
            Ok(remote) => {
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.remote_id = Some(remote.id.clone());
                    state.remote_url = remote.url.clone();
                    state.last_sync_timestamp = Some(Utc::now());
                    state.last_uploaded_hash = Some(hash);
                }
                *self.inner.last_error.borrow_mut() = None;
                self.persist_state();
                info!(
                    provider = %provider.kind(),
                    remote = %remote.id,
                    tasks = payload.tasks.len(),
                    projects = payload.projects.len(),
                    "Uploaded local state"
                );
                true
            }
            Err(e) => {
                self.record_failure("upload", e);
                false
            }
        }
    }

    /// Download the remote state and merge it when it is newer than every
    /// local modification.
    pub async fn sync_from_cloud(&self) -> bool {
        if !self.is_online() {
            debug!("Pull skipped: offline");
            return false;
        }
        let Some(provider) = self.ready_provider() else {
            return false;
        };
        let Some(_guard) = InFlight::acquire(&self.inner.in_flight) else {
            debug!("Pull skipped: another sync in progress");
            return false;
        };
        let Some(remote) = self.inner.state.borrow().remote() else {
            debug!("Pull skipped: nothing uploaded yet");
            return false;
        };

        let payload = match provider.download(&remote.id).await {
            Ok(payload) => payload,
            Err(e) => {
                self.record_failure("download", e);
                return false;
            }
        };

        let facade = self.inner.facade.as_ref();
        let remote_is_newer = match latest_modification(facade) {
            Some(local_latest) => payload.timestamp > local_latest,
            None => true,
        };

        let outcome = if remote_is_newer {
            let plan = MergePlan::build(facade, &payload);
            let summary = plan.apply(facade);
            info!(
                from = %payload.device_name,
                created = summary.created,
                updated = summary.updated,
                deleted = summary.deleted,
                failed = summary.failed,
                "Merged remote state"
            );
            PullOutcome::Merged(summary)
        } else {
            info!(remote = %payload.timestamp, "Local state is newer; nothing to merge");
            PullOutcome::UpToDate
        };
        self.inner.last_pull.set(Some(outcome));

        {
            let mut state = self.inner.state.borrow_mut();
            state.last_sync_timestamp = Some(Utc::now());
            // The remote now holds the downloaded blob, whoever uploaded it.
            state.last_uploaded_hash = Some(payload.content_hash());
        }
        *self.inner.last_error.borrow_mut() = None;
        self.persist_state();
        true
    }
}
