//! In-process remote, for local runs and tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::ProviderKind;
use crate::error::{PomoflowError, Result};
use crate::sync::provider::{RemoteProvider, RemoteRef, SyncPayload};

pub struct MemoryProvider {
    blobs: RefCell<HashMap<String, SyncPayload>>,
    next_id: Cell<u64>,
    credential: Cell<bool>,
    offline: Cell<bool>,
    uploads: Cell<usize>,
    downloads: Cell<usize>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            blobs: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            credential: Cell::new(true),
            offline: Cell::new(false),
            uploads: Cell::new(0),
            downloads: Cell::new(0),
        }
    }

    pub fn set_credential(&self, present: bool) {
        self.credential.set(present);
    }

    /// Make every request fail with a network error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.offline.set(unreachable);
    }

    /// Store `payload` under `id` as if another device had uploaded it.
    pub fn put(&self, id: &str, payload: SyncPayload) {
        self.blobs.borrow_mut().insert(id.to_string(), payload);
    }

    pub fn get(&self, id: &str) -> Option<SyncPayload> {
        self.blobs.borrow().get(id).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.borrow().len()
    }

    /// Requests received, successful or not.
    pub fn upload_count(&self) -> usize {
        self.uploads.get()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.get()
    }

    fn check(&self) -> Result<()> {
        if !self.credential.get() {
            return Err(PomoflowError::CredentialMissing {
                provider: ProviderKind::Memory.to_string(),
            });
        }
        if self.offline.get() {
            return Err(PomoflowError::Network {
                provider: ProviderKind::Memory.to_string(),
                message: "remote unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl RemoteProvider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    fn has_credential(&self) -> bool {
        self.credential.get()
    }

    async fn upload(&self, existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef> {
        self.uploads.set(self.uploads.get() + 1);
        self.check()?;

        let id = match existing {
            Some(remote) if self.blobs.borrow().contains_key(&remote.id) => remote.id.clone(),
            Some(_) => {
                return Err(PomoflowError::RemoteStatus {
                    provider: ProviderKind::Memory.to_string(),
                    status: 404,
                })
            }
            None => {
                let id = format!("mem-{}", self.next_id.get());
                self.next_id.set(self.next_id.get() + 1);
                id
            }
        };
        self.blobs.borrow_mut().insert(id.clone(), payload.clone());
        Ok(RemoteRef {
            url: Some(format!("memory://{}", id)),
            id,
        })
    }

    async fn download(&self, id: &str) -> Result<SyncPayload> {
        self.downloads.set(self.downloads.get() + 1);
        self.check()?;
        self.get(id).ok_or_else(|| PomoflowError::RemoteStatus {
            provider: ProviderKind::Memory.to_string(),
            status: 404,
        })
    }
}
