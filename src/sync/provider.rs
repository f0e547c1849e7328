//! Remote blob store contract and the payload that travels through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use sha2::{Digest, Sha256};

use crate::config::ProviderKind;
use crate::error::Result;
use crate::store::Collection;

/// Current payload format.
pub const PAYLOAD_VERSION: u32 = 1;

/// Where an uploaded payload lives on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: String,
    pub url: Option<String>,
}

/// The full local state, stamped with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub tasks: Vec<Json>,
    #[serde(default)]
    pub projects: Vec<Json>,
    #[serde(default)]
    pub settings: Json,
}

impl SyncPayload {
    pub fn items(&self, collection: Collection) -> &[Json] {
        match collection {
            Collection::Tasks => &self.tasks,
            Collection::Projects => &self.projects,
        }
    }

    /// SHA-256 over the data only, so re-stamping identical content hashes
    /// the same.
    pub fn content_hash(&self) -> String {
        let content = json!({
            "tasks": self.tasks,
            "projects": self.projects,
            "settings": self.settings,
        });
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait(?Send)]
pub trait RemoteProvider {
    fn kind(&self) -> ProviderKind;

    /// Whether a credential is configured. Checked before every sync.
    fn has_credential(&self) -> bool;

    /// Create a blob, or overwrite `existing` in place.
    async fn upload(&self, existing: Option<&RemoteRef>, payload: &SyncPayload) -> Result<RemoteRef>;

    async fn download(&self, id: &str) -> Result<SyncPayload>;
}
