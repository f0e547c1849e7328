//! Sync bookkeeping persisted between sessions.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderKind;
use crate::error::{PomoflowError, Result};
use crate::sync::device::DeviceIdentity;
use crate::sync::provider::RemoteRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub provider: ProviderKind,
    pub remote_id: Option<String>,
    pub remote_url: Option<String>,
    /// Only advanced by a successful round trip.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub device_id: String,
    pub device_name: String,
    /// Runtime only.
    #[serde(skip)]
    pub online: bool,
    /// Content hash of the blob the remote is known to hold, from our last
    /// upload or download.
    #[serde(default)]
    pub last_uploaded_hash: Option<String>,
}

impl SyncState {
    pub fn new(provider: ProviderKind, device: DeviceIdentity) -> Self {
        Self {
            provider,
            remote_id: None,
            remote_url: None,
            last_sync_timestamp: None,
            device_id: device.id,
            device_name: device.name,
            online: true,
            last_uploaded_hash: None,
        }
    }

    /// Load the saved state for `provider`. A missing or unreadable file
    /// starts fresh with a new device identity; a state saved for a
    /// different provider keeps the device but forgets the remote.
    pub fn load(path: &Path, provider: ProviderKind) -> Self {
        let saved = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<SyncState>(&content) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable sync state");
                    None
                }
            },
            Err(_) => None,
        };

        match saved {
            Some(mut state) => {
                if state.provider != provider {
                    debug!(from = %state.provider, to = %provider, "Provider changed, forgetting remote");
                    state.provider = provider;
                    state.clear_remote();
                }
                state.online = true;
                state
            }
            None => Self::new(provider, DeviceIdentity::generate()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PomoflowError::FileWriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| PomoflowError::FileWriteError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn device(&self) -> DeviceIdentity {
        DeviceIdentity {
            id: self.device_id.clone(),
            name: self.device_name.clone(),
        }
    }

    pub fn remote(&self) -> Option<RemoteRef> {
        self.remote_id.as_ref().map(|id| RemoteRef {
            id: id.clone(),
            url: self.remote_url.clone(),
        })
    }

    pub fn clear_remote(&mut self) {
        self.remote_id = None;
        self.remote_url = None;
        self.last_uploaded_hash = None;
    }
}
