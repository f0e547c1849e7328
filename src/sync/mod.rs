//! Cloud sync: remote providers, reconciliation and the coordinator that
//! drives them.

pub mod coordinator;
pub mod device;
pub mod gist;
#[cfg(feature = "http")]
mod http;
pub mod jsonbin;
pub mod memory;
pub mod merge;
pub mod provider;
pub mod state;

use std::rc::Rc;

use crate::config::{ProviderKind, SyncConfig};
use crate::error::Result;
use crate::settings::LocalSettings;

pub use coordinator::{PullOutcome, SyncCoordinator, SyncHandle, SyncStatus};
pub use device::DeviceIdentity;
pub use gist::GistProvider;
pub use jsonbin::JsonBinProvider;
pub use memory::MemoryProvider;
pub use merge::{MergeAction, MergePlan, MergeSummary};
pub use provider::{RemoteProvider, RemoteRef, SyncPayload};
pub use state::SyncState;

/// Build the provider for `kind` from configuration.
pub fn build_provider(
    kind: ProviderKind,
    config: &SyncConfig,
    settings: Rc<LocalSettings>,
) -> Result<Rc<dyn RemoteProvider>> {
    let timeout = config.request_timeout();
    let provider: Rc<dyn RemoteProvider> = match kind {
        ProviderKind::Gist => Rc::new(GistProvider::new(&config.gist, timeout, settings)?),
        ProviderKind::JsonBin => Rc::new(JsonBinProvider::new(&config.jsonbin, timeout, settings)?),
        ProviderKind::Memory => Rc::new(MemoryProvider::new()),
    };
    Ok(provider)
}

/// The enabled provider from configuration, if any.
pub fn enabled_provider(
    config: &SyncConfig,
    settings: Rc<LocalSettings>,
) -> Result<Option<Rc<dyn RemoteProvider>>> {
    match config.enabled_provider() {
        Some(kind) => build_provider(kind, config, settings).map(Some),
        None => Ok(None),
    }
}
