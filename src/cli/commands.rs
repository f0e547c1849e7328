//! CLI Command Implementations
//!
//! Each command opens the data directory, does its work and flushes any
//! pending writes before returning. Commands must run inside a `LocalSet`.

use std::path::Path;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, ProviderKind, CONFIG_FILE};
use crate::error::{PomoflowError, Result};
use crate::persistence::TransactionOutcome;
use crate::settings::{LocalSettings, GIST_TOKEN_KEY, JSONBIN_KEY_KEY};
use crate::store::Collection;
use crate::sync::{PullOutcome, SyncState};
use crate::workspace::Workspace;

/// Write a default configuration.
pub fn init(data_dir: &Path, force: bool) -> Result<()> {
    let config_path = data_dir.join(CONFIG_FILE);
    if config_path.exists() && !force {
        println!("Configuration already exists: {}", config_path.display());
        println!("Use --force to overwrite it");
        return Ok(());
    }

    let config = EngineConfig {
        data_dir: data_dir.to_path_buf(),
        ..EngineConfig::default()
    };
    let path = config.save()?;
    info!(path = %path.display(), "Configuration written");
    println!("Initialized: {}", path.display());
    Ok(())
}

/// Print counts, persistence stats and sync status.
pub async fn status(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    let stats = workspace.queue.stats();
    let sync = workspace.sync.status();

    println!("Data directory: {}", data_dir.display());
    println!("Tasks: {}", workspace.store.count(Collection::Tasks));
    println!("Projects: {}", workspace.store.count(Collection::Projects));
    println!(
        "History: {} undo / {} redo (capacity {})",
        workspace.history.undo_count(),
        workspace.history.redo_count(),
        workspace.history.capacity()
    );

    println!("\n--- Persistence ---");
    println!("Pending operations: {}", workspace.queue.pending_count());
    println!("Transactions this session: {}", stats.transactions);

    println!("\n--- Sync ---");
    match sync.provider {
        Some(provider) => println!("Provider: {}", provider),
        None => println!("Provider: none enabled"),
    }
    println!("Credential: {}", if sync.has_credential { "set" } else { "missing" });
    println!("Device: {}", sync.device_name);
    if let Some(url) = sync.remote_url.as_ref().or(sync.remote_id.as_ref()) {
        println!("Remote: {}", url);
    }
    match sync.last_sync {
        Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Last sync: never"),
    }
    Ok(())
}

/// Create a task under a history snapshot and write it out.
pub async fn add_task(
    data_dir: &Path,
    title: &str,
    id: Option<&str>,
    project: Option<&str>,
) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    let id = id
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = Utc::now().to_rfc3339();
    let mut task = json!({
        "id": id,
        "title": title,
        "completed": false,
        "createdAt": now,
        "updatedAt": now,
    });
    if let Some(project) = project {
        task["projectId"] = json!(project);
    }

    workspace.add_task(task)?;
    finish(&workspace).await?;
    println!("Task created: {} ({})", title, id);
    Ok(())
}

/// Undo the last recorded change.
pub async fn undo(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    let label = workspace.history.undo_labels().into_iter().next();
    if !workspace.history.undo() {
        println!("Nothing to undo.");
        return Ok(());
    }
    finish(&workspace).await?;
    println!("Undone: {}", label.unwrap_or_default());
    Ok(())
}

/// Re-apply the last undone change.
pub async fn redo(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    let label = workspace.history.redo_labels().into_iter().next();
    if !workspace.history.redo() {
        println!("Nothing to redo.");
        return Ok(());
    }
    finish(&workspace).await?;
    println!("Redone: {}", label.unwrap_or_default());
    Ok(())
}

/// Upload now.
pub async fn push(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    if workspace.sync.sync_now().await {
        let status = workspace.sync.status();
        println!(
            "Pushed to {}",
            status.remote_url.or(status.remote_id).unwrap_or_default()
        );
    } else {
        report_sync_failure(&workspace);
    }
    Ok(())
}

/// Download and merge if the remote is newer.
pub async fn pull(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    if !workspace.sync.sync_from_cloud().await {
        report_sync_failure(&workspace);
        return Ok(());
    }
    finish(&workspace).await?;

    match workspace.sync.last_pull() {
        Some(PullOutcome::Merged(summary)) => println!(
            "Merged: {} created, {} updated, {} deleted, {} failed",
            summary.created, summary.updated, summary.deleted, summary.failed
        ),
        _ => println!("Already up to date."),
    }
    Ok(())
}

/// Point sync at an existing remote; the next pull reads it.
pub async fn link(data_dir: &Path, remote_id: &str) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    workspace.link_remote(remote_id)?;
    println!("Linked to {}", remote_id.trim());
    println!("Run `pull` to merge its contents.");
    Ok(())
}

/// Save a provider token or key to local settings.
pub fn set_credential(data_dir: &Path, provider: &str, value: &str) -> Result<()> {
    let kind = ProviderKind::from_str(provider).ok_or_else(|| PomoflowError::Config {
        reason: format!("unknown provider '{}'", provider),
    })?;
    let key = match kind {
        ProviderKind::Gist => GIST_TOKEN_KEY,
        ProviderKind::JsonBin => JSONBIN_KEY_KEY,
        ProviderKind::Memory => {
            println!("The memory provider needs no credential.");
            return Ok(());
        }
    };

    let config = EngineConfig::load(data_dir)?;
    let settings = LocalSettings::open(&config.local_settings_file());
    settings.set(key, value.trim())?;
    info!(provider = %kind, "Credential stored");
    println!("Credential saved for {}", kind);
    Ok(())
}

/// Print the device identity, creating it on first use.
pub fn device(data_dir: &Path) -> Result<()> {
    let config = EngineConfig::load(data_dir)?;
    let path = config.sync_state_file();
    let state = SyncState::load(&path, config.sync.active_provider);
    if !path.exists() {
        state.save(&path)?;
    }

    println!("Device id: {}", state.device_id);
    println!("Device name: {}", state.device_name);
    Ok(())
}

/// Show the recorded undo and redo labels.
pub async fn show_history(data_dir: &Path) -> Result<()> {
    let workspace = Workspace::open(EngineConfig::load(data_dir)?).await?;
    let history = &workspace.history;

    if !history.can_undo() && !history.can_redo() {
        println!("No changes in history.");
        return Ok(());
    }

    println!("Change History:");
    println!("{:-<60}", "");
    for label in history.redo_labels().iter().rev() {
        println!("    {} (undone)", label);
    }
    for (i, label) in history.undo_labels().iter().enumerate() {
        let marker = if i == 0 { ">>> " } else { "    " };
        println!("{}{}", marker, label);
    }
    println!("{:-<60}", "");
    println!(
        "Undo stack: {} | Redo stack: {}",
        history.undo_count(),
        history.redo_count()
    );
    Ok(())
}

/// Flush pending writes, reporting anything that did not land.
async fn finish(workspace: &Workspace) -> Result<()> {
    let report = workspace.flush().await?;
    if report.outcome != TransactionOutcome::Success {
        warn!(transaction = %report.id, failed = report.failed(), "Some writes failed");
    }
    report.ensure_complete()
}

fn report_sync_failure(workspace: &Workspace) {
    let status = workspace.sync.status();
    match (status.provider, status.last_error) {
        (None, _) => println!("No sync provider enabled. Edit {} to enable one.", CONFIG_FILE),
        (Some(provider), _) if !status.has_credential => {
            println!("No credential for {}. Use 'pomoflow set-credential {} <token>'", provider, provider)
        }
        (Some(_), Some(error)) => println!("Sync failed: {}", error),
        (Some(_), None) => println!("Sync did not run."),
    }
}
