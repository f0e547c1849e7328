//! Pomoflow CLI - Task State Engine
//!
//! Command-line interface for the Pomoflow history, persistence and sync
//! engine.

use clap::Parser;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pomoflow::cli::{commands, Cli, Commands};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Pomoflow v{}", env!("CARGO_PKG_VERSION"));

    let Some(cmd) = cli.command else {
        println!("Pomoflow v{}", env!("CARGO_PKG_VERSION"));
        println!("Use --help for available commands");
        return Ok(());
    };

    // The engine is single-threaded; everything runs on one LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, handle_command(&cli.data_dir, cmd))?;
    Ok(())
}

async fn handle_command(data_dir: &std::path::Path, cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Init { force } => commands::init(data_dir, force)?,
        Commands::Status => commands::status(data_dir).await?,
        Commands::AddTask { title, id, project } => {
            commands::add_task(data_dir, &title, id.as_deref(), project.as_deref()).await?
        }
        Commands::Undo => commands::undo(data_dir).await?,
        Commands::Redo => commands::redo(data_dir).await?,
        Commands::Push => commands::push(data_dir).await?,
        Commands::Pull => commands::pull(data_dir).await?,
        Commands::Link { remote_id } => commands::link(data_dir, &remote_id).await?,
        Commands::SetCredential { provider, value } => {
            commands::set_credential(data_dir, &provider, &value)?
        }
        Commands::Device => commands::device(data_dir)?,
        Commands::History => commands::show_history(data_dir).await?,
    }
    Ok(())
}
