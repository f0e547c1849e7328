//! CLI Module
//!
//! Command-line interface for the Pomoflow engine.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pomoflow - history, persistence and sync engine for a task manager
#[derive(Parser, Debug)]
#[command(name = "pomoflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Data directory holding stores, history and sync state
    #[arg(short, long, global = true, default_value = ".pomoflow")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration into the data directory
    #[command(name = "init")]
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show store, persistence and sync state
    #[command(name = "status")]
    Status,

    /// Create a task and persist it
    #[command(name = "add-task")]
    AddTask {
        /// Task title
        title: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Project the task belongs to
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Undo the last recorded change
    #[command(name = "undo")]
    Undo,

    /// Redo the last undone change
    #[command(name = "redo")]
    Redo,

    /// Upload the local state to the active provider
    #[command(name = "push")]
    Push,

    /// Merge newer remote state into the local store
    #[command(name = "pull")]
    Pull,

    /// Attach to a gist or bin another device already pushed
    #[command(name = "link")]
    Link {
        /// Remote id (gist id or bin id)
        remote_id: String,
    },

    /// Store a provider credential in local settings
    #[command(name = "set-credential")]
    SetCredential {
        /// Provider (gist, jsonbin)
        provider: String,

        /// Token or API key
        value: String,
    },

    /// Print this device's sync identity
    #[command(name = "device")]
    Device,

    /// Show undo/redo history
    #[command(name = "history")]
    History,
}
