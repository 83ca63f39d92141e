//! Orchestra Control - CLI client for the orchestrad kernel API

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{KernelClient, DEFAULT_URL};

#[derive(Parser)]
#[command(name = "orchestractl")]
#[command(about = "Orchestra kernel control - registry, health, navigation, config and backups", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Kernel base URL
    #[arg(long, global = true, env = "ORCHESTRA_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Actor id recorded in the audit log (defaults to system)
    #[arg(long, global = true, env = "ORCHESTRA_ACTOR")]
    actor: Option<String>,

    /// Print the raw response envelope
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage registered services
    Services {
        #[command(subcommand)]
        action: ServicesAction,
    },

    /// Kernel liveness, or a full sweep with --check
    Health {
        /// Ping every service now
        #[arg(long)]
        check: bool,

        /// Per-check timeout for the sweep, in milliseconds
        #[arg(long, requires = "check")]
        timeout_ms: Option<u64>,
    },

    /// Full sweep plus memory and build information
    Diagnostics,

    /// Recorded health checks, newest first
    History {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        hours: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Uptime percentage for one service
    Uptime {
        id: String,
        #[arg(long)]
        hours: Option<u32>,
    },

    /// Aggregated navigation tree
    Nav {
        #[arg(long)]
        user: Option<String>,

        /// Capability held by the user (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        #[arg(long)]
        tenant: Option<String>,
    },

    /// Status rollup from stored registry state
    ShellHealth,

    /// Kernel configuration entries
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Ask services to back themselves up
    Backup {
        /// Limit to these services (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Ask services to restore a backup
    Restore {
        backup_id: String,
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Encrypted snapshots of the kernel's own state
    KernelBackup {
        #[command(subcommand)]
        action: KernelBackupAction,
    },

    /// Backup schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Query the audit log
    Audit {
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        entity_id: Option<String>,
        /// Event type, e.g. service.registered
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum ServicesAction {
    List,
    Get {
        id: String,
    },
    Register {
        id: String,
        endpoint: String,
        #[arg(long)]
        health_check: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Unregister {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    List {
        #[arg(long)]
        prefix: Option<String>,
    },
    Get {
        key: String,
    },
    /// VALUE is parsed as JSON, falling back to a plain string
    Set {
        key: String,
        value: String,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        key: String,
    },
    History {
        key: String,
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum KernelBackupAction {
    Create,
    List,
    Get { id: String },
    Verify { id: String },
    Restore { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum ScheduleAction {
    List,
    Create {
        name: String,
        /// Five-field cron expression, e.g. "0 3 * * *"
        cron: String,
        /// full or incremental
        #[arg(long, default_value = "full")]
        backup_type: String,
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long)]
        disabled: bool,
    },
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = KernelClient::new(&cli.url, cli.actor.clone())?;

    let envelope = commands::run(&client, cli.command).await?;
    if !output::print_envelope(&envelope, cli.json) {
        std::process::exit(1);
    }
    Ok(())
}
