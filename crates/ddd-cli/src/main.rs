//! Operator CLI: thin wrappers over the library crates' public functions
//! (spec.md §4 supplemented "Operator CLI crate"), mirroring `mqk-cli`'s
//! `Cli`/`Commands`/`Subcommand` clap layout and its "connect, call the
//! library, print, exit" shape for each command.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ddd")]
#[command(about = "Reliability-core operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the idempotent storage schema to the configured database.
    Migrate,

    /// Outbox inspection and maintenance.
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },

    /// Long-process (saga) inspection.
    Process {
        #[command(subcommand)]
        cmd: ProcessCmd,
    },

    /// Behaviour workflow inspection.
    Workflow {
        #[command(subcommand)]
        cmd: WorkflowCmd,
    },
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Print grouped counts by status plus the unresolved DLQ count.
    Stats,
    /// Delete completed rows older than `--days` days.
    Purge {
        #[arg(long)]
        days: i64,
    },
    /// Dead-letter queue commands.
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },
}

#[derive(Subcommand)]
enum DlqCmd {
    /// List every unresolved dead-lettered entry.
    List,
}

#[derive(Subcommand)]
enum ProcessCmd {
    /// Print one long-process row by id.
    Show {
        #[arg(value_name = "ID")]
        id: i64,
    },
}

#[derive(Subcommand)]
enum WorkflowCmd {
    /// Print one behaviour workflow row by id.
    Show {
        #[arg(value_name = "ID")]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Outbox { cmd } => match cmd {
            OutboxCmd::Stats => commands::outbox::stats().await?,
            OutboxCmd::Purge { days } => commands::outbox::purge(days).await?,
            OutboxCmd::Dlq { cmd: DlqCmd::List } => commands::outbox::dlq_list().await?,
        },
        Commands::Process { cmd: ProcessCmd::Show { id } } => commands::process::show(id).await?,
        Commands::Workflow { cmd: WorkflowCmd::Show { id } } => commands::workflow::show(id).await?,
    }

    Ok(())
}
