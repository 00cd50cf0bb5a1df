//! task-cli: local-first to-do list over a JSON file store.
//!
//! Each invocation seeds a repository from the stored snapshot, applies
//! one mutation optimistically, and flushes the queued remote ops
//! before exiting. The same core drives long-lived clients; the CLI
//! just compresses the lifecycle into a single command.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use task_cli::JsonFileStore;
use task_store::{EngineConfig, SyncEngine, Task, TaskId, TaskRepository, UserId};

#[derive(Parser, Debug)]
#[command(name = "task-cli")]
#[command(about = "Local-first synchronized to-do list")]
struct Args {
    /// Path to the JSON store file
    #[arg(long, default_value = "tasks.json")]
    data: PathBuf,

    /// User whose task list to operate on
    #[arg(long, default_value = "default")]
    user: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a task
    Add {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// List all tasks
    List,
    /// Mark a task as done
    Done { id: String },
    /// Mark a task as not done
    Undone { id: String },
    /// Change a task's text
    Edit {
        id: String,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Remove a task
    Rm { id: String },
}

/// Display form of a task id: the first few characters, enough to
/// disambiguate and to feed back into the prefix resolver.
fn short_id(id: &TaskId) -> String {
    id.as_str().chars().take(8).collect()
}

/// Resolve a (possibly abbreviated) task id against the current set.
fn resolve_id(tasks: &[Task], prefix: &str) -> Result<TaskId> {
    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.id.as_str().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [task] => Ok(task.id.clone()),
        [] => bail!("no task matches id '{prefix}'"),
        _ => bail!("id '{prefix}' is ambiguous ({} matches)", matches.len()),
    }
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in tasks {
        let check = if task.is_checked { "x" } else { " " };
        let flag = if task.sync_failed { "  (sync failed)" } else { "" };
        println!("[{check}] {}  {}{flag}", short_id(&task.id), task.text);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG; defaults to warn, or debug with --verbose
    let default_filter = if args.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let owner = UserId::from(args.user.as_str());
    let store = Arc::new(JsonFileStore::new(&args.data));

    let repo = Arc::new(Mutex::new(TaskRepository::new(
        owner.clone(),
        Arc::clone(&store),
    )));
    let engine = SyncEngine::new(
        owner.clone(),
        Arc::clone(&repo),
        Arc::clone(&store),
        EngineConfig::default(),
    );

    // Seed local state from the stored snapshot
    let snapshot = store
        .snapshot_for(&owner)
        .await
        .with_context(|| format!("failed to read store at {}", args.data.display()))?;
    engine.deliver_snapshot(&snapshot).await;

    match &args.command {
        Command::Add { text } => {
            let text = text.join(" ");
            let task = repo.lock().await.create(&text)?;
            info!(id = %task.id, "added task");
            println!("Added {}: {}", short_id(&task.id), task.text);
        }
        Command::List => {
            print_tasks(&repo.lock().await.tasks());
        }
        Command::Done { id } | Command::Undone { id } => {
            let value = matches!(args.command, Command::Done { .. });
            let mut repo = repo.lock().await;
            let id = resolve_id(&repo.tasks(), id)?;
            repo.set_checked(&id, value)?;
        }
        Command::Edit { id, text } => {
            let text = text.join(" ");
            let mut repo = repo.lock().await;
            let id = resolve_id(&repo.tasks(), id)?;
            if !repo.edit_text(&id, &text)? {
                println!("No changes made");
            }
        }
        Command::Rm { id } => {
            let mut repo = repo.lock().await;
            let id = resolve_id(&repo.tasks(), id)?;
            repo.delete(&id)?;
        }
    }

    let report = engine.flush_until_idle().await;
    if report.retrying > 0 || report.rejected > 0 {
        warn!(?report, "some changes did not reach the store");
        bail!("failed to write all changes to {}", args.data.display());
    }

    Ok(())
}
