#![forbid(unsafe_code)]

//! `agent-autopilot-ctl`: offline companion for `agent-autopilot`.
//!
//! Inspects and repairs a workspace's session data directly on disk:
//! session locks, the live state file, and checkpoints. Commands that
//! rewrite state refuse to run while the session is held by a live host.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use agent_autopilot::config::GlobalConfig;
use agent_autopilot::models::state::TaskList;
use agent_autopilot::orchestrator::{AgentStateManager, SessionManager};
use agent_autopilot::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-autopilot-ctl",
    about = "Offline session tools for agent-autopilot",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Session to operate on; defaults to the configured session id.
    #[arg(long)]
    session_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions held by live processes.
    Sessions,

    /// Print a summary of the session state (or the full record with --json).
    State {
        /// Print the full state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Snapshot the current state as a named checkpoint.
    Checkpoint {
        /// Checkpoint name.
        name: String,
    },

    /// List checkpoints, oldest first.
    Checkpoints,

    /// Replace the live state with the newest checkpoint of that name.
    Restore {
        /// Checkpoint name.
        name: String,
    },

    /// Remove the session lock.
    Release {
        /// Remove the lock even if its owner still appears alive.
        #[arg(long)]
        force: bool,
    },

    /// Delete the live state file.
    Clear,
}

fn main() -> std::process::ExitCode {
    let args = Cli::parse();
    match run(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let session_id = args.session_id.unwrap_or_else(|| config.session_id.clone());
    let sessions = SessionManager::file_backed(config.lock_dir());
    let state = AgentStateManager::new(config.state_path(&session_id));

    match args.command {
        Command::Sessions => {
            let active = sessions.list_active()?;
            if active.is_empty() {
                println!("no active sessions");
            }
            for info in active {
                println!(
                    "{}\tpid {}\t{}@{}\tsince {}",
                    info.session_id,
                    info.pid,
                    info.username,
                    info.hostname,
                    info.start_time.to_rfc3339()
                );
            }
        }
        Command::State { json } => {
            let Some(current) = state.load_state()? else {
                println!("no state for session {session_id}");
                return Ok(());
            };
            if json {
                let rendered = serde_json::to_string_pretty(&current)
                    .map_err(|err| AppError::Io(format!("failed to render state: {err}")))?;
                println!("{rendered}");
                return Ok(());
            }
            println!("session:    {}", current.session_id);
            println!("mode:       {}", current.current_mode.as_str());
            println!("iteration:  {}", current.session.iteration);
            for list in TaskList::ALL {
                println!("{:<11} {}", format!("{}:", list.as_str()), current.tasks(list).len());
            }
            println!(
                "success:    {:.0}% ({} completed, {} failed)",
                current.metrics.success_rate * 100.0,
                current.metrics.tasks_completed,
                current.metrics.tasks_failed
            );
            println!("files:      {}", current.metrics.files_modified);
            println!("peak mem:   {} MB", current.metrics.peak_memory_mb);
        }
        Command::Checkpoint { name } => {
            if state.load_state()?.is_none() {
                return Err(AppError::NotFound(format!(
                    "no state for session {session_id}"
                )));
            }
            let summary = state.checkpoint(&name)?;
            println!("{}", summary.path.display());
        }
        Command::Checkpoints => {
            for summary in state.list_checkpoints()? {
                println!(
                    "{}\t{}\t{}",
                    summary.name,
                    summary.created_epoch_ms,
                    summary.path.display()
                );
            }
        }
        Command::Restore { name } => {
            refuse_if_active(&sessions, &session_id)?;
            let restored = state.restore_checkpoint(&name)?;
            println!("restored {}", restored.path.display());
            for divergence in restored.divergences {
                println!("  {:?}\t{}", divergence.kind, divergence.file_path);
            }
        }
        Command::Release { force } => {
            if !force {
                refuse_if_active(&sessions, &session_id)?;
            }
            sessions.release(&session_id)?;
            println!("released {session_id}");
        }
        Command::Clear => {
            refuse_if_active(&sessions, &session_id)?;
            state.clear_state()?;
            println!("cleared state for {session_id}");
        }
    }

    Ok(())
}

fn refuse_if_active(sessions: &SessionManager, session_id: &str) -> Result<()> {
    match sessions.get_session(session_id)? {
        Some(info) if info.is_owner_alive() => Err(AppError::SessionConflict {
            session_id: info.session_id,
            pid: info.pid,
            hostname: info.hostname,
        }),
        _ => Ok(()),
    }
}
