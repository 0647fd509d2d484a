#![forbid(unsafe_code)]

//! `agent-autopilot`: autonomous session host.
//!
//! Acquires the session lock, restores or creates the session state, and
//! runs the improvement loop until a shutdown signal or a resource breach.
//! A breach still persists the final state, then exits with an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_autopilot::collaborators::backoff::Backoff;
use agent_autopilot::collaborators::host_cli::HostCliWorkflow;
use agent_autopilot::collaborators::inbox::InboxDiscovery;
use agent_autopilot::collaborators::planner::DependencyPlanner;
use agent_autopilot::config::GlobalConfig;
use agent_autopilot::models::resource::LimitExceeded;
use agent_autopilot::models::state::{AgentState, StateUpdate};
use agent_autopilot::orchestrator::resource_monitor::MonitorLimits;
use agent_autopilot::orchestrator::{
    AgentStateManager, ContinuousImprovementLoop, ResourceMonitor, SessionManager, TaskExecutor,
    WorkflowAdapter,
};
use agent_autopilot::policy::DenyListPolicy;
use agent_autopilot::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-autopilot", about = "Autonomous coding-agent session host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured session id.
    #[arg(long)]
    session_id: Option<String>,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-autopilot bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(ws) = args.workspace {
        config.workspace_root = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
    }
    let session_id = args.session_id.unwrap_or_else(|| config.session_id.clone());
    info!(session_id = %session_id, workspace = %config.workspace_root.display(), "configuration loaded");

    let sessions = SessionManager::file_backed(config.lock_dir());
    sessions.acquire(&session_id)?.into_result()?;

    let outcome = run_session(&config, &session_id).await;

    if let Err(err) = sessions.release(&session_id) {
        error!(%err, "failed to release session lock");
    }
    info!("agent-autopilot shut down");
    outcome
}

async fn run_session(config: &GlobalConfig, session_id: &str) -> Result<()> {
    let state = Arc::new(AgentStateManager::new(config.state_path(session_id)));
    let restored = restore_or_initialize(&state, config, session_id)?;
    info!(
        iteration = restored.session.iteration,
        queued = restored.task_queue.len(),
        "session state ready"
    );

    if config.autosave_seconds > 0 {
        state.start_auto_save(Duration::from_secs(config.autosave_seconds));
    }

    let (breach_tx, mut breach_rx) = mpsc::unbounded_channel::<LimitExceeded>();
    let monitor = ResourceMonitor::new(
        MonitorLimits::from(&config.limits),
        Arc::new(move |breach: LimitExceeded| {
            let _ = breach_tx.send(breach);
        }),
    );
    monitor.sample_now();
    monitor.start(config.monitor_interval());

    let discovery = Arc::new(InboxDiscovery::new(
        config.inbox_dir(),
        Backoff::from(&config.backoff),
    ));
    discovery.mark_reported(restored.tracked_ids())?;

    let improvement = Arc::new(ContinuousImprovementLoop::new(
        discovery,
        Arc::new(DependencyPlanner),
        Arc::new(TaskExecutor::new(Arc::new(build_adapter(config)))),
        Arc::clone(&state),
    ));

    let mut loop_handle = {
        let improvement = Arc::clone(&improvement);
        tokio::spawn(async move { improvement.start().await })
    };

    let mut breached = None;
    let finished = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        Some(breach) = breach_rx.recv() => {
            error!(limit = %breach.limit, "{}; stopping", breach.message);
            breached = Some(breach);
            None
        }
        joined = &mut loop_handle => Some(joined),
    };
    improvement.stop();

    let joined = match finished {
        Some(joined) => joined,
        None => loop_handle.await,
    };
    let loop_result = joined
        .unwrap_or_else(|err| Err(AppError::Io(format!("improvement loop task failed: {err}"))));

    monitor.stop();
    let usage = monitor.current_usage();
    if let Err(err) = state.record_peak_memory(usage.peak_memory_mb) {
        warn!(%err, "failed to record peak memory");
    }
    state.stop_auto_save();
    if let Err(err) = state.save_state() {
        error!(%err, "failed to persist final state");
    }

    loop_result?;
    match breached {
        Some(breach) => Err(AppError::from(&breach)),
        None => Ok(()),
    }
}

fn restore_or_initialize(
    state: &AgentStateManager,
    config: &GlobalConfig,
    session_id: &str,
) -> Result<AgentState> {
    if state.load_state()?.is_none() {
        return state.initialize(session_id, config.agent_config());
    }
    let recovered = state.recover_interrupted()?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "recovered interrupted tasks");
    }
    state.update_state(StateUpdate {
        config: Some(config.agent_config()),
        ..Default::default()
    })
}

fn build_adapter(config: &GlobalConfig) -> WorkflowAdapter {
    let policy = DenyListPolicy::new(config.denied_workflows.iter().cloned());
    let mut adapter = WorkflowAdapter::new(Arc::new(policy));
    for name in &config.workflows {
        adapter.register(
            name.clone(),
            Arc::new(HostCliWorkflow::new(name.clone(), config.host.clone())),
        );
    }
    info!(workflows = ?adapter.names(), "workflows registered");
    adapter
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
