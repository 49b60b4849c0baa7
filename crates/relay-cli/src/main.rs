//! `task-relay serve` — wires the Storage Kernel, Job Manager, Worker
//! Pool, Answer Runner, HTTP Bridge, and MCP surface into one running
//! process (spec.md §6).
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relay_bridge::{AppState, BridgeRuntimeConfig};
use relay_bus::EventBus;
use relay_config::{CliOverrides, Profile, RelayConfig, StorageBackend, Transport};
use relay_executor::{ExecutorBackend, SubprocessBackend, WorkerPool, WorkerPoolConfig};
use relay_manager::JobManager;
use relay_mcp::RelayMcpServer;
use relay_runner::{AnswerRunner, AnswerRunnerConfig, HttpLlmClient, RoleStore};
use relay_storage::{memory::MemoryStore, sqlite::SqliteStore, store::Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used for configuration and startup failures (spec.md §6).
const EXIT_STARTUP_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "task-relay", version, about = "Task-relay scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler: Worker Pool, Answer Runner, HTTP Bridge, and MCP surface.
    Serve {
        /// `--profile {dev|staging|prod}`.
        #[arg(long, value_enum)]
        profile: Option<ProfileArg>,

        /// Directory searched for a `config.toml` overlay.
        #[arg(long)]
        config_dir: Option<PathBuf>,

        /// `--storage {memory|sqlite}`.
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,

        /// Path to the sqlite file; required when `--storage sqlite`.
        #[arg(long)]
        sqlite: Option<PathBuf>,

        /// MCP control-surface transport.
        #[arg(long, value_enum)]
        transport: Option<TransportArg>,

        /// Enable debug logging.
        #[arg(long)]
        debug: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProfileArg {
    Dev,
    Staging,
    Prod,
}

impl From<ProfileArg> for Profile {
    fn from(value: ProfileArg) -> Self {
        match value {
            ProfileArg::Dev => Profile::Dev,
            ProfileArg::Staging => Profile::Staging,
            ProfileArg::Prod => Profile::Prod,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StorageArg {
    Memory,
    Sqlite,
}

impl From<StorageArg> for StorageBackend {
    fn from(value: StorageArg) -> Self {
        match value {
            StorageArg::Memory => StorageBackend::Memory,
            StorageArg::Sqlite => StorageBackend::Sqlite,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransportArg {
    Stdio,
}

impl From<TransportArg> for Transport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => Transport::Stdio,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let Commands::Serve {
        profile,
        config_dir,
        storage,
        sqlite,
        transport,
        debug,
    } = cli.command;

    let filter = if debug {
        EnvFilter::new("task_relay=debug,relay=debug")
    } else {
        EnvFilter::new("task_relay=info,relay=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let overrides = CliOverrides {
        profile: profile.map(Into::into),
        config_dir,
        storage: storage.map(Into::into),
        sqlite_path: sqlite,
        transport: transport.map(Into::into),
    };

    let (config, warnings) = match RelayConfig::load(&overrides) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    };
    for warning in &warnings {
        warn!("{warning}");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(serve(config))
}

async fn serve(config: RelayConfig) -> Result<()> {
    let store: Arc<dyn Store> = match config.storage {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .context("--storage sqlite requires --sqlite <path>")?;
            Arc::new(SqliteStore::open(path).with_context(|| {
                format!("open sqlite store at {}", path.display())
            })?)
        }
    };

    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(JobManager::new(store, bus));

    let backend: Arc<dyn ExecutorBackend> = match &config.executor_cmd {
        Some(cmd) => Arc::new(SubprocessBackend::new(cmd.clone())),
        None => Arc::new(SubprocessBackend::new("true")),
    };
    let worker_pool = Arc::new(WorkerPool::new(
        Arc::clone(&manager),
        backend,
        WorkerPoolConfig {
            max_concurrency: config.worker.max_concurrency,
            lease_ttl_ms: config.worker.lease_ttl_ms,
            heartbeat_interval_ms: config.worker.heartbeat_interval_ms,
            poll_interval_ms: config.worker.poll_interval_ms,
            default_job_timeout_ms: config.worker.default_job_timeout_ms,
            artifact_root: config.artifact_root.clone(),
        },
    ));
    let worker_handles = worker_pool.spawn();

    let runner_handle = if config.runner.enabled {
        let roles = RoleStore::new(config.runner.roles_dir.clone());
        let api_key = std::env::var(&config.runner.llm_api_key_env).ok();
        let llm = Arc::new(HttpLlmClient::new(config.runner.llm_base_url.clone(), api_key));
        let runner = Arc::new(AnswerRunner::new(
            Arc::clone(&manager),
            roles,
            llm,
            AnswerRunnerConfig {
                policy_version: "v1".to_string(),
                default_timeout_ms: config.runner.default_timeout_s * 1_000,
                default_model: config.runner.llm_model.clone(),
            },
        ));
        Some(runner.spawn())
    } else {
        info!("answer runner disabled by configuration");
        None
    };

    let bridge_state = AppState::new(
        Arc::clone(&manager),
        BridgeRuntimeConfig {
            long_poll_timeout_ms: config.bridge.long_poll_timeout_ms,
            sse_heartbeat_ms: config.bridge.sse_heartbeat_ms,
        },
    );
    let dispatcher_handle = bridge_state.spawn_dispatcher();
    let app = relay_bridge::build_app(Arc::clone(&bridge_state));

    let bind = format!("127.0.0.1:{}", config.bridge.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "task-relay HTTP bridge listening");

    let mcp_server = RelayMcpServer::new(Arc::clone(&manager));
    let mcp_handle = tokio::spawn(async move {
        if let Err(err) = mcp_server.serve_stdio().await {
            warn!("mcp server exited: {err:#}");
        }
    });

    let shutdown_signal = {
        let bridge_state = Arc::clone(&bridge_state);
        async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining in-flight work");
            bridge_state.begin_shutdown();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("http bridge serve loop")?;

    dispatcher_handle.abort();
    mcp_handle.abort();
    for handle in worker_handles {
        handle.abort();
    }
    if let Some(runner_handle) = runner_handle {
        runner_handle.abort();
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        stream.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
