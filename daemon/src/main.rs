use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jagc_channels::{TelegramGateway, TelegramGatewayConfig, TelegramTaskRunNotifier, TelegramTopicBridge};
use jagc_core::{
    AgentSessionExecutor, Config, EchoExecutor, PiSessionFactory, ProgressBus, RunExecutor,
    RunService, RunnerKind,
};
use jagc_store::Store;
use jagc_tasks::{NoTopicBridge, NoopTaskRunNotifier, TaskEngine, TaskEngineConfig};
use jagc_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "jagc")]
#[command(about = "Single-user local agent runtime daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon: HTTP surface, task engine, and (when configured)
    /// the Telegram gateway.
    Serve,
    /// Print the configuration change that authorizes a Telegram user.
    AllowUser { user_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(config.tracing_filter())
        .with_target(false)
        .init();

    match cli.command {
        Command::Serve => serve_daemon(config).await,
        Command::AllowUser { user_id } => {
            let stripped = jagc_core::strip_leading_zeroes(user_id.trim());
            let mut ids = config.telegram_allowed_user_ids.clone();
            if !ids.iter().any(|id| id == &stripped) {
                ids.push(stripped);
            }
            println!("Add this to the daemon's environment and restart it:");
            println!("export TELEGRAM_ALLOWED_USER_IDS={}", ids.join(","));
            Ok(())
        }
    }
}

async fn serve_daemon(config: Config) -> anyhow::Result<()> {
    config.ensure_workspace()?;
    info!(
        workspace = %config.workspace_dir.display(),
        database = %config.database_path.display(),
        "starting jagc"
    );

    let store = Store::open(&config.database_path)
        .await
        .context("failed to open the run store")?;

    let progress = ProgressBus::new();
    let executor: Arc<dyn RunExecutor> = match config.runner {
        RunnerKind::Echo => {
            info!("runner: echo (diagnostic mode)");
            Arc::new(EchoExecutor::new(progress.clone()))
        }
        RunnerKind::Pi => {
            info!("runner: pi agent sessions");
            let factory = Arc::new(PiSessionFactory::new(config.sessions_dir()));
            Arc::new(AgentSessionExecutor::new(
                store.clone(),
                factory,
                progress.clone(),
            ))
        }
    };

    let runs = RunService::new(store.clone(), executor, progress);
    let recovered = runs.init().await?;
    if recovered > 0 {
        info!(recovered, "crash recovery complete");
    }

    let shutdown = CancellationToken::new();

    // TTL sweep for pending input images that never got claimed.
    {
        let store = store.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        match store.purge_expired_input_images(chrono::Utc::now()).await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "expired input images purged"),
                            Err(err) => warn!(%err, "image TTL sweep failed"),
                        }
                    }
                }
            }
        });
    }

    // Telegram gateway, when a bot token is configured.
    let gateway = match &config.telegram_bot_token {
        Some(token) => {
            let gw_config = TelegramGatewayConfig::new(
                token.clone(),
                config.telegram_allowed_user_ids.clone(),
            );
            let gateway = TelegramGateway::new(gw_config, runs.clone(), store.clone())?;
            gateway.start();
            Some(gateway)
        }
        None => {
            info!("TELEGRAM_BOT_TOKEN not set; telegram gateway disabled");
            None
        }
    };

    let engine = match &gateway {
        Some(gateway) => TaskEngine::new(
            store.clone(),
            runs.clone(),
            TelegramTopicBridge::new(gateway.api()),
            TelegramTaskRunNotifier::new(gateway.follower()),
            TaskEngineConfig::default(),
        ),
        None => TaskEngine::new(
            store.clone(),
            runs.clone(),
            Arc::new(NoTopicBridge),
            Arc::new(NoopTaskRunNotifier),
            TaskEngineConfig::default(),
        ),
    };
    engine.start().await;

    let state = AppState {
        runs: runs.clone(),
        store: store.clone(),
        tasks: Some(engine.clone()),
    };
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid HOST/PORT {}:{}", config.host, config.port))?;
    let server = tokio::spawn(serve(addr, state, shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Stop the producers first, then the HTTP surface, then drain the run
    // service; the store closes when the last handle drops.
    engine.stop().await;
    if let Some(gateway) = &gateway {
        gateway.stop();
    }
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "http server exited with error"),
        Err(err) => warn!(%err, "http server task join failed"),
    }
    runs.shutdown().await;
    info!("bye");
    Ok(())
}

/// Resolve on the first SIGINT or SIGTERM; later signals are ignored so a
/// second Ctrl-C cannot re-enter the shutdown path.
async fn wait_for_shutdown_signal() {
    static FIRED: AtomicBool = AtomicBool::new(false);

    let ctrl_c = async {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                // Signal infrastructure unavailable; park forever rather
                // than spinning.
                std::future::pending::<()>().await;
            }
            if !FIRED.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => loop {
                stream.recv().await;
                if !FIRED.swap(true, Ordering::SeqCst) {
                    return;
                }
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
