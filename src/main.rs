//! keepgate — execution gateway between an AI agent and a privileged
//! downstream service.
//!
//! Quick start:
//!   keepgate serve --config config.yaml --permissions permissions.yaml
//!   keepgate check --config config.yaml --permissions permissions.yaml

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use keepgate::approval::telegram::TelegramMessenger;
use keepgate::approval::{ApprovalCoordinator, Messenger};
use keepgate::config::Config;
use keepgate::executor::homeassistant::HomeAssistantService;
use keepgate::executor::{Dispatcher, ServiceHandler};
use keepgate::gateway::GatewayServer;
use keepgate::policy::{parser::load_policy, PolicyEngine};
use keepgate::store::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "keepgate",
    version,
    about = "Execution gateway for AI agents talking to a privileged service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        #[arg(long, env = "KEEPGATE_CONFIG")]
        config: PathBuf,
        #[arg(long, env = "KEEPGATE_PERMISSIONS")]
        permissions: PathBuf,
        #[arg(long, env = "KEEPGATE_BIND")]
        bind: Option<std::net::SocketAddr>,
    },
    /// Validate a config and permissions file without starting the server.
    Check {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        permissions: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keepgate=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            permissions,
            bind,
        } => run_serve(config, permissions, bind).await,
        Commands::Check { config, permissions } => run_check(config, permissions),
    }
}

async fn run_serve(
    config_path: PathBuf,
    permissions_path: PathBuf,
    bind: Option<std::net::SocketAddr>,
) -> Result<()> {
    let config = Config::load(&config_path)?;
    let policy = load_policy(&permissions_path)?;
    let engine = PolicyEngine::new(&policy).context("compiling permissions")?;

    let store = Arc::new(Store::open(std::path::Path::new(&config.storage.path))?);
    let stale = store.cleanup_stale_requests()?;
    if !stale.is_empty() {
        tracing::info!(count = stale.len(), "swept stale pending requests on startup");
    }

    let mut services: HashMap<String, Arc<dyn ServiceHandler>> = HashMap::new();
    services.insert(
        "homeassistant".to_string(),
        Arc::new(HomeAssistantService::new(
            config.services.homeassistant.url.clone(),
            config.services.homeassistant.token.clone(),
        )),
    );
    let dispatcher = Dispatcher::new(services);
    for (name, healthy) in dispatcher.health_check_all().await {
        if !healthy {
            tracing::warn!(service = name, "service health check failed at startup");
        }
    }

    let telegram = config
        .messenger
        .telegram
        .as_ref()
        .context("messenger.telegram is required")?;
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(
        &telegram.token,
        telegram.chat_id,
        telegram.allowed_users.clone(),
        telegram.audit_ignored_presses,
        store.clone(),
    ));

    let coordinator = Arc::new(ApprovalCoordinator::new(
        store.clone(),
        std::time::Duration::from_secs(config.approval_timeout),
        config.rate_limit.max_pending_approvals,
    ));

    messenger.start(coordinator.clone()).await?;

    let tls_acceptor = match &config.gateway.tls {
        Some(tls) => {
            tracing::info!("TLS enabled for gateway listener");
            Some(keepgate::tls::acceptor_from_files(&tls.cert, &tls.key)?)
        }
        None => {
            if !config.gateway.insecure {
                bail!("gateway.tls is required unless gateway.insecure is set");
            }
            tracing::warn!("running with gateway.insecure: connections are not TLS-wrapped");
            None
        }
    };

    let bind_addr = bind.unwrap_or_else(|| {
        format!("{}:{}", config.gateway.host, config.gateway.port)
            .parse()
            .expect("gateway.host/port must form a valid socket address")
    });
    let server = GatewayServer::new(
        bind_addr,
        tls_acceptor,
        engine,
        store.clone(),
        coordinator.clone(),
        dispatcher,
        messenger.clone(),
        config.agent.token.clone(),
        config.rate_limit.max_requests_per_minute,
        std::time::Duration::from_secs(60),
    );

    let listener = server.bind().await?;
    tokio::select! {
        result = server.serve(listener) => result?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    coordinator.resolve_all_pending().await;
    messenger.stop().await?;

    Ok(())
}

/// Resolves on either `SIGINT` or `SIGTERM` so the gateway drains pending
/// approvals and stops the messenger the same way under a shell `Ctrl-C`
/// or an orchestrator-issued termination.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run_check(config_path: PathBuf, permissions_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)?;
    let policy = load_policy(&permissions_path)?;
    let _engine = PolicyEngine::new(&policy).context("compiling permissions")?;

    println!("{}", "config and permissions look valid".green());
    println!(
        "  rules: {}, defaults: {}",
        policy.rules.len(),
        policy.defaults.len()
    );
    println!("  services configured: homeassistant ({})", config.services.homeassistant.url);

    let catches_everything = policy
        .defaults
        .iter()
        .any(|r| r.pattern == "*" && r.action == keepgate::policy::RuleAction::Ask);
    if !catches_everything {
        println!(
            "{}",
            "  warning: no default '*' -> ask rule — unmatched requests will implicitly ask anyway, but an explicit default documents intent".yellow()
        );
    }

    Ok(())
}
