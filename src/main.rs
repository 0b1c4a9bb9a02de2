use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use edge_dispatch::adapters::crash_sink::report_error;
use edge_dispatch::adapters::{
    CacheInvalidator, CoinbaseWallet, CrashSink, EdgeClient, HttpCacheInvalidator,
    LoggingCrashSink, NullCacheInvalidator, PostgresStore, RollbarSink, UnconfiguredWallet,
    WalletClient,
};
use edge_dispatch::cli::{Cli, Commands};
use edge_dispatch::orchestrator::{invitations, push, tasks, OrchestratorContext};
use edge_dispatch::{AppConfig, DispatchError, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(errors) = config.validate() {
        for err in &errors {
            error!("configuration error: {err}");
        }
        std::process::exit(1);
    }

    let mut ctx = match build_context(config).await {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(error = %err, "failed to initialize orchestrator context");
            std::process::exit(1);
        }
    };

    if let Err(err) = run_command(&mut ctx, cli.command).await {
        error!(error = %err, "command failed");
        report_error(ctx.crash_sink.as_ref(), &err).await;
        std::process::exit(1);
    }
}

async fn run_command(ctx: &mut OrchestratorContext, command: Commands) -> Result<()> {
    match command {
        Commands::ProcessTasks => {
            let processed = tasks::process_pending_tasks(ctx).await?;
            info!(processed, "process-tasks pass complete");
        }
        Commands::SendInvitations => run_send_invitations(ctx).await?,
        Commands::PushRelations { informed } => {
            if informed {
                ctx.config.use_informed = true;
            }
            run_send_invitations(ctx).await?;
            run_push_relations(ctx).await?;
        }
    }
    Ok(())
}

async fn run_send_invitations(ctx: &OrchestratorContext) -> Result<()> {
    for anticheat_policy in [false, true] {
        let invited = invitations::send_invitations(ctx, anticheat_policy).await?;
        info!(anticheat_policy, invited, "send-invitations pass complete");
    }
    Ok(())
}

async fn run_push_relations(ctx: &OrchestratorContext) -> Result<()> {
    for anticheat_policy in [false, true] {
        let pushed = push::push_relations(ctx, anticheat_policy).await?;
        info!(anticheat_policy, pushed, "push-relations pass complete");
    }
    Ok(())
}

async fn build_context(config: AppConfig) -> Result<OrchestratorContext> {
    let cache: Arc<dyn CacheInvalidator> = match std::env::var("CACHE_PURGE_URL") {
        Ok(url) => Arc::new(HttpCacheInvalidator::new(url)),
        Err(_) => Arc::new(NullCacheInvalidator),
    };

    let store = PostgresStore::connect(&config.database.url, config.database.max_connections, cache).await?;
    store.ensure_schema().await?;

    let edge = EdgeClient::from_config(&config.edge)?;

    let wallet: Arc<dyn WalletClient> = if config.payment_method == "bitcoin" {
        let api_key = config
            .coinbase
            .api_key
            .clone()
            .ok_or_else(|| DispatchError::Wallet("COINBASE_API_KEY not set".to_string()))?;
        let api_secret = config
            .coinbase
            .api_secret
            .clone()
            .ok_or_else(|| DispatchError::Wallet("COINBASE_API_SECRET not set".to_string()))?;
        let base_url = std::env::var("COINBASE_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.coinbase.com".to_string());
        Arc::new(CoinbaseWallet::new(base_url, api_key, api_secret))
    } else {
        Arc::new(UnconfiguredWallet)
    };

    let crash_sink: Arc<dyn CrashSink> = match &config.rollbar.token {
        Some(token) => {
            let environment = config.rollbar.environment.clone().unwrap_or_else(|| "production".to_string());
            Arc::new(RollbarSink::new(token.clone(), environment))
        }
        None => Arc::new(LoggingCrashSink),
    };

    Ok(OrchestratorContext {
        store: Arc::new(store),
        edge,
        wallet,
        crash_sink,
        config,
    })
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.logging.level)));

    if config.logging.json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}
