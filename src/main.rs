use clap::Parser;
use sqlx::migrate::Migrator;
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_core::cli::{self, Cli, Commands, DbCommands};
use tally_core::config::Config;
use tally_core::services::card_ledger::CardLedger;
use tally_core::services::events::{self, EventBus};
use tally_core::services::queue::{self, JobQueue};
use tally_core::services::query::TransactionQueryService;
use tally_core::services::reconciliation::ReconciliationService;
use tally_core::services::scheduler;
use tally_core::{AppState, create_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Cleanup => cli::handle_cleanup(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = tally_core::db::create_pool(&config).await?;

    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    tracing::info!("Database migrations completed");

    let report = tally_core::startup::validate_environment(&config, &pool).await?;
    report.print();
    if !report.is_valid() {
        anyhow::bail!("Startup validation failed");
    }

    // Post-commit side effects: cardholder notification and analytics.
    let events = EventBus::new(256);
    tokio::spawn(events::run_listeners(pool.clone(), events.subscribe()));

    let ledger = CardLedger::new(config.default_credit_limit.clone());
    let service = ReconciliationService::new(pool.clone(), ledger, events.clone());

    let queue = JobQueue::new(pool.clone());
    for _ in 0..config.worker_count {
        tokio::spawn(queue::run_worker(queue.clone(), service.clone()));
    }
    tracing::info!(workers = config.worker_count, "transaction job workers started");

    scheduler::install_cleanup_schedule(&pool).await?;
    tokio::spawn(scheduler::run_scheduler(pool.clone(), service.clone()));

    let state = AppState {
        db: pool.clone(),
        queries: TransactionQueryService::new(pool),
    };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
