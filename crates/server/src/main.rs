//! Trading Organism: self-improving strategy search with a serving API
//!
//! Usage:
//!   trading-organism serve --port 8000     Launch the serving API
//!   trading-organism worker                Run the evolve/promote loop
//!   trading-organism evolve --dry-run      Run one cycle against in-memory stores

mod routes;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use engine::{
    run_worker, Collaborators, HttpReloadSignal, InMemoryStores, LogOnlyReload, Notifier,
    PromotionOrchestrator, RandomWalkSource, SqliteStores, WebhookNotifier, WorkerConfig,
};
use persistence::Database;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::routes::AppState;

#[derive(Parser)]
#[command(name = "trading-organism")]
#[command(about = "Evolves, scores and promotes trading strategy configurations", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the serving API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on (defaults to API_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the background evolution worker
    Worker {
        /// Stop after this many cycles instead of running forever
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Run a single evolve/score/promote cycle and print the report
    Evolve {
        /// Use in-memory stores and skip webhook/reload side effects
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,trading_organism=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,trading_organism=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;

    match cli.command {
        Commands::Serve { host, port } => {
            let port = port.unwrap_or(config.api_port);
            cmd_serve(&config, &host, port).await?;
        }
        Commands::Worker { cycles } => {
            cmd_worker(&config, cycles).await?;
        }
        Commands::Evolve { dry_run } => {
            cmd_evolve(&config, dry_run).await?;
        }
    }

    Ok(())
}

async fn open_database(config: &WorkerConfig) -> anyhow::Result<Database> {
    let db = Database::new(&config.db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", config.db_path.display());
    Ok(db)
}

fn sqlite_collaborators(db: &Database, config: &WorkerConfig) -> Collaborators {
    let stores = Arc::new(SqliteStores::new(db.pool_clone()));
    Collaborators {
        config: stores.clone(),
        models: stores.clone(),
        journal: stores,
        notifier: Arc::new(WebhookNotifier::new(config.webhook_url.clone())),
        reload: Arc::new(HttpReloadSignal::new(
            &config.api_base_url,
            &config.api_reload_endpoint,
        )),
    }
}

// ============================================================================
// Serve command
// ============================================================================

async fn cmd_serve(config: &WorkerConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("Trading Organism v{} starting...", env!("CARGO_PKG_VERSION"));

    let db = open_database(config).await?;
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config.webhook_url.clone()));
    let state = AppState::new(db, notifier);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Trading Organism v{} ===", env!("CARGO_PKG_VERSION"));
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /                 - Liveness, serving version and config");
    println!("  GET  /health           - Health check");
    println!("  GET  /metrics          - Metrics of the best model");
    println!("  POST /reload?version=  - Switch the serving version");
    println!("  POST /config           - Validate and store a strategy config");
    println!("  GET  /best_model       - Best promoted model");
    println!("  GET  /versions         - Recent model versions");
    println!("  GET  /evolution        - Recent evolution journal");
    println!("\n  Database: {}", config.db_path.display());
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Worker command
// ============================================================================

async fn cmd_worker(config: &WorkerConfig, cycles: Option<u64>) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let orchestrator = PromotionOrchestrator::new(
        sqlite_collaborators(&db, config),
        Arc::new(RandomWalkSource::default()),
        config.orchestrator_settings(),
    );

    info!(
        population = config.population,
        generations = config.generations,
        promote_delta = config.promote_delta,
        "Starting evolution worker"
    );

    let final_state = run_worker(&orchestrator, config.backoff_policy(), cycles).await;
    info!(state = ?final_state, "Worker finished");

    Ok(())
}

// ============================================================================
// Evolve command
// ============================================================================

async fn cmd_evolve(config: &WorkerConfig, dry_run: bool) -> anyhow::Result<()> {
    let collaborators = if dry_run {
        let stores = Arc::new(InMemoryStores::new());
        Collaborators {
            config: stores.clone(),
            models: stores.clone(),
            journal: stores,
            notifier: Arc::new(WebhookNotifier::disabled()),
            reload: Arc::new(LogOnlyReload),
        }
    } else {
        let db = open_database(config).await?;
        sqlite_collaborators(&db, config)
    };

    let orchestrator = PromotionOrchestrator::new(
        collaborators,
        Arc::new(RandomWalkSource::default()),
        config.orchestrator_settings(),
    );

    let report = orchestrator
        .run_cycle(0)
        .await
        .map_err(|e| anyhow::anyhow!("Evolution cycle failed: {}", e))?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
