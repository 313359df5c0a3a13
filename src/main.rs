use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thermalcast::config::Config;
use thermalcast::email::BrevoClient;
use thermalcast::forecast::{MeteoblueClient, OpenMeteoClient};
use thermalcast::interpret::GeminiClient;
use thermalcast::jobs::JobRunner;
use thermalcast::pipeline::ReportPipeline;
use thermalcast::rate_limit::{RateLimitConfig, SlidingWindow};
use thermalcast::storage::SqliteStorage;
use thermalcast::{api, metrics};

/// How long shutdown waits for in-flight background jobs.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "thermalcast")]
#[command(about = "Credit-metered AI flight-condition report service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        /// Path to SQLite database (default: data dir)
        #[arg(long)]
        database: Option<String>,
    },
    /// Manage accounts
    Accounts {
        #[command(subcommand)]
        action: AccountActions,
    },
}

#[derive(Subcommand)]
enum AccountActions {
    /// Create an account with the starting credit balance
    Create {
        /// Account email address
        email: String,
    },
    /// Show an account with its balance and recent ledger entries
    Show {
        /// Account ID
        id: String,
    },
    /// Add purchased credits to an account
    Credit {
        /// Account ID
        id: String,
        /// Credits to add
        amount: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "thermalcast=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();

    match cli.command {
        Commands::Serve {
            port,
            host,
            database,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(database) = database {
                config.storage.database_path = Some(database.into());
            }
            serve(config).await
        }
        Commands::Accounts { action } => {
            let storage = open_storage(&config)?;
            match action {
                AccountActions::Create { email } => {
                    let account = storage.create_account(&email).await?;
                    println!("Created account {} ({})", account.id, account.email);
                    println!("Starting credits: {}", account.credits);
                }
                AccountActions::Show { id } => {
                    let account = storage
                        .get_account(&id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("account '{}' not found", id))?;
                    println!("Account:  {} ({})", account.id, account.email);
                    println!("Credits:  {}", account.credits);
                    println!(
                        "Settings: language={} style={} units={}",
                        account.language, account.style, account.units
                    );
                    println!();
                    println!("Recent transactions:");
                    for entry in storage.list_transactions(&id).await?.iter().take(10) {
                        println!(
                            "  {}  {:+}  {}  {}",
                            entry.created_at.format("%Y-%m-%d %H:%M"),
                            entry.amount,
                            entry.kind,
                            entry.description
                        );
                    }
                }
                AccountActions::Credit { id, amount } => {
                    let balance = storage
                        .purchase_credits(&id, amount, &format!("Purchased {} credits", amount))
                        .await?;
                    println!("New balance: {}", balance);
                }
            }
            Ok(())
        }
    }
}

fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = config.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&path)?)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    metrics::init_metrics();

    // Missing upstream credentials are fatal here, not at first request.
    let gemini_key = config.require_gemini_key()?.to_string();
    let meteoblue_key = config.require_meteoblue_key()?.to_string();
    let brevo_key = config.require_brevo_key()?.to_string();

    let storage = open_storage(&config)?;
    let jobs = JobRunner::new();

    let forecast = Arc::new(OpenMeteoClient::new(Duration::from_secs(
        config.upstream.forecast_timeout_seconds,
    ))?);
    let meteograms = Arc::new(MeteoblueClient::new(
        &meteoblue_key,
        Duration::from_secs(config.upstream.image_timeout_seconds),
    )?);
    let interpreter = Arc::new(GeminiClient::new(
        &gemini_key,
        &config.upstream.gemini_model,
        Duration::from_secs(config.upstream.generate_timeout_seconds),
    )?);
    let mailer = Arc::new(BrevoClient::new(
        &brevo_key,
        &config.upstream.sender_email,
        &config.upstream.sender_name,
        Duration::from_secs(config.upstream.image_timeout_seconds),
    )?);

    let pipeline = ReportPipeline::new(
        storage.clone(),
        Arc::new(SlidingWindow::new(RateLimitConfig::emails())),
        jobs.clone(),
        forecast,
        interpreter,
        mailer,
        meteograms,
    );

    let app = api::create_router(api::AppState {
        pipeline,
        storage,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("thermalcast server running on http://{}", addr);
    println!();
    println!("API endpoints:");
    println!("  GET    /api/health");
    println!("  POST   /api/interpret");
    println!("  POST   /api/interpret-route");
    println!("  POST   /api/interpret-and-email");
    println!("  POST   /api/credits");
    println!("  POST   /api/accounts");
    println!("  GET    /api/accounts/:id");
    println!("  POST   /api/accounts/:id/settings");
    println!("  GET    /api/accounts/:id/transactions");
    println!("  GET    /api/accounts/:id/reports");
    println!("  DELETE /api/reports/:id");
    println!("  GET    /metrics");
    println!();
    println!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let queued report emails finish before exiting.
    jobs.begin_drain();
    if !jobs.drain(DRAIN_TIMEOUT).await {
        eprintln!("Shutdown: some background jobs did not finish in time");
    }

    println!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down gracefully...");
}
