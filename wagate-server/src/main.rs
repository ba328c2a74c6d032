use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use wagate_core::config::LogFormat;
use wagate_core::{HttpBridgeClient, TenantStore, WagateConfig, WagateError};

use wagate_server::{server, subsystems, tls};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "wagate.toml")]
    config: String,

    /// Overrides `server.port`
    #[arg(long)]
    port: Option<u16>,

    /// Overrides `server.admin_token`
    #[arg(long)]
    admin_token: Option<String>,

    /// Log output: console or json
    #[arg(long = "log-type")]
    log_type: Option<LogFormat>,

    /// Colored console output
    #[arg(long)]
    color: Option<bool>,

    #[arg(long)]
    health: bool,
}

fn init_logging(format: LogFormat, color: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    match format {
        LogFormat::Console => fmt().with_env_filter(filter).with_ansi(color).init(),
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let mut config = match WagateConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(token) = args.admin_token.filter(|t| !t.is_empty()) {
        config.server.admin_token = Some(token);
    }
    if let Some(format) = args.log_type {
        config.logging.format = format;
    }
    if let Some(color) = args.color {
        config.logging.color = color;
    }

    init_logging(config.logging.format, config.logging.color);
    tls::install_crypto_provider();

    let store = match wagate_core::db::open_store(&config.database).await {
        Ok(s) => Arc::new(s),
        Err(WagateError::Database(e)) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to prepare tenant schema: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.ping().await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        match store.list().await {
            Ok(tenants) => println!(
                "✅ tenants table readable: {} tenants, {} flagged connected",
                tenants.len(),
                tenants.iter().filter(|t| t.connected).count()
            ),
            Err(e) => {
                println!("❌ tenants table check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Wagate health check passed");
        return Ok(());
    }

    let client = Arc::new(HttpBridgeClient::new(&config.bridge)?);
    let supervisor = server::build_supervisor(store, client, &config);

    // Sessions must be back before the listener accepts requests.
    if let Err(e) = supervisor.startup_reconciliation().await {
        tracing::error!("Startup reconciliation failed: {}", e);
        std::process::exit(1);
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn metadata cache sweeper
    tokio::spawn(subsystems::cache::run_sweep_loop(
        Arc::clone(supervisor.directory().cache()),
        tx.subscribe(),
    ));

    let rustls = tls::load_tls(&config.tls).await;
    server::run_http_servers(supervisor, &config, rustls, tx).await?;

    tracing::info!("Wagate stopped");
    Ok(())
}
