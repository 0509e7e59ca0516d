//! Botfleet: research job orchestrator server.

use std::path::PathBuf;
use std::sync::Arc;

use botfleet_core::{FleetConfig, ResearchMode, SystemClock};
use botfleet_runtime::{create_provider, Orchestrator, Scheduler};
use botfleet_store::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;
mod state;

use state::AppState;

fn resolve_data_dir() -> PathBuf {
    std::env::var("BOTFLEET_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

/// Load and validate configuration, then print the effective settings.
fn check_config(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = FleetConfig::from_env(&data_dir)?;
    let orch = &config.orchestrator;
    println!("Configuration OK");
    println!();
    println!("  data dir          {}", config.data_paths.root.display());
    println!("  config file       {}", orch.config_path.display());
    println!("  port              {}", config.port);
    println!("  daily budget      ${:.2}", orch.daily_budget_usd);
    println!("  max concurrent    {}", orch.max_concurrent);
    println!("  tick interval     {}s", orch.tick_interval_secs);
    for mode in ResearchMode::ALL {
        println!(
            "  {:<17} every {} min, ~${:.2}/job",
            mode.as_str(),
            orch.interval(mode).num_minutes(),
            orch.estimated_cost(mode.cost_class())
        );
    }
    println!(
        "  provider          {}",
        orch.provider_url.as_deref().unwrap_or("dry-run")
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    // Handle CLI subcommands
    if args.len() > 1 {
        match args[1].as_str() {
            "--check-config" | "check-config" => {
                let data_dir = if args.len() > 2 {
                    PathBuf::from(&args[2])
                } else {
                    resolve_data_dir()
                };
                if let Err(e) = check_config(data_dir) {
                    eprintln!("Configuration error: {}", e);
                    std::process::exit(1);
                }
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("Botfleet: research job orchestrator");
                println!();
                println!("Usage: botfleet [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  check-config [data-dir]  Validate configuration and print it");
                println!("  help                     Show this help message");
                println!();
                println!("Environment:");
                println!("  BOTFLEET_DATA_DIR        Data directory (default: data)");
                println!("  PORT                     HTTP port (default: 3010)");
                println!("  RUST_LOG                 Log filter (default: info)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'botfleet help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    // Normal server startup
    let data_dir = resolve_data_dir();

    info!("Data directory: {}", data_dir.display());

    let config = FleetConfig::from_env(&data_dir)?;
    let port = config.port;

    let store = SqliteStore::open(&config.data_paths.db_dir)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;

    // Restore state and recover jobs interrupted by the last shutdown
    let orchestrator = Arc::new(Orchestrator::load(
        config.orchestrator.clone(),
        Arc::new(store),
        Arc::new(SystemClock),
    )?);

    let provider = create_provider(&config.orchestrator);
    let scheduler = Scheduler::start(orchestrator.clone(), provider);

    let state = Arc::new(AppState::new(config, orchestrator));
    let app = routes::build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Botfleet server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    info!("Botfleet server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
