//! tabrelay: bridges OpenAI chat clients to chat pages driven by browser-tab workers.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tabrelay_core::DataPaths;
use tabrelay_dispatch::spawn_heartbeat;
use tabrelay_server::{build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("TABRELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--help" | "-h" | "help" => {
                println!("tabrelay: OpenAI-compatible bridge to browser-tab workers");
                println!();
                println!("Usage: tabrelay");
                println!();
                println!("Environment:");
                println!("  TABRELAY_DATA_DIR   Directory holding config.jsonc and models.json (default: data)");
                println!("  PORT                Overrides the configured port");
                println!("  RUST_LOG            Log filter (default: info)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown argument: {}. Use 'tabrelay help' for usage.", arg);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());
    let paths = DataPaths::new(&data_dir)?;

    let state = Arc::new(AppState::new(paths));
    let config = state.config();

    // Liveness probing and requeueing run for the life of the process.
    let _heartbeat = spawn_heartbeat(state.dispatcher.clone(), config.heartbeat_interval());

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tabrelay {} listening on {}", config.version, addr);

    axum::serve(listener, app).await?;

    Ok(())
}
