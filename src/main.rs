mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use tidepool::http_server::{create_router, AppState};
use tidepool::{Store, StoreConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidepool=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let password = cli
        .password
        .clone()
        .or_else(|| std::env::var("TIDEPOOL_PASSWORD").ok());

    println!("🌊 Starting tidepool");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📁 Data directory: {:?}", cli.data_dir);
    println!("🌐 Port: {}", cli.port);
    println!("🧹 Sweep interval: {:?}", cli.sweep_interval);
    println!("💾 Checkpoint interval: {:?}", cli.checkpoint_interval);
    println!(
        "🔑 Password: {}",
        if password.is_some() { "required" } else { "none" }
    );
    println!();

    let store = match Store::open(StoreConfig {
        data_dir: cli.data_dir.clone(),
        sweep_interval: cli.sweep_interval,
        checkpoint_interval: cli.checkpoint_interval,
        password,
    }) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("❌ Failed to open store: {}", e);
            std::process::exit(1);
        }
    };
    println!("✓ Store opened");

    let app = create_router(AppState::new(Arc::clone(&store)));

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("❌ Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    println!("✓ Listening on http://{}", addr);
    println!("📴 Press Ctrl+C to stop");
    println!();

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("❌ Server error: {}", e);
    }

    info!("shutting down: checkpointing indexes");
    if let Err(e) = store.shutdown() {
        warn!("final checkpoint failed: {}", e);
    }
    println!("✓ tidepool stopped");
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
