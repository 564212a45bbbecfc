//! Kameo Bidding Bot Web Server
//!
//! Job-oriented control surface for the bidding bot.

use anyhow::Result;
use kameo_bot::api::{create_app, AppState};
use kameo_bot::Config;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging. Default to info; override with RUST_LOG,
    // e.g. RUST_LOG=debug for request traces
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       KAMEO BIDDING BOT - WEB SERVER                         ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Database: {:<49} ║", config.database_path);
    println!("║  Platform: {:<49} ║", config.web_base_url);
    println!(
        "║  Rate limit: {:<47} ║",
        format!(
            "{} requests / {}s",
            config.rate_limit.max_requests, config.rate_limit.window_secs
        )
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Create application state
    info!("Initializing application state...");
    let state = AppState::new(config).await?;

    // Drop finished jobs once their retention window passes
    state.orchestrator.clone().spawn_retention_sweep();

    // Create the Axum app
    let app = create_app(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    println!();
    println!("  API:     http://localhost:3000/api");
    println!("  Health:  http://localhost:3000/health");
    println!();

    // Run the server
    axum::serve(listener, app).await?;

    Ok(())
}
