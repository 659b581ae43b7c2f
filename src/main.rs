use anyhow::anyhow;
use tokio::net::TcpListener;

use cadenza::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Load configuration
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();

    // Create application state
    let app_state = AppState::new(config);

    let app = routes::api::create_api_router().with_state(app_state);

    let listener = TcpListener::bind(&address).await?;
    println!("Server listening on {address}");

    axum::serve(listener, app).await?;

    Ok(())
}
