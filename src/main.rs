use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use bunch_gateway::auth::jwt::{load_or_generate_jwt_secret, JwtVerifier};
use bunch_gateway::config::Config;
use bunch_gateway::routes;
use bunch_gateway::state::AppState;
use bunch_gateway::store::sqlite::{init_db, SqliteStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "bunch_gateway=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "bunch_gateway=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("bunch-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let db = init_db(&config.data_dir)?;
    let store = Arc::new(SqliteStore::new(db));

    let jwt_secret = load_or_generate_jwt_secret(&config.data_dir)?;
    let verifier = Arc::new(JwtVerifier::new(jwt_secret));

    let app_state = AppState::new(store, verifier, config.outbound_queue_size);
    let app = routes::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
