use tracing_subscriber::EnvFilter;

use hairscan::api;
use hairscan::config::Config;
use hairscan::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Embedding sidecar: {}", config.embedder.base_url);
    if config.llm.enabled {
        tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    } else {
        tracing::info!("LLM explanations disabled, using templates");
    }

    let state = AppState::new(config.clone())?;
    tracing::info!("Ensemble strategy: {}", state.ensemble().strategy());

    // No CORS layer: clients are same-origin or server-side.
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
