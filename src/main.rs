//! Friends Federation binary entry point

use std::sync::Arc;

use friends_federation::federation::{FollowerRegistry, HttpTransport};
use friends_federation::{AppState, config, data::InMemoryFeeds};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Wire the federation core and seed followed feeds
/// 5. Start delivery workers
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!(
        "friends_federation={},tower_http=debug",
        config.logging.level
    );
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting Friends Federation..."
    );

    // 3. Initialize metrics
    friends_federation::metrics::init_metrics();

    // 4. Wire the federation core
    // Followers come from configuration; a host that tracks them itself
    // passes its own registry through `with_followers`.
    let followers = FollowerRegistry::from_seeds(&config.followers).await;
    tracing::info!(count = config.followers.len(), "Loaded followers from configuration");
    let transport = HttpTransport::new(
        &config.federation.user_agent,
        config.federation.request_timeout(),
    )?
    .with_followers(Arc::new(followers));
    let state = AppState::new(
        config.clone(),
        Arc::new(transport),
        Arc::new(InMemoryFeeds::new()),
    );
    state.seed_feeds().await;

    // 5. Start delivery workers
    let _workers = state.spawn_delivery_workers();

    // 6. Start HTTP server
    let app = friends_federation::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}
