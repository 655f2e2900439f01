// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ChoreQuest API Server

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use axum::middleware;
use chorequest_api::{
    config::Config,
    create_router,
    security::{security_headers_middleware, SecurityHeaders},
    state::AppState,
};
use chorequest_shared::{create_pool, run_migrations};
use tokio::time::{interval, Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chorequest_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A weak or missing secret must stop the process before anything listens
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chorequest-api: configuration error: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!(
        app_mode = %config.app_mode,
        "Starting ChoreQuest API Server v{}",
        env!("CARGO_PKG_VERSION")
    );

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    let state = AppState::new(config.clone(), pool)?;

    // Drop rate-limit keys whose windows have emptied
    let limiter = state.rate_limiter.clone();
    let window_seconds = config.rate_limit_window_seconds;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(window_seconds.max(1)));
        loop {
            ticker.tick().await;
            let pruned = limiter.prune_idle(window_seconds);
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle rate-limit keys");
            }
        }
    });
    tracing::info!("Rate limiter pruning task started");

    let allowed_origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if config.trust_proxy_headers {
        tracing::info!("Client addresses taken from proxy forwarding headers");
    }

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE, header::RETRY_AFTER])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(middleware::from_fn_with_state(
            SecurityHeaders {
                hsts: config.cookie_secure,
            },
            security_headers_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // Peer addresses feed the per-client rate-limit keys
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
