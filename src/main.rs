use anyhow::Context;
use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use mcp_gateway::auth::CALLER_HEADER;
use mcp_gateway::config::{self, GatewayConfig};
use mcp_gateway::state::AppState;

fn build_app() -> anyhow::Result<(axum::Router, AppState)> {
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env();
    let records = match &config.services_file {
        Some(path) => config::load_snapshot(path)
            .with_context(|| format!("loading services from {}", path.display()))?,
        None => {
            tracing::warn!("MCP_SERVICES_FILE not set, starting with an empty registry");
            Vec::new()
        }
    };

    let state = AppState::new(config, records);

    // CORS - explicit allowlist for local dashboards
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(CALLER_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(86_400));

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let frame_deny: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    let referrer: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );

    // Rate limiting: 200 req burst, replenish 1 per 50 ms, per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_millisecond(50)
        .burst_size(200)
        .finish()
        .context("invalid rate limiter configuration")?;

    let app = mcp_gateway::create_router(state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024))
        .layer(cors)
        .layer(nosniff)
        .layer(frame_deny)
        .layer(referrer)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        // SSE responses are excluded by the default compression predicate.
        .layer(CompressionLayer::new());

    Ok((app, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    let (app, state) = build_app()?;

    // ── Health supervisor ──
    let supervisor = state.health.spawn(state.shutdown.clone());

    // ── Non-blocking startup: eager services launch in background ──
    let startup_state = state.clone();
    tokio::spawn(async move {
        startup_state.start_services().await;
        startup_state.mark_ready();
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.port));
    tracing::info!("MCP gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    if let Err(e) = supervisor.await {
        tracing::warn!("health supervisor ended abnormally: {}", e);
    }

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");

    // Open SSE sessions would hold the server open; end them with the adapters.
    state.shutdown();
}
