use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::{SharedState, api_router};
use super::jwt::JwtIssuer;
use super::middleware::{WebhookSecret, handle_panic, preflight_no_content};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Allowed browser origin; `*` allows any origin without credentials.
    pub cors_allow_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            cors_allow_origin: "http://localhost:3000".to_string(),
        }
    }
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(super::rpc::WORKSPACE_HEADER),
        ]);
    if origin == "*" {
        return Ok(layer.allow_origin(AllowOrigin::any()));
    }
    let origin = HeaderValue::from_str(origin)
        .with_context(|| format!("Invalid CORS origin '{}'", origin))?;
    Ok(layer.allow_origin(origin).allow_credentials(true))
}

/// Build the full application router: operations, webhook, health check,
/// CORS, access logging and panic recovery.
pub fn build_router(
    state: SharedState,
    jwt: Arc<JwtIssuer>,
    webhook_secret: Option<WebhookSecret>,
    config: &ServerConfig,
) -> Result<Router> {
    Ok(api_router(jwt, webhook_secret)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors_layer(&config.cors_allow_origin)?)
        .layer(axum::middleware::from_fn(preflight_no_content))
        .layer(TraceLayer::new_for_http()))
}

/// Serve `app` until Ctrl-C or SIGTERM.
pub async fn start_server(app: Router, config: &ServerConfig) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "treenq listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}
