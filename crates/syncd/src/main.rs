use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use apiforge_syncd::auth::JwtIdentityService;
use apiforge_syncd::config::SyncConfig;
use apiforge_syncd::gateway::ExternalWriteGateway;
use apiforge_syncd::relay::{EventBroker, MemoryJobEventStore, RelayService};
use apiforge_syncd::scope::{MemoryScopeDirectory, ScopeDirectory};
use apiforge_syncd::session::SessionRegistry;
use apiforge_syncd::store::UpdateLogStore;
use apiforge_syncd::ws;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set APIFORGE_SYNCD_JWT_SECRET in production");
    }

    let identity =
        Arc::new(JwtIdentityService::new(&config.jwt_secret).context("invalid JWT secret")?);
    let store = Arc::new(UpdateLogStore::open(&config.update_log_path).with_context(|| {
        format!("failed to open update log at {}", config.update_log_path.display())
    })?);
    let registry = Arc::new(SessionRegistry::new(store, config.compaction_threshold));

    // Scope and job records are owned by the external workspace service; the
    // in-memory directories stand in until that integration is wired up.
    let scopes: Arc<dyn ScopeDirectory> = Arc::new(MemoryScopeDirectory::new());
    let relay = Arc::new(RelayService::new(
        Arc::new(MemoryJobEventStore::new()),
        Arc::new(EventBroker::new()),
    ));
    let gateway = Arc::new(ExternalWriteGateway::new(
        Arc::clone(&identity),
        Arc::clone(&scopes),
        Arc::clone(&registry),
    ));

    let app = build_router(ws::AppState { identity, scopes, registry, gateway, relay });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind sync listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting sync server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("sync server exited unexpectedly")
}

fn build_router(state: ws::AppState) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(ws::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
