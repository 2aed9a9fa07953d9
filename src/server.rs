use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::config::ConfigPatch;
use crate::relay::{self, RelayService};

/// Assemble the HTTP surface over a shared relay instance. Unsupported
/// methods on known paths fall through to the same JSON 404 unknown paths
/// get, so the calling mod never sees a non-JSON error body.
pub fn router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route(
            "/status",
            get(handle_status).options(preflight).fallback(not_found),
        )
        .route(
            "/chat",
            post(handle_chat).options(preflight).fallback(not_found),
        )
        .route(
            "/config",
            post(handle_config).options(preflight).fallback(not_found),
        )
        .fallback(unmatched)
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Bind and run the relay until ctrl-c or SIGTERM.
pub async fn serve(service: Arc<RelayService>) -> anyhow::Result<()> {
    let config = service.config_snapshot().await;
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);
    println!(
        "Factorio GPT service listening on http://{} (model={})",
        addr, config.default_model
    );
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    println!("Service stopped.");
    Ok(())
}

async fn shutdown_signal() {
    // A handler that cannot be installed must not read as a received
    // signal; park the arm instead.
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn handle_status(State(service): State<Arc<RelayService>>) -> Json<Value> {
    debug!("GET /status");
    let config = service.config_snapshot().await;
    let (ready, error) = match relay::readiness(&config) {
        Ok(()) => (true, None),
        Err(reason) => (false, Some(reason.to_string())),
    };
    let rate_limit = service.rate_limit().await;
    Json(json!({
        "ready": ready,
        "error": error,
        "host": config.host,
        "port": config.port,
        "default_model": config.default_model,
        "profiles": config.profiles,
        "rate_limit": rate_limit,
    }))
}

async fn handle_chat(State(service): State<Arc<RelayService>>, body: Bytes) -> Response {
    debug!("POST /chat ({} bytes)", body.len());
    let payload = match parse_object(&body) {
        Ok(payload) => payload,
        Err(message) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message),
    };
    // Detached task: a caller hanging up must not cancel the upstream call
    // mid-flight. The call runs to completion and commits its snapshot; the
    // reply is simply discarded when nobody is left to read it.
    let relay = tokio::spawn(async move { service.relay_chat(payload).await });
    match relay.await {
        Ok(Ok((result, rate_limit))) => Json(json!({
            "result": result,
            "rate_limit": rate_limit,
        }))
        .into_response(),
        Ok(Err(err)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        Err(err) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("relay task failed: {}", err))
        }
    }
}

async fn handle_config(State(service): State<Arc<RelayService>>, body: Bytes) -> Response {
    debug!("POST /config ({} bytes)", body.len());
    let patch: ConfigPatch = if body.is_empty() {
        ConfigPatch::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(patch) => patch,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid config patch: {}", e),
                )
            }
        }
    };
    match service.apply_config_patch(patch).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

// Empty bodies count as the empty object; lenient local callers send
// argument-free POSTs with no body at all.
fn parse_object(body: &Bytes) -> Result<Map<String, Value>, String> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_slice(body).map_err(|_| "Invalid JSON payload".to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

// Bare OPTIONS probes (no CORS preflight headers) get the same allowance a
// browser preflight would.
async fn preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
        .into_response()
}

async fn unmatched(method: Method) -> Response {
    if method == Method::OPTIONS {
        preflight().await
    } else {
        not_found().await
    }
}
