use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::config::ConfigUpdate;
use crate::engine::{AgentCommand, AgentEngine, DemoScenario};
use crate::events::{AgentThought, ThoughtKind};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AgentEngine>,
    pub commands: mpsc::Sender<AgentCommand>,
}

/// Create the API router
pub fn create_router(engine: Arc<AgentEngine>, commands: mpsc::Sender<AgentCommand>) -> Router {
    let state = AppState { engine, commands };

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/thoughts", get(thoughts_websocket))
        .route("/api/agent/analyze/:token_id", post(analyze_invoice))
        .route("/api/agent/config", get(get_config).post(update_config))
        .route("/api/agent/demo/:scenario", post(run_demo))
        .route("/api/agent/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Queue a manual re-analysis of one invoice
async fn analyze_invoice(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token_id = token_id.trim().to_string();
    if token_id.is_empty() {
        return Err(ApiError::BadRequest("token_id is required".to_string()));
    }

    state
        .commands
        .send(AgentCommand::Analyze {
            token_id: token_id.clone(),
        })
        .await
        .map_err(|_| ApiError::Unavailable("agent is not running".to_string()))?;

    Ok(Json(json!({
        "queued": true,
        "token_id": token_id,
    })))
}

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cfg = state.engine.config();
    let cfg = cfg.read();
    Json(json!({
        "min_confidence": cfg.min_confidence,
        "analysis_interval_ms": cfg.analysis_interval_ms,
        "max_concurrent_analyses": cfg.max_concurrent_analyses,
        "auto_execute": cfg.auto_execute,
    }))
}

/// Partial config update; unknown or out-of-range values are skipped and
/// the applied key list is returned.
async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Json<serde_json::Value> {
    let cfg = state.engine.config();
    let applied = cfg.write().apply_update(&update);
    debug!(?applied, "runtime config update");

    state.engine.thoughts().emit(
        ThoughtKind::System,
        None,
        format!("config updated: [{}]", applied.join(", ")),
    );

    let cfg = cfg.read();
    Json(json!({
        "applied": applied,
        "config": {
            "min_confidence": cfg.min_confidence,
            "analysis_interval_ms": cfg.analysis_interval_ms,
            "max_concurrent_analyses": cfg.max_concurrent_analyses,
            "auto_execute": cfg.auto_execute,
        },
    }))
}

async fn run_demo(
    State(state): State<AppState>,
    Path(scenario): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scenario = DemoScenario::parse(&scenario).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unknown scenario '{scenario}' (expected market-crash, market-rally, or reset)"
        ))
    })?;

    state
        .commands
        .send(AgentCommand::Demo(scenario))
        .await
        .map_err(|_| ApiError::Unavailable("agent is not running".to_string()))?;

    Ok(Json(json!({ "queued": true })))
}

async fn get_status(State(state): State<AppState>) -> Json<crate::engine::StatusReport> {
    Json(state.engine.status())
}

// ===== WebSocket =====

async fn thoughts_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.engine.thoughts().subscribe();

    // Greet the subscriber with current status so the dashboard isn't empty.
    let hello = json!({
        "type": "status",
        "data": state.engine.status(),
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let thought: AgentThought = match event {
                    Ok(t) => t,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "slow thought subscriber lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let msg = serde_json::to_string(&thought).unwrap_or_else(|e| {
                    warn!("failed to serialize thought: {}", e);
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            Some(Ok(msg)) = socket.recv() => {
                match msg {
                    Message::Text(text) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_scenarios_parse() {
        assert_eq!(DemoScenario::parse("market-crash"), Some(DemoScenario::MarketCrash));
        assert_eq!(DemoScenario::parse("Market-Rally"), Some(DemoScenario::MarketRally));
        assert_eq!(DemoScenario::parse("reset"), Some(DemoScenario::Reset));
        assert_eq!(DemoScenario::parse("moon"), None);
    }

    #[test]
    fn bad_request_maps_to_400() {
        let resp = ApiError::BadRequest("token_id is required".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
