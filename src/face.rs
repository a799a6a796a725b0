use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::brain::PolicyOracle;
use crate::config::AgentConfig;
use crate::session;
use crate::types::{Profile, default_goals, default_profile};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub oracle: Arc<dyn PolicyOracle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    #[serde(default)]
    pub url: String,
    pub test_profile: Option<Profile>,
    pub goals: Option<Vec<String>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/test", post(test_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves on `port`, falling back to the next nine ports if it is taken.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let mut listener = None;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(_) => continue,
        }
    }
    let listener = listener.ok_or_else(|| {
        anyhow::anyhow!(
            "Could not bind to any port {}-{}. Kill the old agent first.",
            port,
            port.saturating_add(9)
        )
    })?;

    info!("Backend running at http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn test_handler(
    State(state): State<AppState>,
    Json(payload): Json<TestRequest>,
) -> (StatusCode, Json<Value>) {
    let url = payload.url.trim().to_string();
    if url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "url is required" })),
        );
    }

    let profile = payload.test_profile.unwrap_or_else(default_profile);
    let goals = payload
        .goals
        .filter(|g| !g.is_empty())
        .unwrap_or_else(default_goals);
    info!("Running test on {} with {} goals", url, goals.len());

    match session::run_session(&state.config, state.oracle.clone(), &url, &profile, &goals).await {
        Ok(report) => {
            let mut body = json!({ "success": true, "result": report.steps });
            if let Some(message) = report.error {
                body["error"] = Value::String(message);
            }
            (StatusCode::OK, Json(body))
        }
        Err(e) => {
            error!("Test error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            )
        }
    }
}
