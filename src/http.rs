use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

use mitmcore::policy::PolicyStore;
use mitmcore::process::{process_nfc_payload, ProcessError};

use crate::server::Phase;

/// Relay envelopes are small; anything bigger is hostile.
const MAX_BODY_SIZE: usize = 256 * 1024;

pub struct HttpState {
    pub policy: Arc<PolicyStore>,
    pub semaphore: Semaphore,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", post(relay))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Operator probe: current policy toggles and signing state. The key path
/// itself is never exposed.
async fn status(State(state): State<Arc<HttpState>>) -> Json<Value> {
    let snapshot = state.policy.read();
    Json(json!({
        "status": "running",
        "mitm_enabled": snapshot.policy.mitm_enabled,
        "bypass_pin": snapshot.policy.bypass_pin,
        "cdcvm_enabled": snapshot.policy.cdcvm_enabled,
        "enhanced_limits": snapshot.policy.enhanced_limits,
        "block_all": snapshot.policy.block_all,
        "signing_key_loaded": snapshot.key.is_some(),
    }))
}

/// Stateless JSON relay path: same envelope fields as the NFC_DATA inner
/// payload, 200 on success, 403 when blocked, 400 for malformed input.
async fn relay(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let _permit = match state.semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": "INTERNAL", "message": "relay unavailable"})),
            )
        }
    };

    let snapshot = state.policy.read();

    match process_nfc_payload(&body, &snapshot) {
        Ok(outcome) => {
            let value = serde_json::to_value(&outcome.response).unwrap_or_else(|_| json!({}));
            (StatusCode::OK, Json(value))
        }
        Err(err @ ProcessError::Blocked) => (StatusCode::FORBIDDEN, Json(error_value(&err))),
        Err(err @ (ProcessError::Envelope(_) | ProcessError::Parse(_))) => {
            warn!("HTTP relay rejected body: {}", err);
            (StatusCode::BAD_REQUEST, Json(error_value(&err)))
        }
        Err(err) => {
            warn!("HTTP relay internal failure: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error_value(&err)))
        }
    }
}

fn error_value(err: &ProcessError) -> Value {
    json!({
        "code": err.wire_code().as_str(),
        "message": err.to_string(),
    })
}

pub async fn run_http(
    listener: tokio::net::TcpListener,
    state: Arc<HttpState>,
    mut phase: watch::Receiver<Phase>,
) -> std::io::Result<()> {
    match listener.local_addr() {
        Ok(addr) => info!("HTTP relay listening on {}", addr),
        Err(_) => info!("HTTP relay listening"),
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while phase.changed().await.is_ok() {
                if *phase.borrow() != Phase::Running {
                    break;
                }
            }
        })
        .await
}
