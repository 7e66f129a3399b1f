//! Control and read API over a running sync engine.

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use lib_fleetsync::{DeviceId, EngineHandle, EngineStatus, LiveState};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleUpdateRequest {
    pub device_ids: Vec<DeviceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionRequest {
    pub session_id: String,
    pub device_ids: Vec<DeviceId>,
    #[serde(default)]
    pub realtime: bool,
}

pub fn router(engine: EngineHandle) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/reset", post(reset_handler))
        .route("/vehicles/update", post(vehicle_update_handler))
        .route("/attention", post(attention_handler))
        .route("/attention/{session_id}", delete(unregister_attention_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(ApiState { engine })
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, engine: EngineHandle, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Control API listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler(State(state): State<ApiState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

async fn state_handler(State(state): State<ApiState>) -> Json<LiveState> {
    Json(state.engine.latest_state().as_ref().clone())
}

async fn reset_handler(State(state): State<ApiState>) -> Json<EngineStatus> {
    tracing::warn!("Force reset requested over the API");
    state.engine.force_reset().await;
    Json(state.engine.status())
}

async fn vehicle_update_handler(
    State(state): State<ApiState>,
    Json(request): Json<VehicleUpdateRequest>,
) -> StatusCode {
    if request.device_ids.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state.engine.force_vehicle_update(&request.device_ids);
    StatusCode::ACCEPTED
}

async fn attention_handler(State(state): State<ApiState>, Json(request): Json<AttentionRequest>) -> StatusCode {
    if request.session_id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state
        .engine
        .register_attention(&request.session_id, request.device_ids, request.realtime);
    StatusCode::NO_CONTENT
}

async fn unregister_attention_handler(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    if state.engine.unregister_attention(&session_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Streams every published snapshot until either side goes away.
async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let (subscriber_id, mut rx) = state.engine.subscribe();
    tracing::debug!(subscriber_id, "WebSocket subscriber connected");

    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                let Some(snapshot) = snapshot else { break };
                let payload = match serde_json::to_string(snapshot.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "Snapshot serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.engine.unsubscribe(subscriber_id);
    tracing::debug!(subscriber_id, "WebSocket subscriber disconnected");
}
