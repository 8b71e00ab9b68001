use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::fleet::handle::{FleetCommand, FleetHandle, FleetReply};
use crate::fleet::{FleetError, FleetEvent};
use crate::persona::PersonaDescriptor;

#[derive(Clone)]
pub struct ServerState {
    pub fleet: FleetHandle,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    room_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct InviteRequest {
    room_id: String,
    user_id: String,
}

type ApiResult = Result<Json<FleetReply>, (StatusCode, Json<FleetError>)>;

/// Serve the control API until `shutdown` fires, then close open websockets
/// and drain in-flight requests.
pub async fn serve_backend(
    fleet: FleetHandle,
    event_rx: flume::Receiver<FleetEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_addr = std::env::var("CHORUS_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8797".to_string())
        .parse::<SocketAddr>()
        .context("Invalid CHORUS_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Chorus backend listening on http://{}", bind_addr);
    serve_on(listener, fleet, auth, event_rx, shutdown).await
}

async fn serve_on(
    listener: tokio::net::TcpListener,
    fleet: FleetHandle,
    auth: BackendAuthConfig,
    event_rx: flume::Receiver<FleetEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        fleet,
        auth,
        ws_events: ws_events.clone(),
        shutdown: shutdown.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Backend server failed")?;
    tracing::info!("Backend server stopped");
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/personas", get(list_personas).post(spawn_persona))
        .route("/personas/:id", get(describe_persona).delete(despawn_persona))
        .route("/personas/:id/send", post(send_as_persona))
        .route("/personas/:id/join", post(join_room))
        .route("/personas/:id/invite", post(invite_to_room))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<FleetEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_fleet_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_fleet_event(event: FleetEvent) -> ApiEventEnvelope {
    let event_type = match &event {
        FleetEvent::Spawned { .. } => "spawned",
        FleetEvent::Despawned { .. } => "despawned",
        FleetEvent::SessionStarted { .. } => "session_started",
        FleetEvent::SessionStopped { .. } => "session_stopped",
        FleetEvent::SessionFailed { .. } => "session_failed",
        FleetEvent::ReplySent { .. } => "reply_sent",
        FleetEvent::Error { .. } => "error",
    };
    let mut payload = serde_json::to_value(&event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(object) = payload.as_object_mut() {
        object.remove("type");
    }
    envelope(event_type, payload)
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("CHORUS_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("CHORUS_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "CHORUS_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid CHORUS_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn status_for(error: &FleetError) -> StatusCode {
    match error {
        FleetError::InvalidDescriptor { .. } => StatusCode::BAD_REQUEST,
        FleetError::DuplicateId { .. } => StatusCode::CONFLICT,
        FleetError::NotFound { .. } => StatusCode::NOT_FOUND,
        FleetError::PartialFailure { .. } => StatusCode::MULTI_STATUS,
        FleetError::Backend { .. } | FleetError::Generation { .. } => StatusCode::BAD_GATEWAY,
        FleetError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        FleetError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn run(state: &ServerState, command: FleetCommand) -> ApiResult {
    state
        .fleet
        .call(command)
        .await
        .map(Json)
        .map_err(|e| (status_for(&e), Json(e)))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_personas(State(state): State<Arc<ServerState>>) -> ApiResult {
    run(&state, FleetCommand::List).await
}

async fn spawn_persona(
    State(state): State<Arc<ServerState>>,
    Json(descriptor): Json<PersonaDescriptor>,
) -> ApiResult {
    run(&state, FleetCommand::Spawn { descriptor }).await
}

async fn describe_persona(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
) -> ApiResult {
    run(&state, FleetCommand::Describe { persona_id }).await
}

async fn despawn_persona(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
) -> ApiResult {
    run(&state, FleetCommand::Despawn { persona_id }).await
}

async fn send_as_persona(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult {
    run(
        &state,
        FleetCommand::Send {
            persona_id,
            room_id: request.room_id,
            text: request.text,
        },
    )
    .await
}

async fn join_room(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
    Json(request): Json<JoinRequest>,
) -> ApiResult {
    run(
        &state,
        FleetCommand::Join {
            persona_id,
            room_id: request.room_id,
        },
    )
    .await
}

async fn invite_to_room(
    State(state): State<Arc<ServerState>>,
    Path(persona_id): Path<String>,
    Json(request): Json<InviteRequest>,
) -> ApiResult {
    run(
        &state,
        FleetCommand::Invite {
            persona_id,
            room_id: request.room_id,
            user_id: request.user_id,
        },
    )
    .await
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
