use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fleet_core::protocol::{decode_message, WireMessage, DEFAULT_MAX_MESSAGE_BYTES};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::AgentRegistry;
use crate::router::CommandRouter;

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub write_timeout: Duration,
    pub debug: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            debug: false,
        }
    }
}

pub struct CoordinatorState {
    pub options: ServerOptions,
    pub registry: Arc<AgentRegistry>,
    pub router: CommandRouter,
}

impl CoordinatorState {
    pub fn new(options: ServerOptions) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let router = CommandRouter::new(registry.clone());
        Self {
            options,
            registry,
            router,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest {
    app_name: String,
    #[serde(default)]
    app_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRequest {
    app_name: String,
    #[serde(default)]
    app_path: String,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

pub fn app(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/agents", get(agents_handler))
        .route("/agents/:identity/apps", get(apps_handler))
        .route("/agents/:identity/launch", post(launch_handler))
        .route("/agents/:identity/refresh", post(refresh_handler))
        .route("/agents/:identity/close", post(close_handler))
        .route("/agents/:identity/command", post(command_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<CoordinatorState>) -> std::io::Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<CoordinatorState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket, remote).await;
    })
}

async fn health_handler(State(state): State<Arc<CoordinatorState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agents": state.registry.count().await,
    }))
}

async fn agents_handler(State(state): State<Arc<CoordinatorState>>) -> impl IntoResponse {
    Json(state.registry.identities().await)
}

async fn apps_handler(
    State(state): State<Arc<CoordinatorState>>,
    Path(identity): Path<String>,
) -> impl IntoResponse {
    Json(state.router.inventory(&identity).await)
}

async fn launch_handler(
    State(state): State<Arc<CoordinatorState>>,
    Path(identity): Path<String>,
    Json(request): Json<LaunchRequest>,
) -> Json<bool> {
    Json(
        state
            .router
            .launch(&identity, &request.app_name, &request.app_path)
            .await,
    )
}

async fn refresh_handler(
    State(state): State<Arc<CoordinatorState>>,
    Path(identity): Path<String>,
) -> Json<bool> {
    Json(state.router.refresh(&identity).await)
}

async fn close_handler(
    State(state): State<Arc<CoordinatorState>>,
    Path(identity): Path<String>,
    Json(request): Json<CloseRequest>,
) -> Json<bool> {
    Json(
        state
            .router
            .close(&identity, &request.app_name, &request.app_path)
            .await,
    )
}

async fn command_handler(
    State(state): State<Arc<CoordinatorState>>,
    Path(identity): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Json<bool> {
    Json(state.router.command(&identity, &request.command).await)
}

async fn handle_socket(state: Arc<CoordinatorState>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_timeout = state.options.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
    });

    let conn_id = state.registry.next_conn_id();
    info!(event = "connection_open", conn_id = conn_id, remote = %remote);

    let mut registered: Option<String> = None;

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", conn_id = conn_id, error = %err);
                break;
            }
        };
        let raw = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(value) => value,
                Err(_) => {
                    warn!(event = "frame_not_utf8", conn_id = conn_id);
                    continue;
                }
            },
            Message::Close(_) => {
                info!(event = "connection_close", conn_id = conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if state.options.debug {
            debug!(event = "frame_received", conn_id = conn_id, raw = %raw);
        }
        let message = match decode_message(&raw, DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", conn_id = conn_id, error = %err);
                continue;
            }
        };
        apply_message(&state.registry, &tx, conn_id, &mut registered, message).await;
    }

    if let Some(identity) = registered.take() {
        state.registry.unregister(&identity, conn_id).await;
    }
    drop(tx);
    let _ = write_task.await;
    info!(event = "connection_finished", conn_id = conn_id);
}

async fn apply_message(
    registry: &AgentRegistry,
    tx: &mpsc::Sender<Message>,
    conn_id: u64,
    registered: &mut Option<String>,
    message: WireMessage,
) {
    match message {
        WireMessage::Register { identity, hostname } => {
            if let Some(prior) = registered.as_ref() {
                if prior != &identity {
                    registry.unregister(prior, conn_id).await;
                }
            }
            let replaced = registry
                .register(&identity, &hostname, conn_id, tx.clone())
                .await;
            if let Some(old) = replaced {
                close_connection(&old, "superseded").await;
            }
            *registered = Some(identity);
        }
        WireMessage::Heartbeat => match registered.as_ref() {
            Some(identity) => {
                registry.record_heartbeat(identity).await;
            }
            None => {
                debug!(event = "heartbeat_before_register", conn_id = conn_id);
            }
        },
        WireMessage::AppsList { identity, apps } => {
            if !registry.record_inventory(&identity, apps).await {
                warn!(
                    event = "inventory_for_unknown",
                    conn_id = conn_id,
                    identity = %identity
                );
            }
        }
        other => {
            warn!(
                event = "wrong_direction",
                conn_id = conn_id,
                kind = other.kind()
            );
        }
    }
}

async fn close_connection(sender: &mpsc::Sender<Message>, reason: &str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: reason.to_string().into(),
        })))
        .await;
}
