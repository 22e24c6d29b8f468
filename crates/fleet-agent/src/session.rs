use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::protocol::{
    decode_message, encode_message, WireMessage, DEFAULT_MAX_MESSAGE_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use url::Url;

use crate::inventory::AppsProvider;
use crate::lifecycle::ProcessController;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ConnectedUnregistered,
    Registered,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::ConnectedUnregistered => "connected-unregistered",
            SessionState::Registered => "registered",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub coordinator_url: Url,
    pub identity: String,
    pub hostname: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

pub struct AgentSession {
    config: SessionConfig,
    controller: Arc<ProcessController>,
    provider: Arc<dyn AppsProvider>,
    state_tx: watch::Sender<SessionState>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl AgentSession {
    pub fn new(
        config: SessionConfig,
        controller: Arc<ProcessController>,
        provider: Arc<dyn AppsProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            controller,
            provider,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    // Reconnects forever at a fixed cadence; the loop never gives up on the
    // coordinator.
    pub async fn run(&self) {
        loop {
            self.set_state(SessionState::Connecting);
            let connect = connect_async(self.config.coordinator_url.clone()).await;
            let ws = match connect {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!("connect failed: {err}");
                    self.set_state(SessionState::Disconnected);
                    tokio::time::sleep(self.config.reconnect_delay).await;
                    continue;
                }
            };
            self.set_state(SessionState::ConnectedUnregistered);
            self.drive_connection(ws).await;
            self.set_state(SessionState::Disconnected);
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn drive_connection(&self, mut ws: WsStream) {
        let register = WireMessage::Register {
            identity: self.config.identity.clone(),
            hostname: self.config.hostname.clone(),
        };
        if !self.send(&mut ws, &register).await {
            warn!("register send failed");
            let _ = ws.close(None).await;
            return;
        }
        self.set_state(SessionState::Registered);

        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(OUTBOUND_QUEUE);
        self.spawn_inventory_report(out_tx.clone());

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick completes immediately; beats start one period out.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text, &out_tx),
                        Some(Ok(WsMessage::Close(_))) => {
                            info!("coordinator closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("read failed: {err}");
                            break;
                        }
                        None => break,
                    }
                }
                Some(out) = out_rx.recv() => {
                    if !self.send(&mut ws, &out).await {
                        warn!("send failed: {}", out.kind());
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.send(&mut ws, &WireMessage::Heartbeat).await {
                        warn!("heartbeat send failed");
                        break;
                    }
                }
            }
        }
        let _ = ws.close(None).await;
    }

    fn handle_frame(&self, raw: &str, out_tx: &mpsc::Sender<WireMessage>) {
        let message = match decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping frame: {err}");
                return;
            }
        };
        match message {
            WireMessage::Command { command } => {
                info!("command received: {command}");
            }
            WireMessage::LaunchApp { app_name, app_path } => {
                let controller = self.controller.clone();
                tokio::spawn(async move {
                    if let Err(err) = controller.launch(&app_name, &app_path).await {
                        warn!("launch {app_name} failed: {err}");
                    }
                });
            }
            WireMessage::RefreshApps => {
                self.spawn_inventory_report(out_tx.clone());
            }
            WireMessage::CloseApp { app_name, app_path } => {
                let controller = self.controller.clone();
                tokio::spawn(async move {
                    controller.close(&app_name, &app_path).await;
                });
            }
            other => {
                warn!("unexpected {} from coordinator", other.kind());
            }
        }
    }

    fn spawn_inventory_report(&self, out_tx: mpsc::Sender<WireMessage>) {
        let provider = self.provider.clone();
        let identity = self.config.identity.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || provider.collect()).await {
                Ok(Ok(apps)) => {
                    info!("reporting {} apps", apps.len());
                    let _ = out_tx.send(WireMessage::AppsList { identity, apps }).await;
                }
                Ok(Err(err)) => {
                    // A failed sweep reports nothing; the coordinator keeps
                    // the previous inventory.
                    warn!("apps collection failed: {err}");
                }
                Err(err) => {
                    warn!("apps collection panicked: {err}");
                }
            }
        });
    }

    async fn send(&self, ws: &mut WsStream, message: &WireMessage) -> bool {
        let raw = match encode_message(message, DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("encode failed: {err}");
                return false;
            }
        };
        ws.send(WsMessage::Text(raw)).await.is_ok()
    }

    fn set_state(&self, state: SessionState) {
        if self.state_tx.send_replace(state) != state {
            info!("session {state}");
        }
    }
}
