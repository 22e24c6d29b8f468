use std::sync::Arc;

use axum::extract::ws::Message;
use fleet_core::protocol::{encode_message, AppDescriptor, WireMessage, DEFAULT_MAX_MESSAGE_BYTES};
use tracing::{debug, warn};

use crate::registry::AgentRegistry;

#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<AgentRegistry>,
}

impl CommandRouter {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub async fn launch(&self, identity: &str, app_name: &str, app_path: &str) -> bool {
        self.forward(
            identity,
            WireMessage::LaunchApp {
                app_name: app_name.to_string(),
                app_path: app_path.to_string(),
            },
        )
        .await
    }

    pub async fn refresh(&self, identity: &str) -> bool {
        self.forward(identity, WireMessage::RefreshApps).await
    }

    pub async fn close(&self, identity: &str, app_name: &str, app_path: &str) -> bool {
        self.forward(
            identity,
            WireMessage::CloseApp {
                app_name: app_name.to_string(),
                app_path: app_path.to_string(),
            },
        )
        .await
    }

    pub async fn command(&self, identity: &str, command: &str) -> bool {
        self.forward(
            identity,
            WireMessage::Command {
                command: command.to_string(),
            },
        )
        .await
    }

    pub async fn inventory(&self, identity: &str) -> Vec<AppDescriptor> {
        self.registry
            .lookup(identity)
            .await
            .map(|record| record.apps)
            .unwrap_or_default()
    }

    // Delivery to the transport only; completion is observed through later
    // APPS_LIST traffic, never correlated with the command.
    async fn forward(&self, identity: &str, message: WireMessage) -> bool {
        let Some(record) = self.registry.lookup(identity).await else {
            warn!(
                event = "forward_miss",
                identity = identity,
                kind = message.kind()
            );
            return false;
        };
        if record.sender.is_closed() {
            warn!(
                event = "forward_closed",
                identity = identity,
                kind = message.kind()
            );
            return false;
        }
        let raw = match encode_message(&message, DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", identity = identity, error = %err);
                return false;
            }
        };
        if record.sender.send(Message::Text(raw)).await.is_err() {
            warn!(
                event = "send_error",
                identity = identity,
                kind = message.kind()
            );
            return false;
        }
        debug!(
            event = "command_forwarded",
            identity = identity,
            kind = message.kind()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::protocol::decode_message;
    use tokio::sync::mpsc;

    async fn registry_with_agent(identity: &str) -> (Arc<AgentRegistry>, mpsc::Receiver<Message>) {
        let registry = Arc::new(AgentRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let conn = registry.next_conn_id();
        registry.register(identity, "host-a", conn, tx).await;
        (registry, rx)
    }

    fn decode_text_frame(msg: Message) -> WireMessage {
        match msg {
            Message::Text(raw) => decode_message(&raw, DEFAULT_MAX_MESSAGE_BYTES).expect("decode"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_commands_to_the_registered_connection() {
        let (registry, mut rx) = registry_with_agent("SIM-01").await;
        let router = CommandRouter::new(registry);

        assert!(
            router
                .launch("SIM-01", "Notepad", "C:\\Windows\\notepad.exe")
                .await
        );
        assert!(router.refresh("SIM-01").await);
        assert!(
            router
                .close("SIM-01", "Notepad", "C:\\Windows\\notepad.exe")
                .await
        );
        assert!(router.command("SIM-01", "reboot").await);

        assert_eq!(
            decode_text_frame(rx.recv().await.expect("launch frame")),
            WireMessage::LaunchApp {
                app_name: "Notepad".to_string(),
                app_path: "C:\\Windows\\notepad.exe".to_string(),
            }
        );
        assert_eq!(
            decode_text_frame(rx.recv().await.expect("refresh frame")),
            WireMessage::RefreshApps
        );
        assert_eq!(
            decode_text_frame(rx.recv().await.expect("close frame")),
            WireMessage::CloseApp {
                app_name: "Notepad".to_string(),
                app_path: "C:\\Windows\\notepad.exe".to_string(),
            }
        );
        assert_eq!(
            decode_text_frame(rx.recv().await.expect("command frame")),
            WireMessage::Command {
                command: "reboot".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_identity_fails_without_outbound_traffic() {
        let (registry, mut rx) = registry_with_agent("SIM-01").await;
        let router = CommandRouter::new(registry);

        assert!(!router.launch("SIM-99", "Notepad", "notepad.exe").await);
        assert!(!router.refresh("SIM-99").await);
        assert!(!router.close("SIM-99", "Notepad", "notepad.exe").await);
        assert!(!router.command("SIM-99", "reboot").await);

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn closed_connection_fails_without_side_effects() {
        let (registry, rx) = registry_with_agent("SIM-01").await;
        drop(rx);
        let router = CommandRouter::new(registry.clone());

        assert!(!router.launch("SIM-01", "Notepad", "notepad.exe").await);
        assert!(!router.refresh("SIM-01").await);

        // The record itself stays until the socket task unregisters it.
        assert!(registry.lookup("SIM-01").await.is_some());
    }

    #[tokio::test]
    async fn inventory_is_empty_for_unknown_identities() {
        let registry = Arc::new(AgentRegistry::new());
        let router = CommandRouter::new(registry.clone());
        assert!(router.inventory("SIM-99").await.is_empty());

        let (tx, _rx) = mpsc::channel(8);
        let conn = registry.next_conn_id();
        registry.register("SIM-01", "host-a", conn, tx).await;
        registry
            .record_inventory(
                "SIM-01",
                vec![AppDescriptor {
                    name: "Notepad".to_string(),
                    version: Some("10.0".to_string()),
                    launch_path: Some("C:\\Windows\\notepad.exe".to_string()),
                }],
            )
            .await;

        let apps = router.inventory("SIM-01").await;
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "Notepad");
    }
}
