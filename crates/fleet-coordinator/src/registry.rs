use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use fleet_core::protocol::AppDescriptor;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AgentRecord {
    pub identity: String,
    pub hostname: String,
    pub conn_id: u64,
    pub sender: mpsc::Sender<Message>,
    pub apps: Vec<AppDescriptor>,
    pub connected_since: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    AgentConnected { identity: String, hostname: String },
    AgentDisconnected { identity: String },
    InventoryUpdated { identity: String, apps: Vec<AppDescriptor> },
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    events: broadcast::Sender<RegistryEvent>,
    conn_counter: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn register(
        &self,
        identity: &str,
        hostname: &str,
        conn_id: u64,
        sender: mpsc::Sender<Message>,
    ) -> Option<mpsc::Sender<Message>> {
        let record = AgentRecord {
            identity: identity.to_string(),
            hostname: hostname.to_string(),
            conn_id,
            sender,
            apps: Vec::new(),
            connected_since: Utc::now(),
            last_heartbeat: None,
        };
        let replaced = self
            .agents
            .write()
            .await
            .insert(identity.to_string(), record)
            .map(|prior| prior.sender);
        info!(
            event = "agent_registered",
            identity = identity,
            hostname = hostname,
            conn_id = conn_id,
            replaced = replaced.is_some()
        );
        self.emit(RegistryEvent::AgentConnected {
            identity: identity.to_string(),
            hostname: hostname.to_string(),
        });
        replaced
    }

    pub async fn record_inventory(&self, identity: &str, apps: Vec<AppDescriptor>) -> bool {
        let mut agents = self.agents.write().await;
        let Some(record) = agents.get_mut(identity) else {
            return false;
        };
        record.apps = apps.clone();
        drop(agents);
        info!(
            event = "inventory_updated",
            identity = identity,
            apps = apps.len()
        );
        self.emit(RegistryEvent::InventoryUpdated {
            identity: identity.to_string(),
            apps,
        });
        true
    }

    pub async fn record_heartbeat(&self, identity: &str) -> bool {
        let mut agents = self.agents.write().await;
        let Some(record) = agents.get_mut(identity) else {
            return false;
        };
        record.last_heartbeat = Some(Utc::now());
        debug!(event = "heartbeat", identity = identity);
        true
    }

    // Guarded by conn id so the delayed close of a replaced connection
    // cannot evict the registration that superseded it.
    pub async fn unregister(&self, identity: &str, conn_id: u64) -> bool {
        let mut agents = self.agents.write().await;
        let owns_record = agents
            .get(identity)
            .map(|record| record.conn_id == conn_id)
            .unwrap_or(false);
        if !owns_record {
            return false;
        }
        agents.remove(identity);
        drop(agents);
        info!(
            event = "agent_unregistered",
            identity = identity,
            conn_id = conn_id
        );
        self.emit(RegistryEvent::AgentDisconnected {
            identity: identity.to_string(),
        });
        true
    }

    pub async fn lookup(&self, identity: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(identity).cloned()
    }

    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str) -> AppDescriptor {
        AppDescriptor {
            name: name.to_string(),
            version: None,
            launch_path: None,
        }
    }

    fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn register_keeps_one_record_bound_to_latest_connection() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = registry.next_conn_id();
        let second = registry.next_conn_id();

        assert!(registry
            .register("SIM-01", "host-a", first, tx1)
            .await
            .is_none());
        let replaced = registry.register("SIM-01", "host-a", second, tx2).await;
        assert!(replaced.is_some());

        let record = registry.lookup("SIM-01").await.expect("record");
        assert_eq!(record.conn_id, second);
        assert_eq!(registry.identities().await, vec!["SIM-01".to_string()]);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn stale_unregister_cannot_evict_newer_registration() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = registry.next_conn_id();
        let second = registry.next_conn_id();
        registry.register("SIM-01", "host-a", first, tx1).await;
        registry.register("SIM-01", "host-a", second, tx2).await;

        assert!(!registry.unregister("SIM-01", first).await);
        assert!(registry.lookup("SIM-01").await.is_some());

        assert!(registry.unregister("SIM-01", second).await);
        assert!(registry.lookup("SIM-01").await.is_none());
    }

    #[tokio::test]
    async fn inventory_is_replaced_wholesale() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = channel();
        let conn = registry.next_conn_id();
        registry.register("SIM-01", "host-a", conn, tx).await;

        assert!(
            registry
                .record_inventory("SIM-01", vec![app("Notepad"), app("Calc")])
                .await
        );
        assert!(
            registry
                .record_inventory("SIM-01", vec![app("Paint")])
                .await
        );

        let record = registry.lookup("SIM-01").await.expect("record");
        assert_eq!(record.apps, vec![app("Paint")]);
    }

    #[tokio::test]
    async fn inventory_for_unknown_identity_is_ignored() {
        let registry = AgentRegistry::new();
        assert!(!registry.record_inventory("SIM-99", vec![app("Paint")]).await);
        assert!(registry.lookup("SIM-99").await.is_none());
    }

    #[tokio::test]
    async fn register_resets_inventory() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let first = registry.next_conn_id();
        registry.register("SIM-01", "host-a", first, tx1).await;
        registry
            .record_inventory("SIM-01", vec![app("Notepad")])
            .await;

        let second = registry.next_conn_id();
        registry.register("SIM-01", "host-a", second, tx2).await;

        let record = registry.lookup("SIM-01").await.expect("record");
        assert!(record.apps.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_recorded_but_only_for_registered_identities() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = channel();
        let conn = registry.next_conn_id();
        registry.register("SIM-01", "host-a", conn, tx).await;

        let before = registry.lookup("SIM-01").await.expect("record");
        assert!(before.last_heartbeat.is_none());

        assert!(registry.record_heartbeat("SIM-01").await);
        let after = registry.lookup("SIM-01").await.expect("record");
        assert!(after.last_heartbeat.is_some());

        assert!(!registry.record_heartbeat("SIM-99").await);
    }

    #[tokio::test]
    async fn events_follow_the_session_lifecycle() {
        let registry = AgentRegistry::new();
        let mut events = registry.subscribe();
        let (tx, _rx) = channel();
        let conn = registry.next_conn_id();

        registry.register("SIM-01", "host-a", conn, tx).await;
        registry
            .record_inventory("SIM-01", vec![app("Notepad")])
            .await;
        registry.unregister("SIM-01", conn).await;

        assert_eq!(
            events.recv().await.expect("connected"),
            RegistryEvent::AgentConnected {
                identity: "SIM-01".to_string(),
                hostname: "host-a".to_string(),
            }
        );
        assert_eq!(
            events.recv().await.expect("inventory"),
            RegistryEvent::InventoryUpdated {
                identity: "SIM-01".to_string(),
                apps: vec![app("Notepad")],
            }
        );
        assert_eq!(
            events.recv().await.expect("disconnected"),
            RegistryEvent::AgentDisconnected {
                identity: "SIM-01".to_string(),
            }
        );
    }
}
