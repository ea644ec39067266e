// registry.rs
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub type SessionId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    sender: UnboundedSender<Arc<str>>,
}

impl Connection {
    pub fn new(sender: UnboundedSender<Arc<str>>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }

    pub fn send(&self, frame: Arc<str>) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// How a published event is rendered into a text frame: `Named` wraps it as
/// `{"event": <event>, "data": <payload>}`, `Raw` sends the payload as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFormat {
    Named { event: String },
    Raw,
}

impl Default for EventFormat {
    fn default() -> Self {
        EventFormat::Named {
            event: "status_change".to_string(),
        }
    }
}

impl EventFormat {
    pub fn encode(&self, payload: &Value) -> serde_json::Result<String> {
        match self {
            EventFormat::Named { event } => serde_json::to_string(&serde_json::json!({
                "event": event,
                "data": payload,
            })),
            EventFormat::Raw => serde_json::to_string(payload),
        }
    }
}

#[derive(Debug, Clone)]
struct Membership {
    session_id: SessionId,
    connection: Connection,
}

/// In-memory map of which live connections belong to which session channel.
///
/// Channels exist only while they have members. Holds no message history.
pub struct ChannelRegistry {
    members: DashMap<ConnectionId, Membership>,
    // session id -> connection ids
    channels: DashMap<SessionId, HashSet<ConnectionId>>,
    format: EventFormat,
}

impl ChannelRegistry {
    pub fn new(format: EventFormat) -> Self {
        Self {
            members: DashMap::new(),
            channels: DashMap::new(),
            format,
        }
    }

    /// Register `connection` under `session_id`. Joining the same channel again
    /// is a no-op; joining another channel moves the connection.
    pub fn join(&self, connection: &Connection, session_id: &str) {
        if let Some(existing) = self.members.get(&connection.id) {
            if existing.session_id == session_id {
                return;
            }
        }
        self.leave(&connection.id);

        self.members.insert(
            connection.id.clone(),
            Membership {
                session_id: session_id.to_string(),
                connection: connection.clone(),
            },
        );
        self.channels
            .entry(session_id.to_string())
            .or_default()
            .insert(connection.id.clone());

        debug!(connection_id = %connection.id, session_id, "joined channel");
    }

    pub fn leave(&self, connection_id: &ConnectionId) {
        let Some((_, membership)) = self.members.remove(connection_id) else {
            return;
        };

        // Emptiness is rechecked under the shard lock; a racing join keeps the channel.
        if let Some(mut ids) = self.channels.get_mut(&membership.session_id) {
            ids.remove(connection_id);
        }
        self.channels
            .remove_if(&membership.session_id, |_, ids| ids.is_empty());

        debug!(
            connection_id = %connection_id,
            session_id = %membership.session_id,
            "left channel"
        );
    }

    /// Deliver `event` to every connection joined to `session_id` on this process.
    ///
    /// A member whose writer is gone is pruned; the others still receive the event.
    pub fn publish(&self, session_id: &str, event: &Value) {
        let frame: Arc<str> = match self.format.encode(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(session_id, error = %e, "failed to serialize event");
                return;
            }
        };

        let recipients: Vec<Connection> = match self.channels.get(session_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.members.get(id).map(|m| m.connection.clone()))
                .collect(),
            None => {
                debug!(session_id, "no subscribers for session");
                return;
            }
        };

        let mut dead = Vec::new();
        for connection in &recipients {
            if !connection.send(Arc::clone(&frame)) {
                warn!(
                    connection_id = %connection.id,
                    session_id,
                    "failed to deliver event, dropping connection"
                );
                dead.push(connection.id.clone());
            }
        }

        debug!(
            session_id,
            recipients = recipients.len() - dead.len(),
            "published event"
        );

        for id in &dead {
            self.leave(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn members(&self, session_id: &str) -> Vec<ConnectionId> {
        self.channels
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(EventFormat::default())
    }
}
