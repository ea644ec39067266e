//! Cross-instance fan-out.
//!
//! Every relay process owns a local [`ChannelRegistry`]. A [`Bus`] decides how
//! a publish reaches registries in other processes: [`LocalBus`] for a single
//! process, [`RelayBus`] over a shared pub/sub [`Transport`] otherwise.

mod memory;
mod redis_transport;
mod subscription;

pub use memory::MemoryTransport;
pub use redis_transport::RedisTransport;
pub use subscription::{resubscribing, Backoff};

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::ChannelRegistry;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Deliver `event` to every connection joined to `session_id`, on every instance.
    async fn publish(&self, session_id: &str, event: &Value) -> Result<()>;

    /// Whether events from other instances are currently arriving.
    fn is_connected(&self) -> bool {
        true
    }
}

pub struct LocalBus {
    registry: Arc<ChannelRegistry>,
}

impl LocalBus {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, session_id: &str, event: &Value) -> Result<()> {
        self.registry.publish(session_id, event);
        Ok(())
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, payload: String) -> Result<()>;

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin: Uuid,
    pub session_id: String,
    pub event: Value,
}

/// Multi-instance bus.
///
/// Publishes locally, then hands an envelope to the transport. The listener
/// replays envelopes from other instances into the local registry and skips
/// its own, so each member sees an event once. A failed transport send is
/// logged and not retried; local members already have the event.
pub struct RelayBus<T> {
    instance_id: Uuid,
    registry: Arc<ChannelRegistry>,
    transport: T,
}

impl<T: Transport> RelayBus<T> {
    pub fn new(registry: Arc<ChannelRegistry>, transport: T) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            registry,
            transport,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn listen<S>(&self, incoming: S) -> JoinHandle<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let instance_id = self.instance_id;
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let mut incoming = Box::pin(incoming);
            while let Some(payload) = incoming.next().await {
                deliver_remote(instance_id, &registry, &payload);
            }
            warn!(%instance_id, "cross-instance subscription ended");
        })
    }
}

fn deliver_remote(instance_id: Uuid, registry: &ChannelRegistry, payload: &str) {
    match serde_json::from_str::<BusEnvelope>(payload) {
        Ok(envelope) if envelope.origin == instance_id => {}
        Ok(envelope) => {
            debug!(
                origin = %envelope.origin,
                session_id = %envelope.session_id,
                "delivering event from another instance"
            );
            registry.publish(&envelope.session_id, &envelope.event);
        }
        Err(e) => warn!(error = %e, "dropping malformed bus envelope"),
    }
}

#[async_trait]
impl<T: Transport> Bus for RelayBus<T> {
    async fn publish(&self, session_id: &str, event: &Value) -> Result<()> {
        self.registry.publish(session_id, event);

        let envelope = BusEnvelope {
            origin: self.instance_id,
            session_id: session_id.to_string(),
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        if let Err(e) = self.transport.send(payload).await {
            warn!(error = %format!("{e:#}"), session_id, "event not relayed to other instances");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
