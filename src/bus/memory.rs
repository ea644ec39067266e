use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::Transport;

/// In-process pub/sub medium. Several [`super::RelayBus`] instances sharing one
/// `MemoryTransport` behave like relay processes sharing a Redis channel.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    tx: broadcast::Sender<String>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self.tx.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory bus subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: String) -> Result<()> {
        // No subscribers means no other instance to reach.
        let _ = self.tx.send(payload);
        Ok(())
    }
}
