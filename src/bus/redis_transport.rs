use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{resubscribing, Backoff, Transport};

/// Redis pub/sub medium shared by every relay instance behind the load balancer.
///
/// Publishing goes through a [`ConnectionManager`], which reconnects on its own
/// after a Redis restart. The subscription is reopened with backoff.
#[derive(Clone)]
pub struct RedisTransport {
    connection: ConnectionManager,
    channel: String,
    subscribed: Arc<AtomicBool>,
}

impl RedisTransport {
    /// Returns the transport and the stream of payloads published by any instance.
    pub async fn connect(
        url: &str,
        channel: &str,
    ) -> Result<(Self, impl Stream<Item = String> + Send + 'static)> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;

        let connection = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;

        let subscribed = Arc::new(AtomicBool::new(false));
        let channel = channel.to_string();

        let incoming = {
            let channel = channel.clone();
            resubscribing(
                move || subscribe(client.clone(), channel.clone()),
                Arc::clone(&subscribed),
                Backoff::default(),
            )
        };

        Ok((
            Self {
                connection,
                channel,
                subscribed,
            },
            incoming,
        ))
    }
}

async fn subscribe(
    client: redis::Client,
    channel: String,
) -> Result<impl Stream<Item = String> + Send + 'static> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to open redis subscription")?;
    pubsub
        .subscribe(&channel)
        .await
        .with_context(|| format!("failed to subscribe to {channel}"))?;

    info!(%channel, "subscribed to redis bus");

    Ok(pubsub.into_on_message().filter_map(|msg| {
        let payload = match msg.get_payload::<String>() {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "dropping non-text redis message");
                None
            }
        };
        futures::future::ready(payload)
    }))
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, payload: String) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<_, i64>(&mut connection)
            .await
            .context("redis publish failed")?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }
}
