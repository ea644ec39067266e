use anyhow::Result;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Keep a subscription alive across broker restarts.
///
/// `open` is called again whenever the current stream ends or fails to open,
/// waiting `backoff` between attempts. `connected` tracks whether a stream is
/// currently live. The returned stream ends only once it is dropped.
pub fn resubscribing<F, Fut, S>(
    mut open: F,
    connected: Arc<AtomicBool>,
    backoff: Backoff,
) -> impl Stream<Item = String> + Send + 'static
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S>> + Send,
    S: Stream<Item = String> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded();

    tokio::spawn(async move {
        let mut delay = backoff.initial;
        loop {
            match open().await {
                Ok(stream) => {
                    connected.store(true, Ordering::Relaxed);
                    delay = backoff.initial;
                    info!("bus subscription established");

                    let mut stream = Box::pin(stream);
                    while let Some(payload) = stream.next().await {
                        if tx.unbounded_send(payload).is_err() {
                            return;
                        }
                    }
                    warn!("bus subscription ended");
                }
                Err(e) => warn!(error = %format!("{e:#}"), ?delay, "bus subscription failed"),
            }

            connected.store(false, Ordering::Relaxed);
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(backoff.max);
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures::stream::{self, BoxStream};
    use std::sync::atomic::AtomicUsize;

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    async fn next(incoming: &mut (impl Stream<Item = String> + Unpin)) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), incoming.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn resubscribes_after_stream_ends_and_open_fails() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connected = Arc::new(AtomicBool::new(false));

        let counter = Arc::clone(&attempts);
        let incoming = resubscribing(
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match attempt {
                        0 => Ok(stream::iter(vec!["first".to_string()]).boxed()),
                        1 => Err(anyhow!("connection refused")),
                        2 => Ok(stream::iter(vec!["second".to_string()])
                            .chain(stream::pending())
                            .boxed()),
                        _ => Ok::<BoxStream<'static, String>, _>(stream::pending().boxed()),
                    }
                }
            },
            Arc::clone(&connected),
            fast(),
        );
        let mut incoming = Box::pin(incoming);

        assert_eq!(next(&mut incoming).await.as_deref(), Some("first"));
        assert_eq!(next(&mut incoming).await.as_deref(), Some("second"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(connected.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn reports_disconnected_while_open_keeps_failing() {
        let connected = Arc::new(AtomicBool::new(true));
        let incoming = resubscribing(
            || async { Err::<BoxStream<'static, String>, _>(anyhow!("down")) },
            Arc::clone(&connected),
            fast(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connected.load(Ordering::Relaxed));
        drop(incoming);
    }
}
