//! Key listing helpers: regex filters and streaming producers

use futures::StreamExt;
use regex::RegexSet;
use std::time::Duration;
use strata_core::effects::KeyStream;
use strata_core::{Result, StrataError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Matches a key when any of its patterns does
#[derive(Debug, Clone)]
pub struct KeyFilter {
    patterns: RegexSet,
}

impl KeyFilter {
    /// Compile `patterns`. An empty pattern list matches nothing.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| StrataError::invalid(format!("invalid key pattern: {e}")))?;
        Ok(Self { patterns })
    }

    /// Whether `key` matches at least one pattern
    pub fn matches(&self, key: &str) -> bool {
        self.patterns.is_match(key)
    }
}

/// Parameters of a streaming key query
#[derive(Debug, Clone)]
pub(crate) struct StreamSettings {
    pub buffer: usize,
    pub inactivity_timeout: Duration,
}

/// Drain `keys` into a bounded channel from a tracked task.
///
/// The producer stops when the source ends or errors, when no key arrives
/// within the inactivity timeout, when either token is cancelled, or when the
/// receiver is dropped.
pub(crate) fn spawn_key_stream(
    tasks: &TaskTracker,
    mut keys: KeyStream,
    filter: Option<KeyFilter>,
    settings: StreamSettings,
    cancel: CancellationToken,
    scope: CancellationToken,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(settings.buffer);
    tasks.spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = scope.cancelled() => break,
                _ = tx.closed() => break,
                next = tokio::time::timeout(settings.inactivity_timeout, keys.next()) => next,
            };
            let key = match next {
                Ok(Some(Ok(key))) => key,
                Ok(Some(Err(err))) => {
                    warn!(error = %err, "Streaming query failed");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        timeout_ms = settings.inactivity_timeout.as_millis() as u64,
                        "Streaming query idle, closing"
                    );
                    break;
                }
            };
            if filter.as_ref().is_some_and(|f| !f.matches(&key)) {
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = scope.cancelled() => break,
                sent = tx.send(key) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn keys(items: &[&str]) -> KeyStream {
        let items: Vec<_> = items.iter().map(|k| Ok(k.to_string())).collect();
        stream::iter(items).boxed()
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            buffer: 4,
            inactivity_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn filter_is_a_union() {
        let filter = KeyFilter::new(["^/a/", "x$"]).unwrap();
        assert!(filter.matches("/a/1"));
        assert!(filter.matches("/b/x"));
        assert!(!filter.matches("/b/y"));

        let none = KeyFilter::new(Vec::<String>::new()).unwrap();
        assert!(!none.matches("/a/1"));
        assert!(KeyFilter::new(["("]).is_err());
    }

    #[tokio::test]
    async fn stream_filters_and_finishes() {
        let tasks = TaskTracker::new();
        let mut rx = spawn_key_stream(
            &tasks,
            keys(&["/a/1", "/b/2", "/a/3"]),
            Some(KeyFilter::new(["^/a/"]).unwrap()),
            settings(),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        let mut seen = Vec::new();
        while let Some(key) = rx.recv().await {
            seen.push(key);
        }
        assert_eq!(seen, vec!["/a/1", "/a/3"]);
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_times_out() {
        let tasks = TaskTracker::new();
        let stalled = keys(&["/a/1"]).chain(stream::pending()).boxed();
        let mut rx = spawn_key_stream(
            &tasks,
            stalled,
            None,
            settings(),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        assert_eq!(rx.recv().await.as_deref(), Some("/a/1"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let mut rx = spawn_key_stream(
            &tasks,
            stream::pending().boxed(),
            None,
            settings(),
            cancel.clone(),
            CancellationToken::new(),
        );
        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        tasks.close();
        tasks.wait().await;
    }
}
