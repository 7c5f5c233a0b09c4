//! In-memory trust-bundle source
//!
//! Holds the CA bundle in memory and accepts replacements over a channel.
//! Used by test harnesses to drive rotation without touching a filesystem.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BundleSource, Shared};

/// Trust-bundle source fed from a channel of bundle bytes
pub struct MemorySource {
    shared: Arc<Shared>,
    feed_task: JoinHandle<()>,
}

impl MemorySource {
    /// Create a memory source with the given initial bundle. Each value
    /// received on `bundles` replaces the current bundle and notifies
    /// subscribers; identical bundles are absorbed silently.
    pub fn new(initial: Vec<u8>, mut bundles: mpsc::Receiver<Vec<u8>>) -> Self {
        let shared = Arc::new(Shared::new(initial));
        let feed_shared = Arc::clone(&shared);
        let feed_task = tokio::spawn(async move {
            while let Some(bundle) = bundles.recv().await {
                feed_shared.update(bundle);
            }
        });

        Self { shared, feed_task }
    }
}

impl BundleSource for MemorySource {
    fn certificates_pem(&self) -> Vec<u8> {
        self.shared.certificates_pem()
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        self.shared.subscribe()
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.feed_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn replacement_notifies_subscribers() {
        let (tx, rx) = mpsc::channel(4);
        let source = MemorySource::new(b"OLD".to_vec(), rx);
        let mut events = source.subscribe();

        tx.send(b"NEW".to_vec()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("expected a change event");
        assert_eq!(source.certificates_pem(), b"NEW");
    }

    #[tokio::test]
    async fn identical_bundle_is_not_an_event() {
        let (tx, rx) = mpsc::channel(4);
        let source = MemorySource::new(b"SAME".to_vec(), rx);
        let mut events = source.subscribe();

        tx.send(b"SAME".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(got.is_err(), "identical bundle must not broadcast");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_hear_the_change() {
        let (tx, rx) = mpsc::channel(4);
        let source = MemorySource::new(Vec::new(), rx);
        let mut first = source.subscribe();
        let mut second = source.subscribe();

        tx.send(b"BUNDLE".to_vec()).await.unwrap();
        for events in [&mut first, &mut second] {
            tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("each subscriber gets the event");
        }
    }
}
