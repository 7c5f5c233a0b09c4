//! File-backed trust-bundle source
//!
//! Watches a CA bundle on disk, typically a projected Secret or ConfigMap
//! volume. Kubernetes updates those by atomically swapping a symlink, so
//! the watcher re-reads the path on a short interval and compares contents;
//! an event is only emitted when the bytes actually change. Transient read
//! failures during a swap are logged and retried on the next tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use spiffe_common::{Error, Result};

use super::{BundleSource, Shared};

/// Default interval between bundle re-reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Trust-bundle source backed by a PEM file on disk
pub struct FileSource {
    shared: Arc<Shared>,
    watch_task: JoinHandle<()>,
}

impl FileSource {
    /// Create a file source, reading the bundle immediately and watching it
    /// for changes thereafter. Fails if the initial read fails.
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let path = path.into();
        let initial = std::fs::read(&path).map_err(|e| {
            Error::config(format!("failed to read root CAs file {path:?}: {e}"))
        })?;

        info!(path = %path.display(), bytes = initial.len(), "watching root CA bundle file");

        let shared = Arc::new(Shared::new(initial));
        let watch_shared = Arc::clone(&shared);
        let watch_task = tokio::spawn(async move {
            watch(watch_shared, path, poll_interval).await;
        });

        Ok(Self { shared, watch_task })
    }
}

async fn watch(shared: Arc<Shared>, path: PathBuf, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The constructor already read the initial contents.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match tokio::fs::read(&path).await {
            Ok(bundle) => {
                if shared.update(bundle) {
                    info!(path = %path.display(), "root CA bundle changed on file");
                }
            }
            Err(e) => {
                // Projected volumes momentarily remove the symlink while
                // swapping; the next tick sees the new target.
                warn!(path = %path.display(), error = %e, "failed to read root CAs file");
            }
        }
    }
}

impl BundleSource for FileSource {
    fn certificates_pem(&self) -> Vec<u8> {
        self.shared.certificates_pem()
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        self.shared.subscribe()
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        self.watch_task.abort();
        debug!("closed root CAs file watcher");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    const FAST_POLL: Duration = Duration::from_millis(20);

    async fn recv_event(rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .is_ok()
    }

    async fn expect_no_event(rx: &mut mpsc::Receiver<()>) {
        let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "expected no event");
    }

    #[tokio::test]
    async fn missing_file_fails_construction() {
        assert!(FileSource::new("/nonexistent/bundle.pem", FAST_POLL).is_err());
    }

    #[tokio::test]
    async fn serves_initial_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"INITIAL").unwrap();
        file.flush().unwrap();

        let source = FileSource::new(file.path(), FAST_POLL).unwrap();
        assert_eq!(source.certificates_pem(), b"INITIAL");
    }

    #[tokio::test]
    async fn emits_on_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"ONE").unwrap();

        let source = FileSource::new(&path, FAST_POLL).unwrap();
        let mut events = source.subscribe();

        // Rewriting identical contents is not a change.
        std::fs::write(&path, b"ONE").unwrap();
        expect_no_event(&mut events).await;

        std::fs::write(&path, b"TWO").unwrap();
        assert!(recv_event(&mut events).await, "expected a change event");
        assert_eq!(source.certificates_pem(), b"TWO");
    }

    #[tokio::test]
    async fn survives_symlink_style_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"ONE").unwrap();

        let source = FileSource::new(&path, FAST_POLL).unwrap();
        let mut events = source.subscribe();

        // Remove-then-recreate, as a projected volume swap appears to us.
        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&path, b"TWO").unwrap();

        assert!(recv_event(&mut events).await, "expected a change event");
        assert_eq!(source.certificates_pem(), b"TWO");
    }
}
