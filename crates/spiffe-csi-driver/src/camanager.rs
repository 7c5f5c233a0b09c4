//! CA bundle distribution to managed volumes
//!
//! Subscribes to the trust-bundle source and, on every change, rewrites the
//! CA file of every managed volume. Each pass applies a single bundle
//! snapshot; a failed pass schedules a retry after a fixed period without
//! blocking the subscription channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use spiffe_common::Result;

use crate::rootca::BundleSource;
use crate::store::Store;

/// Default period between retries of a failed rotation sweep
pub const DEFAULT_UPDATE_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Distributes trust-bundle changes to every managed volume
pub struct CaManager {
    store: Store,
    root_cas: Arc<dyn BundleSource>,
    cert_file_name: String,
    key_file_name: String,
    ca_file_name: String,
}

impl CaManager {
    /// Construct a new CA manager over the given store and bundle source
    pub fn new(
        store: Store,
        root_cas: Arc<dyn BundleSource>,
        cert_file_name: impl Into<String>,
        key_file_name: impl Into<String>,
        ca_file_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            root_cas,
            cert_file_name: cert_file_name.into(),
            key_file_name: key_file_name.into(),
            ca_file_name: ca_file_name.into(),
        }
    }

    /// Subscribe to bundle events and update managed volumes until the task
    /// is cancelled. Blocking; callers spawn this on its own task.
    pub async fn run(self, update_retry_period: Duration) {
        let mut watcher = self.root_cas.subscribe();

        // updateChan carries both fresh bundle events and retries of failed
        // sweeps. Capacity 1: a pass already scheduled absorbs later
        // triggers, and the final pass converges on the newest snapshot.
        let (update_tx, mut update_rx) = mpsc::channel::<()>(1);

        info!("starting root CA file manager");

        loop {
            tokio::select! {
                event = watcher.recv() => {
                    if event.is_none() {
                        info!("closing root CA file manager, bundle source went away");
                        return;
                    }
                    let _ = update_tx.try_send(());
                }

                Some(()) = update_rx.recv() => {
                    info!("root CA file event received, updating managed volumes");

                    if let Err(e) = self.update_root_ca_files() {
                        error!(error = %e, "failed to update root CA files on managed volumes");

                        let retry_tx = update_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(update_retry_period).await;
                            let _ = retry_tx.try_send(());
                        });
                        continue;
                    }

                    info!("updated root CA files on managed volumes");
                }
            }
        }
    }

    /// Rewrite the CA file of every managed volume with the current bundle.
    ///
    /// The bundle is snapshotted once; every volume in this pass receives
    /// the same bytes. Volumes whose on-disk CA already equals the snapshot
    /// are skipped.
    pub fn update_root_ca_files(&self) -> Result<()> {
        let bundle = self.root_cas.certificates_pem();

        for volume_id in self.store.list_volumes()? {
            let meta = self.store.read_metadata(&volume_id)?;

            let cert_data = self.store.read_file(&volume_id, &self.cert_file_name)?;
            let key_data = self.store.read_file(&volume_id, &self.key_file_name)?;

            // No need to re-write CA data again if it hasn't changed on file.
            if let Ok(ca_data) = self.store.read_file(&volume_id, &self.ca_file_name) {
                if ca_data == bundle {
                    continue;
                }
            }

            let files = BTreeMap::from([
                (self.cert_file_name.clone(), cert_data),
                (self.key_file_name.clone(), key_data),
                (self.ca_file_name.clone(), bundle.clone()),
            ]);
            self.store.write_files(&meta, &files)?;

            debug!(volume_id = %volume_id, "updated CA file on volume");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::rootca::MemorySource;
    use crate::store::Metadata;

    fn materialised_volume(store: &Store, volume_id: &str, ca: &[u8]) -> Metadata {
        let meta = Metadata {
            volume_id: volume_id.to_string(),
            target_path: PathBuf::from("/target"),
            pod_name: "sleep".to_string(),
            pod_namespace: "sandbox".to_string(),
            pod_uid: "uid".to_string(),
            service_account: "sleep".to_string(),
            token: "t.t.t".to_string(),
            volume_context: BTreeMap::new(),
            next_issuance_time: None,
        };
        store.register(&meta).unwrap();
        let files = BTreeMap::from([
            ("tls.crt".to_string(), b"CERT".to_vec()),
            ("tls.key".to_string(), b"KEY".to_vec()),
            ("ca.crt".to_string(), ca.to_vec()),
        ]);
        store.write_files(&meta, &files).unwrap();
        meta
    }

    fn manager(store: &Store, source: Arc<dyn BundleSource>) -> CaManager {
        CaManager::new(store.clone(), source, "tls.crt", "tls.key", "ca.crt")
    }

    #[tokio::test]
    async fn sweep_rewrites_stale_ca_files_on_every_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        materialised_volume(&store, "csi-1", b"OLD");
        materialised_volume(&store, "csi-2", b"OLD");

        let (_tx, rx) = mpsc::channel(1);
        let source = Arc::new(MemorySource::new(b"NEW-BUNDLE".to_vec(), rx));
        manager(&store, source).update_root_ca_files().unwrap();

        for volume_id in ["csi-1", "csi-2"] {
            assert_eq!(store.read_file(volume_id, "ca.crt").unwrap(), b"NEW-BUNDLE");
            // Certificate and key survive the rotation untouched.
            assert_eq!(store.read_file(volume_id, "tls.crt").unwrap(), b"CERT");
            assert_eq!(store.read_file(volume_id, "tls.key").unwrap(), b"KEY");
        }
    }

    #[tokio::test]
    async fn sweep_skips_volumes_already_on_the_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        materialised_volume(&store, "csi-1", b"BUNDLE");

        let (_tx, rx) = mpsc::channel(1);
        let source = Arc::new(MemorySource::new(b"BUNDLE".to_vec(), rx));
        let manager = manager(&store, source);

        let ca_path = store.data_dir("csi-1").unwrap().join("ca.crt");
        let before = std::fs::metadata(&ca_path).unwrap().modified().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.update_root_ca_files().unwrap();

        let after = std::fs::metadata(&ca_path).unwrap().modified().unwrap();
        assert_eq!(before, after, "unchanged bundle must cause zero writes");
    }

    #[tokio::test]
    async fn sweep_fails_on_unmaterialised_volume() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        // Registered but never materialised: no files to pair the CA with.
        let meta = Metadata {
            volume_id: "csi-empty".to_string(),
            target_path: PathBuf::from("/target"),
            pod_name: "sleep".to_string(),
            pod_namespace: "sandbox".to_string(),
            pod_uid: "uid".to_string(),
            service_account: "sleep".to_string(),
            token: "t.t.t".to_string(),
            volume_context: BTreeMap::new(),
            next_issuance_time: None,
        };
        store.register(&meta).unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let source = Arc::new(MemorySource::new(b"BUNDLE".to_vec(), rx));
        assert!(manager(&store, source).update_root_ca_files().is_err());
    }

    #[tokio::test]
    async fn run_applies_bundle_changes_as_they_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        materialised_volume(&store, "csi-1", b"OLD");

        let (bundle_tx, bundle_rx) = mpsc::channel(1);
        let source = Arc::new(MemorySource::new(b"OLD".to_vec(), bundle_rx));
        let manager = manager(&store, source);

        let task = tokio::spawn(manager.run(Duration::from_millis(20)));

        bundle_tx.send(b"ROTATED".to_vec()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if store.read_file("csi-1", "ca.crt").unwrap() == b"ROTATED" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "volume never received the rotated bundle"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        task.abort();
    }
}
