//! Filesystem-backed volume store
//!
//! One subdirectory per volume ID under the driver's data root:
//!
//! ```text
//! <root>/<volume-id>/metadata.json   registration and issuance state
//! <root>/<volume-id>/data/<files>    the files bind-mounted into the Pod
//! ```
//!
//! `write_files` writes each file to a tempfile in the data directory,
//! fsyncs it, renames it into place and finally fsyncs the directory, so a
//! reader never observes a torn file and a crash never leaves a partial
//! trio visible under the final names.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use spiffe_common::{Error, Result, FS_GROUP_VOLUME_ATTRIBUTE};

const METADATA_FILE: &str = "metadata.json";
const DATA_DIR: &str = "data";

// File modes for volume contents. Without an fs-group the files stay
// world-readable like any other projected volume; with one, access narrows
// to the owning group.
const FILE_MODE_DEFAULT: u32 = 0o644;
const FILE_MODE_GROUP: u32 = 0o440;
const DIR_MODE_DEFAULT: u32 = 0o755;
const DIR_MODE_GROUP: u32 = 0o750;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-volume registration and issuance state, persisted as
/// `metadata.json` inside the volume's directory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// CSI-assigned opaque volume ID
    pub volume_id: String,

    /// Path the kubelet asked us to publish the volume at
    pub target_path: PathBuf,

    /// Name of the mounting Pod
    pub pod_name: String,

    /// Namespace of the mounting Pod
    pub pod_namespace: String,

    /// UID of the mounting Pod
    pub pod_uid: String,

    /// ServiceAccount of the mounting Pod
    pub service_account: String,

    /// ServiceAccount token captured at publish time, used for issuance and
    /// renewals on behalf of the Pod
    pub token: String,

    /// Raw volume context as supplied by the kubelet
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,

    /// When the certificate should next be re-issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_issuance_time: Option<DateTime<Utc>>,
}

impl Metadata {
    /// The filesystem group requested through the fs-group volume attribute
    pub fn fs_group(&self) -> Result<Option<u32>> {
        match self.volume_context.get(FS_GROUP_VOLUME_ATTRIBUTE) {
            None => Ok(None),
            Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
                Error::store(
                    &self.volume_id,
                    format!("invalid {FS_GROUP_VOLUME_ATTRIBUTE} attribute: {raw:?}"),
                )
            }),
        }
    }
}

/// Filesystem-backed store of managed volumes
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (creating if necessary) a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::internal_with_context("store", format!("creating data root: {e}")))?;
        Ok(Self { root })
    }

    fn volume_dir(&self, volume_id: &str) -> Result<PathBuf> {
        // Volume IDs become path components; refuse anything that could
        // escape the root.
        if volume_id.is_empty()
            || volume_id.contains('/')
            || volume_id.contains('\0')
            || volume_id == "."
            || volume_id == ".."
        {
            return Err(Error::store(volume_id, "invalid volume ID"));
        }
        Ok(self.root.join(volume_id))
    }

    /// Directory holding the files that get bind-mounted into the Pod
    pub fn data_dir(&self, volume_id: &str) -> Result<PathBuf> {
        Ok(self.volume_dir(volume_id)?.join(DATA_DIR))
    }

    /// Whether the volume is registered in this store
    pub fn is_registered(&self, volume_id: &str) -> bool {
        self.volume_dir(volume_id)
            .map(|d| d.join(METADATA_FILE).exists())
            .unwrap_or(false)
    }

    /// Register a volume: create its directories and persist metadata.
    ///
    /// Registration is idempotent; re-registering overwrites the metadata.
    pub fn register(&self, meta: &Metadata) -> Result<()> {
        let dir = self.volume_dir(&meta.volume_id)?;
        let data = dir.join(DATA_DIR);
        fs::create_dir_all(&data)
            .map_err(|e| Error::store(&meta.volume_id, format!("creating volume dirs: {e}")))?;

        let dir_mode = if meta.fs_group()?.is_some() {
            DIR_MODE_GROUP
        } else {
            DIR_MODE_DEFAULT
        };
        fs::set_permissions(&data, fs::Permissions::from_mode(dir_mode))
            .map_err(|e| Error::store(&meta.volume_id, format!("setting data dir mode: {e}")))?;
        if let Some(gid) = meta.fs_group()? {
            std::os::unix::fs::chown(&data, None, Some(gid))
                .map_err(|e| Error::store(&meta.volume_id, format!("chowning data dir: {e}")))?;
        }

        self.write_metadata(meta)
    }

    /// Read back a volume's metadata
    pub fn read_metadata(&self, volume_id: &str) -> Result<Metadata> {
        let path = self.volume_dir(volume_id)?.join(METADATA_FILE);
        let bytes = fs::read(&path)
            .map_err(|e| Error::store(volume_id, format!("reading metadata: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::store(volume_id, format!("decoding metadata: {e}")))
    }

    /// Persist a volume's metadata (tempfile + rename)
    pub fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        let dir = self.volume_dir(&meta.volume_id)?;
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::store(&meta.volume_id, format!("encoding metadata: {e}")))?;
        atomic_write(&dir, METADATA_FILE, &bytes, 0o600, None)
            .map_err(|e| Error::store(&meta.volume_id, format!("writing metadata: {e}")))?;
        sync_dir(&dir).map_err(|e| Error::store(&meta.volume_id, format!("syncing dir: {e}")))
    }

    /// Read a named file from the volume's data directory
    pub fn read_file(&self, volume_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.data_dir(volume_id)?.join(name);
        fs::read(&path).map_err(|e| Error::store(volume_id, format!("reading {name}: {e}")))
    }

    /// Atomically write a set of files into the volume's data directory.
    ///
    /// Related files (certificate, key, CA) are always rotated together
    /// through this call so readers never pair a new certificate with an old
    /// key. Honours the fs-group volume attribute on every written file.
    pub fn write_files(&self, meta: &Metadata, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let data = self.data_dir(&meta.volume_id)?;
        if !data.is_dir() {
            return Err(Error::store(&meta.volume_id, "volume is not registered"));
        }

        let fs_group = meta.fs_group()?;
        let mode = if fs_group.is_some() {
            FILE_MODE_GROUP
        } else {
            FILE_MODE_DEFAULT
        };

        for (name, contents) in files {
            if name.contains('/') || name.starts_with('.') {
                return Err(Error::store(
                    &meta.volume_id,
                    format!("invalid file name {name:?}"),
                ));
            }
            atomic_write(&data, name, contents, mode, fs_group)
                .map_err(|e| Error::store(&meta.volume_id, format!("writing {name}: {e}")))?;
        }

        sync_dir(&data).map_err(|e| Error::store(&meta.volume_id, format!("syncing dir: {e}")))?;
        debug!(volume_id = %meta.volume_id, files = files.len(), "wrote volume files");
        Ok(())
    }

    /// List the IDs of every registered volume
    pub fn list_volumes(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::internal_with_context("store", format!("listing volumes: {e}")))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::internal_with_context("store", format!("listing volumes: {e}")))?;
            if entry.path().join(METADATA_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a volume and everything under it
    pub fn remove_volume(&self, volume_id: &str) -> Result<()> {
        let dir = self.volume_dir(volume_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::store(volume_id, format!("removing volume: {e}")))?;
        }
        Ok(())
    }
}

/// Write `contents` to `dir/name` via a tempfile in the same directory.
fn atomic_write(
    dir: &Path,
    name: &str,
    contents: &[u8],
    mode: u32,
    fs_group: Option<u32>,
) -> std::io::Result<()> {
    let tmp_name = format!(
        ".{name}.tmp-{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let tmp_path = dir.join(&tmp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;
    if let Err(e) = write_and_finalize(&mut file, &tmp_path, contents, mode, fs_group) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    fs::rename(&tmp_path, dir.join(name))
}

fn write_and_finalize(
    file: &mut File,
    tmp_path: &Path,
    contents: &[u8],
    mode: u32,
    fs_group: Option<u32>,
) -> std::io::Result<()> {
    file.write_all(contents)?;
    file.sync_all()?;
    fs::set_permissions(tmp_path, fs::Permissions::from_mode(mode))?;
    if let Some(gid) = fs_group {
        std::os::unix::fs::chown(tmp_path, None, Some(gid))?;
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::MetadataExt;

    fn metadata(volume_id: &str) -> Metadata {
        Metadata {
            volume_id: volume_id.to_string(),
            target_path: PathBuf::from("/var/lib/kubelet/pods/x/volumes/y/mount"),
            pod_name: "sleep-7d9f".to_string(),
            pod_namespace: "sandbox".to_string(),
            pod_uid: "0b36d56e".to_string(),
            service_account: "sleep".to_string(),
            token: "header.payload.signature".to_string(),
            volume_context: BTreeMap::new(),
            next_issuance_time: None,
        }
    }

    #[test]
    fn register_and_read_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let mut meta = metadata("csi-1");
        meta.next_issuance_time = Some(Utc::now());
        store.register(&meta).unwrap();

        let read = store.read_metadata("csi-1").unwrap();
        assert_eq!(read, meta);
        assert!(store.is_registered("csi-1"));
        assert!(!store.is_registered("csi-2"));
    }

    #[test]
    fn write_files_lands_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let meta = metadata("csi-1");
        store.register(&meta).unwrap();

        let files = BTreeMap::from([
            ("tls.crt".to_string(), b"CERT".to_vec()),
            ("tls.key".to_string(), b"KEY".to_vec()),
            ("ca.crt".to_string(), b"CA".to_vec()),
        ]);
        store.write_files(&meta, &files).unwrap();

        assert_eq!(store.read_file("csi-1", "tls.crt").unwrap(), b"CERT");
        assert_eq!(store.read_file("csi-1", "tls.key").unwrap(), b"KEY");
        assert_eq!(store.read_file("csi-1", "ca.crt").unwrap(), b"CA");

        // No tempfiles survive a successful write.
        let leftovers: Vec<_> = fs::read_dir(store.data_dir("csi-1").unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "leftover tempfiles: {leftovers:?}");
    }

    #[test]
    fn rewrites_replace_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let meta = metadata("csi-1");
        store.register(&meta).unwrap();

        let first = BTreeMap::from([("ca.crt".to_string(), b"OLD".to_vec())]);
        store.write_files(&meta, &first).unwrap();
        let second = BTreeMap::from([("ca.crt".to_string(), b"NEW".to_vec())]);
        store.write_files(&meta, &second).unwrap();

        assert_eq!(store.read_file("csi-1", "ca.crt").unwrap(), b"NEW");
    }

    #[test]
    fn unregistered_volume_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let meta = metadata("csi-ghost");

        let files = BTreeMap::from([("tls.crt".to_string(), b"CERT".to_vec())]);
        assert!(store.write_files(&meta, &files).is_err());
    }

    #[test]
    fn hostile_volume_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        for id in ["", "..", "a/b", "."] {
            assert!(store.read_metadata(id).is_err(), "expected rejection of {id:?}");
        }
    }

    #[test]
    fn file_names_cannot_traverse() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        let meta = metadata("csi-1");
        store.register(&meta).unwrap();

        let files = BTreeMap::from([("../escape".to_string(), b"X".to_vec())]);
        assert!(store.write_files(&meta, &files).is_err());
    }

    #[test]
    fn list_and_remove_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        store.register(&metadata("csi-b")).unwrap();
        store.register(&metadata("csi-a")).unwrap();
        assert_eq!(store.list_volumes().unwrap(), vec!["csi-a", "csi-b"]);

        store.remove_volume("csi-a").unwrap();
        assert_eq!(store.list_volumes().unwrap(), vec!["csi-b"]);

        // Removing twice is fine.
        store.remove_volume("csi-a").unwrap();
    }

    #[test]
    fn fs_group_narrows_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let mut meta = metadata("csi-1");
        store.register(&meta).unwrap();

        // Use our own gid so the chown is permitted in unprivileged tests.
        let own_gid = fs::metadata(dir.path()).unwrap().gid();
        meta.volume_context
            .insert(FS_GROUP_VOLUME_ATTRIBUTE.to_string(), own_gid.to_string());
        store.register(&meta).unwrap();

        let files = BTreeMap::from([("tls.key".to_string(), b"KEY".to_vec())]);
        store.write_files(&meta, &files).unwrap();

        let path = store.data_dir("csi-1").unwrap().join("tls.key");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o440);
        assert_eq!(fs::metadata(&path).unwrap().gid(), own_gid);
    }

    #[test]
    fn invalid_fs_group_attribute_is_an_error() {
        let mut meta = metadata("csi-1");
        meta.volume_context.insert(
            FS_GROUP_VOLUME_ATTRIBUTE.to_string(),
            "not-a-gid".to_string(),
        );
        assert!(meta.fs_group().is_err());
    }
}
