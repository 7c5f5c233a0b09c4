//! Runtime issuance configuration
//!
//! Watches a single ConfigMap and swaps the active issuer reference under
//! the manager's write lock. Deleting the ConfigMap reverts to the issuer
//! configured at startup; if none was configured, the active reference
//! becomes empty and request generation fails until a new ConfigMap
//! appears. The watch is re-established with a short back-off whenever the
//! stream ends or errors.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use spiffe_common::crd::IssuerRef;

use crate::manager::SharedIssuer;

/// ConfigMap key holding the issuer name
pub const ISSUER_NAME_KEY: &str = "issuer-name";
/// ConfigMap key holding the issuer kind
pub const ISSUER_KIND_KEY: &str = "issuer-kind";
/// ConfigMap key holding the issuer group
pub const ISSUER_GROUP_KEY: &str = "issuer-group";

const WATCH_BACKOFF_MIN: Duration = Duration::from_secs(1);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Watches the runtime issuance ConfigMap and maintains the active issuer
pub struct RuntimeConfigWatcher {
    client: Client,
    namespace: String,
    name: String,
    issuer: SharedIssuer,
    original_issuer: Option<IssuerRef>,
}

impl RuntimeConfigWatcher {
    /// Create a watcher over `(namespace, name)`, swapping issuers into
    /// `issuer`. `original_issuer` is what a deletion reverts to.
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        issuer: SharedIssuer,
        original_issuer: Option<IssuerRef>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            issuer,
            original_issuer,
        }
    }

    /// Watch until the task is cancelled. The watch is recreated with
    /// bounded back-off whenever the underlying stream ends.
    pub async fn run(self) {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.name));

        info!(
            namespace = %self.namespace,
            name = %self.name,
            "watching runtime issuance ConfigMap"
        );

        let mut backoff = WATCH_BACKOFF_MIN;
        loop {
            let stream = watcher::watcher(api.clone(), config.clone());
            let mut stream = std::pin::pin!(stream);

            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Apply(cm)) | Ok(Event::InitApply(cm)) => {
                        backoff = WATCH_BACKOFF_MIN;
                        self.apply(&cm);
                    }
                    Ok(Event::Delete(cm)) => {
                        backoff = WATCH_BACKOFF_MIN;
                        info!(name = %cm.name_any(), "runtime issuance ConfigMap deleted");
                        self.revert();
                    }
                    Ok(Event::Init) | Ok(Event::InitDone) => {
                        debug!("runtime issuance watch synced");
                    }
                    Err(e) => {
                        warn!(error = %e, "runtime issuance watch error");
                    }
                }
            }

            warn!(
                retry_in_secs = backoff.as_secs(),
                "runtime issuance watch ended, re-establishing"
            );
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, WATCH_BACKOFF_MAX);
        }
    }

    fn apply(&self, cm: &ConfigMap) {
        match issuer_from_configmap(cm) {
            Some(new_issuer) => {
                let mut active = self.issuer.write().expect("issuer lock poisoned");
                if active.as_ref() != Some(&new_issuer) {
                    info!(issuer = %new_issuer, "switching active issuerRef");
                    *active = Some(new_issuer);
                }
            }
            None => {
                warn!(
                    name = %cm.name_any(),
                    "runtime issuance ConfigMap is missing issuer keys, ignoring"
                );
            }
        }
    }

    fn revert(&self) {
        let mut active = self.issuer.write().expect("issuer lock poisoned");
        match &self.original_issuer {
            Some(original) => {
                info!(issuer = %original, "reverting to startup issuerRef");
                *active = Some(original.clone());
            }
            None => {
                warn!("no startup issuerRef to revert to, issuance disabled until reconfigured");
                *active = None;
            }
        }
    }
}

/// Extract the issuer reference from the ConfigMap's data. All three keys
/// must be present and non-empty.
pub fn issuer_from_configmap(cm: &ConfigMap) -> Option<IssuerRef> {
    let data = cm.data.as_ref()?;
    let name = data.get(ISSUER_NAME_KEY).filter(|v| !v.is_empty())?;
    let kind = data.get(ISSUER_KIND_KEY).filter(|v| !v.is_empty())?;
    let group = data.get(ISSUER_GROUP_KEY).filter(|v| !v.is_empty())?;
    Some(IssuerRef::new(name, kind, group))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::{Arc, RwLock};

    fn configmap(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn watcher_with(
        issuer: SharedIssuer,
        original: Option<IssuerRef>,
    ) -> RuntimeConfigWatcher {
        // The client is only exercised by run(); apply/revert are pure over
        // the shared cell.
        RuntimeConfigWatcher {
            client: Client::try_from(kube::Config::new("http://localhost:8080".parse().unwrap()))
                .expect("local config"),
            namespace: "cert-manager".to_string(),
            name: "spiffe-issuance".to_string(),
            issuer,
            original_issuer: original,
        }
    }

    #[test]
    fn complete_configmap_yields_issuer() {
        let cm = configmap(&[
            (ISSUER_NAME_KEY, "second-ca"),
            (ISSUER_KIND_KEY, "ClusterIssuer"),
            (ISSUER_GROUP_KEY, "cert-manager.io"),
        ]);
        assert_eq!(
            issuer_from_configmap(&cm),
            Some(IssuerRef::new("second-ca", "ClusterIssuer", "cert-manager.io"))
        );
    }

    #[test]
    fn missing_or_empty_keys_yield_nothing() {
        let missing = configmap(&[(ISSUER_NAME_KEY, "ca"), (ISSUER_KIND_KEY, "Issuer")]);
        assert_eq!(issuer_from_configmap(&missing), None);

        let empty = configmap(&[
            (ISSUER_NAME_KEY, "ca"),
            (ISSUER_KIND_KEY, ""),
            (ISSUER_GROUP_KEY, "cert-manager.io"),
        ]);
        assert_eq!(issuer_from_configmap(&empty), None);

        assert_eq!(issuer_from_configmap(&ConfigMap::default()), None);
    }

    #[tokio::test]
    async fn apply_swaps_and_delete_reverts_to_original() {
        let startup = IssuerRef::new("first-ca", "ClusterIssuer", "cert-manager.io");
        let issuer: SharedIssuer = Arc::new(RwLock::new(Some(startup.clone())));
        let watcher = watcher_with(Arc::clone(&issuer), Some(startup.clone()));

        watcher.apply(&configmap(&[
            (ISSUER_NAME_KEY, "second-ca"),
            (ISSUER_KIND_KEY, "Issuer"),
            (ISSUER_GROUP_KEY, "cert-manager.io"),
        ]));
        assert_eq!(
            issuer.read().unwrap().as_ref().map(|i| i.name.clone()),
            Some("second-ca".to_string())
        );

        watcher.revert();
        assert_eq!(*issuer.read().unwrap(), Some(startup));
    }

    #[tokio::test]
    async fn incomplete_update_leaves_active_issuer_alone() {
        let startup = IssuerRef::new("first-ca", "ClusterIssuer", "cert-manager.io");
        let issuer: SharedIssuer = Arc::new(RwLock::new(Some(startup.clone())));
        let watcher = watcher_with(Arc::clone(&issuer), Some(startup.clone()));

        watcher.apply(&configmap(&[(ISSUER_NAME_KEY, "half-configured")]));
        assert_eq!(*issuer.read().unwrap(), Some(startup));
    }

    #[tokio::test]
    async fn delete_without_startup_issuer_disables_issuance() {
        let issuer: SharedIssuer = Arc::new(RwLock::new(Some(IssuerRef::new(
            "runtime-ca",
            "Issuer",
            "cert-manager.io",
        ))));
        let watcher = watcher_with(Arc::clone(&issuer), None);

        watcher.revert();
        assert_eq!(*issuer.read().unwrap(), None);
    }
}
