//! spiffe-csi-driver - CSI node driver provisioning SPIFFE identities to
//! Pods via cert-manager CertificateRequests

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::{info, warn};

use spiffe_common::crd::IssuerRef;
use spiffe_common::{duration, DRIVER_NAME, RESERVED_ANNOTATION_PREFIX};
use spiffe_csi_driver::camanager::{CaManager, DEFAULT_UPDATE_RETRY_PERIOD};
use spiffe_csi_driver::manager::{Manager, Options};
use spiffe_csi_driver::rootca::{BundleSource, FileSource, DEFAULT_POLL_INTERVAL};
use spiffe_csi_driver::runtime_config::RuntimeConfigWatcher;
use spiffe_csi_driver::server::{self, IdentityService, NodeService};
use spiffe_csi_driver::store::Store;
use spiffe_csi_driver::DRIVER_VERSION;

/// CSI driver that requests SPIFFE certificates from cert-manager on behalf
/// of the mounting Pod.
#[derive(Parser, Debug)]
#[command(name = "spiffe-csi-driver", version, about, long_about = None)]
struct Cli {
    /// Name of the node the driver is running on
    #[arg(long)]
    node_id: String,

    /// Path to the data directory used to store managed volumes
    #[arg(long)]
    data_root: String,

    /// Path to the unix socket used to listen for gRPC requests
    #[arg(long)]
    endpoint: String,

    /// The trust domain that will be requested for on created
    /// CertificateRequests
    #[arg(long, default_value = "cluster.local")]
    trust_domain: String,

    /// The duration that created CertificateRequests will use, as a Go
    /// duration string
    #[arg(long, default_value = "1h")]
    certificate_request_duration: String,

    /// Name of the issuer that CertificateRequests will be created for.
    /// When unset, issuance requires the runtime issuance ConfigMap.
    #[arg(long)]
    issuer_name: Option<String>,

    /// Kind of the issuer that CertificateRequests will be created for
    #[arg(long, default_value = "ClusterIssuer")]
    issuer_kind: String,

    /// Group of the issuer that CertificateRequests will be created for
    #[arg(long, default_value = "cert-manager.io")]
    issuer_group: String,

    /// The file name that signed certificates will be written to within
    /// the pod's volume directory
    #[arg(long, default_value = "tls.crt")]
    file_name_certificate: String,

    /// The file name that the certificate's private key will be written to
    /// within the pod's volume directory
    #[arg(long, default_value = "tls.key")]
    file_name_key: String,

    /// The file name that the root CA bundle will be written to within the
    /// pod's volume directory
    #[arg(long, default_value = "ca.crt")]
    file_name_ca: String,

    /// File path read by the driver and written to all managed volumes at
    /// the --file-name-ca location. If undefined, no CA file is written.
    #[arg(long)]
    source_ca_bundle: Option<String>,

    /// Include a DNS SAN equal to the ServiceAccount name in generated CSRs
    #[arg(long, default_value_t = false)]
    include_dns_san: bool,

    /// Extra annotations to set on created CertificateRequests, as
    /// comma-separated key=value pairs. Keys under the driver's reserved
    /// prefix are dropped.
    #[arg(long, default_value = "")]
    extra_certificate_request_annotations: String,

    /// Name of the ConfigMap carrying runtime issuance configuration.
    /// Active only together with the namespace flag.
    #[arg(long)]
    runtime_issuance_config_map_name: Option<String>,

    /// Namespace of the ConfigMap carrying runtime issuance configuration
    #[arg(long)]
    runtime_issuance_config_map_namespace: Option<String>,
}

/// Parse `k=v,k2=v2` into a map, dropping keys under the reserved prefix.
fn parse_extra_annotations(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    for entry in raw.split(',').filter(|e| !e.is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("invalid annotation entry {entry:?}, expected key=value"))?;
        if key.starts_with(RESERVED_ANNOTATION_PREFIX) {
            warn!(
                key,
                "custom annotations must not begin with {RESERVED_ANNOTATION_PREFIX}, skipping"
            );
            continue;
        }
        annotations.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(annotations)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spiffe_common::install_crypto_provider();

    let cli = Cli::parse();

    spiffe_common::telemetry::init("spiffe-csi-driver")
        .context("failed to initialize telemetry")?;
    info!(version = DRIVER_VERSION, node = %cli.node_id, "starting SPIFFE CSI driver");

    let certificate_request_duration = duration::parse(&cli.certificate_request_duration)
        .context("invalid --certificate-request-duration")?;
    let extra_annotations = parse_extra_annotations(&cli.extra_certificate_request_annotations)?;

    let issuer_ref = cli
        .issuer_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .map(|name| IssuerRef::new(name, &cli.issuer_kind, &cli.issuer_group));
    match &issuer_ref {
        Some(issuer) => info!(%issuer, "issuing against configured issuerRef"),
        None => warn!(
            "no --issuer-name configured; issuance requires the runtime issuance ConfigMap"
        ),
    }

    let root_cas: Option<Arc<dyn BundleSource>> = match &cli.source_ca_bundle {
        Some(path) => {
            info!(filepath = %path, "using CA root bundle");
            Some(Arc::new(FileSource::new(path, DEFAULT_POLL_INTERVAL)?))
        }
        None => {
            info!("propagating root CA bundle disabled");
            None
        }
    };

    let kube_config = kube::Config::infer()
        .await
        .context("failed to infer kubernetes config")?;
    let client =
        Client::try_from(kube_config.clone()).context("failed to create kubernetes client")?;

    let store = Store::new(&cli.data_root)?;

    let manager = Manager::new(
        client.clone(),
        kube_config,
        store.clone(),
        root_cas.clone(),
        Options {
            trust_domain: cli.trust_domain,
            certificate_request_duration,
            issuer_ref: issuer_ref.clone(),
            cert_file_name: cli.file_name_certificate.clone(),
            key_file_name: cli.file_name_key.clone(),
            ca_file_name: cli.file_name_ca.clone(),
            extra_annotations,
            include_dns_san: cli.include_dns_san,
        },
    );

    // Pick renewal timers back up for volumes that survived a restart.
    manager.resume().await?;

    let mut background = Vec::new();

    if let Some(root_cas) = root_cas {
        let camanager = CaManager::new(
            store,
            root_cas,
            cli.file_name_certificate,
            cli.file_name_key,
            cli.file_name_ca,
        );
        background.push(tokio::spawn(camanager.run(DEFAULT_UPDATE_RETRY_PERIOD)));
    }

    match (
        &cli.runtime_issuance_config_map_name,
        &cli.runtime_issuance_config_map_namespace,
    ) {
        (Some(name), Some(namespace)) => {
            let watcher = RuntimeConfigWatcher::new(
                client.clone(),
                namespace.as_str(),
                name.as_str(),
                manager.issuer(),
                issuer_ref,
            );
            background.push(tokio::spawn(watcher.run()));
        }
        (None, None) => {}
        _ => warn!(
            "runtime issuance requires both --runtime-issuance-config-map-name and \
             --runtime-issuance-config-map-namespace; feature disabled"
        ),
    }

    let identity = IdentityService::new(DRIVER_NAME, DRIVER_VERSION);
    let node = NodeService::new(Arc::clone(&manager), cli.node_id);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    };

    let result = server::serve(&cli.endpoint, identity, node, shutdown).await;

    for task in background {
        task.abort();
    }

    info!("SPIFFE CSI driver shutting down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_annotations_parse_and_filter() {
        let parsed =
            parse_extra_annotations("team=infra,audit.example.com/owner=platform").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("team").map(String::as_str), Some("infra"));

        // Reserved-prefix keys are dropped, the rest survive.
        let filtered =
            parse_extra_annotations("spiffe.csi.cert-manager.io/identity=spoofed,team=infra")
                .unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("team"));

        assert!(parse_extra_annotations("").unwrap().is_empty());
        assert!(parse_extra_annotations("not-a-pair").is_err());
    }
}
