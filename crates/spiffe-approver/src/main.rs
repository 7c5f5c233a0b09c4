//! spiffe-approver - approves or denies CertificateRequests created by the
//! SPIFFE CSI driver

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::{error, info, warn};

use spiffe_approver::controller::{self, Context};
use spiffe_approver::evaluator::{EcCurve, Evaluator, Options};
use spiffe_approver::leader_election::LeaderElector;
use spiffe_approver::probes;
use spiffe_common::crd::IssuerRef;
use spiffe_common::{duration, DRIVER_NAME};

/// Approver paired with the SPIFFE CSI driver: watches CertificateRequests
/// matching the configured issuer and approves or denies each one.
#[derive(Parser, Debug)]
#[command(name = "spiffe-approver", version, about, long_about = None)]
struct Cli {
    /// Namespace to use for controller leader election
    #[arg(long, default_value = "cert-manager")]
    leader_election_namespace: String,

    /// TCP address for exposing the HTTP readiness probe, served on '/readyz'
    #[arg(long, default_value = ":6060")]
    readiness_probe_bind_address: String,

    /// TCP address for exposing HTTP Prometheus metrics. "0" disables.
    /// Accepted for deployment compatibility; no metrics are registered.
    #[arg(long, default_value = ":9402")]
    metrics_bind_address: String,

    /// The trust domain this approver ensures is present on requests
    #[arg(long, default_value = "cluster.local")]
    trust_domain: String,

    /// The duration which is enforced for requests to have, as a Go
    /// duration string
    #[arg(long, default_value = "1h")]
    certificate_request_duration: String,

    /// Name of the issuer that requests must reference
    #[arg(long, default_value = "my-spiffe-ca")]
    issuer_name: String,

    /// Kind of the issuer that requests must reference
    #[arg(long, default_value = "ClusterIssuer")]
    issuer_kind: String,

    /// Group of the issuer that requests must reference
    #[arg(long, default_value = "cert-manager.io")]
    issuer_group: String,

    /// Allow requests to carry a single DNS SAN equal to the
    /// ServiceAccount name
    #[arg(long, default_value_t = false)]
    include_dns_san: bool,
}

/// Parse a controller-style bind address (":6060" means all interfaces)
fn parse_bind_address(addr: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid bind address {addr:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spiffe_common::install_crypto_provider();

    let cli = Cli::parse();

    spiffe_common::telemetry::init("spiffe-approver")
        .context("failed to initialize telemetry")?;

    let certificate_request_duration = duration::parse(&cli.certificate_request_duration)
        .context("invalid --certificate-request-duration")?;

    if cli.metrics_bind_address != "0" {
        warn!(
            address = %cli.metrics_bind_address,
            "metrics endpoint not served by this build, flag accepted for compatibility"
        );
    }

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let evaluator = Evaluator::new(Options {
        trust_domain: cli.trust_domain.clone(),
        certificate_request_duration,
        include_dns_san: cli.include_dns_san,
        allowed_curves: vec![EcCurve::P256, EcCurve::P521],
    });

    let ctx = Arc::new(Context {
        client: client.clone(),
        issuer_ref: IssuerRef::new(cli.issuer_name, cli.issuer_kind, cli.issuer_group),
        evaluator,
    });

    // Ready as soon as the context exists; reconciliation starts only once
    // the lease is held.
    let readyz_addr = parse_bind_address(&cli.readiness_probe_bind_address)?;
    tokio::spawn(async move {
        if let Err(e) = probes::serve(readyz_addr).await {
            error!(error = %e, "readiness probe server failed");
        }
    });

    let identity = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("spiffe-approver-{}", std::process::id()));
    let elector = Arc::new(LeaderElector::new(
        client,
        DRIVER_NAME,
        &cli.leader_election_namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await;

    info!("starting SPIFFE approver...");

    tokio::select! {
        _ = controller::run(ctx) => {
            info!("approver shutting down");
            Ok(())
        }
        _ = guard.lost() => {
            error!("leader election lost, exiting");
            std::process::exit(1);
        }
    }
}
