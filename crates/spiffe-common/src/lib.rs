//! Common types for the SPIFFE CSI driver and its approver: the
//! CertificateRequest API surface, SPIFFE identities, errors and telemetry.

#![deny(missing_docs)]

pub mod crd;
pub mod duration;
pub mod error;
pub mod identity;
pub mod telemetry;

pub use error::Error;
pub use identity::SpiffeId;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name the CSI driver is registered under in Kubernetes. Also used as the
/// reason on Approved/Denied CertificateRequest conditions.
pub const DRIVER_NAME: &str = "spiffe.csi.cert-manager.io";

/// Annotation carrying the SPIFFE URI on CertificateRequests created by the
/// driver.
pub const IDENTITY_ANNOTATION: &str = "spiffe.csi.cert-manager.io/identity";

/// Prefix reserved for driver-owned annotations. Operator-supplied extra
/// annotations must not use it.
pub const RESERVED_ANNOTATION_PREFIX: &str = "spiffe.csi.cert-manager.io";

/// Volume attribute naming the filesystem group that mounted files are
/// readable by.
pub const FS_GROUP_VOLUME_ATTRIBUTE: &str = "spiffe.csi.cert-manager.io/fs-group";

/// Label placed on CertificateRequests to tie them back to the originating
/// CSI volume, so stale requests can be cleaned up before re-issuance.
pub const VOLUME_ID_LABEL: &str = "spiffe.csi.cert-manager.io/volume-id";

// Volume-context keys populated by the kubelet for ephemeral CSI volumes.
/// Pod name volume-context key.
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
/// Pod namespace volume-context key.
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";
/// Pod UID volume-context key.
pub const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";
/// Pod ServiceAccount name volume-context key.
pub const POD_SERVICE_ACCOUNT_KEY: &str = "csi.storage.k8s.io/serviceAccount.name";
/// ServiceAccount tokens volume-context key. The value is a JSON map of
/// audience to token, produced by the kubelet's TokenRequest projection.
pub const POD_SERVICE_ACCOUNT_TOKENS_KEY: &str = "csi.storage.k8s.io/serviceAccount.tokens";
/// Ephemeral volume marker volume-context key.
pub const EPHEMERAL_KEY: &str = "csi.storage.k8s.io/ephemeral";

/// Install the crypto provider for rustls.
///
/// This must be called before creating any TLS connections (including kube
/// clients). Safe to call multiple times - subsequent calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
