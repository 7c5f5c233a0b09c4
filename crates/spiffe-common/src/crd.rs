//! cert-manager CertificateRequest API types
//!
//! The driver creates CertificateRequests and the approver sets their
//! Approved/Denied conditions, so both sides share these definitions. Only
//! the fields this project reads or writes are modelled; the signer owns the
//! rest of the surface.

use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set when a request has been approved
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type set when a request has been denied
pub const CONDITION_DENIED: &str = "Denied";

/// Reference to the issuer that will sign an approved request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Name of the issuer resource
    pub name: String,

    /// Kind of the issuer resource (e.g. ClusterIssuer)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// API group of the issuer resource (e.g. cert-manager.io)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

impl IssuerRef {
    /// Construct an issuer reference from its three parts
    pub fn new(name: impl Into<String>, kind: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            group: group.into(),
        }
    }
}

impl std::fmt::Display for IssuerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.name, self.group)
    }
}

/// Requested key usage, using cert-manager's wire values
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    /// signing
    #[serde(rename = "signing")]
    Signing,
    /// digital signature
    #[serde(rename = "digital signature")]
    DigitalSignature,
    /// content commitment
    #[serde(rename = "content commitment")]
    ContentCommitment,
    /// key encipherment
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
    /// key agreement
    #[serde(rename = "key agreement")]
    KeyAgreement,
    /// data encipherment
    #[serde(rename = "data encipherment")]
    DataEncipherment,
    /// cert sign
    #[serde(rename = "cert sign")]
    CertSign,
    /// crl sign
    #[serde(rename = "crl sign")]
    CrlSign,
    /// encipher only
    #[serde(rename = "encipher only")]
    EncipherOnly,
    /// decipher only
    #[serde(rename = "decipher only")]
    DecipherOnly,
    /// any
    #[serde(rename = "any")]
    Any,
    /// server auth
    #[serde(rename = "server auth")]
    ServerAuth,
    /// client auth
    #[serde(rename = "client auth")]
    ClientAuth,
    /// code signing
    #[serde(rename = "code signing")]
    CodeSigning,
    /// email protection
    #[serde(rename = "email protection")]
    EmailProtection,
    /// timestamping
    #[serde(rename = "timestamping")]
    Timestamping,
    /// ocsp signing
    #[serde(rename = "ocsp signing")]
    OcspSigning,
}

/// Specification of a CertificateRequest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    plural = "certificaterequests",
    shortname = "cr",
    namespaced,
    status = "CertificateRequestStatus",
    printcolumn = r#"{"name":"Approved","type":"string","jsonPath":".status.conditions[?(@.type==\"Approved\")].status"}"#,
    printcolumn = r#"{"name":"Denied","type":"string","jsonPath":".status.conditions[?(@.type==\"Denied\")].status"}"#,
    printcolumn = r#"{"name":"Issuer","type":"string","jsonPath":".spec.issuerRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 certificate signing request (base64 on the wire)
    #[schemars(with = "String")]
    pub request: ByteString,

    /// Requested certificate lifetime as a Go duration string (e.g. "1h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Whether a CA certificate is being requested
    #[serde(default, rename = "isCA", skip_serializing_if = "std::ops::Not::not")]
    pub is_ca: bool,

    /// Requested key usages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,

    /// Issuer that should sign this request
    pub issuer_ref: IssuerRef,

    /// Kubernetes user that created the request. Populated by the API
    /// server; for driver-created requests this is the mounting Pod's
    /// ServiceAccount in `system:serviceaccount:<ns>:<sa>` form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// UID of the user that created the request. Populated by the API server.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Groups of the user that created the request. Populated by the API
    /// server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Status of a CertificateRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    /// Observed conditions. Approved and Denied are terminal and mutually
    /// exclusive once set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateRequestCondition>,

    /// PEM-encoded signed certificate chain, leaf first. Set by the signer
    /// once the request has been approved and signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub certificate: Option<ByteString>,

    /// PEM-encoded CA bundle of the signer, if it chooses to publish one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca: Option<ByteString>,
}

/// A single observed condition on a CertificateRequest
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestCondition {
    /// Condition type (e.g. Approved, Denied, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status: "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the condition last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl CertificateRequest {
    /// Whether the request carries a true condition of the given type
    fn has_true_condition(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == type_ && c.status == "True")
            })
            .unwrap_or(false)
    }

    /// Whether this request has been approved
    pub fn is_approved(&self) -> bool {
        self.has_true_condition(CONDITION_APPROVED)
    }

    /// Whether this request has been denied
    pub fn is_denied(&self) -> bool {
        self.has_true_condition(CONDITION_DENIED)
    }

    /// Whether this request has reached a terminal approval state
    pub fn is_terminal(&self) -> bool {
        self.is_approved() || self.is_denied()
    }

    /// The signed certificate chain, if present
    pub fn certificate(&self) -> Option<&[u8]> {
        self.status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .map(|b| b.0.as_slice())
    }

    /// The message of the Denied condition, if present
    pub fn denial_message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| {
            s.conditions
                .iter()
                .find(|c| c.type_ == CONDITION_DENIED && c.status == "True")
                .and_then(|c| c.message.as_deref())
        })
    }

    /// Set a condition, replacing any existing condition of the same type
    pub fn set_condition(&mut self, condition: CertificateRequestCondition) {
        let status = self.status.get_or_insert_with(Default::default);
        status.conditions.retain(|c| c.type_ != condition.type_);
        status.conditions.push(condition);
    }
}

/// Build an Approved condition with the given reason
pub fn approved_condition(reason: &str) -> CertificateRequestCondition {
    CertificateRequestCondition {
        type_: CONDITION_APPROVED.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some("Approved request".to_string()),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
    }
}

/// Build a Denied condition with the given reason and denial message
pub fn denied_condition(reason: &str, message: &str) -> CertificateRequestCondition {
    CertificateRequestCondition {
        type_: CONDITION_DENIED.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        message: Some(format!("Denied request: {message}")),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
    }
}
