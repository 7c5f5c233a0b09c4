//! CertificateRequest evaluation policy
//!
//! A pure decision function over a CertificateRequest: either the request is
//! acceptable for a SPIFFE workload identity, or it names the first check
//! that failed. Returning a denial is an expected policy outcome, never an
//! operational error.
//!
//! The checks run in a fixed order and the first failure wins:
//! PEM/CSR decoding, requested duration, CSR self-signature, forbidden
//! SANs/subject, usages encoded in the CSR, `isCA`, requested usages, key
//! type, and finally the identity binding between the URI SAN and the
//! requesting ServiceAccount.

use std::collections::HashMap;
use std::time::Duration;

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

use spiffe_common::crd::{CertificateRequest, KeyUsage};
use spiffe_common::{duration, Error, SpiffeId};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P521: &str = "1.3.132.0.35";

/// Usages every request must carry, no more and no fewer.
pub const REQUIRED_USAGES: [KeyUsage; 4] = [
    KeyUsage::KeyEncipherment,
    KeyUsage::DigitalSignature,
    KeyUsage::ClientAuth,
    KeyUsage::ServerAuth,
];

/// ECDSA curves the evaluator can be configured to accept.
///
/// The accepted set is policy, not a constant: deployments migrating from
/// the legacy P-521 generator and deployments on the current P-256 one both
/// need to pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcCurve {
    /// NIST P-256 (prime256v1)
    P256,
    /// NIST P-521 (secp521r1)
    P521,
}

impl EcCurve {
    fn oid(&self) -> &'static str {
        match self {
            EcCurve::P256 => OID_CURVE_P256,
            EcCurve::P521 => OID_CURVE_P521,
        }
    }
}

impl std::fmt::Display for EcCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EcCurve::P256 => f.write_str("P-256"),
            EcCurve::P521 => f.write_str("P-521"),
        }
    }
}

/// Reason a CertificateRequest must be denied.
///
/// Carried as the message of the Denied condition, prefixed with
/// `Denied request: ` by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial(
    /// The reason text, carried verbatim into the condition message
    pub String,
);

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn deny(msg: impl Into<String>) -> Denial {
    Denial(msg.into())
}

/// Options to configure the evaluator
#[derive(Clone, Debug)]
pub struct Options {
    /// Trust domain asserted on requested URI SANs
    pub trust_domain: String,

    /// The exact duration requests must ask for
    pub certificate_request_duration: Duration,

    /// Allow a single DNS SAN equal to the ServiceAccount name
    pub include_dns_san: bool,

    /// ECDSA curves accepted from requestors
    pub allowed_curves: Vec<EcCurve>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trust_domain: "cluster.local".to_string(),
            certificate_request_duration: Duration::from_secs(3600),
            include_dns_san: false,
            allowed_curves: vec![EcCurve::P256, EcCurve::P521],
        }
    }
}

/// Evaluates whether a CertificateRequest should be approved or denied
#[derive(Clone, Debug)]
pub struct Evaluator {
    trust_domain: String,
    certificate_request_duration: Duration,
    include_dns_san: bool,
    allowed_curves: Vec<EcCurve>,
}

/// SANs and subject data pulled out of the CSR
#[derive(Debug, Default)]
struct CsrNames {
    uris: Vec<String>,
    dns: Vec<String>,
    ips: Vec<String>,
    emails: Vec<String>,
    common_name: String,
}

impl Evaluator {
    /// Construct a new evaluator
    pub fn new(opts: Options) -> Self {
        Self {
            trust_domain: opts.trust_domain,
            certificate_request_duration: opts.certificate_request_duration,
            include_dns_san: opts.include_dns_san,
            allowed_curves: opts.allowed_curves,
        }
    }

    /// Evaluate a CertificateRequest.
    ///
    /// `Ok(())` means the request should be approved; `Err` names the first
    /// failing check and is the denial reason.
    pub fn evaluate(&self, req: &CertificateRequest) -> Result<(), Denial> {
        let csr_der = decode_csr_pem(&req.spec.request.0)?;
        let (_, csr) = X509CertificationRequest::from_der(&csr_der)
            .map_err(|e| deny(format!("failed to parse request: {e}")))?;

        self.check_duration(req)?;

        csr.verify_signature()
            .map_err(|e| deny(format!("signature check failed for csr: {e}")))?;

        let names = collect_names(&csr);
        self.check_forbidden_names(&names)?;
        check_encoded_usages(&csr)?;

        if req.spec.is_ca {
            return Err(deny("request contains spec.isCA=true"));
        }

        check_requested_usages(&req.spec.usages)?;
        self.check_public_key(&csr)?;
        self.check_identity(&names, &req.spec.username)?;

        Ok(())
    }

    fn check_duration(&self, req: &CertificateRequest) -> Result<(), Denial> {
        let required = duration::format(self.certificate_request_duration);
        match req.spec.duration.as_deref() {
            None => Err(deny(format!(
                "requested certificate duration doesn't match required, required={required:?} got=nil"
            ))),
            Some(got) => {
                let parsed = duration::parse(got).map_err(|_| {
                    deny(format!(
                        "requested certificate duration doesn't match required, required={required:?} got={got:?}"
                    ))
                })?;
                if parsed != self.certificate_request_duration {
                    return Err(deny(format!(
                        "requested certificate duration doesn't match required, required={required:?} got={got:?}"
                    )));
                }
                Ok(())
            }
        }
    }

    fn check_forbidden_names(&self, names: &CsrNames) -> Result<(), Denial> {
        let dns_forbidden = !self.include_dns_san && !names.dns.is_empty();
        if dns_forbidden
            || !names.ips.is_empty()
            || !names.common_name.is_empty()
            || !names.emails.is_empty()
        {
            return Err(deny(format!(
                "forbidden extensions, DNS={:?} IPs={:?} CommonName={:?} Emails={:?}",
                names.dns, names.ips, names.common_name, names.emails
            )));
        }
        Ok(())
    }

    fn check_public_key(&self, csr: &X509CertificationRequest<'_>) -> Result<(), Denial> {
        let allowed = self
            .allowed_curves
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        let spki = &csr.certification_request_info.subject_pki;
        if spki.algorithm.algorithm.to_id_string() != OID_EC_PUBLIC_KEY {
            return Err(deny(format!(
                "forbidden key used by requestor, expecting ECDSA {allowed}"
            )));
        }
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .map(|oid| oid.to_id_string());
        let curve_allowed = curve
            .map(|c| self.allowed_curves.iter().any(|a| a.oid() == c))
            .unwrap_or(false);
        if !curve_allowed {
            return Err(deny(format!(
                "forbidden key used by requestor, expecting ECDSA {allowed}"
            )));
        }
        Ok(())
    }

    fn check_identity(&self, names: &CsrNames, username: &str) -> Result<(), Denial> {
        let id = match SpiffeId::from_username(&self.trust_domain, username) {
            Ok(id) => id,
            Err(Error::Identity { message }) => return Err(deny(message)),
            Err(e) => return Err(deny(e.to_string())),
        };

        if names.uris.len() != 1 {
            return Err(deny(format!(
                "expected exactly 1 SPIFFE URI present on request, got={}",
                names.uris.len()
            )));
        }

        let uri = &names.uris[0];
        let scheme = uri.split_once("://").map(|(s, _)| s).unwrap_or("");
        if scheme != "spiffe" {
            return Err(deny(format!("URI scheme is not spiffe: {scheme}")));
        }

        let expected = id.to_uri();
        if *uri != expected {
            return Err(deny(format!(
                "unexpected SPIFFE ID requested, exp={expected:?} got={uri:?}"
            )));
        }

        // A single DNS SAN equal to the service account name is allowed when
        // the deployment opts in.
        if self.include_dns_san {
            if names.dns.len() > 1 {
                return Err(deny(format!(
                    "expected exactly 0 or 1 DNS SAN present on request, got={}",
                    names.dns.len()
                )));
            }
            if let Some(dns) = names.dns.first() {
                if *dns != id.service_account {
                    return Err(deny(format!(
                        "unexpected DNS SAN requested, exp={:?} got={dns:?}",
                        id.service_account
                    )));
                }
            }
        }

        Ok(())
    }
}

fn decode_csr_pem(request: &[u8]) -> Result<Vec<u8>, Denial> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(request)
        .map_err(|e| deny(format!("failed to parse request: {e}")))?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(deny(format!(
            "failed to parse request: expected CERTIFICATE REQUEST PEM, got {:?}",
            pem.label
        )));
    }
    Ok(pem.contents)
}

fn collect_names(csr: &X509CertificationRequest<'_>) -> CsrNames {
    let mut names = CsrNames {
        common_name: csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string(),
        ..Default::default()
    };

    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::URI(uri) => names.uris.push((*uri).to_string()),
                        GeneralName::DNSName(dns) => names.dns.push((*dns).to_string()),
                        GeneralName::RFC822Name(email) => names.emails.push((*email).to_string()),
                        GeneralName::IPAddress(bytes) => names.ips.push(format_ip(bytes)),
                        _ => {}
                    }
                }
            }
        }
    }

    names
}

fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => format!("{bytes:?}"),
    }
}

/// Usages encoded as extensions inside the CSR itself must not exceed what
/// the required usages grant.
fn check_encoded_usages(csr: &X509CertificationRequest<'_>) -> Result<(), Denial> {
    let Some(extensions) = csr.requested_extensions() else {
        return Ok(());
    };

    for ext in extensions {
        match ext {
            ParsedExtension::KeyUsage(ku) => {
                let forbidden = ku.non_repudiation()
                    || ku.data_encipherment()
                    || ku.key_agreement()
                    || ku.key_cert_sign()
                    || ku.crl_sign()
                    || ku.encipher_only()
                    || ku.decipher_only();
                if forbidden {
                    return Err(deny(format!(
                        "request contains forbidden key usages encoded in the CSR, got={ku}"
                    )));
                }
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                let forbidden = eku.any
                    || eku.code_signing
                    || eku.email_protection
                    || eku.time_stamping
                    || eku.ocsp_signing
                    || !eku.other.is_empty();
                if forbidden {
                    return Err(deny(
                        "request contains forbidden extended key usages encoded in the CSR",
                    ));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// The requested usages must equal the required quartet as a multiset.
fn check_requested_usages(usages: &[KeyUsage]) -> Result<(), Denial> {
    let mut required: HashMap<KeyUsage, usize> = HashMap::new();
    for usage in REQUIRED_USAGES {
        *required.entry(usage).or_default() += 1;
    }
    let mut got: HashMap<KeyUsage, usize> = HashMap::new();
    for usage in usages {
        *got.entry(*usage).or_default() += 1;
    }

    if required != got {
        return Err(deny(format!(
            "request contains wrong usages, exp={REQUIRED_USAGES:?} got={usages:?}"
        )));
    }
    Ok(())
}
