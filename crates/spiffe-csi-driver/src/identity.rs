//! Pod identity extraction from ServiceAccount tokens
//!
//! The kubelet hands us a TokenRequest token in the volume context. We
//! decode its payload to learn which (namespace, service account) to
//! request a certificate for - nothing more. The signature is deliberately
//! NOT verified: the token is only ever exercised against the API server,
//! which is the sole authority on identity. The header's algorithm is still
//! checked against a standard allow-list so an `alg=none` token never gets
//! this far.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use spiffe_common::{Error, Result, POD_SERVICE_ACCOUNT_TOKENS_KEY};

/// Signing algorithms accepted in token headers
const ALLOWED_ALGORITHMS: [&str; 6] = ["RS256", "RS384", "RS512", "ES256", "ES384", "ES512"];

/// The identity of a mounting Pod, as claimed by its ServiceAccount token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    /// Namespace of the ServiceAccount
    pub namespace: String,
    /// Name of the ServiceAccount
    pub service_account: String,
}

#[derive(Deserialize)]
struct Header {
    #[serde(default)]
    alg: String,
}

#[derive(Deserialize)]
struct Claims {
    #[serde(rename = "kubernetes.io")]
    kubernetes_io: Option<KubernetesClaims>,
}

#[derive(Deserialize)]
struct KubernetesClaims {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    serviceaccount: Option<ServiceAccountClaims>,
}

#[derive(Deserialize)]
struct ServiceAccountClaims {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
}

/// Pull the empty-audience ServiceAccount token out of the volume context.
///
/// The kubelet serialises its TokenRequest results under the
/// `csi.storage.k8s.io/serviceAccount.tokens` key as a JSON map of audience
/// to token. The driver requests no audience, so the entry under `""` is
/// the one minted for us.
pub fn token_from_volume_context(volume_context: &BTreeMap<String, String>) -> Result<String> {
    let raw = volume_context
        .get(POD_SERVICE_ACCOUNT_TOKENS_KEY)
        .ok_or_else(|| {
            Error::identity(format!(
                "volume context missing {POD_SERVICE_ACCOUNT_TOKENS_KEY}; is the CSIDriver registered with tokenRequests?"
            ))
        })?;

    let tokens: BTreeMap<String, TokenEntry> = serde_json::from_str(raw)
        .map_err(|e| Error::identity(format!("failed to decode service account tokens: {e}")))?;

    tokens
        .get("")
        .map(|entry| entry.token.clone())
        .ok_or_else(|| Error::identity("no empty-audience token present in volume context"))
}

/// Derive the Pod identity from a ServiceAccount token without verifying
/// its signature.
pub fn identity_from_token(token: &str) -> Result<PodIdentity> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::identity("token is not a compact JWT"));
    };

    let header: Header = decode_segment(header, "header")?;
    if !ALLOWED_ALGORITHMS.contains(&header.alg.as_str()) {
        return Err(Error::identity(format!(
            "token signed with disallowed algorithm {:?}",
            header.alg
        )));
    }

    let claims: Claims = decode_segment(payload, "payload")?;
    let kubernetes = claims
        .kubernetes_io
        .ok_or_else(|| Error::identity("token has no kubernetes.io claim"))?;
    let name = kubernetes
        .serviceaccount
        .map(|sa| sa.name)
        .unwrap_or_default();

    if kubernetes.namespace.is_empty() || name.is_empty() {
        return Err(Error::identity(
            "missing namespace or serviceaccount name in token",
        ));
    }

    Ok(PodIdentity {
        namespace: kubernetes.namespace,
        service_account: name,
    })
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str, what: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::identity(format!("failed to decode token {what}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::identity(format!("failed to decode token {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: serde_json::Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&value).unwrap())
    }

    fn token(alg: &str, payload: serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            encode(serde_json::json!({"alg": alg, "kid": "test"})),
            encode(payload),
            URL_SAFE_NO_PAD.encode(b"unverified-signature")
        )
    }

    fn sandbox_claims() -> serde_json::Value {
        serde_json::json!({
            "aud": [],
            "exp": 1893456000u64,
            "kubernetes.io": {
                "namespace": "sandbox",
                "pod": {"name": "sleep-7d9f", "uid": "0b36d56e"},
                "serviceaccount": {"name": "sleep", "uid": "aa11"}
            },
            "sub": "system:serviceaccount:sandbox:sleep"
        })
    }

    #[test]
    fn identity_is_read_from_the_kubernetes_claim() {
        let id = identity_from_token(&token("RS256", sandbox_claims())).unwrap();
        assert_eq!(
            id,
            PodIdentity {
                namespace: "sandbox".to_string(),
                service_account: "sleep".to_string(),
            }
        );
    }

    #[test]
    fn disallowed_algorithms_are_rejected() {
        for alg in ["none", "HS256", ""] {
            let err = identity_from_token(&token(alg, sandbox_claims())).unwrap_err();
            assert!(
                err.to_string().contains("disallowed algorithm"),
                "alg {alg:?}: {err}"
            );
        }
    }

    #[test]
    fn missing_claims_are_rejected() {
        let err = identity_from_token(&token("RS256", serde_json::json!({"sub": "x"})))
            .unwrap_err();
        assert!(err.to_string().contains("kubernetes.io"), "{err}");

        let no_name = serde_json::json!({
            "kubernetes.io": {"namespace": "sandbox", "serviceaccount": {"name": ""}}
        });
        let err = identity_from_token(&token("RS256", no_name)).unwrap_err();
        assert!(err.to_string().contains("missing namespace"), "{err}");
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        for garbage in ["", "a.b", "a.b.c.d", "!!!.###.$$$"] {
            assert!(identity_from_token(garbage).is_err(), "{garbage:?}");
        }
    }

    #[test]
    fn empty_audience_token_is_selected() {
        let tokens = serde_json::json!({
            "": {"token": "empty-aud-token", "expirationTimestamp": "2031-01-01T00:00:00Z"},
            "vault": {"token": "vault-token", "expirationTimestamp": "2031-01-01T00:00:00Z"}
        })
        .to_string();
        let ctx = BTreeMap::from([(POD_SERVICE_ACCOUNT_TOKENS_KEY.to_string(), tokens)]);
        assert_eq!(token_from_volume_context(&ctx).unwrap(), "empty-aud-token");
    }

    #[test]
    fn missing_tokens_attribute_is_rejected() {
        let err = token_from_volume_context(&BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("tokenRequests"), "{err}");

        let ctx = BTreeMap::from([(
            POD_SERVICE_ACCOUNT_TOKENS_KEY.to_string(),
            serde_json::json!({"vault": {"token": "t", "expirationTimestamp": "x"}}).to_string(),
        )]);
        let err = token_from_volume_context(&ctx).unwrap_err();
        assert!(err.to_string().contains("empty-audience"), "{err}");
    }
}
