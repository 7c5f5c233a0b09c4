//! SPIFFE identities
//!
//! A workload identity is the pair (namespace, service account) scoped to a
//! trust domain, rendered as `spiffe://<td>/ns/<ns>/sa/<sa>`.

use crate::error::Error;

/// A SPIFFE identity within a single trust domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpiffeId {
    /// Trust domain, e.g. `cluster.local`
    pub trust_domain: String,
    /// Namespace of the workload's ServiceAccount
    pub namespace: String,
    /// Name of the workload's ServiceAccount
    pub service_account: String,
}

impl SpiffeId {
    /// Construct a SPIFFE identity from its parts
    pub fn new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            namespace: namespace.into(),
            service_account: service_account.into(),
        }
    }

    /// Derive the identity from a Kubernetes username of the canonical
    /// `system:serviceaccount:<namespace>:<service-account>` form.
    ///
    /// Anything that is not exactly four colon-separated parts with the two
    /// literal prefixes is rejected.
    pub fn from_username(trust_domain: &str, username: &str) -> Result<Self, Error> {
        let split: Vec<&str> = username.split(':').collect();
        if split.len() != 4 || split[0] != "system" || split[1] != "serviceaccount" {
            return Err(Error::identity(format!(
                "got non-serviceaccount encoded username: {username:?}"
            )));
        }
        Ok(Self::new(trust_domain, split[2], split[3]))
    }

    /// The SPIFFE URI for this identity
    pub fn to_uri(&self) -> String {
        format!(
            "spiffe://{}/ns/{}/sa/{}",
            self.trust_domain, self.namespace, self.service_account
        )
    }
}

impl std::fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_has_the_spiffe_form() {
        let id = SpiffeId::new("cluster.local", "sandbox", "sleep");
        assert_eq!(id.to_uri(), "spiffe://cluster.local/ns/sandbox/sa/sleep");
    }

    #[test]
    fn username_parses_to_identity() {
        let id = SpiffeId::from_username("foo.bar", "system:serviceaccount:sandbox:sleep").unwrap();
        assert_eq!(id, SpiffeId::new("foo.bar", "sandbox", "sleep"));
    }

    #[test]
    fn malformed_usernames_are_rejected() {
        for username in [
            "system:serviceaccount:foo",
            "system:serviceaccount:a:b:c",
            "system:node:sandbox:sleep",
            "user:serviceaccount:sandbox:sleep",
            "",
        ] {
            assert!(
                SpiffeId::from_username("foo.bar", username).is_err(),
                "expected rejection of {username:?}"
            );
        }
    }
}
