//! Type-safe identifier newtypes for Tessera resources.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of different ID types (e.g., passing a secret name
//! where an issuer reference is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a namespaced resource.
///
/// Certificates, namespaced Issuers and Secrets are addressed by
/// `namespace/name`. Cluster-scoped issuers use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped resource
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key for a sibling resource in the same namespace
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Scope of an issuer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IssuerKind {
    /// Issuer living in the same namespace as the certificate
    #[default]
    Issuer,
    /// Cluster-scoped issuer usable from any namespace
    ClusterIssuer,
}

impl IssuerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuerKind::Issuer => "Issuer",
            IssuerKind::ClusterIssuer => "ClusterIssuer",
        }
    }

    /// Parse a kind name, accepting any casing
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "issuer" => Some(IssuerKind::Issuer),
            "clusterissuer" | "cluster-issuer" => Some(IssuerKind::ClusterIssuer),
            _ => None,
        }
    }
}

impl fmt::Display for IssuerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a Certificate to the issuer that signs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuerRef {
    pub name: String,
    #[serde(default)]
    pub kind: IssuerKind,
}

impl IssuerRef {
    pub fn new(name: impl Into<String>, kind: IssuerKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Resolve to the issuer's resource key as seen from `namespace`
    pub fn resolve(&self, namespace: &str) -> ResourceKey {
        match self.kind {
            IssuerKind::Issuer => ResourceKey::new(namespace, self.name.clone()),
            IssuerKind::ClusterIssuer => ResourceKey::cluster(self.name.clone()),
        }
    }
}

impl fmt::Display for IssuerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::new("default", "web").to_string(), "default/web");
        assert_eq!(ResourceKey::cluster("letsencrypt").to_string(), "letsencrypt");
    }

    #[test]
    fn test_sibling_keeps_namespace() {
        let key = ResourceKey::new("team-a", "web");
        let secret = key.sibling("web-tls");
        assert_eq!(secret.namespace(), "team-a");
        assert_eq!(secret.name(), "web-tls");
    }

    #[test]
    fn test_issuer_ref_resolution() {
        let namespaced = IssuerRef::new("vault", IssuerKind::Issuer);
        assert_eq!(namespaced.resolve("team-a"), ResourceKey::new("team-a", "vault"));

        let cluster = IssuerRef::new("letsencrypt", IssuerKind::ClusterIssuer);
        let key = cluster.resolve("team-a");
        assert!(key.is_cluster_scoped());
        assert_eq!(key.name(), "letsencrypt");
    }

    #[test]
    fn test_issuer_kind_parsing() {
        assert_eq!(IssuerKind::from_str_loose("Issuer"), Some(IssuerKind::Issuer));
        assert_eq!(
            IssuerKind::from_str_loose("cluster-issuer"),
            Some(IssuerKind::ClusterIssuer)
        );
        assert_eq!(IssuerKind::from_str_loose("bogus"), None);
    }
}
