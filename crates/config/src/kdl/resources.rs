//! Issuer and certificate KDL parsing.

use anyhow::Result;
use tracing::trace;

use tessera_common::{IssuerKind, IssuerRef, ResourceKey};

use crate::resources::{
    default_approle_path, AcmeIssuerConfig, CaIssuerConfig, Certificate, CertificateSpec, Issuer,
    IssuerBackendConfig, IssuerSpec, VaultAuth, VaultIssuerConfig,
};

use super::helpers::{
    get_child, get_duration_entry, get_first_arg_string, get_property_string, get_string_entry,
    get_string_list,
};

/// Namespace used when a namespaced resource does not declare one
pub const DEFAULT_NAMESPACE: &str = "default";

fn resource_name(node: &kdl::KdlNode, what: &str) -> Result<String> {
    get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "{} requires a name argument, e.g., {} \"example\" {{ ... }}",
            what,
            node.name().value()
        )
    })
}

fn require(node: &kdl::KdlNode, field: &str, owner: &str) -> Result<String> {
    get_string_entry(node, field)
        .ok_or_else(|| anyhow::anyhow!("{} requires a '{}' field", owner, field))
}

/// Parse an `issuer` or `cluster-issuer` node
pub fn parse_issuer(node: &kdl::KdlNode, kind: IssuerKind) -> Result<Issuer> {
    let name = resource_name(node, "Issuer")?;
    trace!(issuer = %name, kind = %kind, "Parsing issuer");

    let key = match kind {
        IssuerKind::Issuer => ResourceKey::new(
            get_string_entry(node, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            name.clone(),
        ),
        IssuerKind::ClusterIssuer => ResourceKey::cluster(name.clone()),
    };

    let owner = format!("Issuer '{}'", name);
    let mut backends = Vec::new();

    if let Some(acme) = get_child(node, "acme") {
        backends.push(IssuerBackendConfig::Acme(AcmeIssuerConfig {
            server: require(acme, "server", &owner)?,
            email: require(acme, "email", &owner)?,
            private_key_secret: require(acme, "private-key-secret", &owner)?,
        }));
    }
    if let Some(ca) = get_child(node, "ca") {
        backends.push(IssuerBackendConfig::Ca(CaIssuerConfig {
            secret_name: require(ca, "secret-name", &owner)?,
        }));
    }
    if get_child(node, "self-signed").is_some() {
        backends.push(IssuerBackendConfig::SelfSigned);
    }
    if let Some(vault) = get_child(node, "vault") {
        backends.push(IssuerBackendConfig::Vault(parse_vault(vault, &owner)?));
    }

    let backend = match backends.len() {
        0 => {
            return Err(anyhow::anyhow!(
                "{} must declare one backend: acme, ca, self-signed or vault",
                owner
            ))
        }
        1 => backends.remove(0),
        n => {
            return Err(anyhow::anyhow!(
                "{} declares {} backends; exactly one is allowed",
                owner,
                n
            ))
        }
    };

    let spec = IssuerSpec {
        backend,
        duration: get_duration_entry(node, "duration")?,
        renew_before: get_duration_entry(node, "renew-before")?,
    };

    trace!(
        issuer = %key,
        backend = spec.backend.kind_name(),
        "Parsed issuer"
    );

    Ok(Issuer::new(key, spec))
}

fn parse_vault(node: &kdl::KdlNode, owner: &str) -> Result<VaultIssuerConfig> {
    let auth_node = get_child(node, "auth")
        .ok_or_else(|| anyhow::anyhow!("{} vault backend requires an 'auth' block", owner))?;

    let auth = if let Some(secret_name) = get_string_entry(auth_node, "token-secret") {
        VaultAuth::Token { secret_name }
    } else if let Some(app_role) = get_child(auth_node, "app-role") {
        VaultAuth::AppRole {
            secret_name: require(app_role, "secret-name", owner)?,
            path: get_string_entry(app_role, "path").unwrap_or_else(default_approle_path),
        }
    } else {
        return Err(anyhow::anyhow!(
            "{} vault auth requires 'token-secret' or an 'app-role' block",
            owner
        ));
    };

    Ok(VaultIssuerConfig {
        server: require(node, "server", owner)?,
        path: require(node, "path", owner)?,
        auth,
    })
}

/// Parse a `certificate` node
pub fn parse_certificate(node: &kdl::KdlNode) -> Result<Certificate> {
    let name = resource_name(node, "Certificate")?;
    trace!(certificate = %name, "Parsing certificate");

    let owner = format!("Certificate '{}'", name);
    let namespace =
        get_string_entry(node, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    let issuer_node = get_child(node, "issuer")
        .ok_or_else(|| anyhow::anyhow!("{} requires an 'issuer' reference", owner))?;
    let issuer_name = get_first_arg_string(issuer_node)
        .ok_or_else(|| anyhow::anyhow!("{} 'issuer' requires a name argument", owner))?;
    let issuer_kind = match get_property_string(issuer_node, "kind") {
        Some(kind) => IssuerKind::from_str_loose(&kind).ok_or_else(|| {
            anyhow::anyhow!(
                "{} has invalid issuer kind '{}'. Valid kinds: Issuer, ClusterIssuer",
                owner,
                kind
            )
        })?,
        None => IssuerKind::Issuer,
    };

    let spec = CertificateSpec {
        common_name: get_string_entry(node, "common-name").unwrap_or_default(),
        dns_names: get_string_list(node, "dns-names"),
        secret_name: require(node, "secret-name", &owner)?,
        issuer_ref: IssuerRef::new(issuer_name, issuer_kind),
        duration: get_duration_entry(node, "duration")?,
        renew_before: get_duration_entry(node, "renew-before")?,
    };

    trace!(
        certificate = %name,
        dns_names = spec.dns_names.len(),
        issuer = %spec.issuer_ref,
        "Parsed certificate"
    );

    Ok(Certificate::new(ResourceKey::new(namespace, name), spec))
}
