//! KDL declaration file parsing.

mod controller;
mod helpers;
mod resources;

use anyhow::Result;
use tracing::{debug, trace};

use tessera_common::IssuerKind;

use crate::Config;

pub use resources::DEFAULT_NAMESPACE;

/// Parse a complete declaration document
pub fn parse_document(text: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = text
        .parse()
        .map_err(|e: kdl::KdlError| anyhow::anyhow!("KDL syntax error: {}", e))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => {
                config.controller = controller::parse_controller_config(node)?;
            }
            "issuer" => {
                config
                    .issuers
                    .push(resources::parse_issuer(node, IssuerKind::Issuer)?);
            }
            "cluster-issuer" => {
                config
                    .issuers
                    .push(resources::parse_issuer(node, IssuerKind::ClusterIssuer)?);
            }
            "certificate" => {
                config
                    .certificates
                    .push(resources::parse_certificate(node)?);
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level node '{}'. Valid nodes: controller, issuer, cluster-issuer, certificate",
                    other
                ));
            }
        }
        trace!(node = node.name().value(), "Parsed top-level node");
    }

    debug!(
        issuers = config.issuers.len(),
        certificates = config.certificates.len(),
        "Parsed declaration document"
    );

    Ok(config)
}
