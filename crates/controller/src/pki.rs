//! Crypto primitives: keys, CSRs, signing and certificate inspection.
//!
//! Pure functions over PEM/DER data. Key generation and signing use
//! `rcgen`; inspection of issued certificates uses `x509-parser`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::extensions::GeneralName;

/// Organization placed in every subject we build
pub const DEFAULT_ORGANIZATION: &str = "tessera";

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("no names requested: set a common name or at least one DNS name")]
    NoNames,

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("certificate public key does not match the private key")]
    KeyMismatch,
}

pub type Result<T> = std::result::Result<T, PkiError>;

// ============================================================================
// Names
// ============================================================================

/// The resolved subject of a certificate request.
///
/// The common name (when set) is the primary name and comes first; DNS
/// names follow in declared order with duplicates removed. When only DNS
/// names are given, the first one becomes the common name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameSet {
    common_name: String,
    names: Vec<String>,
}

impl NameSet {
    pub fn from_spec(common_name: &str, dns_names: &[String]) -> Result<Self> {
        let mut names: Vec<String> = Vec::with_capacity(dns_names.len() + 1);
        let common_name = common_name.trim();

        if !common_name.is_empty() {
            names.push(common_name.to_string());
        }
        for name in dns_names {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_string());
            }
        }

        let common_name = names.first().cloned().ok_or(PkiError::NoNames)?;
        Ok(Self { common_name, names })
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// All names, primary first
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Order-insensitive, case-insensitive comparison with observed names
    pub fn matches(&self, other: &[String]) -> bool {
        let mut ours: Vec<String> = self.names.iter().map(|n| n.to_ascii_lowercase()).collect();
        let mut theirs: Vec<String> = other.iter().map(|n| n.to_ascii_lowercase()).collect();
        ours.sort();
        ours.dedup();
        theirs.sort();
        theirs.dedup();
        ours == theirs
    }
}

// ============================================================================
// Keys and CSRs
// ============================================================================

/// Generate a new ECDSA P-256 key pair, PEM encoded (PKCS#8)
pub fn generate_key() -> Result<String> {
    let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
    Ok(key.serialize_pem())
}

/// Parse a PEM private key
pub fn load_key(key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(key_pem).map_err(|e| PkiError::InvalidKey(e.to_string()))
}

/// A certificate signing request in both encodings
#[derive(Debug, Clone)]
pub struct Csr {
    pub pem: String,
    pub der: Vec<u8>,
}

fn leaf_params(names: &NameSet) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(names.names().to_vec())
        .map_err(|e| PkiError::Csr(format!("invalid subject names: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(names.common_name().to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(DEFAULT_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    Ok(params)
}

/// Build a CSR for `names` signed by `key_pem`
pub fn build_csr(key_pem: &str, names: &NameSet) -> Result<Csr> {
    let key = load_key(key_pem)?;
    let csr = leaf_params(names)?
        .serialize_request(&key)
        .map_err(|e| PkiError::Csr(e.to_string()))?;
    let pem = csr.pem().map_err(|e| PkiError::Csr(e.to_string()))?;
    Ok(Csr {
        pem,
        der: csr.der().to_vec(),
    })
}

fn validity(duration: Duration) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX / 2);
    (now, now + time::Duration::seconds(secs))
}

/// Self-sign a certificate for `names` with `key_pem`
pub fn self_sign(key_pem: &str, names: &NameSet, duration: Duration) -> Result<String> {
    let key = load_key(key_pem)?;
    let mut params = leaf_params(names)?;
    let (not_before, not_after) = validity(duration);
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    Ok(cert.pem())
}

/// Sign a CSR with a CA certificate and key; returns the leaf PEM
pub fn sign_with_ca(
    csr_pem: &str,
    ca_cert_pem: &str,
    ca_key_pem: &str,
    duration: Duration,
) -> Result<String> {
    let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::Csr(format!("failed to parse CSR: {}", e)))?;

    let (not_before, not_after) = validity(duration);
    csr.params.not_before = not_before;
    csr.params.not_after = not_after;
    csr.params.is_ca = IsCa::NoCa;
    csr.params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let ca_key = load_key(ca_key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::InvalidCertificate(format!("failed to load CA: {}", e)))?;

    let cert = csr
        .signed_by(&issuer)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    Ok(cert.pem())
}

/// Generate a self-signed CA certificate; returns `(cert_pem, key_pem)`
pub fn generate_ca(common_name: &str, duration: Duration) -> Result<(String, String)> {
    let key = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(DEFAULT_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = validity(duration);
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key)
        .map_err(|e| PkiError::Signing(e.to_string()))?;
    Ok((cert.pem(), key.serialize_pem()))
}

// ============================================================================
// Inspection
// ============================================================================

/// What we need to know about an issued leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub issuer_common_name: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Raw subject public key bits
    pub public_key: Vec<u8>,
    /// Number of certificates in the chain
    pub chain_len: usize,
}

impl CertificateInfo {
    /// Validity period as issued
    pub fn duration(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Names the certificate covers: SANs, or the CN when no SAN is present
    pub fn names(&self) -> Vec<String> {
        if self.dns_names.is_empty() {
            self.common_name.iter().cloned().collect()
        } else {
            self.dns_names.clone()
        }
    }
}

/// Parse a PEM chain and describe its first (leaf) certificate
pub fn parse_certificate_chain(chain_pem: &str) -> Result<CertificateInfo> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|e| PkiError::InvalidCertificate(format!("failed to parse PEM: {}", e)))?;
    let certs: Vec<_> = blocks
        .iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .collect();
    let leaf = certs.first().ok_or(PkiError::EmptyChain)?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|e| PkiError::InvalidCertificate(format!("invalid X.509 certificate: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| PkiError::InvalidCertificate("invalid notBefore".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| PkiError::InvalidCertificate("invalid notAfter".to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    let issuer_common_name = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertificateInfo {
        common_name,
        dns_names,
        issuer_common_name,
        not_before,
        not_after,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
        chain_len: certs.len(),
    })
}

/// Check that the leaf's public key belongs to `key_pem`
pub fn verify_key_matches(key_pem: &str, leaf: &CertificateInfo) -> Result<()> {
    let key = load_key(key_pem)?;
    if key.public_key_raw() == leaf.public_key.as_slice() {
        Ok(())
    } else {
        Err(PkiError::KeyMismatch)
    }
}
