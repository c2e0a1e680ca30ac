//! Certificate material for the simulated control plane
//!
//! The simulator terminates real TLS for the fake etcd members and API
//! servers, so each registered instance needs serving material minted from
//! the workload cluster's root CA. Key generation and signing go through
//! `rcgen`; certificates travel as PEM strings.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// CA certificate or key material could not be parsed
    #[error("invalid CA material: {0}")]
    InvalidCa(String),

    /// The requested name is not a valid DNS name
    #[error("invalid DNS name {0:?}")]
    InvalidDnsName(String),
}

/// A PEM-encoded certificate and its private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    /// PEM-encoded certificate
    pub cert_pem: String,

    /// PEM-encoded private key
    pub key_pem: String,
}

impl CertKeyPair {
    /// Validate that both halves parse as PEM material
    pub fn validate(&self) -> Result<(), PkiError> {
        pem::parse(self.cert_pem.as_bytes())
            .map_err(|e| PkiError::InvalidCa(format!("failed to parse certificate: {}", e)))?;
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::InvalidCa(format!("failed to parse key: {}", e)))?;
        Ok(())
    }
}

/// Generate a self-signed root CA with the given common name
pub fn self_signed_ca(common_name: &str) -> Result<CertKeyPair, PkiError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e)))?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Mint a serving certificate for `dns_name`, signed by the given CA
pub fn serving_cert(dns_name: &str, ca: &CertKeyPair) -> Result<CertKeyPair, PkiError> {
    let ca_key = KeyPair::from_pem(&ca.key_pem)
        .map_err(|e| PkiError::InvalidCa(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
        .map_err(|e| PkiError::InvalidCa(format!("failed to create issuer: {}", e)))?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(dns_name.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = vec![SanType::DnsName(
        Ia5String::try_from(dns_name.to_string())
            .map_err(|_| PkiError::InvalidDnsName(dns_name.to_string()))?,
    )];

    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate serving key: {}", e)))?;
    let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to sign serving cert: {}", e))
    })?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}
