//! PKI primitives: key pairs, certificate issuance and inspection
//!
//! This module wraps the cryptographic library with the sequencing and
//! validation certward needs. It never decides *where* material is stored;
//! that is the job of [`crate::store`].
//!
//! # Certificate Profile
//!
//! Every certificate uses a single template:
//! - Key usage: digital signature + key encipherment (+ cert sign for CAs)
//! - Extended key usage: server auth + client auth
//! - SANs: caller DNS names plus `127.0.0.1` for port-forwarded access
//! - Serial: 128 random bits
//!
//! Signer/key consistency is not checked at issuance time. A certificate
//! signed with the wrong key fails chain verification when it is used.

mod certificate;
mod keys;

pub use certificate::{issue, Certificate, CertificateInfo, CertificateTemplate, Signer, LOOPBACK_IP};
pub use keys::{write_with_mode, KeyPair, PRIVATE_KEY_FILE_MODE, PUBLIC_FILE_MODE};

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Private key algorithm is not ECDSA or RSA
    #[error("unknown private key algorithm '{0}' (expected ECDSA or RSA)")]
    UnknownAlgorithm(String),

    /// ECDSA curve is not one of the supported named curves
    #[error("unknown ECDSA curve '{0}' (expected P224, P256, P384 or P521)")]
    UnknownCurve(String),

    /// RSA modulus below the accepted minimum
    #[error("RSA key size {0} is too low (minimum {min})", min = crate::options::MIN_RSA_BITS)]
    RsaBitsTooLow(u32),

    /// Certificate subject is incomplete or malformed
    #[error("invalid distinguished name: {0}")]
    InvalidDistinguishedName(String),

    /// Validity window is unusable
    #[error("invalid validity: {0}")]
    InvalidValidity(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}
