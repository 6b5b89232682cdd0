//! TLS options for certificate issuance
//!
//! Options arrive as loosely typed caller input (CLI flags or a YAML file).
//! [`TlsOptions::validate`] turns them into a [`KeySpec`], which is the only
//! thing key generation accepts, so invalid security parameters can never
//! reach the key generator.
//!
//! Exactly one algorithm branch is authoritative: `ecdsa_curve` is ignored
//! under RSA and `rsa_bits` is ignored under ECDSA.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pki::PkiError;

/// Minimum accepted RSA modulus size in bits
pub const MIN_RSA_BITS: u32 = 2048;

/// RSA modulus size used when the caller does not pick one
pub const DEFAULT_RSA_BITS: u32 = 4096;

/// Certificate validity used when the caller does not pick one
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Private key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivateKeyAlgorithm {
    /// Elliptic-curve keys on one of the NIST curves
    Ecdsa,
    /// RSA keys
    Rsa,
}

impl PrivateKeyAlgorithm {
    /// Canonical text form, as stored in secret metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ecdsa => "ECDSA",
            Self::Rsa => "RSA",
        }
    }
}

impl fmt::Display for PrivateKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivateKeyAlgorithm {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("ECDSA") {
            Ok(Self::Ecdsa)
        } else if trimmed.eq_ignore_ascii_case("RSA") {
            Ok(Self::Rsa)
        } else {
            Err(PkiError::UnknownAlgorithm(s.to_string()))
        }
    }
}

/// Named elliptic curve for ECDSA keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcdsaCurve {
    /// NIST P-224 (secp224r1)
    P224,
    /// NIST P-256 (prime256v1)
    P256,
    /// NIST P-384 (secp384r1)
    P384,
    /// NIST P-521 (secp521r1)
    P521,
}

impl EcdsaCurve {
    /// All supported curves
    pub const ALL: [EcdsaCurve; 4] = [Self::P224, Self::P256, Self::P384, Self::P521];

    /// Canonical text form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P224 => "P224",
            Self::P256 => "P256",
            Self::P384 => "P384",
            Self::P521 => "P521",
        }
    }

    /// Field size in bits
    pub fn bits(&self) -> u32 {
        match self {
            Self::P224 => 224,
            Self::P256 => 256,
            Self::P384 => 384,
            Self::P521 => 521,
        }
    }
}

impl fmt::Display for EcdsaCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EcdsaCurve {
    type Err = PkiError;

    /// Accepts `P256`, `p256` and `P-256` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .collect::<String>()
            .to_ascii_uppercase();

        Self::ALL
            .into_iter()
            .find(|curve| curve.as_str() == normalized)
            .ok_or_else(|| PkiError::UnknownCurve(s.to_string()))
    }
}

/// Validated key generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// ECDSA key on the given curve
    Ecdsa(EcdsaCurve),
    /// RSA key with the given modulus size
    Rsa {
        /// Modulus size in bits (at least [`MIN_RSA_BITS`])
        bits: u32,
    },
}

impl KeySpec {
    /// Algorithm family of this spec
    pub fn algorithm(&self) -> PrivateKeyAlgorithm {
        match self {
            Self::Ecdsa(_) => PrivateKeyAlgorithm::Ecdsa,
            Self::Rsa { .. } => PrivateKeyAlgorithm::Rsa,
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ecdsa(curve) => write!(f, "ECDSA/{}", curve),
            Self::Rsa { bits } => write!(f, "RSA/{}", bits),
        }
    }
}

/// Certificate subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistinguishedName {
    /// Common name (required)
    pub common_name: String,
    /// Organization (required)
    pub organization: String,
    /// Organizational unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    /// City / locality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// State or province
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Two-letter country code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl DistinguishedName {
    /// Create a subject with only the required fields set
    pub fn new(common_name: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.into(),
            ..Default::default()
        }
    }

    /// Copy of this subject with a different common name
    pub fn with_common_name(&self, common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..self.clone()
        }
    }

    /// Check required fields and the country code format
    pub fn validate(&self) -> Result<(), PkiError> {
        if self.common_name.trim().is_empty() {
            return Err(PkiError::InvalidDistinguishedName(
                "common name is required".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(PkiError::InvalidDistinguishedName(
                "organization is required".to_string(),
            ));
        }
        if let Some(country) = &self.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PkiError::InvalidDistinguishedName(format!(
                    "country must be a two-letter code, got '{}'",
                    country
                )));
            }
        }
        Ok(())
    }
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

fn default_algorithm() -> String {
    PrivateKeyAlgorithm::Ecdsa.as_str().to_string()
}

fn default_curve() -> String {
    EcdsaCurve::P256.as_str().to_string()
}

fn default_rsa_bits() -> u32 {
    DEFAULT_RSA_BITS
}

/// Caller-supplied TLS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    /// Certificate subject
    pub distinguished_name: DistinguishedName,
    /// Validity window length in days
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    /// `ECDSA` or `RSA`
    #[serde(default = "default_algorithm")]
    pub private_key_algorithm: String,
    /// Curve name, only read when the algorithm is ECDSA
    #[serde(default = "default_curve")]
    pub ecdsa_curve: String,
    /// Modulus size, only read when the algorithm is RSA
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: u32,
}

impl TlsOptions {
    /// Options with defaults (ECDSA P-256, one year) for the given subject
    pub fn new(distinguished_name: DistinguishedName) -> Self {
        Self {
            distinguished_name,
            validity_days: DEFAULT_VALIDITY_DAYS,
            private_key_algorithm: default_algorithm(),
            ecdsa_curve: default_curve(),
            rsa_bits: DEFAULT_RSA_BITS,
        }
    }

    /// Parse options from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, PkiError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PkiError::ParseError(format!("failed to parse TLS options: {}", e)))
    }

    /// Validity window as a duration
    pub fn validity(&self) -> Duration {
        Duration::from_secs(u64::from(self.validity_days) * SECONDS_PER_DAY)
    }

    /// Validate the options and resolve the authoritative key parameters
    pub fn validate(&self) -> Result<KeySpec, PkiError> {
        self.distinguished_name.validate()?;

        if self.validity_days == 0 {
            return Err(PkiError::InvalidValidity(
                "validity must be at least one day".to_string(),
            ));
        }

        match self.private_key_algorithm.parse::<PrivateKeyAlgorithm>()? {
            PrivateKeyAlgorithm::Ecdsa => Ok(KeySpec::Ecdsa(self.ecdsa_curve.parse()?)),
            PrivateKeyAlgorithm::Rsa => {
                if self.rsa_bits < MIN_RSA_BITS {
                    return Err(PkiError::RsaBitsTooLow(self.rsa_bits));
                }
                Ok(KeySpec::Rsa {
                    bits: self.rsa_bits,
                })
            }
        }
    }
}
