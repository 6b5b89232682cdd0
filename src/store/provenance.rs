//! Versioned provenance metadata carried on secret records
//!
//! Each record is annotated twice: once with the flat keys external tooling
//! greps for, and once with a JSON document holding the same facts plus a
//! schema version. Readers prefer the JSON document and fall back to the
//! flat keys for records that predate it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::options::PrivateKeyAlgorithm;
use crate::pki::PkiError;

/// Schema version written by this build
pub const PROVENANCE_VERSION: u32 = 1;

/// Annotation holding the JSON provenance document
pub const PROVENANCE_ANNOTATION: &str = "certward.dev/provenance";
/// Annotation holding the private key algorithm
pub const ALGORITHM_ANNOTATION: &str = "certward.dev/private-key-algorithm";
/// Annotation holding the file name base
pub const FILENAME_BASE_ANNOTATION: &str = "certward.dev/filename-base";
/// Annotation holding the signing CA's `namespace/name`
pub const SIGNED_BY_ANNOTATION: &str = "certward.dev/signed-by";

/// Label marking records written by certward
pub const MANAGED_BY_LABEL: &str = "certward.dev/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "certward";

const RESERVED_ANNOTATIONS: [&str; 4] = [
    PROVENANCE_ANNOTATION,
    ALGORITHM_ANNOTATION,
    FILENAME_BASE_ANNOTATION,
    SIGNED_BY_ANNOTATION,
];

/// Namespaced coordinates of a secret record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretRef {
    /// Namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
}

impl SecretRef {
    /// Create a reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for SecretRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(StoreError::InvalidSecretRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for SecretRef {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SecretRef> for String {
    fn from(value: SecretRef) -> Self {
        value.to_string()
    }
}

/// Where a record's key material came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Schema version
    pub version: u32,
    /// `ECDSA` or `RSA`, kept textual so unknown values surface on dispatch
    pub private_key_algorithm: String,
    /// Base of the `<base>.crt/.pem/.pub` data keys
    pub filename_base: String,
    /// CA record that signed this one; absent for CAs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<SecretRef>,
}

/// Check that a file name base is a single plain path component
///
/// Allowed: non-empty, `[A-Za-z0-9._-]` only, no leading `.`.
pub fn validate_filename_base(base: &str) -> Result<(), StoreError> {
    let plain = !base.is_empty()
        && !base.starts_with('.')
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidFilenameBase(base.to_string()))
    }
}

impl Provenance {
    /// Provenance for a record written now
    pub fn new(
        algorithm: PrivateKeyAlgorithm,
        filename_base: impl Into<String>,
        signed_by: Option<SecretRef>,
    ) -> Result<Self, StoreError> {
        let filename_base = filename_base.into();
        validate_filename_base(&filename_base)?;
        Ok(Self {
            version: PROVENANCE_VERSION,
            private_key_algorithm: algorithm.as_str().to_string(),
            filename_base,
            signed_by,
        })
    }

    /// Parsed key algorithm
    pub fn algorithm(&self) -> Result<PrivateKeyAlgorithm, PkiError> {
        self.private_key_algorithm.parse()
    }

    /// Flat annotations plus the JSON document
    pub fn to_annotations(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let json = serde_json::to_string(self)
            .map_err(|e| StoreError::InvalidProvenance(format!("failed to encode: {}", e)))?;

        let mut annotations = BTreeMap::new();
        annotations.insert(PROVENANCE_ANNOTATION.to_string(), json);
        annotations.insert(
            ALGORITHM_ANNOTATION.to_string(),
            self.private_key_algorithm.clone(),
        );
        annotations.insert(
            FILENAME_BASE_ANNOTATION.to_string(),
            self.filename_base.clone(),
        );
        if let Some(signed_by) = &self.signed_by {
            annotations.insert(SIGNED_BY_ANNOTATION.to_string(), signed_by.to_string());
        }
        Ok(annotations)
    }

    /// Decode from a record's annotations
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self, StoreError> {
        if let Some(json) = annotations.get(PROVENANCE_ANNOTATION) {
            #[derive(Deserialize)]
            struct Versioned {
                version: u32,
            }

            let versioned: Versioned = serde_json::from_str(json)
                .map_err(|e| StoreError::InvalidProvenance(format!("{}: {}", PROVENANCE_ANNOTATION, e)))?;
            if versioned.version > PROVENANCE_VERSION {
                return Err(StoreError::UnsupportedProvenanceVersion {
                    found: versioned.version,
                    supported: PROVENANCE_VERSION,
                });
            }
            let provenance: Self = serde_json::from_str(json).map_err(|e| {
                StoreError::InvalidProvenance(format!("{}: {}", PROVENANCE_ANNOTATION, e))
            })?;
            validate_filename_base(&provenance.filename_base)?;
            return Ok(provenance);
        }

        let required = |key: &str| {
            annotations
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::InvalidProvenance(format!("missing annotation {}", key)))
        };

        let signed_by = annotations
            .get(SIGNED_BY_ANNOTATION)
            .map(|s| s.parse())
            .transpose()?;

        let filename_base = required(FILENAME_BASE_ANNOTATION)?;
        validate_filename_base(&filename_base)?;
        Ok(Self {
            version: PROVENANCE_VERSION,
            private_key_algorithm: required(ALGORITHM_ANNOTATION)?,
            filename_base,
            signed_by,
        })
    }
}

/// Merge caller metadata with the provenance keys
///
/// Returns `(labels, annotations)`. Caller keys that collide with a key
/// certward owns are rejected.
pub fn merge_metadata(
    provenance: &Provenance,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), StoreError> {
    check_caller_metadata(labels, annotations)?;

    let mut merged_labels = labels.clone();
    merged_labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let mut merged_annotations = annotations.clone();
    merged_annotations.extend(provenance.to_annotations()?);

    Ok((merged_labels, merged_annotations))
}

/// Reject caller labels or annotations that use a reserved key
pub fn check_caller_metadata(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<(), StoreError> {
    if labels.contains_key(MANAGED_BY_LABEL) {
        return Err(StoreError::ReservedMetadataKey(MANAGED_BY_LABEL.to_string()));
    }
    if let Some(key) = annotations
        .keys()
        .find(|key| RESERVED_ANNOTATIONS.contains(&key.as_str()))
    {
        return Err(StoreError::ReservedMetadataKey(key.clone()));
    }
    Ok(())
}
