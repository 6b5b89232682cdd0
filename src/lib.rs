//! certward - certificate lifecycle for cluster-hosted TLS services
//!
//! certward issues the CA and leaf certificates a privileged in-cluster TLS
//! server and its clients authenticate with, persists them as Kubernetes
//! secrets annotated with their provenance, and ties client certificates to
//! RBAC identities.
//!
//! # Architecture
//!
//! - A CA is generated once and stored as a secret in the server namespace
//! - Leaf certificates are issued by loading that CA back from its secret
//! - Every record carries versioned provenance (algorithm, file naming,
//!   signing CA) so later steps never guess how it was produced
//! - Client access is a certificate plus a Role/RoleBinding per identity
//!
//! # Modules
//!
//! - [`options`] - TLS options and their validation
//! - [`pki`] - Key pairs, certificate issuance and inspection
//! - [`store`] - Secret-backed PKI storage and provenance metadata
//! - [`rbac`] - Grant, revoke and configure client access
//! - [`readiness`] - Deadline-bounded readiness polling
//! - [`cluster`] - Kubernetes client construction
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod options;
pub mod pki;
pub mod rbac;
pub mod readiness;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of every label and annotation key certward writes
pub const METADATA_PREFIX: &str = "certward.dev/";

/// Default namespace of the TLS server and its CA
pub const DEFAULT_SERVER_NAMESPACE: &str = "kube-system";

/// Default name of the CA secret in the server namespace
pub const DEFAULT_CA_SECRET_NAME: &str = "certward-ca";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keys_share_the_prefix() {
        for key in [
            store::provenance::PROVENANCE_ANNOTATION,
            store::provenance::ALGORITHM_ANNOTATION,
            store::provenance::FILENAME_BASE_ANNOTATION,
            store::provenance::SIGNED_BY_ANNOTATION,
            store::provenance::MANAGED_BY_LABEL,
            rbac::CREDENTIALS_LABEL,
            rbac::CREDENTIALS_TYPE_LABEL,
            rbac::ENTITY_HASH_LABEL,
            rbac::ENTITY_ANNOTATION,
        ] {
            assert!(key.starts_with(METADATA_PREFIX), "{} lacks prefix", key);
        }
    }
}
