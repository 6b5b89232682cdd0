//! Error types for certward

use thiserror::Error;

use crate::cluster::ConnectError;
use crate::pki::PkiError;
use crate::rbac::RbacError;
use crate::readiness::ReadinessError;
use crate::store::StoreError;

/// Main error type for certward operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Key or certificate error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Secret storage error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Access grant error
    #[error("access error: {0}")]
    Rbac(#[from] RbacError),

    /// Readiness wait error
    #[error("readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// Cluster connection error
    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Invalid caller input that no module owns, e.g. a malformed `key=value` flag
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures caused by caller input rather than the cluster
    ///
    /// These never succeed on retry.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Pki(e) => pki_is_configuration(e),
            Self::Store(e) => store_is_configuration(e),
            Self::Rbac(RbacError::Store(e)) => store_is_configuration(e),
            Self::Rbac(e) => matches!(
                e,
                RbacError::RequiredArgs
                    | RbacError::TooManyIdentities(_)
                    | RbacError::InvalidServiceAccount(_)
            ),
            Self::Connect(e) => matches!(e, ConnectError::IncompleteExplicit),
            Self::Readiness(_) => false,
        }
    }
}

fn pki_is_configuration(e: &PkiError) -> bool {
    matches!(
        e,
        PkiError::UnknownAlgorithm(_)
            | PkiError::UnknownCurve(_)
            | PkiError::RsaBitsTooLow(_)
            | PkiError::InvalidDistinguishedName(_)
            | PkiError::InvalidValidity(_)
    )
}

fn store_is_configuration(e: &StoreError) -> bool {
    match e {
        StoreError::Pki(e) => pki_is_configuration(e),
        StoreError::ReservedMetadataKey(_)
        | StoreError::InvalidSecretRef(_)
        | StoreError::InvalidFilenameBase(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ==========================================================================
    // Story Tests: Error Propagation in Certificate Operations
    // ==========================================================================
    //
    // Each module owns its error enum; these tests show how they surface
    // through the top-level type a CLI user sees.

    /// Story: bad TLS options are rejected before any key is generated
    #[test]
    fn story_configuration_errors_are_not_retryable() {
        let err: Error = PkiError::RsaBitsTooLow(2047).into();
        assert!(err.to_string().contains("pki error"));
        assert!(err.to_string().contains("2047"));
        assert!(err.is_configuration());

        let err: Error = PkiError::UnknownCurve("P192".to_string()).into();
        assert!(err.to_string().contains("P192"));
        assert!(err.is_configuration());

        let err: Error = RbacError::InvalidServiceAccount("invalid".to_string()).into();
        assert!(err.to_string().contains("namespace/name"));
        assert!(err.is_configuration());

        let err: Error = RbacError::RequiredArgs.into();
        assert!(err.is_configuration());

        let err: Error = StoreError::InvalidFilenameBase("../x".to_string()).into();
        assert!(err.to_string().contains("../x"));
        assert!(err.is_configuration());

        // Options rejected inside a grant are still configuration errors
        let err: Error = RbacError::Store(StoreError::Pki(PkiError::RsaBitsTooLow(1024))).into();
        assert!(err.is_configuration());
    }

    /// Story: a missing CA names the secret the user has to create
    #[test]
    fn story_missing_ca_is_actionable() {
        let err: Error = StoreError::CaNotFound {
            namespace: "kube-system".to_string(),
            name: "tiller-ca".to_string(),
        }
        .into();
        assert!(err.to_string().contains("kube-system/tiller-ca"));
        assert!(!err.is_configuration());
    }

    /// Story: duplicate names are reported, never overwritten
    #[test]
    fn story_storage_conflicts_surface() {
        let err: Error = RbacError::Store(StoreError::AlreadyExists {
            namespace: "kube-system".to_string(),
            name: "certward-client-abc-certs".to_string(),
        })
        .into();
        assert!(err.to_string().contains("access error"));
        assert!(err.to_string().contains("already exists"));
    }

    /// Story: a readiness timeout names the namespace waited on
    #[test]
    fn story_timeout_is_distinct() {
        let err: Error = ReadinessError::Timeout {
            namespace: "kube-system".to_string(),
            deadline: Duration::from_secs(300),
        }
        .into();
        assert!(matches!(
            err,
            Error::Readiness(ReadinessError::Timeout { .. })
        ));
        assert!(err.to_string().contains("kube-system"));
    }

    #[test]
    fn validation_helper() {
        match Error::validation("label 'app' must be key=value") {
            Error::Validation(msg) => assert!(msg.contains("key=value")),
            other => panic!("expected Validation, got {:?}", other),
        }
        assert!(Error::validation("x").is_configuration());
    }

    #[test]
    fn connection_errors_convert() {
        let err: Error = ConnectError::IncompleteExplicit.into();
        assert!(err.to_string().contains("connection error"));
        assert!(err.to_string().contains("--token"));
        assert!(err.is_configuration());
    }
}
