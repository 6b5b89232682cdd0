//! Secret-backed PKI storage
//!
//! Persists key material and provenance metadata as Kubernetes `Secret`s and
//! runs the "load CA, issue leaf, persist" sequence for signed certificates.
//!
//! # Record Layout
//!
//! A record named by a [`SecretRef`] holds `<base>.crt`, `<base>.pem` and
//! `<base>.pub`, plus `ca.crt` when it was signed by a CA record. Provenance
//! lives in annotations (see [`provenance`]). Records are created once and
//! never updated; a name collision is an error, not an upsert.

pub mod provenance;
pub mod workspace;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::options::TlsOptions;
use crate::pki::{
    issue, write_with_mode, Certificate, CertificateTemplate, KeyPair, PkiError, Signer,
    PRIVATE_KEY_FILE_MODE, PUBLIC_FILE_MODE,
};
pub use provenance::{Provenance, SecretRef};
use provenance::merge_metadata;
use workspace::{certificate_file, private_key_file, public_key_file, Workspace, CA_CERT_FILE};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The CA record a leaf should be signed by does not exist
    #[error("CA secret {namespace}/{name} not found")]
    CaNotFound {
        /// Namespace searched
        namespace: String,
        /// Secret name searched
        name: String,
    },

    /// A record that should exist does not
    #[error("secret {namespace}/{name} not found")]
    NotFound {
        /// Namespace searched
        namespace: String,
        /// Secret name searched
        name: String,
    },

    /// A record with this name already exists
    #[error("secret {namespace}/{name} already exists")]
    AlreadyExists {
        /// Namespace of the existing record
        namespace: String,
        /// Name of the existing record
        name: String,
    },

    /// A record lacks an expected data key
    #[error("secret {secret} has no '{key}' entry")]
    MissingKey {
        /// Record in `namespace/name` form
        secret: String,
        /// Missing data key
        key: String,
    },

    /// Caller metadata uses a key certward owns
    #[error("label or annotation '{0}' is reserved")]
    ReservedMetadataKey(String),

    /// Provenance annotations are missing or malformed
    #[error("invalid provenance: {0}")]
    InvalidProvenance(String),

    /// Provenance was written by a newer schema
    #[error("provenance version {found} is newer than supported version {supported}")]
    UnsupportedProvenanceVersion {
        /// Version found on the record
        found: u32,
        /// Highest version this build reads
        supported: u32,
    },

    /// File name base is not a plain file name, or collides with `ca`
    /// on a signed record
    #[error("invalid filename base '{0}' (expected a plain name of [A-Za-z0-9._-])")]
    InvalidFilenameBase(String),

    /// Secret reference is not `namespace/name`
    #[error("invalid secret reference '{0}' (expected namespace/name)")]
    InvalidSecretRef(String),

    /// Key or certificate operation failed
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Trait for the secret operations the store needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Fetch a secret, `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret; an existing name fails with [`StoreError::AlreadyExists`]
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    /// Delete a secret, returning whether it existed
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;

    /// List secrets matching a label selector
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;
}

/// Real Kubernetes secret client
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    /// Create a new KubeSecretClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(StoreError::AlreadyExists {
                namespace: namespace.to_string(),
                name: secret.metadata.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(secrets.items)
    }
}

/// What to issue and where to put it
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// Target record
    pub target: SecretRef,
    /// Base of the data keys, e.g. `tiller` for `tiller.crt`
    pub filename_base: String,
    /// Subject, validity and key parameters
    pub options: TlsOptions,
    /// Passphrase for the new private key; empty leaves it unencrypted
    pub passphrase: String,
    /// Extra DNS SANs
    pub dns_names: Vec<String>,
    /// Caller labels merged into the record
    pub labels: BTreeMap<String, String>,
    /// Caller annotations merged into the record
    pub annotations: BTreeMap<String, String>,
}

impl IssueRequest {
    /// Request with no passphrase, SANs or caller metadata
    pub fn new(target: SecretRef, filename_base: impl Into<String>, options: TlsOptions) -> Self {
        Self {
            target,
            filename_base: filename_base.into(),
            options,
            passphrase: String::new(),
            dns_names: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Outcome of a successful issuance
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Where the record was written
    pub secret: SecretRef,
    /// Provenance recorded on it
    pub provenance: Provenance,
    /// Issued certificate
    pub certificate: Certificate,
}

/// A CA record loaded back into memory
#[derive(Debug)]
pub struct LoadedCa {
    /// CA certificate
    pub certificate: Certificate,
    /// CA private key
    pub key: KeyPair,
    /// Provenance of the CA record
    pub provenance: Provenance,
}

impl LoadedCa {
    /// Borrow as a signer
    pub fn signer(&self) -> Signer<'_> {
        Signer {
            certificate: &self.certificate,
            key: &self.key,
        }
    }
}

/// Raw key material of one record
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    /// Provenance of the record
    pub provenance: Provenance,
    /// `<base>.crt`
    pub certificate: Vec<u8>,
    /// `<base>.pem`, as stored
    pub private_key: Vec<u8>,
    /// `<base>.pub`
    pub public_key: Vec<u8>,
    /// `ca.crt`, present on signed records
    pub ca_certificate: Option<Vec<u8>>,
}

impl CredentialBundle {
    /// Write the bundle under `dir`, private key 0600 and the rest 0644
    ///
    /// Returns the paths written.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<std::path::PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let base = &self.provenance.filename_base;

        let mut files = vec![
            (certificate_file(base), &self.certificate, PUBLIC_FILE_MODE),
            (public_key_file(base), &self.public_key, PUBLIC_FILE_MODE),
            (private_key_file(base), &self.private_key, PRIVATE_KEY_FILE_MODE),
        ];
        if let Some(ca) = &self.ca_certificate {
            files.insert(0, (CA_CERT_FILE.to_string(), ca, PUBLIC_FILE_MODE));
        }

        let mut written = Vec::with_capacity(files.len());
        for (name, contents, mode) in files {
            let path = dir.join(name);
            write_with_mode(&path, contents, mode)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Secret-backed PKI store
#[derive(Clone)]
pub struct PkiStore {
    secrets: Arc<dyn SecretClient>,
}

impl PkiStore {
    /// Create a store over any secret client
    pub fn new(secrets: Arc<dyn SecretClient>) -> Self {
        Self { secrets }
    }

    /// Create a store talking to the cluster
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(KubeSecretClient::new(client)))
    }

    /// Generate a self-signed CA and persist it
    pub async fn store_ca(&self, request: &IssueRequest) -> Result<StoredRecord> {
        let spec = request.options.validate()?;
        let provenance = Provenance::new(spec.algorithm(), &request.filename_base, None)?;
        let (labels, annotations) =
            merge_metadata(&provenance, &request.labels, &request.annotations)?;

        let workspace = Workspace::new()?;
        let key = KeyPair::generate(&spec)?;
        let certificate = issue(&template(request, true), &key, None)?;

        let base = &request.filename_base;
        workspace.write_key_pair(base, &key, &request.passphrase)?;
        workspace.write_certificate(&certificate_file(base), &certificate)?;
        let data = workspace.collect(&record_files(base, false))?;

        self.persist(&request.target, labels, annotations, data)
            .await?;

        info!(
            secret = %request.target,
            algorithm = %spec,
            "stored CA certificate"
        );
        Ok(StoredRecord {
            secret: request.target.clone(),
            provenance,
            certificate,
        })
    }

    /// Issue a leaf signed by the CA record `ca` and persist it
    ///
    /// A missing CA record fails with [`StoreError::CaNotFound`] before
    /// anything is written.
    pub async fn store_signed(
        &self,
        request: &IssueRequest,
        ca: &SecretRef,
        ca_passphrase: &str,
    ) -> Result<StoredRecord> {
        let spec = request.options.validate()?;
        // `ca.crt` holds the signer's certificate on signed records
        if certificate_file(&request.filename_base) == CA_CERT_FILE {
            return Err(StoreError::InvalidFilenameBase(request.filename_base.clone()));
        }
        let provenance =
            Provenance::new(spec.algorithm(), &request.filename_base, Some(ca.clone()))?;
        let (labels, annotations) =
            merge_metadata(&provenance, &request.labels, &request.annotations)?;

        let workspace = Workspace::new()?;
        let loaded = self.materialize_ca(&workspace, ca, ca_passphrase).await?;

        let key = KeyPair::generate(&spec)?;
        let certificate = issue(&template(request, false), &key, Some(loaded.signer()))?;

        let base = &request.filename_base;
        workspace.write_key_pair(base, &key, &request.passphrase)?;
        workspace.write_certificate(&certificate_file(base), &certificate)?;
        workspace.write_certificate(CA_CERT_FILE, &loaded.certificate)?;
        let data = workspace.collect(&record_files(base, true))?;

        self.persist(&request.target, labels, annotations, data)
            .await?;

        info!(
            secret = %request.target,
            signed_by = %ca,
            algorithm = %spec,
            "stored signed certificate"
        );
        Ok(StoredRecord {
            secret: request.target.clone(),
            provenance,
            certificate,
        })
    }

    /// Load a CA record's certificate and key
    pub async fn load_ca(&self, ca: &SecretRef, passphrase: &str) -> Result<LoadedCa> {
        let workspace = Workspace::new()?;
        self.materialize_ca(&workspace, ca, passphrase).await
    }

    /// Fetch a record's raw key material
    pub async fn load_bundle(&self, secret: &SecretRef) -> Result<CredentialBundle> {
        let record = self
            .secrets
            .get(&secret.namespace, &secret.name)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                namespace: secret.namespace.clone(),
                name: secret.name.clone(),
            })?;
        bundle_from_secret(secret, &record)
    }

    /// Fetch a record's provenance and certificate
    pub async fn inspect(&self, secret: &SecretRef) -> Result<(Provenance, Certificate)> {
        let bundle = self.load_bundle(secret).await?;
        let certificate = Certificate::from_pem(&bundle.certificate)?;
        Ok((bundle.provenance, certificate))
    }

    /// Delete a record, returning whether it existed
    pub async fn delete(&self, secret: &SecretRef) -> Result<bool> {
        let existed = self.secrets.delete(&secret.namespace, &secret.name).await?;
        debug!(secret = %secret, existed, "deleted secret");
        Ok(existed)
    }

    /// References of records matching a label selector
    pub async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<SecretRef>> {
        let secrets = self.secrets.list(namespace, label_selector).await?;
        Ok(secrets
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .map(|name| SecretRef::new(namespace, name))
            .collect())
    }

    async fn materialize_ca(
        &self,
        workspace: &Workspace,
        ca: &SecretRef,
        passphrase: &str,
    ) -> Result<LoadedCa> {
        let record = self
            .secrets
            .get(&ca.namespace, &ca.name)
            .await?
            .ok_or_else(|| StoreError::CaNotFound {
                namespace: ca.namespace.clone(),
                name: ca.name.clone(),
            })?;

        let provenance = provenance_of(&record)?;
        let algorithm = provenance.algorithm()?;
        let base = &provenance.filename_base;

        let cert_file = certificate_file(base);
        let key_file = private_key_file(base);
        workspace.write_raw(&cert_file, data_entry(ca, &record, &cert_file)?)?;
        workspace.write_raw(&key_file, data_entry(ca, &record, &key_file)?)?;

        let certificate = Certificate::from_pem(&workspace.read(&cert_file)?)?;
        if !certificate.is_ca()? {
            return Err(StoreError::InvalidProvenance(format!(
                "secret {} does not hold a CA certificate",
                ca
            )));
        }
        let key = KeyPair::from_private_key_pem(algorithm, &workspace.read(&key_file)?, passphrase)?;

        debug!(secret = %ca, %algorithm, "loaded CA");
        Ok(LoadedCa {
            certificate,
            key,
            provenance,
        })
    }

    async fn persist(
        &self,
        target: &SecretRef,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };
        self.secrets.create(&target.namespace, &secret).await?;
        Ok(())
    }
}

fn template(request: &IssueRequest, is_ca: bool) -> CertificateTemplate {
    CertificateTemplate {
        subject: request.options.distinguished_name.clone(),
        validity: request.options.validity(),
        is_ca,
        dns_names: request.dns_names.clone(),
    }
}

fn record_files(base: &str, signed: bool) -> Vec<String> {
    let mut files = vec![
        certificate_file(base),
        private_key_file(base),
        public_key_file(base),
    ];
    if signed {
        files.push(CA_CERT_FILE.to_string());
    }
    files
}

fn provenance_of(secret: &Secret) -> Result<Provenance> {
    let empty = BTreeMap::new();
    let annotations = secret.metadata.annotations.as_ref().unwrap_or(&empty);
    Provenance::from_annotations(annotations)
}

fn data_entry<'a>(reference: &SecretRef, secret: &'a Secret, key: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .ok_or_else(|| StoreError::MissingKey {
            secret: reference.to_string(),
            key: key.to_string(),
        })
}

fn bundle_from_secret(reference: &SecretRef, secret: &Secret) -> Result<CredentialBundle> {
    let provenance = provenance_of(secret)?;
    let base = provenance.filename_base.clone();
    let ca_certificate = secret
        .data
        .as_ref()
        .and_then(|data| data.get(CA_CERT_FILE))
        .map(|bytes| bytes.0.clone());

    Ok(CredentialBundle {
        certificate: data_entry(reference, secret, &certificate_file(&base))?.to_vec(),
        private_key: data_entry(reference, secret, &private_key_file(&base))?.to_vec(),
        public_key: data_entry(reference, secret, &public_key_file(&base))?.to_vec(),
        ca_certificate,
        provenance,
    })
}
