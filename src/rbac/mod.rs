//! Access grants tying client certificates to RBAC identities
//!
//! Granting access to an identity issues a client certificate signed by the
//! server CA, stores it as a labeled secret in the server namespace, and
//! creates a Role and RoleBinding letting that identity read its own
//! credentials and port-forward to the server. Revoking removes all three.
//!
//! Every identity in a batch is handled on its own. A failure for one
//! identity is recorded in the [`AccessReport`] and the batch carries on;
//! nothing is rolled back.

mod entity;

pub use entity::RbacEntity;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use thiserror::Error;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::options::TlsOptions;
use crate::store::{IssueRequest, PkiStore, SecretRef, StoreError};

/// Label marking a secret as access credentials
pub const CREDENTIALS_LABEL: &str = "certward.dev/credentials";
/// Label naming the credential flavor
pub const CREDENTIALS_TYPE_LABEL: &str = "certward.dev/credentials-type";
/// Label holding [`RbacEntity::hash`]
pub const ENTITY_HASH_LABEL: &str = "certward.dev/entity-hash";
/// Annotation holding [`RbacEntity::id`]
pub const ENTITY_ANNOTATION: &str = "certward.dev/entity";

/// File name base used inside client credential secrets
pub const CLIENT_FILENAME_BASE: &str = "client";

/// RBAC workflow errors
#[derive(Debug, Error)]
pub enum RbacError {
    /// No identity was named
    #[error("at least one user, group or service account is required")]
    RequiredArgs,

    /// More than one identity was named where exactly one is allowed
    #[error("exactly one user, group or service account is allowed, got {0}")]
    TooManyIdentities(usize),

    /// Service account is not `namespace/name`
    #[error("invalid service account '{0}' (expected namespace/name)")]
    InvalidServiceAccount(String),

    /// The identity has no credentials to revoke or configure
    #[error("no credentials found for {0}")]
    NoCredentials(String),

    /// An RBAC object with this name already exists
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// Storing or loading credentials failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Trait for the RBAC object operations the workflow needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacClient: Send + Sync {
    /// Create a Role; an existing name fails with [`RbacError::AlreadyExists`]
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), RbacError>;

    /// Create a RoleBinding; an existing name fails with [`RbacError::AlreadyExists`]
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), RbacError>;

    /// Delete Roles matching a label selector, returning how many were removed
    async fn delete_roles(&self, namespace: &str, label_selector: &str)
        -> Result<usize, RbacError>;

    /// Delete RoleBindings matching a label selector, returning how many were removed
    async fn delete_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<usize, RbacError>;
}

/// Real Kubernetes RBAC client
pub struct KubeRbacClient {
    client: Client,
}

impl KubeRbacClient {
    /// Create a new KubeRbacClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn conflict(kind: &'static str, namespace: &str, meta: &ObjectMeta) -> RbacError {
    RbacError::AlreadyExists {
        kind,
        namespace: namespace.to_string(),
        name: meta.name.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl RbacClient for KubeRbacClient {
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), RbacError> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), role).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(conflict("Role", namespace, &role.metadata))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), RbacError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), binding).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(conflict("RoleBinding", namespace, &binding.metadata))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_roles(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<usize, RbacError> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        delete_matching(&api, label_selector).await
    }

    async fn delete_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<usize, RbacError> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        delete_matching(&api, label_selector).await
    }
}

async fn delete_matching<K>(api: &Api<K>, label_selector: &str) -> Result<usize, RbacError>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let objects = api
        .list(&ListParams::default().labels(label_selector))
        .await?;

    let mut deleted = 0;
    for object in objects.items {
        let Some(name) = object.meta().name.clone() else {
            continue;
        };
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => deleted += 1,
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Outcome for one identity in a batch
#[derive(Debug)]
pub struct EntityOutcome {
    /// Identity the outcome is for
    pub entity: RbacEntity,
    /// Credential secrets created (grant) or deleted (revoke)
    pub result: Result<Vec<SecretRef>, RbacError>,
}

/// Per-identity results of a grant or revoke
#[derive(Debug, Default)]
pub struct AccessReport {
    /// One entry per requested identity, in request order
    pub outcomes: Vec<EntityOutcome>,
}

impl AccessReport {
    /// True when every identity succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Identities that failed, with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&RbacEntity, &RbacError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.entity, e)))
    }
}

/// Grant/revoke/configure workflow for one server deployment
pub struct AccessGrant {
    store: PkiStore,
    rbac: Arc<dyn RbacClient>,
    server_namespace: String,
    ca: SecretRef,
    ca_passphrase: String,
    client_key_passphrase: String,
    template: TlsOptions,
}

impl AccessGrant {
    /// Workflow against the CA secret `ca_secret_name` in `server_namespace`
    ///
    /// `template` supplies everything about client certificates except the
    /// common name, which comes from the identity.
    pub fn new(
        store: PkiStore,
        rbac: Arc<dyn RbacClient>,
        server_namespace: impl Into<String>,
        ca_secret_name: impl Into<String>,
        template: TlsOptions,
    ) -> Self {
        let server_namespace = server_namespace.into();
        Self {
            ca: SecretRef::new(server_namespace.clone(), ca_secret_name),
            store,
            rbac,
            server_namespace,
            ca_passphrase: String::new(),
            client_key_passphrase: String::new(),
            template,
        }
    }

    /// Create the workflow talking to the cluster
    pub fn from_client(
        client: Client,
        server_namespace: impl Into<String>,
        ca_secret_name: impl Into<String>,
        template: TlsOptions,
    ) -> Self {
        Self::new(
            PkiStore::from_client(client.clone()),
            Arc::new(KubeRbacClient::new(client)),
            server_namespace,
            ca_secret_name,
            template,
        )
    }

    /// Passphrase protecting the CA private key
    pub fn with_ca_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.ca_passphrase = passphrase.into();
        self
    }

    /// Passphrase to encrypt client private keys with
    pub fn with_client_key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.client_key_passphrase = passphrase.into();
        self
    }

    /// Name of the credential secret for `entity`
    pub fn secret_name(entity: &RbacEntity) -> String {
        format!("certward-client-{}-certs", entity.hash())
    }

    /// Name of the Role and RoleBinding for `entity`
    pub fn role_name(entity: &RbacEntity) -> String {
        format!("certward-client-{}", entity.hash())
    }

    fn selector(entity: &RbacEntity) -> String {
        format!("{}={}", ENTITY_HASH_LABEL, entity.hash())
    }

    /// Issue credentials and RBAC for each identity
    pub async fn grant(&self, entities: &[RbacEntity]) -> Result<AccessReport, RbacError> {
        if entities.is_empty() {
            return Err(RbacError::RequiredArgs);
        }

        let mut report = AccessReport::default();
        for entity in entities {
            let result = self.grant_one(entity).await;
            match &result {
                Ok(_) => info!(entity = %entity, namespace = %self.server_namespace, "granted access"),
                Err(e) => warn!(entity = %entity, error = %e, "failed to grant access"),
            }
            report.outcomes.push(EntityOutcome {
                entity: entity.clone(),
                result,
            });
        }
        Ok(report)
    }

    /// Remove credentials and RBAC for each identity
    pub async fn revoke(&self, entities: &[RbacEntity]) -> Result<AccessReport, RbacError> {
        if entities.is_empty() {
            return Err(RbacError::RequiredArgs);
        }

        let mut report = AccessReport::default();
        for entity in entities {
            let result = self.revoke_one(entity).await;
            match &result {
                Ok(_) => info!(entity = %entity, namespace = %self.server_namespace, "revoked access"),
                Err(e) => warn!(entity = %entity, error = %e, "failed to revoke access"),
            }
            report.outcomes.push(EntityOutcome {
                entity: entity.clone(),
                result,
            });
        }
        Ok(report)
    }

    /// Write one identity's credentials to `output_dir`
    ///
    /// Returns the files written.
    pub async fn configure(
        &self,
        entity: &RbacEntity,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, RbacError> {
        let secret = SecretRef::new(&self.server_namespace, Self::secret_name(entity));
        let bundle = match self.store.load_bundle(&secret).await {
            Ok(bundle) => bundle,
            Err(StoreError::NotFound { .. }) => {
                return Err(RbacError::NoCredentials(entity.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let written = bundle.write_to(output_dir)?;
        info!(
            entity = %entity,
            dir = %output_dir.display(),
            files = written.len(),
            "wrote client credentials"
        );
        Ok(written)
    }

    async fn grant_one(&self, entity: &RbacEntity) -> Result<Vec<SecretRef>, RbacError> {
        let hash = entity.hash();
        let secret_name = Self::secret_name(entity);

        let mut options = self.template.clone();
        options.distinguished_name = options
            .distinguished_name
            .with_common_name(entity.common_name());

        let mut request = IssueRequest::new(
            SecretRef::new(&self.server_namespace, &secret_name),
            CLIENT_FILENAME_BASE,
            options,
        );
        request.passphrase = self.client_key_passphrase.clone();
        request.labels = BTreeMap::from([
            (CREDENTIALS_LABEL.to_string(), "true".to_string()),
            (CREDENTIALS_TYPE_LABEL.to_string(), "client".to_string()),
            (ENTITY_HASH_LABEL.to_string(), hash.clone()),
        ]);
        request.annotations = BTreeMap::from([(ENTITY_ANNOTATION.to_string(), entity.id())]);

        let record = self
            .store
            .store_signed(&request, &self.ca, &self.ca_passphrase)
            .await?;

        let labels = BTreeMap::from([(ENTITY_HASH_LABEL.to_string(), hash)]);
        let role_name = Self::role_name(entity);

        let role = Role {
            metadata: ObjectMeta {
                name: Some(role_name.clone()),
                namespace: Some(self.server_namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            rules: Some(access_rules(&secret_name)),
        };
        self.rbac
            .create_role(&self.server_namespace, &role)
            .await?;

        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(role_name.clone()),
                namespace: Some(self.server_namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role_name,
            },
            subjects: Some(vec![entity.subject()]),
        };
        self.rbac
            .create_role_binding(&self.server_namespace, &binding)
            .await?;

        Ok(vec![record.secret])
    }

    async fn revoke_one(&self, entity: &RbacEntity) -> Result<Vec<SecretRef>, RbacError> {
        let selector = Self::selector(entity);
        let ns = &self.server_namespace;

        let secrets = self
            .store
            .list(ns, &format!("{},{}=true", selector, CREDENTIALS_LABEL))
            .await?;
        let mut deleted = Vec::with_capacity(secrets.len());
        for secret in secrets {
            if self.store.delete(&secret).await? {
                deleted.push(secret);
            }
        }

        let bindings = self.rbac.delete_role_bindings(ns, &selector).await?;
        let roles = self.rbac.delete_roles(ns, &selector).await?;
        info!(
            entity = %entity,
            secrets = deleted.len(),
            bindings,
            roles,
            "deleted access resources"
        );

        if deleted.is_empty() {
            return Err(RbacError::NoCredentials(entity.to_string()));
        }
        Ok(deleted)
    }
}

/// Read the one credential secret, list pods and port-forward to them
fn access_rules(secret_name: &str) -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![secret_name.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            verbs: vec!["list".to_string()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods/portforward".to_string()]),
            verbs: vec!["create".to_string()],
            ..Default::default()
        },
    ]
}
