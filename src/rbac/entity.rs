//! RBAC identities access can be granted to

use std::fmt;

use k8s_openapi::api::rbac::v1::Subject;

use super::RbacError;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// A principal: user, group or service account
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RbacEntity {
    /// Kubernetes user
    User(String),
    /// Kubernetes group
    Group(String),
    /// Service account in a namespace
    ServiceAccount {
        /// Namespace of the service account
        namespace: String,
        /// Service account name
        name: String,
    },
}

impl RbacEntity {
    /// Parse a service account from `namespace/name`
    pub fn service_account(encoded: &str) -> Result<Self, RbacError> {
        let mut parts = encoded.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::ServiceAccount {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(RbacError::InvalidServiceAccount(encoded.to_string())),
        }
    }

    /// Build the identities named by repeated flags; at least one is required
    ///
    /// Empty strings are ignored.
    pub fn collect(
        users: &[String],
        groups: &[String],
        service_accounts: &[String],
    ) -> Result<Vec<Self>, RbacError> {
        let non_empty = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        };

        let mut entities: Vec<Self> = non_empty(users).into_iter().map(Self::User).collect();
        entities.extend(non_empty(groups).into_iter().map(Self::Group));
        for sa in non_empty(service_accounts) {
            entities.push(Self::service_account(&sa)?);
        }

        if entities.is_empty() {
            return Err(RbacError::RequiredArgs);
        }
        Ok(entities)
    }

    /// Build the single identity named by exactly one of the three flags
    pub fn exactly_one(
        user: Option<&str>,
        group: Option<&str>,
        service_account: Option<&str>,
    ) -> Result<Self, RbacError> {
        let user = present(user);
        let group = present(group);
        let service_account = present(service_account);

        let count = [user, group, service_account]
            .iter()
            .filter(|v| v.is_some())
            .count();
        match count {
            0 => return Err(RbacError::RequiredArgs),
            1 => {}
            n => return Err(RbacError::TooManyIdentities(n)),
        }

        if let Some(user) = user {
            Ok(Self::User(user.to_string()))
        } else if let Some(group) = group {
            Ok(Self::Group(group.to_string()))
        } else {
            Self::service_account(service_account.unwrap_or_default())
        }
    }

    /// Stable identifier, e.g. `serviceaccount:kube-system:my-sa`
    pub fn id(&self) -> String {
        match self {
            Self::User(name) => format!("user:{}", name),
            Self::Group(name) => format!("group:{}", name),
            Self::ServiceAccount { namespace, name } => {
                format!("serviceaccount:{}:{}", namespace, name)
            }
        }
    }

    /// 16 hex characters of SHA-256 over [`id`](Self::id)
    ///
    /// Used in resource names and label values, so it must stay stable
    /// across releases.
    pub fn hash(&self) -> String {
        let digest = openssl::sha::sha256(self.id().as_bytes());
        digest[..8]
            .iter()
            .fold(String::with_capacity(16), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }

    /// Name the identity authenticates as; used as the certificate CN
    pub fn common_name(&self) -> String {
        match self {
            Self::User(name) | Self::Group(name) => name.clone(),
            Self::ServiceAccount { namespace, name } => {
                format!("system:serviceaccount:{}:{}", namespace, name)
            }
        }
    }

    /// RoleBinding subject for this identity
    pub fn subject(&self) -> Subject {
        match self {
            Self::User(name) => Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "User".to_string(),
                name: name.clone(),
                namespace: None,
            },
            Self::Group(name) => Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "Group".to_string(),
                name: name.clone(),
                namespace: None,
            },
            Self::ServiceAccount { namespace, name } => Subject {
                api_group: None,
                kind: "ServiceAccount".to_string(),
                name: name.clone(),
                namespace: Some(namespace.clone()),
            },
        }
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl fmt::Display for RbacEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(name) => write!(f, "user {}", name),
            Self::Group(name) => write!(f, "group {}", name),
            Self::ServiceAccount { namespace, name } => {
                write!(f, "service account {}/{}", namespace, name)
            }
        }
    }
}
