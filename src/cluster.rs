//! Cluster connectivity
//!
//! Resolves which API server to talk to from, in order of preference:
//! an explicit server/CA/token triple, a kubeconfig file (optionally with a
//! named context), or whatever `kube` infers from the environment.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tracing::debug;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const EXPLICIT_CONTEXT: &str = "certward";

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Kubeconfig could not be read or parsed
    #[error("failed to read kubeconfig: {0}")]
    Kubeconfig(String),

    /// Client configuration could not be built
    #[error("failed to load cluster config: {0}")]
    Config(String),

    /// Only part of the server/CA/token triple was given
    #[error("--server, --certificate-authority and --token must be given together")]
    IncompleteExplicit,

    /// Reading the CA file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Client construction failed
    #[error("failed to create client: {0}")]
    Client(#[from] kube::Error),
}

/// How to reach the cluster
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Kubeconfig file
    pub kubeconfig: Option<PathBuf>,
    /// Context within the kubeconfig
    pub context: Option<String>,
    /// API server URL
    pub server: Option<String>,
    /// PEM file with the API server CA
    pub certificate_authority: Option<PathBuf>,
    /// Bearer token
    pub token: Option<String>,
}

impl ConnectionOptions {
    fn explicit(&self) -> Result<Option<(&str, &PathBuf, &str)>, ConnectError> {
        match (&self.server, &self.certificate_authority, &self.token) {
            (None, None, None) => Ok(None),
            (Some(server), Some(ca), Some(token)) => Ok(Some((server.as_str(), ca, token.as_str()))),
            _ => Err(ConnectError::IncompleteExplicit),
        }
    }

    /// Build a client config with default timeouts
    pub async fn config(&self) -> Result<Config, ConnectError> {
        let mut config = match self.explicit()? {
            Some((server, ca_path, token)) => {
                let ca_pem = std::fs::read(ca_path)?;
                let kubeconfig = explicit_kubeconfig(server, &ca_pem, token)?;
                debug!(server = %server, "using explicit server credentials");
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ConnectError::Config(e.to_string()))?
            }
            None => match &self.kubeconfig {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path)
                        .map_err(|e| ConnectError::Kubeconfig(e.to_string()))?;
                    let options = KubeConfigOptions {
                        context: self.context.clone(),
                        ..Default::default()
                    };
                    debug!(path = %path.display(), context = ?self.context, "using kubeconfig");
                    Config::from_custom_kubeconfig(kubeconfig, &options)
                        .await
                        .map_err(|e| ConnectError::Config(e.to_string()))?
                }
                None if self.context.is_some() => {
                    let options = KubeConfigOptions {
                        context: self.context.clone(),
                        ..Default::default()
                    };
                    Config::from_kubeconfig(&options)
                        .await
                        .map_err(|e| ConnectError::Config(e.to_string()))?
                }
                None => Config::infer()
                    .await
                    .map_err(|e| ConnectError::Config(e.to_string()))?,
            },
        };

        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        Ok(config)
    }
}

/// Create a client from connection options
pub async fn connect(options: &ConnectionOptions) -> Result<Client, ConnectError> {
    let config = options.config().await?;
    Ok(Client::try_from(config)?)
}

/// Single-context kubeconfig for a server/CA/token triple
fn explicit_kubeconfig(server: &str, ca_pem: &[u8], token: &str) -> Result<Kubeconfig, ConnectError> {
    let ca_data = base64::engine::general_purpose::STANDARD.encode(ca_pem);
    let document = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": EXPLICIT_CONTEXT,
            "cluster": {
                "server": server,
                "certificate-authority-data": ca_data,
            }
        }],
        "users": [{
            "name": EXPLICIT_CONTEXT,
            "user": { "token": token }
        }],
        "contexts": [{
            "name": EXPLICIT_CONTEXT,
            "context": {
                "cluster": EXPLICIT_CONTEXT,
                "user": EXPLICIT_CONTEXT,
            }
        }],
        "current-context": EXPLICIT_CONTEXT,
    });
    serde_json::from_value(document).map_err(|e| ConnectError::Kubeconfig(e.to_string()))
}
