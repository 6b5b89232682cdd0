//! certward - certificate lifecycle CLI for cluster-hosted TLS services

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use certward::cluster::{connect, ConnectionOptions};
use certward::options::{DistinguishedName, TlsOptions};
use certward::pki::{Certificate, CertificateInfo};
use certward::rbac::{AccessGrant, AccessReport, RbacEntity};
use certward::readiness::{KubeWorkloadProbe, ReadinessPoller, DEFAULT_POLL_INTERVAL};
use certward::store::{IssueRequest, PkiStore, SecretRef};
use certward::{Error, DEFAULT_CA_SECRET_NAME, DEFAULT_SERVER_NAMESPACE};

/// certward - issue, store and grant TLS credentials for in-cluster servers
#[derive(Parser, Debug)]
#[command(name = "certward", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate, verify and inspect certificates
    #[command(subcommand)]
    Tls(TlsCommands),

    /// Grant identities a client certificate and access to the server
    Grant(AccessArgs),

    /// Revoke identities' client certificates and access
    Revoke(AccessArgs),

    /// Write one identity's client credentials to a directory
    Configure(ConfigureArgs),

    /// Wait until a deployment runs the expected image
    WaitForReady(WaitArgs),
}

#[derive(Subcommand, Debug)]
enum TlsCommands {
    /// Generate a CA, or a certificate signed by a stored CA, into a secret
    Gen(GenArgs),

    /// Verify a certificate file chains to a CA file
    Verify(VerifyArgs),

    /// Print provenance and certificate details of a stored record
    Inspect(InspectArgs),
}

/// How to reach the cluster
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Kubeconfig file (defaults to KUBECONFIG or ~/.kube/config)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long, global = true, env = "CERTWARD_CONTEXT")]
    context: Option<String>,

    /// API server URL; requires --certificate-authority and --token
    #[arg(long, global = true, env = "CERTWARD_SERVER")]
    server: Option<String>,

    /// PEM file with the API server CA
    #[arg(long, global = true, env = "CERTWARD_CERTIFICATE_AUTHORITY")]
    certificate_authority: Option<PathBuf>,

    /// Bearer token
    #[arg(long, global = true, env = "CERTWARD_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl From<&ConnectionArgs> for ConnectionOptions {
    fn from(args: &ConnectionArgs) -> Self {
        Self {
            kubeconfig: args.kubeconfig.clone(),
            context: args.context.clone(),
            server: args.server.clone(),
            certificate_authority: args.certificate_authority.clone(),
            token: args.token.clone(),
        }
    }
}

/// Certificate subject and key parameters
#[derive(Args, Debug)]
struct TlsArgs {
    /// YAML file with TLS options; flags override its values
    #[arg(long = "config")]
    config_file: Option<PathBuf>,

    /// Subject common name
    #[arg(long)]
    common_name: Option<String>,

    /// Subject organization
    #[arg(long)]
    org: Option<String>,

    /// Subject organizational unit
    #[arg(long)]
    org_unit: Option<String>,

    /// Subject city
    #[arg(long)]
    city: Option<String>,

    /// Subject state
    #[arg(long)]
    state: Option<String>,

    /// Subject two-letter country code
    #[arg(long)]
    country: Option<String>,

    /// Validity in days
    #[arg(long)]
    validity_days: Option<u32>,

    /// ECDSA or RSA
    #[arg(long)]
    algorithm: Option<String>,

    /// P224, P256, P384 or P521
    #[arg(long)]
    ecdsa_curve: Option<String>,

    /// RSA key size, at least 2048
    #[arg(long)]
    rsa_bits: Option<u32>,
}

impl TlsArgs {
    fn to_options(&self) -> anyhow::Result<TlsOptions> {
        let mut options = match &self.config_file {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                TlsOptions::from_yaml(&yaml)?
            }
            None => TlsOptions::new(DistinguishedName::default()),
        };

        let dn = &mut options.distinguished_name;
        if let Some(cn) = &self.common_name {
            dn.common_name = cn.clone();
        }
        if let Some(org) = &self.org {
            dn.organization = org.clone();
        }
        if self.org_unit.is_some() {
            dn.organizational_unit = self.org_unit.clone();
        }
        if self.city.is_some() {
            dn.city = self.city.clone();
        }
        if self.state.is_some() {
            dn.state = self.state.clone();
        }
        if self.country.is_some() {
            dn.country = self.country.clone();
        }

        if let Some(days) = self.validity_days {
            options.validity_days = days;
        }
        if let Some(algorithm) = &self.algorithm {
            options.private_key_algorithm = algorithm.clone();
        }
        if let Some(curve) = &self.ecdsa_curve {
            options.ecdsa_curve = curve.clone();
        }
        if let Some(bits) = self.rsa_bits {
            options.rsa_bits = bits;
        }
        Ok(options)
    }
}

#[derive(Args, Debug)]
struct GenArgs {
    /// Namespace of the secret to create
    #[arg(long, default_value = DEFAULT_SERVER_NAMESPACE)]
    namespace: String,

    /// Name of the secret to create
    #[arg(long)]
    secret_name: String,

    /// Base of the data keys, e.g. `tiller` for tiller.crt/.pem/.pub
    #[arg(long)]
    filename_base: String,

    /// Generate a self-signed CA instead of a signed certificate
    #[arg(long)]
    ca: bool,

    /// Namespace of the signing CA secret (defaults to --namespace)
    #[arg(long)]
    ca_namespace: Option<String>,

    /// Name of the signing CA secret
    #[arg(long, required_unless_present = "ca", conflicts_with = "ca")]
    ca_secret_name: Option<String>,

    /// Passphrase of the CA private key
    #[arg(long, env = "CERTWARD_CA_PASSPHRASE", hide_env_values = true, default_value = "")]
    ca_passphrase: String,

    /// Passphrase to encrypt the new private key with
    #[arg(long, env = "CERTWARD_PASSPHRASE", hide_env_values = true, default_value = "")]
    passphrase: String,

    /// Extra DNS subject alternative name (repeatable)
    #[arg(long = "dns-name")]
    dns_names: Vec<String>,

    /// Extra label as key=value (repeatable)
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Extra annotation as key=value (repeatable)
    #[arg(long = "annotation")]
    annotations: Vec<String>,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Certificate PEM file
    #[arg(long)]
    cert: PathBuf,

    /// CA certificate PEM file
    #[arg(long)]
    ca: PathBuf,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Namespace of the secret
    #[arg(long, default_value = DEFAULT_SERVER_NAMESPACE)]
    namespace: String,

    /// Name of the secret
    #[arg(long)]
    secret_name: String,
}

/// Which identities, and which server
#[derive(Args, Debug)]
struct AccessArgs {
    /// Namespace of the TLS server and its CA
    #[arg(long, default_value = DEFAULT_SERVER_NAMESPACE)]
    server_namespace: String,

    /// Name of the server CA secret
    #[arg(long, default_value = DEFAULT_CA_SECRET_NAME)]
    ca_secret_name: String,

    /// Passphrase of the CA private key
    #[arg(long, env = "CERTWARD_CA_PASSPHRASE", hide_env_values = true, default_value = "")]
    ca_passphrase: String,

    /// Passphrase to encrypt client private keys with
    #[arg(long, env = "CERTWARD_CLIENT_PASSPHRASE", hide_env_values = true, default_value = "")]
    client_passphrase: String,

    /// User to grant or revoke (repeatable)
    #[arg(long = "user")]
    users: Vec<String>,

    /// Group to grant or revoke (repeatable)
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Service account as namespace/name (repeatable)
    #[arg(long = "service-account")]
    service_accounts: Vec<String>,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    /// Namespace of the TLS server
    #[arg(long, default_value = DEFAULT_SERVER_NAMESPACE)]
    server_namespace: String,

    /// User to configure
    #[arg(long)]
    user: Option<String>,

    /// Group to configure
    #[arg(long)]
    group: Option<String>,

    /// Service account as namespace/name
    #[arg(long)]
    service_account: Option<String>,

    /// Directory to write ca.crt and client.crt/.pem/.pub into
    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Namespace of the deployment
    #[arg(long, default_value = DEFAULT_SERVER_NAMESPACE)]
    namespace: String,

    /// Deployment name
    #[arg(long)]
    deployment: String,

    /// Exact image reference the ready pod must run
    #[arg(long)]
    image: String,

    /// Label selector for the deployment's pods
    #[arg(long)]
    selector: Option<String>,

    /// Deadline in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Interval between checks in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let connection = ConnectionOptions::from(&cli.connection);

    match cli.command {
        Commands::Tls(TlsCommands::Gen(args)) => run_gen(&connection, args).await,
        Commands::Tls(TlsCommands::Verify(args)) => run_verify(args),
        Commands::Tls(TlsCommands::Inspect(args)) => run_inspect(&connection, args).await,
        Commands::Grant(args) => run_grant(&connection, args).await,
        Commands::Revoke(args) => run_revoke(&connection, args).await,
        Commands::Configure(args) => run_configure(&connection, args).await,
        Commands::WaitForReady(args) => run_wait(&connection, args).await,
    }
}

/// Parse repeated `key=value` flags
fn parse_pairs(flag: &str, pairs: &[String]) -> Result<BTreeMap<String, String>, Error> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::validation(format!(
                "--{} '{}' must be key=value",
                flag, pair
            ))),
        })
        .collect()
}

async fn run_gen(connection: &ConnectionOptions, args: GenArgs) -> anyhow::Result<()> {
    let options = args.tls.to_options()?;
    options.validate()?;

    let mut request = IssueRequest::new(
        SecretRef::new(&args.namespace, &args.secret_name),
        &args.filename_base,
        options,
    );
    request.passphrase = args.passphrase;
    request.dns_names = args.dns_names;
    request.labels = parse_pairs("label", &args.labels)?;
    request.annotations = parse_pairs("annotation", &args.annotations)?;

    let store = PkiStore::from_client(connect(connection).await?);
    let record = match args.ca_secret_name {
        Some(ca_name) if !args.ca => {
            let ca = SecretRef::new(
                args.ca_namespace.unwrap_or_else(|| args.namespace.clone()),
                ca_name,
            );
            store
                .store_signed(&request, &ca, &args.ca_passphrase)
                .await?
        }
        _ => store.store_ca(&request).await?,
    };

    println!(
        "stored {} ({})",
        record.secret,
        record.certificate.subject()
    );
    Ok(())
}

fn run_verify(args: VerifyArgs) -> anyhow::Result<()> {
    let read = |path: &PathBuf| {
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    };
    let cert = Certificate::from_pem(&read(&args.cert)?)?;
    let ca = Certificate::from_pem(&read(&args.ca)?)?;

    if !cert.verify_signed_by(&ca)? {
        anyhow::bail!(
            "{} does not verify against {}",
            args.cert.display(),
            args.ca.display()
        );
    }
    println!("{}: OK", args.cert.display());
    Ok(())
}

async fn run_inspect(connection: &ConnectionOptions, args: InspectArgs) -> anyhow::Result<()> {
    let store = PkiStore::from_client(connect(connection).await?);
    let secret = SecretRef::new(args.namespace, args.secret_name);
    let (provenance, certificate) = store.inspect(&secret).await?;
    let info: CertificateInfo = certificate.info()?;

    println!("secret:      {}", secret);
    println!("algorithm:   {}", provenance.private_key_algorithm);
    println!("files:       {}.crt/.pem/.pub", provenance.filename_base);
    match &provenance.signed_by {
        Some(ca) => println!("signed by:   {}", ca),
        None => println!("signed by:   (self-signed)"),
    }
    println!("subject:     {}", certificate.subject());
    println!("issuer:      {}", certificate.issuer());
    println!("ca:          {}", info.is_ca);
    println!("serial:      {}", info.serial);
    println!("not before:  {}", info.not_before);
    println!("not after:   {}", info.not_after);
    if !info.dns_names.is_empty() {
        println!("dns names:   {}", info.dns_names.join(", "));
    }
    if info.is_expired() {
        println!("status:      EXPIRED");
    }
    Ok(())
}

async fn access_grant(
    connection: &ConnectionOptions,
    args: &AccessArgs,
) -> anyhow::Result<(AccessGrant, Vec<RbacEntity>)> {
    let entities = RbacEntity::collect(&args.users, &args.groups, &args.service_accounts)?;

    let mut template = args.tls.to_options()?;
    if template.distinguished_name.common_name.is_empty() {
        // Replaced per identity
        template.distinguished_name.common_name = "client".to_string();
    }

    let client = connect(connection).await?;
    let grant = AccessGrant::from_client(
        client,
        &args.server_namespace,
        &args.ca_secret_name,
        template,
    )
    .with_ca_passphrase(&args.ca_passphrase)
    .with_client_key_passphrase(&args.client_passphrase);
    Ok((grant, entities))
}

fn print_report(verb: &str, report: &AccessReport) -> anyhow::Result<()> {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(secrets) => {
                let names: Vec<String> = secrets.iter().map(|s| s.to_string()).collect();
                println!("{} {}: {}", verb, outcome.entity, names.join(", "));
            }
            Err(e) => println!("failed {}: {}", outcome.entity, e),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!("{} of {} identities failed", failed, report.outcomes.len());
    }
    Ok(())
}

async fn run_grant(connection: &ConnectionOptions, args: AccessArgs) -> anyhow::Result<()> {
    let (grant, entities) = access_grant(connection, &args).await?;
    let report = grant.grant(&entities).await?;
    print_report("granted", &report)
}

async fn run_revoke(connection: &ConnectionOptions, args: AccessArgs) -> anyhow::Result<()> {
    let (grant, entities) = access_grant(connection, &args).await?;
    let report = grant.revoke(&entities).await?;
    print_report("revoked", &report)
}

async fn run_configure(connection: &ConnectionOptions, args: ConfigureArgs) -> anyhow::Result<()> {
    let entity = RbacEntity::exactly_one(
        args.user.as_deref(),
        args.group.as_deref(),
        args.service_account.as_deref(),
    )?;

    let client = connect(connection).await?;
    let grant = AccessGrant::from_client(
        client,
        &args.server_namespace,
        DEFAULT_CA_SECRET_NAME,
        TlsOptions::new(DistinguishedName::default()),
    );
    for path in grant.configure(&entity, &args.output_dir).await? {
        println!("wrote {}", path.display());
    }
    Ok(())
}

async fn run_wait(connection: &ConnectionOptions, args: WaitArgs) -> anyhow::Result<()> {
    let client = connect(connection).await?;
    let probe = KubeWorkloadProbe::new(client, &args.namespace, &args.deployment, args.selector);
    let poller = ReadinessPoller::new(
        Arc::new(probe),
        &args.namespace,
        &args.image,
        Duration::from_secs(args.timeout_secs),
    )
    .with_interval(Duration::from_millis(args.interval_ms));

    info!(
        namespace = %args.namespace,
        deployment = %args.deployment,
        image = %args.image,
        "waiting for workload"
    );
    poller.wait().await?;
    println!("{}/{} is ready", args.namespace, args.deployment);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn pairs_must_be_key_value() {
        let pairs = parse_pairs("label", &["app=helm".to_string(), "empty=".to_string()]).unwrap();
        assert_eq!(pairs["app"], "helm");
        assert_eq!(pairs["empty"], "");

        assert!(parse_pairs("label", &["novalue".to_string()]).is_err());
        assert!(parse_pairs("label", &["=x".to_string()]).is_err());
    }

    #[test]
    fn tls_flags_override_defaults() {
        let cli = Cli::parse_from([
            "certward",
            "tls",
            "gen",
            "--secret-name",
            "tiller-ca",
            "--filename-base",
            "ca",
            "--ca",
            "--common-name",
            "tiller",
            "--org",
            "Acme",
            "--algorithm",
            "rsa",
            "--rsa-bits",
            "3072",
        ]);
        let Commands::Tls(TlsCommands::Gen(args)) = cli.command else {
            panic!("expected tls gen");
        };
        assert_eq!(args.namespace, DEFAULT_SERVER_NAMESPACE);

        let options = args.tls.to_options().unwrap();
        assert_eq!(options.distinguished_name.common_name, "tiller");
        assert_eq!(options.rsa_bits, 3072);
        assert_eq!(
            options.validate().unwrap(),
            certward::options::KeySpec::Rsa { bits: 3072 }
        );
    }

    #[test]
    fn signed_gen_requires_a_ca_name() {
        let result = Cli::try_parse_from([
            "certward",
            "tls",
            "gen",
            "--secret-name",
            "leaf",
            "--filename-base",
            "tiller",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn access_flags_repeat() {
        let cli = Cli::parse_from([
            "certward",
            "grant",
            "--user",
            "alice",
            "--user",
            "bob",
            "--service-account",
            "ci/deployer",
        ]);
        let Commands::Grant(args) = cli.command else {
            panic!("expected grant");
        };
        assert_eq!(args.users, vec!["alice", "bob"]);
        let entities =
            RbacEntity::collect(&args.users, &args.groups, &args.service_accounts).unwrap();
        assert_eq!(entities.len(), 3);
    }

    #[test]
    fn connection_flags_are_global() {
        let cli = Cli::parse_from([
            "certward",
            "wait-for-ready",
            "--deployment",
            "tiller-deploy",
            "--image",
            "ghcr.io/helm/tiller:v2.16.0",
            "--context",
            "staging",
        ]);
        assert_eq!(cli.connection.context.as_deref(), Some("staging"));
        let Commands::WaitForReady(args) = cli.command else {
            panic!("expected wait-for-ready");
        };
        assert_eq!(args.interval_ms, 500);
        assert_eq!(args.timeout_secs, 300);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = Cli::try_parse_from([
            "certward",
            "wait-for-ready",
            "--deployment",
            "tiller-deploy",
            "--image",
            "ghcr.io/helm/tiller:v2.16.0",
            "--interval-ms",
            "0",
        ]);
        assert!(result.is_err());
    }
}
