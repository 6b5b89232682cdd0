//! Certificate issuance, verification and inspection

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef, X509Ref, X509StoreContext, X509};
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::{parse_pem, KeyPair, PkiError, Result};
use crate::options::DistinguishedName;

/// Always present as an IP SAN so port-forwarded connections verify
pub const LOOPBACK_IP: &str = "127.0.0.1";

const SERIAL_BITS: i32 = 128;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn cert_err(context: &'static str) -> impl Fn(openssl::error::ErrorStack) -> PkiError {
    move |e| PkiError::CertificateGenerationFailed(format!("{}: {}", context, e))
}

/// What to put in a certificate, independent of keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTemplate {
    /// Subject identity
    pub subject: DistinguishedName,
    /// Validity window length, starting now
    pub validity: Duration,
    /// Whether the certificate may sign other certificates
    pub is_ca: bool,
    /// DNS SANs, appended verbatim
    pub dns_names: Vec<String>,
}

/// CA certificate and the private key that signs with it
#[derive(Debug, Clone, Copy)]
pub struct Signer<'a> {
    /// Issuer certificate
    pub certificate: &'a Certificate,
    /// Issuer private key; expected to match `certificate` but not checked
    pub key: &'a KeyPair,
}

/// Issue a certificate for `subject_key`
///
/// Without a signer the certificate is self-signed with `subject_key`. With a
/// signer, the issuer name is copied from the signer certificate and the
/// signer key produces the signature.
pub fn issue(
    template: &CertificateTemplate,
    subject_key: &KeyPair,
    signer: Option<Signer<'_>>,
) -> Result<Certificate> {
    template.subject.validate()?;
    if template.validity.is_zero() {
        return Err(PkiError::InvalidValidity(
            "validity must be positive".to_string(),
        ));
    }

    let subject_name = build_name(&template.subject)?;
    let mut builder = X509Builder::new().map_err(cert_err("failed to create builder"))?;
    builder
        .set_version(2)
        .map_err(cert_err("failed to set version"))?;

    let serial = random_serial()?;
    builder
        .set_serial_number(&serial)
        .map_err(cert_err("failed to set serial"))?;

    builder
        .set_subject_name(&subject_name)
        .map_err(cert_err("failed to set subject"))?;
    let issuer_set = match &signer {
        Some(signer) => builder.set_issuer_name(signer.certificate.x509.subject_name()),
        None => builder.set_issuer_name(&subject_name),
    };
    issuer_set.map_err(cert_err("failed to set issuer"))?;

    builder
        .set_pubkey(subject_key.private_key())
        .map_err(cert_err("failed to set public key"))?;

    let now = unix_now();
    let not_before = Asn1Time::from_unix(now as _).map_err(cert_err("invalid notBefore"))?;
    let not_after = Asn1Time::from_unix((now + template.validity.as_secs() as i64) as _)
        .map_err(cert_err("invalid notAfter"))?;
    builder
        .set_not_before(&not_before)
        .map_err(cert_err("failed to set notBefore"))?;
    builder
        .set_not_after(&not_after)
        .map_err(cert_err("failed to set notAfter"))?;

    if template.is_ca {
        let constraints = BasicConstraints::new()
            .critical()
            .ca()
            .build()
            .map_err(cert_err("failed to build basic constraints"))?;
        builder
            .append_extension(constraints)
            .map_err(cert_err("failed to add basic constraints"))?;
    }

    let mut key_usage = KeyUsage::new();
    key_usage.critical().digital_signature().key_encipherment();
    if template.is_ca {
        key_usage.key_cert_sign();
    }
    let key_usage = key_usage
        .build()
        .map_err(cert_err("failed to build key usage"))?;
    builder
        .append_extension(key_usage)
        .map_err(cert_err("failed to add key usage"))?;

    let extended_key_usage = ExtendedKeyUsage::new()
        .server_auth()
        .client_auth()
        .build()
        .map_err(cert_err("failed to build extended key usage"))?;
    builder
        .append_extension(extended_key_usage)
        .map_err(cert_err("failed to add extended key usage"))?;

    let issuer_cert = signer.as_ref().map(|s| s.certificate.as_x509());

    let subject_key_id = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer_cert, None))
        .map_err(cert_err("failed to build subject key identifier"))?;
    builder
        .append_extension(subject_key_id)
        .map_err(cert_err("failed to add subject key identifier"))?;

    let mut sans = SubjectAlternativeName::new();
    for name in &template.dns_names {
        sans.dns(name);
    }
    sans.ip(LOOPBACK_IP);
    let sans = sans
        .build(&builder.x509v3_context(issuer_cert, None))
        .map_err(cert_err("failed to build subject alternative names"))?;
    builder
        .append_extension(sans)
        .map_err(cert_err("failed to add subject alternative names"))?;

    let signing_key = signer.map(|s| s.key).unwrap_or(subject_key);
    builder
        .sign(signing_key.private_key(), digest_for(signing_key.private_key()))
        .map_err(cert_err("failed to sign certificate"))?;

    let x509 = builder.build();
    debug!(
        subject = %format_name(x509.subject_name()),
        issuer = %format_name(x509.issuer_name()),
        is_ca = template.is_ca,
        "issued certificate"
    );

    Ok(Certificate { x509 })
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new().map_err(cert_err("failed to allocate serial"))?;
    serial
        .rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(cert_err("failed to generate serial"))?;
    serial
        .to_asn1_integer()
        .map_err(cert_err("failed to encode serial"))
}

/// Digest matched to the signing key strength
fn digest_for(key: &PKeyRef<Private>) -> MessageDigest {
    if key.id() == Id::EC {
        match key.bits() {
            384 => MessageDigest::sha384(),
            521 => MessageDigest::sha512(),
            _ => MessageDigest::sha256(),
        }
    } else {
        MessageDigest::sha256()
    }
}

fn build_name(dn: &DistinguishedName) -> Result<X509Name> {
    let mut name = X509NameBuilder::new().map_err(cert_err("failed to create name"))?;

    let entries = [
        (Nid::COMMONNAME, Some(dn.common_name.as_str())),
        (Nid::ORGANIZATIONNAME, Some(dn.organization.as_str())),
        (Nid::ORGANIZATIONALUNITNAME, dn.organizational_unit.as_deref()),
        (Nid::LOCALITYNAME, dn.city.as_deref()),
        (Nid::STATEORPROVINCENAME, dn.state.as_deref()),
        (Nid::COUNTRYNAME, dn.country.as_deref()),
    ];

    for (nid, value) in entries {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            name.append_entry_by_nid(nid, value).map_err(|e| {
                PkiError::InvalidDistinguishedName(format!(
                    "failed to encode {}='{}': {}",
                    nid.short_name().unwrap_or("?"),
                    value,
                    e
                ))
            })?;
        }
    }

    Ok(name.build())
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// An issued X.509 certificate
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("issuer", &self.issuer())
            .finish()
    }
}

impl Certificate {
    /// Parse a `CERTIFICATE` PEM block
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let x509 = X509::from_pem(pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
        Ok(Self { x509 })
    }

    /// Encode as a `CERTIFICATE` PEM block
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        self.x509
            .to_pem()
            .map_err(cert_err("failed to encode certificate"))
    }

    /// Underlying certificate
    pub fn as_x509(&self) -> &X509Ref {
        &self.x509
    }

    /// Subject in `CN=...,O=...` form
    pub fn subject(&self) -> String {
        format_name(self.x509.subject_name())
    }

    /// Issuer in `CN=...,O=...` form
    pub fn issuer(&self) -> String {
        format_name(self.x509.issuer_name())
    }

    /// True when subject and issuer are the same name
    pub fn is_self_issued(&self) -> bool {
        self.subject() == self.issuer()
    }

    /// Basic constraints CA flag
    pub fn is_ca(&self) -> Result<bool> {
        Ok(self.info()?.is_ca)
    }

    /// DER SubjectPublicKeyInfo of the certified key
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.x509
            .public_key()
            .and_then(|key| key.public_key_to_der())
            .map_err(|e| PkiError::ParseError(format!("failed to read public key: {}", e)))
    }

    /// Verify this certificate chains to `ca`, with `ca` as the only trust anchor
    ///
    /// Returns `Ok(false)` when verification fails; errors are reserved for
    /// failures to set up the verification itself.
    pub fn verify_signed_by(&self, ca: &Certificate) -> Result<bool> {
        let mut store = X509StoreBuilder::new().map_err(cert_err("failed to create trust store"))?;
        store
            .add_cert(ca.x509.clone())
            .map_err(cert_err("failed to add CA to trust store"))?;
        let store = store.build();

        let chain = Stack::new().map_err(cert_err("failed to create chain"))?;
        let mut context =
            X509StoreContext::new().map_err(cert_err("failed to create verify context"))?;

        context
            .init(&store, &self.x509, &chain, |ctx| {
                let verified = ctx.verify_cert()?;
                if !verified {
                    debug!(error = %ctx.error(), "certificate chain verification failed");
                }
                Ok(verified)
            })
            .map_err(cert_err("failed to verify certificate"))
    }

    /// Parsed validity and identity summary
    pub fn info(&self) -> Result<CertificateInfo> {
        let der = self
            .x509
            .to_der()
            .map_err(|e| PkiError::ParseError(format!("failed to encode certificate: {}", e)))?;
        CertificateInfo::from_der(&der)
    }
}

/// Summary of a certificate's identity and validity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// Issuer common name
    pub issuer_common_name: String,
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Basic constraints CA flag
    pub is_ca: bool,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// Serial number, hex encoded
    pub serial: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let first_cn = |name: &x509_parser::x509::X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            common_name: first_cn(cert.subject()),
            issuer_common_name: first_cn(cert.issuer()),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca,
            dns_names,
            serial: cert.raw_serial_as_string(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - unix_now()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}
