//! Key pair generation and encoding

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::symm::Cipher;

use super::{PkiError, Result};
use crate::options::{EcdsaCurve, KeySpec, PrivateKeyAlgorithm, MIN_RSA_BITS};

/// Owner read/write only
pub const PRIVATE_KEY_FILE_MODE: u32 = 0o600;

/// World readable, for public keys and certificates
pub const PUBLIC_FILE_MODE: u32 = 0o644;

fn curve_nid(curve: EcdsaCurve) -> Nid {
    match curve {
        EcdsaCurve::P224 => Nid::SECP224R1,
        EcdsaCurve::P256 => Nid::X9_62_PRIME256V1,
        EcdsaCurve::P384 => Nid::SECP384R1,
        EcdsaCurve::P521 => Nid::SECP521R1,
    }
}

/// Private key plus its public half, tagged with the algorithm family
pub struct KeyPair {
    algorithm: PrivateKeyAlgorithm,
    key: PKey<Private>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("bits", &self.key.bits())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate(spec: &KeySpec) -> Result<Self> {
        let key = match *spec {
            KeySpec::Ecdsa(curve) => {
                let group = EcGroup::from_curve_name(curve_nid(curve)).map_err(|e| {
                    PkiError::KeyGenerationFailed(format!("failed to load curve {}: {}", curve, e))
                })?;
                let ec_key = EcKey::generate(&group).map_err(|e| {
                    PkiError::KeyGenerationFailed(format!(
                        "failed to generate {} key: {}",
                        curve, e
                    ))
                })?;
                PKey::from_ec_key(ec_key)
                    .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))?
            }
            KeySpec::Rsa { bits } => {
                if bits < MIN_RSA_BITS {
                    return Err(PkiError::RsaBitsTooLow(bits));
                }
                let rsa = Rsa::generate(bits).map_err(|e| {
                    PkiError::KeyGenerationFailed(format!(
                        "failed to generate RSA-{} key: {}",
                        bits, e
                    ))
                })?;
                PKey::from_rsa(rsa).map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))?
            }
        };

        Ok(Self {
            algorithm: spec.algorithm(),
            key,
        })
    }

    /// Reload a key pair from its PEM encoding
    ///
    /// The passphrase is ignored for unencrypted PEM. It is always passed
    /// through so an encrypted key without a passphrase fails instead of
    /// prompting on the terminal.
    pub fn from_private_key_pem(
        algorithm: PrivateKeyAlgorithm,
        pem: &[u8],
        passphrase: &str,
    ) -> Result<Self> {
        let key = match algorithm {
            PrivateKeyAlgorithm::Ecdsa => {
                let ec_key = EcKey::private_key_from_pem_passphrase(pem, passphrase.as_bytes())
                    .map_err(|e| {
                        PkiError::ParseError(format!("failed to load EC private key: {}", e))
                    })?;
                PKey::from_ec_key(ec_key).map_err(|e| PkiError::ParseError(e.to_string()))?
            }
            PrivateKeyAlgorithm::Rsa => {
                let rsa = Rsa::private_key_from_pem_passphrase(pem, passphrase.as_bytes())
                    .map_err(|e| {
                        PkiError::ParseError(format!("failed to load RSA private key: {}", e))
                    })?;
                PKey::from_rsa(rsa).map_err(|e| PkiError::ParseError(e.to_string()))?
            }
        };

        Ok(Self { algorithm, key })
    }

    /// Algorithm family of this key
    pub fn algorithm(&self) -> PrivateKeyAlgorithm {
        self.algorithm
    }

    /// Key size in bits (curve size for EC keys)
    pub fn bits(&self) -> u32 {
        self.key.bits()
    }

    /// Underlying private key
    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    /// Traditional PEM (`EC PRIVATE KEY` / `RSA PRIVATE KEY`)
    ///
    /// A non-empty passphrase encrypts the block with AES-256-CBC.
    pub fn private_key_pem(&self, passphrase: &str) -> Result<Vec<u8>> {
        let encoded = match self.algorithm {
            PrivateKeyAlgorithm::Ecdsa => {
                let ec_key = self
                    .key
                    .ec_key()
                    .map_err(|e| PkiError::ParseError(e.to_string()))?;
                if passphrase.is_empty() {
                    ec_key.private_key_to_pem()
                } else {
                    ec_key.private_key_to_pem_passphrase(Cipher::aes_256_cbc(), passphrase.as_bytes())
                }
            }
            PrivateKeyAlgorithm::Rsa => {
                let rsa = self
                    .key
                    .rsa()
                    .map_err(|e| PkiError::ParseError(e.to_string()))?;
                if passphrase.is_empty() {
                    rsa.private_key_to_pem()
                } else {
                    rsa.private_key_to_pem_passphrase(Cipher::aes_256_cbc(), passphrase.as_bytes())
                }
            }
        };

        encoded.map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to encode private key: {}", e))
        })
    }

    /// `PUBLIC KEY` PEM (SubjectPublicKeyInfo)
    pub fn public_key_pem(&self) -> Result<Vec<u8>> {
        self.key.public_key_to_pem().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to encode public key: {}", e))
        })
    }

    /// DER SubjectPublicKeyInfo, handy for comparing keys
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.key.public_key_to_der().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to encode public key: {}", e))
        })
    }

    /// Write the private key with owner-only permissions
    pub fn write_private_key(&self, path: &Path, passphrase: &str) -> Result<()> {
        let pem = self.private_key_pem(passphrase)?;
        write_with_mode(path, &pem, PRIVATE_KEY_FILE_MODE)?;
        Ok(())
    }

    /// Write the public key world-readable
    pub fn write_public_key(&self, path: &Path) -> Result<()> {
        let pem = self.public_key_pem()?;
        write_with_mode(path, &pem, PUBLIC_FILE_MODE)?;
        Ok(())
    }
}

/// Write a file and force its permission bits
///
/// The mode is applied to the open handle before any bytes are written, so
/// neither the umask nor a pre-existing file with looser bits ever exposes
/// the new contents.
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = open_with_mode(path, mode)?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(())
}

/// Create or truncate `path` with exactly `mode`
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let file = options.open(path)?;

    // `mode` only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecdsa(curve: EcdsaCurve) -> KeyPair {
        KeyPair::generate(&KeySpec::Ecdsa(curve)).unwrap()
    }

    #[test]
    fn generates_every_curve() {
        for curve in EcdsaCurve::ALL {
            let key = ecdsa(curve);
            assert_eq!(key.algorithm(), PrivateKeyAlgorithm::Ecdsa);
            assert_eq!(key.bits(), curve.bits());
        }
    }

    #[test]
    fn generates_rsa_with_requested_size() {
        let key = KeyPair::generate(&KeySpec::Rsa { bits: 2048 }).unwrap();
        assert_eq!(key.algorithm(), PrivateKeyAlgorithm::Rsa);
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn hand_built_low_rsa_spec_is_still_rejected() {
        let result = KeyPair::generate(&KeySpec::Rsa { bits: 1024 });
        assert!(matches!(result, Err(PkiError::RsaBitsTooLow(1024))));
    }

    #[test]
    fn pem_labels_match_algorithm() {
        let ec = ecdsa(EcdsaCurve::P256);
        let pem = String::from_utf8(ec.private_key_pem("").unwrap()).unwrap();
        assert!(pem.contains("BEGIN EC PRIVATE KEY"));

        let rsa = KeyPair::generate(&KeySpec::Rsa { bits: 2048 }).unwrap();
        let pem = String::from_utf8(rsa.private_key_pem("").unwrap()).unwrap();
        assert!(pem.contains("BEGIN RSA PRIVATE KEY"));

        let public = String::from_utf8(rsa.public_key_pem().unwrap()).unwrap();
        assert!(public.contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn unencrypted_round_trip_preserves_public_key() {
        let original = ecdsa(EcdsaCurve::P384);
        let pem = original.private_key_pem("").unwrap();

        let reloaded = KeyPair::from_private_key_pem(PrivateKeyAlgorithm::Ecdsa, &pem, "").unwrap();
        assert_eq!(
            reloaded.public_key_der().unwrap(),
            original.public_key_der().unwrap()
        );
    }

    #[test]
    fn encrypted_round_trip_requires_passphrase() {
        let original = KeyPair::generate(&KeySpec::Rsa { bits: 2048 }).unwrap();
        let pem = original.private_key_pem("hunter2").unwrap();
        assert!(String::from_utf8_lossy(&pem).contains("ENCRYPTED"));

        let reloaded =
            KeyPair::from_private_key_pem(PrivateKeyAlgorithm::Rsa, &pem, "hunter2").unwrap();
        assert_eq!(
            reloaded.public_key_der().unwrap(),
            original.public_key_der().unwrap()
        );

        let wrong = KeyPair::from_private_key_pem(PrivateKeyAlgorithm::Rsa, &pem, "wrong");
        assert!(matches!(wrong, Err(PkiError::ParseError(_))));
    }

    #[test]
    fn loading_with_the_wrong_algorithm_fails() {
        let ec = ecdsa(EcdsaCurve::P256);
        let pem = ec.private_key_pem("").unwrap();
        let result = KeyPair::from_private_key_pem(PrivateKeyAlgorithm::Rsa, &pem, "");
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_files_get_split_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = ecdsa(EcdsaCurve::P256);
        let private_path = dir.path().join("server.pem");
        let public_path = dir.path().join("server.pub");

        key.write_private_key(&private_path, "").unwrap();
        key.write_public_key(&public_path).unwrap();

        let private_mode = fs::metadata(&private_path).unwrap().permissions().mode() & 0o777;
        let public_mode = fs::metadata(&public_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(private_mode, 0o600);
        assert_eq!(public_mode, 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn rewriting_tightens_existing_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loose.pem");
        fs::write(&path, b"placeholder").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        // Tightened before anything is written
        let file = open_with_mode(&path, PRIVATE_KEY_FILE_MODE).unwrap();
        let mode = file.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(file.metadata().unwrap().len(), 0);
        drop(file);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
        write_with_mode(&path, b"secret", PRIVATE_KEY_FILE_MODE).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"secret");
    }
}
