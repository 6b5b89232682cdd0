//! Scoped scratch directory for intermediate key material
//!
//! Everything the store writes to disk goes through a [`Workspace`]. The
//! backing directory is removed when the workspace is dropped, so every exit
//! path of an issuance call (success, validation failure, storage failure)
//! cleans up after itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::trace;

use super::StoreError;
use crate::pki::{write_with_mode, Certificate, KeyPair, PRIVATE_KEY_FILE_MODE, PUBLIC_FILE_MODE};

/// Data key for the signer certificate carried by signed records
pub const CA_CERT_FILE: &str = "ca.crt";

/// File name of a certificate for `base`
pub fn certificate_file(base: &str) -> String {
    format!("{}.crt", base)
}

/// File name of a private key for `base`
pub fn private_key_file(base: &str) -> String {
    format!("{}.pem", base)
}

/// File name of a public key for `base`
pub fn public_key_file(base: &str) -> String {
    format!("{}.pub", base)
}

/// Temporary directory holding one issuance's files
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh, empty workspace
    pub fn new() -> Result<Self, StoreError> {
        let dir = tempfile::Builder::new().prefix("certward-").tempdir()?;
        trace!(path = %dir.path().display(), "created workspace");
        Ok(Self { dir })
    }

    /// Directory backing this workspace
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `<base>.pem` (0600) and `<base>.pub` (0644)
    pub fn write_key_pair(
        &self,
        base: &str,
        key: &KeyPair,
        passphrase: &str,
    ) -> Result<(), StoreError> {
        key.write_private_key(&self.file(&private_key_file(base)), passphrase)?;
        key.write_public_key(&self.file(&public_key_file(base)))?;
        Ok(())
    }

    /// Write a certificate under `name` (0644)
    pub fn write_certificate(&self, name: &str, cert: &Certificate) -> Result<(), StoreError> {
        let pem = cert.to_pem()?;
        write_with_mode(&self.file(name), &pem, PUBLIC_FILE_MODE)?;
        Ok(())
    }

    /// Write raw bytes; `.pem` files are treated as private keys
    pub fn write_raw(&self, name: &str, contents: &[u8]) -> Result<(), StoreError> {
        let mode = if name.ends_with(".pem") {
            PRIVATE_KEY_FILE_MODE
        } else {
            PUBLIC_FILE_MODE
        };
        write_with_mode(&self.file(name), contents, mode)?;
        Ok(())
    }

    /// Read one file back
    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        Ok(std::fs::read(self.file(name))?)
    }

    /// Read the named files into a secret data map
    pub fn collect(&self, names: &[String]) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.read(name)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{EcdsaCurve, KeySpec};

    #[test]
    fn file_names_follow_base() {
        assert_eq!(certificate_file("tiller"), "tiller.crt");
        assert_eq!(private_key_file("tiller"), "tiller.pem");
        assert_eq!(public_key_file("tiller"), "tiller.pub");
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let workspace = Workspace::new().unwrap();
        let path = workspace.path().to_path_buf();
        workspace.write_raw("note.txt", b"hello").unwrap();
        assert!(path.join("note.txt").exists());

        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn workspace_is_removed_when_an_error_propagates() {
        fn failing(path_out: &mut PathBuf) -> Result<(), StoreError> {
            let workspace = Workspace::new()?;
            *path_out = workspace.path().to_path_buf();
            workspace.read("missing.crt")?;
            Ok(())
        }

        let mut path = PathBuf::new();
        assert!(matches!(failing(&mut path), Err(StoreError::Io(_))));
        assert!(!path.as_os_str().is_empty());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn key_files_get_split_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let workspace = Workspace::new().unwrap();
        let key = KeyPair::generate(&KeySpec::Ecdsa(EcdsaCurve::P256)).unwrap();
        workspace.write_key_pair("client", &key, "").unwrap();
        workspace.write_raw("ca.pem", b"key").unwrap();

        let mode = |name: &str| {
            std::fs::metadata(workspace.path().join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("client.pem"), 0o600);
        assert_eq!(mode("client.pub"), 0o644);
        assert_eq!(mode("ca.pem"), 0o600);
    }

    #[test]
    fn collect_reads_only_named_files() {
        let workspace = Workspace::new().unwrap();
        workspace.write_raw("a.crt", b"A").unwrap();
        workspace.write_raw("b.crt", b"B").unwrap();

        let data = workspace.collect(&["a.crt".to_string()]).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["a.crt"], b"A");
    }
}
