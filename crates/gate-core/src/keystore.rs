//! Per-operator SSH key material under `$HOME/.sgsh/<operator-id>/`.
//!
//! The keypair is generated once, on the operator's first login, and
//! reused by every later session. The private key is PKCS#1 PEM with mode
//! 0600, the public key a single OpenSSH authorized-key line with mode
//! 0644; the enclosing directory is 0700.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::error::{CoreError, Result};

const KEY_BITS: usize = 2048;
const PRIVATE_KEY_FILE: &str = "id_rsa";
const PUBLIC_KEY_FILE: &str = "id_rsa.pub";

/// Key material ready for use: the authorized-key line to hand to agents
/// and the path the tunnel reads the private key from.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub public_key: String,
    pub private_key_path: PathBuf,
}

/// Filesystem store of per-operator RSA keypairs.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `$HOME/.sgsh`.
    pub fn in_home() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(Path::new(&home).join(".sgsh"))
    }

    pub fn private_key_path(&self, operator_id: &str) -> PathBuf {
        self.root.join(operator_id).join(PRIVATE_KEY_FILE)
    }

    fn public_key_path(&self, operator_id: &str) -> PathBuf {
        self.root.join(operator_id).join(PUBLIC_KEY_FILE)
    }

    /// Return the operator's key material, generating the keypair if this
    /// is the first time the operator logs in on this host.
    pub fn ensure(&self, operator_id: &str) -> Result<KeyMaterial> {
        let dir = self.root.join(operator_id);
        if !dir.exists() {
            self.generate(&dir)?;
        }

        let public_key = fs::read_to_string(self.public_key_path(operator_id))
            .map_err(|e| CoreError::Persistence(format!("could not read public key: {e}")))?;
        // The agents expect exactly one authorized-key line.
        ssh_key::PublicKey::from_openssh(public_key.trim())
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;

        Ok(KeyMaterial {
            public_key: public_key.trim().to_string(),
            private_key_path: self.private_key_path(operator_id),
        })
    }

    fn generate(&self, dir: &Path) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder
            .create(dir)
            .map_err(|e| CoreError::Persistence(format!("could not create key directory: {e}")))?;

        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS)
            .map_err(|e| CoreError::InvalidKey(format!("key generation failed: {e}")))?;

        let pem = private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CoreError::InvalidKey(format!("could not encode private key: {e}")))?;
        write_with_mode(&dir.join(PRIVATE_KEY_FILE), pem.as_bytes(), 0o600)?;

        let rsa_public = ssh_key::public::RsaPublicKey::try_from(&private.to_public_key())
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let public = ssh_key::PublicKey::new(ssh_key::public::KeyData::Rsa(rsa_public), "");
        let line = public
            .to_openssh()
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        write_with_mode(
            &dir.join(PUBLIC_KEY_FILE),
            format!("{line}\n").as_bytes(),
            0o644,
        )?;

        Ok(())
    }
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents)
        .map_err(|e| CoreError::Persistence(format!("could not write {}: {e}", path.display())))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CoreError::Persistence(format!("could not chmod {}: {e}", path.display())))
}

/// Load a PKCS#1 PEM private key as SSH-usable key material.
pub fn load_private_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    let pem = fs::read_to_string(path)
        .map_err(|e| CoreError::Persistence(format!("could not read private key: {e}")))?;
    let rsa_key = RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| CoreError::InvalidKey(format!("could not parse private key: {e}")))?;
    let keypair = russh::keys::ssh_key::private::RsaKeypair::try_from(&rsa_key)
        .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
    russh::keys::PrivateKey::new(
        russh::keys::ssh_key::private::KeypairData::Rsa(keypair),
        "",
    )
    .map_err(|e| CoreError::InvalidKey(e.to_string()))
}
