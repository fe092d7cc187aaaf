// ABOUTME: Encrypted-at-rest persistence of the chat identity's credential.
// ABOUTME: AES-256-GCM with an Argon2id passphrase key; plaintext only ever lives in memory.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Fixed KDF salt; the passphrase carries the entropy
const KDF_SALT: &[u8] = b"fieldbot-credential-v1";

/// Opaque credential blob produced by the chat transport during provisioning
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Vec<u8>);

impl Credential {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential([REDACTED; {} bytes])", self.0.len())
    }
}

/// Errors never include plaintext or key material
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("key derivation failed")]
    KeyDerivationFailed,

    #[error("credential file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric cipher for the credential file. Format: `nonce (12 bytes) || ciphertext`
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Argon2id with OWASP parameters (19 MiB, 2 iterations, 1 lane)
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CredentialError> {
        use argon2::{Algorithm, Argon2, Params, Version};

        let params = Params::new(19456, 2, 1, Some(32))
            .map_err(|_| CredentialError::KeyDerivationFailed)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), KDF_SALT, &mut key)
            .map_err(|_| CredentialError::KeyDerivationFailed)?;

        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CredentialError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if data.len() < NONCE_SIZE {
            return Err(CredentialError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed)
    }
}

/// What `SessionStore::load` found on disk
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Missing,
    /// The file could not be decrypted and was wiped
    Corrupt,
}

/// Holds the decrypted credential in memory and the encrypted copy on disk.
///
/// The credential is written encrypted whenever it changes and again on
/// clean shutdown. Plaintext is never written to disk; it stays resident in
/// process memory for the lifetime of the session.
pub struct SessionStore {
    path: PathBuf,
    cipher: CredentialCipher,
    current: Mutex<Option<Credential>>,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>, cipher: CredentialCipher) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cipher,
            current: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decrypt the stored credential into memory.
    /// A file that fails to decrypt is treated as a logout: it is wiped.
    pub fn load(&self) -> Result<LoadOutcome, CredentialError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No stored chat credential");
                return Ok(LoadOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        match self.cipher.decrypt(&data) {
            Ok(plaintext) => {
                self.set_current(Some(Credential(plaintext)));
                tracing::info!(path = %self.path.display(), "Chat credential decrypted");
                Ok(LoadOutcome::Loaded)
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Stored chat credential is corrupt; wiping for re-provisioning"
                );
                self.wipe()?;
                Ok(LoadOutcome::Corrupt)
            }
        }
    }

    /// The in-memory credential, if any
    pub fn current(&self) -> Option<Credential> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the credential and persist it encrypted
    pub fn store(&self, credential: Credential) -> Result<(), CredentialError> {
        self.write_encrypted(&credential)?;
        self.set_current(Some(credential));
        Ok(())
    }

    /// Encrypt whatever is in memory back to disk (clean shutdown)
    pub fn persist(&self) -> Result<(), CredentialError> {
        match self.current() {
            Some(credential) => {
                self.write_encrypted(&credential)?;
                tracing::info!(path = %self.path.display(), "Chat credential encrypted to disk");
            }
            None => tracing::debug!("No chat credential to persist"),
        }
        Ok(())
    }

    /// Drop the credential from memory and disk
    pub fn wipe(&self) -> Result<(), CredentialError> {
        self.set_current(None);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::warn!(path = %self.path.display(), "Chat credential wiped");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_current(&self, credential: Option<Credential>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential;
    }

    fn write_encrypted(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self.cipher.encrypt(credential.as_bytes())?;
        let tmp = self.path.with_extension("enc.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
