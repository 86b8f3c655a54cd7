#![forbid(unsafe_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use avatar_kernel_contracts::avatar::{ApiCredential, SealedCredential};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const FINGERPRINT_HEX_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("seal key io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("seal decode error: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("seal key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("credential cryptographic operation failed")]
    Crypto,
}

/// Encrypts caller API keys before they reach the record journal.
#[derive(Clone)]
pub struct CredentialSealer {
    key: [u8; MASTER_KEY_LEN],
}

impl std::fmt::Debug for CredentialSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialSealer(<key>)")
    }
}

impl CredentialSealer {
    /// Random process-local key. Sealed values do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Reads the base64 master key at `key_path`, creating it (mode 0600) if absent.
    pub fn load_or_create(key_path: &Path) -> Result<Self, SealError> {
        if key_path.exists() {
            let encoded = fs::read_to_string(key_path)?;
            let decoded = BASE64.decode(encoded.trim().as_bytes())?;
            if decoded.len() != MASTER_KEY_LEN {
                return Err(SealError::InvalidKeyLength(decoded.len()));
            }
            let mut key = [0u8; MASTER_KEY_LEN];
            key.copy_from_slice(&decoded);
            return Ok(Self { key });
        }

        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let sealer = Self::ephemeral();
        write_new_file_restricted(key_path, BASE64.encode(sealer.key).as_bytes())?;
        tracing::info!(path = %key_path.display(), "created credential seal key");
        Ok(sealer)
    }

    pub fn seal(&self, credential: &ApiCredential) -> Result<SealedCredential, SealError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::Crypto)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, credential.expose().as_bytes())
            .map_err(|_| SealError::Crypto)?;
        Ok(SealedCredential {
            nonce_b64: BASE64.encode(nonce_bytes),
            ciphertext_b64: BASE64.encode(ciphertext),
        })
    }

    pub fn unseal(&self, sealed: &SealedCredential) -> Result<ApiCredential, SealError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SealError::Crypto)?;
        let nonce_raw = BASE64.decode(sealed.nonce_b64.as_bytes())?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(SealError::Crypto);
        }
        let nonce = Nonce::from_slice(&nonce_raw);
        let ciphertext = BASE64.decode(sealed.ciphertext_b64.as_bytes())?;
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| SealError::Crypto)?;
        let key = String::from_utf8(plaintext).map_err(|_| SealError::Crypto)?;
        ApiCredential::new(key).map_err(|_| SealError::Crypto)
    }
}

/// Short SHA-256 prefix for correlating records that used the same key.
pub fn credential_fingerprint(credential: &ApiCredential) -> String {
    let digest = Sha256::digest(credential.expose().as_bytes());
    let mut out = String::with_capacity(FINGERPRINT_HEX_LEN);
    for byte in digest.iter().take(FINGERPRINT_HEX_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Creates `path` owner-only from the first byte; it never exists with wider bits.
fn write_new_file_restricted(path: &Path, data: &[u8]) -> Result<(), SealError> {
    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_key_path(name: &str) -> (PathBuf, PathBuf) {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        let base = std::env::temp_dir().join(format!("avatar-seal-test-{name}-{suffix}"));
        let key_path = base.join("records.seal.key");
        (base, key_path)
    }

    #[test]
    fn at_seal_01_roundtrip_hides_plaintext() {
        let sealer = CredentialSealer::ephemeral();
        let cred = ApiCredential::new("TOP_SECRET_SENTINEL_123").unwrap();
        let sealed = sealer.seal(&cred).unwrap();
        assert!(!sealed.ciphertext_b64.contains("TOP_SECRET"));
        assert_eq!(sealer.unseal(&sealed).unwrap(), cred);
    }

    #[test]
    fn at_seal_02_other_key_cannot_unseal() {
        let cred = ApiCredential::new("k").unwrap();
        let sealed = CredentialSealer::ephemeral().seal(&cred).unwrap();
        let err = CredentialSealer::ephemeral()
            .unseal(&sealed)
            .expect_err("foreign key must fail");
        assert!(matches!(err, SealError::Crypto));
    }

    #[test]
    fn at_seal_03_key_file_is_created_then_reused() {
        let (base, key_path) = temp_key_path("reuse");
        let first = CredentialSealer::load_or_create(&key_path).unwrap();
        let sealed = first.seal(&ApiCredential::new("abc").unwrap()).unwrap();

        let second = CredentialSealer::load_or_create(&key_path).unwrap();
        assert_eq!(second.unseal(&sealed).unwrap().expose(), "abc");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        fs::remove_dir_all(base).unwrap();
    }

    #[test]
    fn at_seal_04_truncated_key_file_is_rejected() {
        let (base, key_path) = temp_key_path("short");
        fs::create_dir_all(&base).unwrap();
        fs::write(&key_path, BASE64.encode([7u8; 8])).unwrap();
        let err = CredentialSealer::load_or_create(&key_path).expect_err("short key must fail");
        assert!(matches!(err, SealError::InvalidKeyLength(8)));
        fs::remove_dir_all(base).unwrap();
    }

    #[test]
    fn at_seal_05_fingerprint_is_stable_and_short() {
        let a = credential_fingerprint(&ApiCredential::new("secret").unwrap());
        let b = credential_fingerprint(&ApiCredential::new("secret").unwrap());
        let c = credential_fingerprint(&ApiCredential::new("other").unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        // sha256("secret") = 2bb80d53...
        assert!(a.starts_with("2bb80d53"));
    }
}
