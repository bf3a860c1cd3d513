//! Key lifecycle: generation, passphrase derivation, export and import
//!
//! Keys never leave the node. Losing the keyring makes every block sealed
//! under it unreadable.

use crate::crypto::CryptoError;
use argon2::{Algorithm, Argon2, Params, Version};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Keyring export format version
pub const KEYRING_VERSION: u32 = 1;

/// Symmetric encryption key for the baseline layer.
/// Automatically zeroed when dropped
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Derive a key from a passphrase
    ///
    /// Uses Argon2id with memory-hard parameters to resist brute force
    pub fn derive_from_passphrase(passphrase: &str, salt: &[u8; 16]) -> Result<Self, CryptoError> {
        // Memory: 64 MiB, Iterations: 3, Parallelism: 4
        let params = Params::new(64 * 1024, 3, 4, Some(KEY_LEN))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Generate a new random salt for key derivation
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Import raw key material, rejecting anything that is not exactly 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
        })?;
        Ok(Self { key })
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("malformed hex: {}", e)))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Get raw key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// ML-KEM-768 and ML-DSA-65 key pairs for the long-horizon layer
#[derive(Clone)]
pub struct PqKeyPair {
    pub kem_public: mlkem768::PublicKey,
    pub kem_secret: mlkem768::SecretKey,
    pub sign_public: mldsa65::PublicKey,
    pub sign_secret: mldsa65::SecretKey,
}

impl PqKeyPair {
    pub fn generate() -> Self {
        let (kem_public, kem_secret) = mlkem768::keypair();
        let (sign_public, sign_secret) = mldsa65::keypair();
        Self {
            kem_public,
            kem_secret,
            sign_public,
            sign_secret,
        }
    }
}

impl std::fmt::Debug for PqKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PqKeyPair(..)")
    }
}

/// All key material of one node identity
#[derive(Clone, Debug)]
pub struct Keyring {
    pub symmetric: EncryptionKey,
    pub post_quantum: Option<PqKeyPair>,
}

/// Serialized keyring, hex-encoded fields
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct KeyringFile {
    pub version: u32,
    pub symmetric: String,
    #[serde(default)]
    pub kem_public: Option<String>,
    #[serde(default)]
    pub kem_secret: Option<String>,
    #[serde(default)]
    pub sign_public: Option<String>,
    #[serde(default)]
    pub sign_secret: Option<String>,
}

impl Keyring {
    /// Generate a keyring, optionally with the post-quantum layer
    pub fn generate(post_quantum: bool) -> Self {
        Self {
            symmetric: EncryptionKey::generate(),
            post_quantum: post_quantum.then(PqKeyPair::generate),
        }
    }

    pub fn export(&self) -> KeyringFile {
        let pq = self.post_quantum.as_ref();
        KeyringFile {
            version: KEYRING_VERSION,
            symmetric: self.symmetric.to_hex(),
            kem_public: pq.map(|k| hex::encode(k.kem_public.as_bytes())),
            kem_secret: pq.map(|k| hex::encode(k.kem_secret.as_bytes())),
            sign_public: pq.map(|k| hex::encode(k.sign_public.as_bytes())),
            sign_secret: pq.map(|k| hex::encode(k.sign_secret.as_bytes())),
        }
    }

    /// Rebuild a keyring, rejecting malformed or wrong-length material
    pub fn import(file: &KeyringFile) -> Result<Self, CryptoError> {
        if file.version != KEYRING_VERSION {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported keyring version {}",
                file.version
            )));
        }
        let symmetric = EncryptionKey::from_hex(&file.symmetric)?;

        let post_quantum = match (
            &file.kem_public,
            &file.kem_secret,
            &file.sign_public,
            &file.sign_secret,
        ) {
            (None, None, None, None) => None,
            (Some(kp), Some(ks), Some(sp), Some(ss)) => Some(PqKeyPair {
                kem_public: mlkem768::PublicKey::from_bytes(&decode_field(kp)?)
                    .map_err(|_| CryptoError::InvalidKey("bad KEM public key".to_string()))?,
                kem_secret: mlkem768::SecretKey::from_bytes(&decode_field(ks)?)
                    .map_err(|_| CryptoError::InvalidKey("bad KEM secret key".to_string()))?,
                sign_public: mldsa65::PublicKey::from_bytes(&decode_field(sp)?)
                    .map_err(|_| CryptoError::InvalidKey("bad signing public key".to_string()))?,
                sign_secret: mldsa65::SecretKey::from_bytes(&decode_field(ss)?)
                    .map_err(|_| CryptoError::InvalidKey("bad signing secret key".to_string()))?,
            }),
            _ => {
                return Err(CryptoError::InvalidKey(
                    "incomplete post-quantum key material".to_string(),
                ))
            }
        };

        Ok(Self {
            symmetric,
            post_quantum,
        })
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string_pretty(&self.export())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let file: KeyringFile = serde_json::from_str(json)
            .map_err(|e| CryptoError::InvalidKey(format!("malformed keyring: {}", e)))?;
        Self::import(&file)
    }
}

fn decode_field(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|e| CryptoError::InvalidKey(format!("malformed hex: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_deterministic() {
        let salt = [0u8; 16];
        let key1 = EncryptionKey::derive_from_passphrase("test", &salt).unwrap();
        let key2 = EncryptionKey::derive_from_passphrase("test", &salt).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_import_rejects_wrong_length() {
        assert!(EncryptionKey::from_bytes(&[0u8; 31]).is_err());
        assert!(EncryptionKey::from_bytes(&[0u8; 33]).is_err());
        assert!(EncryptionKey::from_hex("not hex").is_err());
        assert!(EncryptionKey::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_keyring_export_import() {
        let keyring = Keyring::generate(true);
        let json = keyring.to_json().unwrap();
        let restored = Keyring::from_json(&json).unwrap();

        assert_eq!(restored.symmetric.as_bytes(), keyring.symmetric.as_bytes());
        let (a, b) = (
            keyring.post_quantum.as_ref().unwrap(),
            restored.post_quantum.as_ref().unwrap(),
        );
        assert_eq!(a.kem_public.as_bytes(), b.kem_public.as_bytes());
        assert_eq!(a.sign_secret.as_bytes(), b.sign_secret.as_bytes());
    }

    #[test]
    fn test_import_rejects_truncated_pq_material() {
        let keyring = Keyring::generate(true);
        let mut file = keyring.export();
        let truncated = file.kem_public.as_ref().map(|s| s[..s.len() - 2].to_string());
        file.kem_public = truncated;
        assert!(Keyring::import(&file).is_err());

        let mut partial = keyring.export();
        partial.sign_secret = None;
        assert!(Keyring::import(&partial).is_err());
    }
}
