//! Layered authenticated encryption and content hashing
//!
//! The baseline layer is XChaCha20-Poly1305 under the node's symmetric key.
//! When the keyring carries post-quantum material, the baseline envelope is
//! wrapped a second time: an ML-KEM-768 encapsulation yields a one-off key for
//! another XChaCha20-Poly1305 pass, and an ML-DSA-65 signature covers the
//! outer layer. Both layers authenticate on their own and decryption fails
//! closed if either check fails.
//!
//! Symmetric envelope: `0x01 || nonce (24) || ciphertext || tag (16)`
//!
//! Layered envelope: `0x02 || kem ciphertext || signature || nonce (24) || ciphertext || tag (16)`

use crate::keys::{EncryptionKey, Keyring, PqKeyPair};
use crate::types::ContentHash;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, SharedSecret as _};
use pqcrypto_traits::sign::DetachedSignature as _;
use thiserror::Error;
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

const KIND_SYMMETRIC: u8 = 0x01;
const KIND_LAYERED: u8 = 0x02;

const AAD_SYMMETRIC: &[u8] = b"cairn/v1/symmetric";
const AAD_LAYERED: &[u8] = b"cairn/v1/layered";
const KEM_KDF_CONTEXT: &str = "cairn 2024 layered envelope key v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed - data may be corrupted or key incorrect")]
    DecryptionFailed,
    #[error("Signature verification failed")]
    SignatureInvalid,
    #[error("Invalid ciphertext format")]
    InvalidFormat,
    #[error("Envelope requires post-quantum keys that this keyring does not hold")]
    MissingPostQuantumKeys,
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// BLAKE3-256 digest of a byte string
pub fn hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

/// Encrypts and decrypts block payloads under one keyring
#[derive(Clone, Debug)]
pub struct CryptoEngine {
    keyring: Keyring,
}

impl CryptoEngine {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Whether `encrypt` produces layered envelopes
    pub fn is_layered(&self) -> bool {
        self.keyring.post_quantum.is_some()
    }

    /// Seal plaintext into an envelope
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let inner = seal_symmetric(&self.keyring.symmetric, plaintext)?;
        match &self.keyring.post_quantum {
            Some(pq) => seal_layered(pq, &inner),
            None => Ok(inner),
        }
    }

    /// Open an envelope. Never returns partial plaintext.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match envelope.first() {
            Some(&KIND_SYMMETRIC) => open_symmetric(&self.keyring.symmetric, envelope),
            Some(&KIND_LAYERED) => {
                let pq = self
                    .keyring
                    .post_quantum
                    .as_ref()
                    .ok_or(CryptoError::MissingPostQuantumKeys)?;
                let inner = Zeroizing::new(open_layered(pq, envelope)?);
                // The outer layer must wrap a baseline envelope, never raw data
                if inner.first() != Some(&KIND_SYMMETRIC) {
                    return Err(CryptoError::InvalidFormat);
                }
                open_symmetric(&self.keyring.symmetric, &inner)
            }
            _ => Err(CryptoError::InvalidFormat),
        }
    }

    pub fn hash(&self, data: &[u8]) -> ContentHash {
        hash(data)
    }
}

fn seal_with(key: &[u8; 32], kind: u8, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    // Fresh random 24-byte nonce per call
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(kind);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with(key: &[u8; 32], aad: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if body.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(&body[..NONCE_LEN]);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &body[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn seal_symmetric(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal_with(key.as_bytes(), KIND_SYMMETRIC, AAD_SYMMETRIC, plaintext)
}

fn open_symmetric(key: &EncryptionKey, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match envelope.split_first() {
        Some((&KIND_SYMMETRIC, body)) => open_with(key.as_bytes(), AAD_SYMMETRIC, body),
        _ => Err(CryptoError::InvalidFormat),
    }
}

fn derive_layer_key(shared_secret: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(blake3::derive_key(KEM_KDF_CONTEXT, shared_secret))
}

fn seal_layered(pq: &PqKeyPair, inner: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (shared, kem_ct) = mlkem768::encapsulate(&pq.kem_public);
    let layer_key = derive_layer_key(shared.as_bytes());

    // seal_with prefixes the kind byte; the signature covers everything after it
    let sealed = seal_with(&layer_key, KIND_LAYERED, AAD_LAYERED, inner)?;
    let nonce_and_ct = &sealed[1..];

    let signed = signed_region(kem_ct.as_bytes(), nonce_and_ct);
    let signature = mldsa65::detached_sign(&signed, &pq.sign_secret);

    let mut out = Vec::with_capacity(1 + signed.len() + signature.as_bytes().len());
    out.push(KIND_LAYERED);
    out.extend_from_slice(kem_ct.as_bytes());
    out.extend_from_slice(signature.as_bytes());
    out.extend_from_slice(nonce_and_ct);
    Ok(out)
}

fn open_layered(pq: &PqKeyPair, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ct_len = mlkem768::ciphertext_bytes();
    let sig_len = mldsa65::signature_bytes();

    let body = envelope.get(1..).ok_or(CryptoError::InvalidFormat)?;
    if body.len() < ct_len + sig_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat);
    }
    let (kem_bytes, rest) = body.split_at(ct_len);
    let (sig_bytes, nonce_and_ct) = rest.split_at(sig_len);

    let signature =
        mldsa65::DetachedSignature::from_bytes(sig_bytes).map_err(|_| CryptoError::InvalidFormat)?;
    let signed = signed_region(kem_bytes, nonce_and_ct);
    mldsa65::verify_detached_signature(&signature, &signed, &pq.sign_public)
        .map_err(|_| CryptoError::SignatureInvalid)?;

    let kem_ct = mlkem768::Ciphertext::from_bytes(kem_bytes).map_err(|_| CryptoError::InvalidFormat)?;
    let shared = mlkem768::decapsulate(&kem_ct, &pq.kem_secret);
    let layer_key = derive_layer_key(shared.as_bytes());

    open_with(&layer_key, AAD_LAYERED, nonce_and_ct)
}

fn signed_region(kem_ct: &[u8], nonce_and_ct: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(AAD_LAYERED.len() + kem_ct.len() + nonce_and_ct.len());
    signed.extend_from_slice(AAD_LAYERED);
    signed.extend_from_slice(kem_ct);
    signed.extend_from_slice(nonce_and_ct);
    signed
}
