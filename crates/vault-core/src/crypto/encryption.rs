//! AES-256-GCM authenticated encryption
//!
//! Encryption format: `{iv_hex}:{auth_tag_hex}:{ciphertext_hex}`
//! - IV: 12 bytes (96 bits) - 4-byte process counter followed by 8 random bytes
//! - Auth tag: 16 bytes (128 bits)
//! - Ciphertext: variable length
//!
//! All functions are stateless apart from the nonce counter and safe to call
//! from many threads at once.

use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::SessionKey;
use crate::error::CipherError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

static NONCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Encrypted data with IV and auth tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Initialization vector (12 bytes for GCM)
    pub iv: [u8; IV_LEN],
    /// Authentication tag (16 bytes)
    pub auth_tag: [u8; TAG_LEN],
    /// Encrypted ciphertext
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Display for EncryptedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            hex::encode(self.iv),
            hex::encode(self.auth_tag),
            hex::encode(&self.ciphertext)
        )
    }
}

impl std::str::FromStr for EncryptedData {
    type Err = CipherError;

    /// Parse from the format: `{iv_hex}:{auth_tag_hex}:{ciphertext_hex}`
    ///
    /// A malformed envelope is treated as tampering.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(iv_hex), Some(tag_hex), Some(ct_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CipherError::Integrity);
        };

        let iv: [u8; IV_LEN] = hex::decode(iv_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(CipherError::Integrity)?;
        let auth_tag: [u8; TAG_LEN] = hex::decode(tag_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(CipherError::Integrity)?;
        let ciphertext = hex::decode(ct_hex).map_err(|_| CipherError::Integrity)?;

        Ok(Self {
            iv,
            auth_tag,
            ciphertext,
        })
    }
}

/// Build a fresh nonce. The counter keeps nonces distinct between concurrent
/// callers in this process; the random tail keeps them distinct across processes.
fn next_nonce() -> [u8; IV_LEN] {
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut iv = [0u8; IV_LEN];
    iv[..4].copy_from_slice(&counter.to_be_bytes());
    OsRng.fill_bytes(&mut iv[4..]);
    iv
}

/// Encrypt plaintext using AES-256-GCM
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<EncryptedData, CipherError> {
    encrypt_with_aad(plaintext, key, &[])
}

/// Encrypt plaintext, binding it to `aad` (authenticated but not encrypted)
///
/// # Arguments
/// * `plaintext` - The data to encrypt
/// * `key` - The 256-bit session key
/// * `aad` - Associated data that must be presented again on decryption
pub fn encrypt_with_aad(
    plaintext: &[u8],
    key: &SessionKey,
    aad: &[u8],
) -> Result<EncryptedData, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    let iv = next_nonce();
    let nonce = Nonce::from_slice(&iv);

    // aes-gcm appends the auth tag to the ciphertext
    let mut ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    if ciphertext.len() < TAG_LEN {
        return Err(CipherError::Encryption("Ciphertext too short".to_string()));
    }

    let tag_start = ciphertext.len() - TAG_LEN;
    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(&ciphertext[tag_start..]);
    ciphertext.truncate(tag_start);

    Ok(EncryptedData {
        iv,
        auth_tag,
        ciphertext,
    })
}

/// Decrypt ciphertext using AES-256-GCM
pub fn decrypt(
    encrypted: &EncryptedData,
    key: &SessionKey,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    decrypt_with_aad(encrypted, key, &[])
}

/// Decrypt ciphertext produced by [`encrypt_with_aad`]
///
/// Fails closed with [`CipherError::Integrity`] on a wrong key, wrong `aad` or
/// any modification; no plaintext is returned in that case.
pub fn decrypt_with_aad(
    encrypted: &EncryptedData,
    key: &SessionKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::Encryption(e.to_string()))?;

    let nonce = Nonce::from_slice(&encrypted.iv);

    // Reconstruct ciphertext with tag appended (as expected by aes-gcm)
    let mut ciphertext_with_tag = Vec::with_capacity(encrypted.ciphertext.len() + TAG_LEN);
    ciphertext_with_tag.extend_from_slice(&encrypted.ciphertext);
    ciphertext_with_tag.extend_from_slice(&encrypted.auth_tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext_with_tag,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CipherError::Integrity)
}

/// Encrypt a string and return the serialized format
pub fn encrypt_string(plaintext: &str, key: &SessionKey, aad: &[u8]) -> Result<String, CipherError> {
    Ok(encrypt_with_aad(plaintext.as_bytes(), key, aad)?.to_string())
}

/// Decrypt from serialized format and return as a zeroizing string
pub fn decrypt_string(
    encrypted: &str,
    key: &SessionKey,
    aad: &[u8],
) -> Result<super::SecretString, CipherError> {
    let encrypted: EncryptedData = encrypted.parse()?;
    let plaintext = decrypt_with_aad(&encrypted, key, aad)?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| CipherError::Integrity)?;
    Ok(super::SecretString::new(text.to_string()))
}
