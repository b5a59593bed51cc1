//! Cryptographic primitives for the vault
//!
//! This module provides:
//! - Argon2id + HKDF derivation of verification hashes and session keys
//! - AES-256-GCM authenticated encryption of individual records
//! - Secure memory handling with zeroize

mod encryption;
mod key_derivation;
mod secure_memory;

pub use encryption::{
    decrypt, decrypt_string, decrypt_with_aad, encrypt, encrypt_string, encrypt_with_aad,
    EncryptedData,
};
pub use key_derivation::{
    derive, generate_salt, verify, DerivedKeys, HashParameters, KdfAlgorithm, KeyDerivationParams,
    Precondition, VerificationHash, DEFAULT_PRECONDITION_THRESHOLD, HASH_LEN,
    HASH_PARAMETERS_VERSION, MIN_SALT_LEN, SALT_LEN,
};
pub use secure_memory::{MasterSecret, SecretString, SessionKey, KEY_LEN};
