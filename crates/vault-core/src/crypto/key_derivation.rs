//! Master-secret key derivation using Argon2id
//!
//! One Argon2id run produces a 32-byte root. HKDF-SHA256 expands the root into
//! two independent outputs: the verification hash that is persisted, and the
//! session encryption key that only ever lives in memory.

use argon2::{Algorithm, Argon2, Block, Params, Version};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use super::secure_memory::{MasterSecret, SessionKey, KEY_LEN};
use crate::error::DerivationError;

/// Length of freshly generated salts in bytes
pub const SALT_LEN: usize = 32;

/// Shortest salt accepted by [`derive`]
pub const MIN_SALT_LEN: usize = 16;

/// Length of the persisted verification hash in bytes
pub const HASH_LEN: usize = 32;

/// Current layout of [`HashParameters`]
pub const HASH_PARAMETERS_VERSION: u32 = 1;

/// Master secrets longer than this are digested before Argon2id runs
pub const DEFAULT_PRECONDITION_THRESHOLD: usize = 128;

/// Minimum safe memory cost in KiB (8 MB)
const MIN_MEMORY_KIB: u32 = 8_192;

const VERIFICATION_INFO: &[u8] = b"vault-verification-hash-v1";
const ENCRYPTION_INFO: &[u8] = b"vault-session-key-v1";

/// Cost parameters for Argon2id key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDerivationParams {
    /// Memory cost in KiB (default: 65536 = 64MB)
    pub memory_cost: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            memory_cost: 65536, // 64 MB
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// The cheapest parameters the cost floor accepts (8 MB, 1 pass, 1 lane)
    pub fn minimum() -> Self {
        Self {
            memory_cost: MIN_MEMORY_KIB,
            time_cost: 1,
            parallelism: 1,
        }
    }

    /// Reject parameters below the cost floor. Weak parameters are an error,
    /// never silently raised or lowered.
    pub fn validate(&self) -> Result<(), DerivationError> {
        if self.memory_cost < MIN_MEMORY_KIB {
            return Err(DerivationError::InvalidParameters(format!(
                "memory cost must be at least {MIN_MEMORY_KIB} KiB (got {})",
                self.memory_cost
            )));
        }
        if self.time_cost < 1 {
            return Err(DerivationError::InvalidParameters(
                "time cost must be at least 1".into(),
            ));
        }
        if self.parallelism < 1 {
            return Err(DerivationError::InvalidParameters(
                "parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Memory-hard function used for derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfAlgorithm {
    Argon2id,
}

/// How the master secret is conditioned before it reaches Argon2id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    /// Feed the secret as-is
    None,
    /// Replace secrets longer than `threshold` bytes with their SHA-256 digest
    Sha256 { threshold: usize },
}

/// Everything needed to reproduce a derivation, persisted next to the
/// verification hash so old records stay verifiable after defaults change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashParameters {
    pub version: u32,
    pub algorithm: KdfAlgorithm,
    pub cost: KeyDerivationParams,
    pub precondition: Precondition,
}

impl HashParameters {
    /// Current-version parameters with the given cost
    pub fn new(cost: KeyDerivationParams) -> Self {
        Self {
            version: HASH_PARAMETERS_VERSION,
            algorithm: KdfAlgorithm::Argon2id,
            cost,
            precondition: Precondition::Sha256 {
                threshold: DEFAULT_PRECONDITION_THRESHOLD,
            },
        }
    }

    /// Whether a record hashed with these parameters should be re-derived
    /// under `target`
    pub fn needs_rehash(&self, target: &HashParameters) -> bool {
        self != target
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for HashParameters {
    fn default() -> Self {
        Self::new(KeyDerivationParams::default())
    }
}

/// Persisted verification hash
#[derive(Clone)]
pub struct VerificationHash([u8; HASH_LEN]);

impl VerificationHash {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Constant-time comparison against a stored hash of any length
    pub fn matches(&self, expected: &[u8]) -> bool {
        bool::from(self.0[..].ct_eq(expected))
    }
}

impl std::fmt::Debug for VerificationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerificationHash({})", hex::encode(self.0))
    }
}

/// Output of one derivation
#[derive(Debug)]
pub struct DerivedKeys {
    pub verification_hash: VerificationHash,
    pub encryption_key: SessionKey,
}

/// Generate a cryptographically random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn condition_input(secret: &MasterSecret, precondition: &Precondition) -> Zeroizing<Vec<u8>> {
    match precondition {
        Precondition::Sha256 { threshold } if secret.len() > *threshold => {
            Zeroizing::new(Sha256::digest(secret.expose()).to_vec())
        }
        _ => Zeroizing::new(secret.expose().to_vec()),
    }
}

/// Derive the verification hash and the session encryption key
///
/// # Arguments
/// * `master_secret` - The user's master secret
/// * `salt` - Per-principal random salt (at least [`MIN_SALT_LEN`] bytes)
/// * `params` - Parameters persisted with the principal's verification record
///
/// Blocks for as long as the configured cost demands. Allocation failure is
/// reported as [`DerivationError::ResourceExhausted`]; parameters are never
/// weakened to make a derivation fit.
pub fn derive(
    master_secret: &MasterSecret,
    salt: &[u8],
    params: &HashParameters,
) -> Result<DerivedKeys, DerivationError> {
    if params.version != HASH_PARAMETERS_VERSION {
        return Err(DerivationError::UnsupportedParameters(params.version));
    }
    params.cost.validate()?;
    if salt.len() < MIN_SALT_LEN {
        return Err(DerivationError::SaltTooShort {
            min: MIN_SALT_LEN,
            actual: salt.len(),
        });
    }

    let argon2_params = Params::new(
        params.cost.memory_cost,
        params.cost.time_cost,
        params.cost.parallelism,
        Some(HASH_LEN),
    )
    .map_err(|e| DerivationError::InvalidParameters(e.to_string()))?;

    let block_count = argon2_params.block_count();
    let mut blocks: Vec<Block> = Vec::new();
    blocks
        .try_reserve_exact(block_count)
        .map_err(|_| DerivationError::ResourceExhausted {
            kib: params.cost.memory_cost,
        })?;
    blocks.resize(block_count, Block::default());

    let input = condition_input(master_secret, &params.precondition);
    let argon2 = match params.algorithm {
        KdfAlgorithm::Argon2id => Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params),
    };

    let mut root = Zeroizing::new([0u8; HASH_LEN]);
    let outcome =
        argon2.hash_password_into_with_memory(&input, salt, &mut root[..], blocks.as_mut_slice());
    blocks.zeroize();
    outcome.map_err(|e| DerivationError::Failed(e.to_string()))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &root[..]);

    let mut verification = [0u8; HASH_LEN];
    hk.expand(VERIFICATION_INFO, &mut verification)
        .map_err(|e| DerivationError::Failed(format!("HKDF expand failed: {e}")))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(ENCRYPTION_INFO, &mut key[..])
        .map_err(|e| DerivationError::Failed(format!("HKDF expand failed: {e}")))?;

    Ok(DerivedKeys {
        verification_hash: VerificationHash(verification),
        encryption_key: SessionKey::new(*key),
    })
}

/// Check a master secret against a stored verification hash
///
/// The final comparison is constant-time.
pub fn verify(
    master_secret: &MasterSecret,
    salt: &[u8],
    params: &HashParameters,
    expected_hash: &[u8],
) -> Result<bool, DerivationError> {
    let derived = derive(master_secret, salt, params)?;
    Ok(derived.verification_hash.matches(expected_hash))
}
