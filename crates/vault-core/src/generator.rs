//! Secret generation and strength scoring

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::SecretString;
use crate::error::ConfigurationError;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{};:,.<>?/~";

/// Pool size assumed for characters outside every known class
const OTHER_POOL: usize = 32;

/// Entropy at which the score saturates
const FULL_SCORE_BITS: f64 = 128.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterClass {
    Lowercase,
    Uppercase,
    Digits,
    Symbols,
}

impl CharacterClass {
    pub const ALL: [CharacterClass; 4] = [
        CharacterClass::Lowercase,
        CharacterClass::Uppercase,
        CharacterClass::Digits,
        CharacterClass::Symbols,
    ];

    pub fn alphabet(&self) -> &'static [u8] {
        match self {
            Self::Lowercase => LOWERCASE,
            Self::Uppercase => UPPERCASE,
            Self::Digits => DIGITS,
            Self::Symbols => SYMBOLS,
        }
    }

    fn of(c: char) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| c.is_ascii() && class.alphabet().contains(&(c as u8)))
    }
}

/// Generate a random secret of exactly `length` characters
///
/// Every requested class contributes at least one character; the rest are
/// drawn uniformly from the union of the classes, then the whole secret is
/// shuffled. Duplicate classes count once.
pub fn generate(
    length: usize,
    classes: &[CharacterClass],
) -> Result<SecretString, ConfigurationError> {
    let mut unique: Vec<CharacterClass> = Vec::with_capacity(classes.len());
    for class in classes {
        if !unique.contains(class) {
            unique.push(*class);
        }
    }

    if unique.is_empty() {
        return Err(ConfigurationError::NoCharacterClasses);
    }
    if length < unique.len() {
        return Err(ConfigurationError::LengthTooShort {
            length,
            required: unique.len(),
        });
    }

    let pool: Vec<u8> = unique
        .iter()
        .flat_map(|class| class.alphabet().iter().copied())
        .collect();

    let mut rng = OsRng;
    let mut chars = Zeroizing::new(Vec::with_capacity(length));
    for class in &unique {
        let alphabet = class.alphabet();
        chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    while chars.len() < length {
        chars.push(pool[rng.gen_range(0..pool.len())]);
    }
    chars.shuffle(&mut rng);

    Ok(SecretString::new(chars.iter().map(|&b| char::from(b)).collect()))
}

/// Estimated entropy in bits: length times log2 of the pool implied by the
/// character classes present
pub fn estimate_entropy(secret: &str) -> f64 {
    let mut seen = [false; 4];
    let mut other = false;
    let mut length = 0usize;

    for c in secret.chars() {
        length += 1;
        match CharacterClass::of(c) {
            Some(class) => seen[class as usize] = true,
            None => other = true,
        }
    }

    let pool: usize = CharacterClass::ALL
        .iter()
        .zip(seen)
        .filter(|(_, present)| *present)
        .map(|(class, _)| class.alphabet().len())
        .sum::<usize>()
        + if other { OTHER_POOL } else { 0 };

    if pool == 0 {
        return 0.0;
    }
    length as f64 * (pool as f64).log2()
}

/// Strength in `[0, 1]`; saturates at 128 bits of estimated entropy
pub fn score(secret: &str) -> f64 {
    (estimate_entropy(secret) / FULL_SCORE_BITS).min(1.0)
}

/// Coarse strength bucket for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrengthLabel {
    VeryWeak,
    Weak,
    Fair,
    Strong,
    VeryStrong,
}

impl StrengthLabel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.25 => Self::VeryWeak,
            s if s < 0.45 => Self::Weak,
            s if s < 0.6 => Self::Fair,
            s if s < 0.85 => Self::Strong,
            _ => Self::VeryStrong,
        }
    }

    pub fn of(secret: &str) -> Self {
        Self::from_score(score(secret))
    }
}

impl std::fmt::Display for StrengthLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::VeryWeak => "very weak",
            Self::Weak => "weak",
            Self::Fair => "fair",
            Self::Strong => "strong",
            Self::VeryStrong => "very strong",
        };
        f.write_str(label)
    }
}
