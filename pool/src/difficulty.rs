/// Share target encoding and proof-of-work difficulty checks
///
/// Workers receive a compact 4-byte target derived from the full 256-bit
/// threshold `(2^256 - 1) / difficulty`. The threshold is laid out as 32
/// big-endian bytes, the first four are taken and byte-reversed, and the
/// result is sent as lowercase hex.

use num_bigint::BigUint;
use num_traits::{Num, Zero};

use crate::error::{PoolError, Result};

const MAX_TARGET_HEX: &str = "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

fn max_target() -> BigUint {
    // constant input, cannot fail
    BigUint::from_str_radix(MAX_TARGET_HEX, 16).unwrap_or_default()
}

/// Compact share target sent to workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Byte-reversed leading word, read big-endian
    pub value: u32,
    /// Lowercase hex of the 4 reversed bytes
    pub hex: String,
}

/// Encode a difficulty as the compact target a worker compares against.
pub fn difficulty_to_target(difficulty: u64) -> Result<Target> {
    if difficulty == 0 {
        return Err(PoolError::InvalidDifficulty(difficulty));
    }

    let threshold = max_target() / BigUint::from(difficulty);
    let bytes = threshold.to_bytes_be();

    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);

    let mut word = [padded[0], padded[1], padded[2], padded[3]];
    word.reverse();

    Ok(Target {
        value: u32::from_be_bytes(word),
        hex: hex::encode(word),
    })
}

/// Convenience wrapper returning only the hex form.
pub fn target_hex(difficulty: u64) -> Result<String> {
    difficulty_to_target(difficulty).map(|t| t.hex)
}

/// A hash meets `difficulty` when, read as a little-endian 256-bit integer,
/// `hash * difficulty` does not exceed `2^256 - 1`.
pub fn hash_meets_difficulty(hash: &[u8; 32], difficulty: u64) -> bool {
    if difficulty == 0 {
        return false;
    }
    let value = BigUint::from_bytes_le(hash);
    if value.is_zero() {
        return true;
    }
    value * BigUint::from(difficulty) <= max_target()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_one_is_all_ones() {
        let t = difficulty_to_target(1).unwrap();
        assert_eq!(t.hex, "ffffffff");
        assert_eq!(t.value, u32::MAX);
    }

    #[test]
    fn known_targets() {
        assert_eq!(target_hex(5000).unwrap(), "711b0d00");
        assert_eq!(target_hex(10000).unwrap(), "b88d0600");
        assert_eq!(target_hex(2).unwrap(), "ffffff7f");
    }

    #[test]
    fn zero_difficulty_is_rejected() {
        assert!(matches!(
            difficulty_to_target(0),
            Err(PoolError::InvalidDifficulty(0))
        ));
    }

    #[test]
    fn higher_difficulty_means_smaller_target() {
        let low = difficulty_to_target(1_000).unwrap();
        let high = difficulty_to_target(1_000_000).unwrap();
        assert!(u32::from_le_bytes(high.value.to_be_bytes()) < u32::from_le_bytes(low.value.to_be_bytes()));
    }

    #[test]
    fn hash_difficulty_check() {
        let mut hash = [0u8; 32];
        assert!(hash_meets_difficulty(&hash, u64::MAX));

        // top byte (little-endian) set: value ~ 2^255, only difficulty 1 passes
        hash[31] = 0x80;
        assert!(hash_meets_difficulty(&hash, 1));
        assert!(!hash_meets_difficulty(&hash, 2));

        let ones = [0xffu8; 32];
        assert!(hash_meets_difficulty(&ones, 1));
        assert!(!hash_meets_difficulty(&ones, 2));
        assert!(!hash_meets_difficulty(&ones, 0));
    }
}
