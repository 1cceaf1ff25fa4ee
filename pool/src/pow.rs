/// Proof-of-work and address boundaries
///
/// Block serialization, the slow hash and address decoding belong to the
/// coin's crypto library. The pool talks to them only through `PowBackend`
/// and `AddressValidator`, so a different coin plugs in without touching
/// the session or protocol code.

use sha3::{Digest, Keccak256};

use crate::blockchain::BlockTemplate;
use crate::difficulty;
use crate::error::{PoolError, Result};

/// Byte offset of the 4-byte header nonce in a CryptoNote hashing blob.
pub const NONCE_OFFSET: usize = 39;

/// A block ready for `submitblock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBlock {
    /// Block id, lowercase hex
    pub hash: String,
    /// Serialized block, lowercase hex
    pub raw: String,
    /// Unix seconds
    pub timestamp: i64,
}

pub trait PowBackend: Send + Sync {
    /// Template bytes with the pool nonce baked into the reserved space.
    fn hashing_blob(&self, template: &BlockTemplate, pool_nonce: u32) -> Result<Vec<u8>>;

    /// Proof-of-work hash of `blob` with the worker's `nonce` inserted.
    fn hash(&self, blob: &[u8], nonce: u32) -> Result<[u8; 32]>;

    fn meets_difficulty(&self, hash: &[u8; 32], difficulty: u64) -> bool {
        difficulty::hash_meets_difficulty(hash, difficulty)
    }

    fn finalize(&self, template: &BlockTemplate, pool_nonce: u32, nonce: u32) -> Result<FinalizedBlock>;

    /// Block id of an already serialized block, lowercase hex.
    fn block_id(&self, block: &[u8]) -> Result<String>;
}

pub trait AddressValidator: Send + Sync {
    fn validate(&self, address: &str) -> Result<()>;
}

fn template_bytes(template: &BlockTemplate) -> Result<Vec<u8>> {
    hex::decode(&template.blob)
        .map_err(|e| PoolError::Upstream(format!("block template is not hex: {}", e)))
}

fn write_u32_le(bytes: &mut [u8], offset: usize, value: u32, what: &str) -> Result<()> {
    let end = offset + 4;
    if end > bytes.len() {
        return Err(PoolError::Upstream(format!(
            "{} offset {} outside {}-byte blob",
            what,
            offset,
            bytes.len()
        )));
    }
    bytes[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Keccak-256 over the raw blob.
///
/// Not a production slow hash. Used for development daemons and tests
/// where the hash function only has to be deterministic.
#[derive(Debug, Default, Clone)]
pub struct Keccak256Backend;

impl Keccak256Backend {
    fn digest(bytes: &[u8]) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

impl PowBackend for Keccak256Backend {
    fn hashing_blob(&self, template: &BlockTemplate, pool_nonce: u32) -> Result<Vec<u8>> {
        let mut bytes = template_bytes(template)?;
        write_u32_le(&mut bytes, template.reserved_offset, pool_nonce, "reserved")?;
        Ok(bytes)
    }

    fn hash(&self, blob: &[u8], nonce: u32) -> Result<[u8; 32]> {
        let mut bytes = blob.to_vec();
        write_u32_le(&mut bytes, NONCE_OFFSET, nonce, "nonce")?;
        Ok(Self::digest(&bytes))
    }

    fn finalize(&self, template: &BlockTemplate, pool_nonce: u32, nonce: u32) -> Result<FinalizedBlock> {
        let mut bytes = self.hashing_blob(template, pool_nonce)?;
        write_u32_le(&mut bytes, NONCE_OFFSET, nonce, "nonce")?;

        Ok(FinalizedBlock {
            hash: hex::encode(Self::digest(&bytes)),
            raw: hex::encode(&bytes),
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    fn block_id(&self, block: &[u8]) -> Result<String> {
        if block.len() < NONCE_OFFSET + 4 {
            return Err(PoolError::request("Block too short"));
        }
        Ok(hex::encode(Self::digest(block)))
    }
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Checks prefix, length and the Base58 alphabet.
#[derive(Debug, Clone)]
pub struct PrefixAddressValidator {
    prefix: String,
    length: usize,
}

impl PrefixAddressValidator {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            length,
        }
    }
}

impl AddressValidator for PrefixAddressValidator {
    fn validate(&self, address: &str) -> Result<()> {
        if !address.starts_with(&self.prefix) {
            return Err(PoolError::request("Invalid address prefix"));
        }
        if address.len() != self.length {
            return Err(PoolError::request("Invalid address length"));
        }
        if !address.chars().all(|c| BASE58_ALPHABET.contains(c)) {
            return Err(PoolError::request("Invalid address encoding"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> BlockTemplate {
        BlockTemplate {
            blob: "00".repeat(80),
            height: 10,
            difficulty: 1,
            reserved_offset: 60,
        }
    }

    #[test]
    fn pool_nonce_changes_hashing_blob() {
        let backend = Keccak256Backend;
        let a = backend.hashing_blob(&template(), 0).unwrap();
        let b = backend.hashing_blob(&template(), 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(&b[60..64], &[1, 0, 0, 0]);
    }

    #[test]
    fn finalized_hash_matches_share_hash() {
        let backend = Keccak256Backend;
        let blob = backend.hashing_blob(&template(), 3).unwrap();
        let share = backend.hash(&blob, 0xdeadbeef).unwrap();
        let block = backend.finalize(&template(), 3, 0xdeadbeef).unwrap();
        assert_eq!(block.hash, hex::encode(share));
        assert_eq!(&hex::decode(block.raw).unwrap()[39..43], &0xdeadbeefu32.to_le_bytes());
    }

    #[test]
    fn block_id_of_finalized_block_is_its_hash() {
        let backend = Keccak256Backend;
        let block = backend.finalize(&template(), 1, 42).unwrap();
        let raw = hex::decode(&block.raw).unwrap();
        assert_eq!(backend.block_id(&raw).unwrap(), block.hash);
        assert!(backend.block_id(&raw[..20]).is_err());
    }

    #[test]
    fn short_blob_is_an_error() {
        let mut t = template();
        t.blob = "00".repeat(10);
        assert!(Keccak256Backend.hashing_blob(&t, 0).is_err());
        assert!(Keccak256Backend.hash(&[0u8; 20], 1).is_err());
    }

    #[test]
    fn address_validation() {
        let v = PrefixAddressValidator::new("TRTL", 8);
        assert!(v.validate("TRTLv1ab").is_ok());
        assert!(v.validate("XRTLv1ab").is_err());
        assert!(v.validate("TRTLv1a").is_err());
        // 0 and l are outside Base58
        assert!(v.validate("TRTLv10b").is_err());
        assert!(v.validate("TRTLv1lb").is_err());
    }
}
