//! Cryptographic operations for the child chain
//!
//! This module provides:
//! - secp256k1 key pairs with deterministic (RFC 6979) recoverable signatures
//! - Keccak-256 hashing, matching what the root chain contract recomputes
//! - Address recovery from 65-byte `r || s || v` signatures

use crate::{Error, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature as EthSignature, H256};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length of a recoverable signature (`r || s || v`)
pub const SIGNATURE_LENGTH: usize = 65;

/// 65-byte recoverable signature as carried in transactions
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    /// All-zero signature, the value of an unsigned slot
    pub const EMPTY: Signature = Signature([0u8; SIGNATURE_LENGTH]);

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// True if the slot has never been signed
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; SIGNATURE_LENGTH]
    }

    /// Recover the signing address for a 32-byte message hash
    pub fn recover(&self, hash: H256) -> Option<Address> {
        if self.is_empty() {
            return None;
        }
        let signature = EthSignature::try_from(&self.0[..]).ok()?;
        signature.recover(hash).ok()
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", ethers::utils::hex::encode(self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", ethers::utils::hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = ethers::utils::hex::decode(s.trim_start_matches("0x"))
            .map_err(de::Error::custom)?;
        let bytes: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("signature must be 65 bytes"))?;
        Ok(Signature(bytes))
    }
}

/// secp256k1 key pair for signing transaction inputs
#[derive(Debug, Clone)]
pub struct KeyPair {
    wallet: LocalWallet,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()),
        }
    }

    /// Create from a 32-byte secret - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let wallet = LocalWallet::from_bytes(seed)
            .map_err(|e| Error::SignatureError(format!("Invalid secret key: {}", e)))?;
        Ok(Self { wallet })
    }

    /// Parse a hex-encoded secret key (with or without `0x`)
    pub fn from_hex(secret: &str) -> Result<Self> {
        let wallet = secret
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| Error::SignatureError(format!("Invalid secret key: {}", e)))?;
        Ok(Self { wallet })
    }

    /// Address controlled by this key
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Underlying wallet (used to sign root chain transactions)
    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    /// Sign a 32-byte hash directly (no message prefix)
    pub fn sign_hash(&self, hash: H256) -> Result<Signature> {
        let signature = self
            .wallet
            .sign_hash(hash)
            .map_err(|e| Error::SignatureError(format!("Signing failed: {}", e)))?;
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(&signature.to_vec());
        Ok(Signature(bytes))
    }
}

/// Hash arbitrary bytes using Keccak-256
pub fn keccak(data: &[u8]) -> H256 {
    H256::from(ethers::utils::keccak256(data))
}

/// Hash the concatenation of several byte strings
pub fn keccak_concat(parts: &[&[u8]]) -> H256 {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part);
    }
    keccak(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_keypair_from_seed_is_deterministic() {
        let seed = [42u8; 32];
        let a = KeyPair::from_seed(&seed).unwrap();
        let b = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_sign_and_recover() {
        let keypair = KeyPair::from_hex(SECRET).unwrap();
        let hash = keccak(b"child chain");

        let signature = keypair.sign_hash(hash).unwrap();
        assert_eq!(signature.recover(hash), Some(keypair.address()));

        // Wrong message recovers a different address
        let other = keccak(b"other message");
        assert_ne!(signature.recover(other), Some(keypair.address()));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let keypair = KeyPair::from_hex(SECRET).unwrap();
        let hash = keccak(b"same input");
        assert_eq!(
            keypair.sign_hash(hash).unwrap(),
            keypair.sign_hash(hash).unwrap()
        );
    }

    #[test]
    fn test_empty_signature_recovers_nothing() {
        assert!(Signature::EMPTY.is_empty());
        assert_eq!(Signature::EMPTY.recover(keccak(b"x")), None);
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") is a well-known constant
        assert_eq!(
            format!("{:?}", keccak(b"")),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak_concat(&[b"ab", b"c"]), keccak(b"abc"));
    }

    #[test]
    fn test_signature_serde_hex() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign_hash(keccak(b"json")).unwrap();
        let json = serde_json::to_string(&signature).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signature);
    }
}
