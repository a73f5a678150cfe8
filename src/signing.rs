//! Ed25519 signing over cell hashes

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use crate::cell::Cell;

/// Length of a detached signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Wallet key pair. The secret half never leaves this type.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Derive a key pair from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Derive a key pair from a hex-encoded 32-byte seed
    pub fn from_hex(seed_hex: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(seed_hex.trim()).map_err(|e| SigningError::InvalidSeed(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| SigningError::InvalidSeed(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self::from_seed(seed))
    }

    /// Generate a fresh key pair
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
        }
    }

    /// Raw ed25519 public key
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign the representation hash of `cell`
    pub fn sign_cell(&self, cell: &Cell) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(&cell.hash()).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair(public: {})", hex::encode(self.public_key()))
    }
}

/// Check a signature produced by [`KeyPair::sign_cell`]
pub fn verify_cell(public_key: &[u8; 32], cell: &Cell, signature: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(&cell.hash(), &Signature::from_bytes(signature)).is_ok()
}

/// Key material errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid secret key seed: {0}")]
    InvalidSeed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::from_seed([7u8; 32]);
        let mut b = CellBuilder::new();
        b.store_u32(1234).unwrap();
        let cell = b.build();

        let sig = kp.sign_cell(&cell);
        assert!(verify_cell(&kp.public_key(), &cell, &sig));
        assert!(!verify_cell(&kp.public_key(), &Cell::empty(), &sig));
    }

    #[test]
    fn test_deterministic_signature() {
        let kp = KeyPair::from_seed([1u8; 32]);
        assert_eq!(kp.sign_cell(&Cell::empty()), kp.sign_cell(&Cell::empty()));
    }

    #[test]
    fn test_from_hex() {
        let kp = KeyPair::from_hex(&hex::encode([9u8; 32])).unwrap();
        assert_eq!(kp.public_key(), KeyPair::from_seed([9u8; 32]).public_key());
        assert!(matches!(KeyPair::from_hex("abcd"), Err(SigningError::InvalidSeed(_))));
        assert!(KeyPair::from_hex("zz").is_err());
    }
}
