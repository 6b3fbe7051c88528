/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives: the hash function, Ed25519 keys, and the derivation of validator
//! addresses from verifying keys.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::Verifier;
pub use ed25519_dalek::{Signature, SignatureError, SigningKey, VerifyingKey};
use sha2::Digest;
use std::fmt::{self, Debug, Formatter};

use super::basic::{Address, SignatureBytes};

pub type CryptoHasher = sha2::Sha256;

/// Serializable form of a [VerifyingKey].
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn address(&self) -> Address {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.0);
        let digest: [u8; 32] = hasher.finalize().into();
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[..20]);
        Address::new(address)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }

    /// Check that `signature` is a valid signature over `message` made by the holder of this key.
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        match self.verifying_key() {
            Ok(verifying_key) => verifying_key
                .verify(message, &Signature::from_bytes(&signature.bytes()))
                .is_ok(),
            Err(_) => false,
        }
    }
}

impl From<&VerifyingKey> for PublicKeyBytes {
    fn from(verifying_key: &VerifyingKey) -> Self {
        PublicKeyBytes(verifying_key.to_bytes())
    }
}

impl Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.address(), f)
    }
}
