//! # Signature Verification
//!
//! The loader depends on [`SignatureVerifier`] only. [`K256Verifier`] is the
//! stock implementation: ECDSA over secp256k1, with the signed bytes hashed
//! by SHA-256 first.

use k256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use sha2::{Digest, Sha256};

/// `verify(data, signature, public_key) -> bool`. Must not panic on
/// malformed input; anything that cannot be checked is `false`.
pub trait SignatureVerifier {
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// secp256k1 ECDSA. `public_key` is SEC1 (33 or 65 bytes), `signature` is
/// r || s (64 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct K256Verifier;

impl SignatureVerifier for K256Verifier {
    fn verify(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let digest = Sha256::digest(data);

        let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key) else {
            log::debug!("verify: invalid public key");
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            log::debug!("verify: invalid signature encoding");
            return false;
        };

        verifying_key.verify_prehash(&digest, &signature).is_ok()
    }
}
