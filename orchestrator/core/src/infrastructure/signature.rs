// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::domain::security::{SignatureError, SignatureVerifier};

/// Checks that a string only uses the standard base64 alphabet, with at most
/// two trailing `=` padding characters.
pub fn is_base64_charset(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let body = value.trim_end_matches('=');
    value.len() - body.len() <= 2
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// Verifies base64 ed25519 signatures against a single public key.
pub struct Ed25519SignatureVerifier {
    verifying_key: VerifyingKey,
}

impl Ed25519SignatureVerifier {
    pub fn from_bytes(public_key_bytes: &[u8]) -> Result<Self, SignatureError> {
        let public_key_bytes: [u8; 32] = public_key_bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("Invalid public key length (must be 32 bytes)".to_string()))?;

        let verifying_key = VerifyingKey::from_bytes(&public_key_bytes)
            .map_err(|e| SignatureError::InvalidKey(format!("Invalid public key: {}", e)))?;

        Ok(Self { verifying_key })
    }

    pub fn from_base64(public_key_b64: &str) -> Result<Self, SignatureError> {
        let bytes = STANDARD
            .decode(public_key_b64.trim())
            .map_err(|e| SignatureError::InvalidKey(format!("Invalid base64 public key: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl SignatureVerifier for Ed25519SignatureVerifier {
    fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), SignatureError> {
        let decoded_sig = STANDARD
            .decode(signature_b64)
            .map_err(|e| SignatureError::Malformed(format!("Invalid base64 signature: {}", e)))?;

        let sig_bytes: [u8; 64] = decoded_sig
            .try_into()
            .map_err(|_| SignatureError::Malformed("Invalid signature length (must be 64 bytes)".to_string()))?;

        let signature = Signature::from_bytes(&sig_bytes);

        self.verifying_key
            .verify(message, &signature)
            .map_err(|e| SignatureError::Mismatch(e.to_string()))
    }
}

/// Accepts any base64 signature of at least `min_length` characters.
///
/// Used only when no public key is configured; it proves nothing about the
/// signer and exists so development setups can connect.
pub struct LengthHeuristicVerifier {
    min_length: usize,
}

impl LengthHeuristicVerifier {
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl SignatureVerifier for LengthHeuristicVerifier {
    fn verify(&self, _message: &[u8], signature_b64: &str) -> Result<(), SignatureError> {
        if !is_base64_charset(signature_b64) {
            return Err(SignatureError::Malformed("Signature is not base64".to_string()));
        }
        if signature_b64.len() < self.min_length {
            return Err(SignatureError::Mismatch(format!(
                "Signature shorter than {} characters",
                self.min_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    #[test]
    fn test_ed25519_verification() {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifier = Ed25519SignatureVerifier::from_base64(&STANDARD.encode(signing_key.verifying_key().as_bytes()))
            .unwrap();

        let signature = STANDARD.encode(signing_key.sign(b"coder-1").to_bytes());
        assert!(verifier.verify(b"coder-1", &signature).is_ok());
        assert!(matches!(
            verifier.verify(b"coder-2", &signature),
            Err(SignatureError::Mismatch(_))
        ));
    }

    #[test]
    fn test_ed25519_rejects_malformed_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifier = Ed25519SignatureVerifier::from_bytes(signing_key.verifying_key().as_bytes()).unwrap();

        assert!(matches!(verifier.verify(b"x", "!!!"), Err(SignatureError::Malformed(_))));
        assert!(matches!(
            verifier.verify(b"x", &STANDARD.encode([0u8; 10])),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_public_key() {
        assert!(matches!(
            Ed25519SignatureVerifier::from_bytes(&[1u8; 12]),
            Err(SignatureError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_length_heuristic() {
        let verifier = LengthHeuristicVerifier::new(32);
        assert!(verifier.verify(b"a", &"A".repeat(32)).is_ok());
        assert!(verifier.verify(b"a", &"A".repeat(31)).is_err());
        assert!(verifier.verify(b"a", &"$".repeat(40)).is_err());
    }

    #[test]
    fn test_base64_charset() {
        assert!(is_base64_charset("c2lnbmF0dXJl"));
        assert!(is_base64_charset("YQ=="));
        assert!(!is_base64_charset("YQ==="));
        assert!(!is_base64_charset(""));
        assert!(!is_base64_charset("has space"));
    }
}
