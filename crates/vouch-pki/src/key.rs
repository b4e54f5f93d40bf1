//! Private key generation.
//!
//! Client keys are ECDSA by default; RSA remains available for environments
//! with fixed policy. Generated keys are serialized as PKCS#8 PEM.

use rcgen::KeyPair;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

use crate::{Error, Result};

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Elliptic Curve Digital Signature Algorithm.
    Ecdsa,
    /// Rivest-Shamir-Adleman.
    Rsa,
    /// Edwards-curve signatures. Not issuable by the hosted CA profile.
    Ed25519,
}

/// Relative key strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrength {
    /// Recommended for general use (P-256 / RSA-2048).
    Normal,
    /// Enhanced security (P-384 / RSA-3072).
    Medium,
    /// High-security applications (RSA-4096 only).
    High,
}

/// Generates a private key in PKCS#8 PEM format.
pub fn create_private_key_pem(key_type: KeyType, strength: KeyStrength) -> Result<String> {
    match key_type {
        KeyType::Ecdsa => create_ec_private_key_pem(strength),
        KeyType::Rsa => create_rsa_private_key_pem(strength),
        KeyType::Ed25519 => Err(Error::UnsupportedKeyType),
    }
}

/// Generates an ECDSA private key.
///
/// Normal strength uses P-256, medium uses P-384. There is no P-521 signing
/// algorithm in the crypto stack, so high strength is rejected.
pub fn create_ec_private_key_pem(strength: KeyStrength) -> Result<String> {
    let alg = match strength {
        KeyStrength::Normal => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyStrength::Medium => &rcgen::PKCS_ECDSA_P384_SHA384,
        KeyStrength::High => return Err(Error::UnsupportedKeyStrength),
    };

    let key = KeyPair::generate_for(alg).map_err(|e| Error::KeyGeneration(e.to_string()))?;
    Ok(key.serialize_pem())
}

/// Generates an RSA private key with a strength-dependent modulus size.
pub fn create_rsa_private_key_pem(strength: KeyStrength) -> Result<String> {
    let bits = match strength {
        KeyStrength::Normal => 2048,
        KeyStrength::Medium => 3072,
        KeyStrength::High => 4096,
    };

    let mut rng = rand::thread_rng();
    let key =
        RsaPrivateKey::new(&mut rng, bits).map_err(|e| Error::KeyGeneration(e.to_string()))?;
    let pem = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    Ok(pem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ec_key() {
        let pem = create_private_key_pem(KeyType::Ecdsa, KeyStrength::Normal).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        // Keys are unique per generation
        let other = create_private_key_pem(KeyType::Ecdsa, KeyStrength::Normal).unwrap();
        assert_ne!(pem, other);
    }

    #[test]
    fn test_generate_ec_p384_key() {
        let pem = create_ec_private_key_pem(KeyStrength::Medium).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_ec_high_strength_unsupported() {
        assert!(matches!(
            create_ec_private_key_pem(KeyStrength::High),
            Err(Error::UnsupportedKeyStrength)
        ));
    }

    #[test]
    fn test_ed25519_unsupported() {
        assert!(matches!(
            create_private_key_pem(KeyType::Ed25519, KeyStrength::Normal),
            Err(Error::UnsupportedKeyType)
        ));
    }

    #[test]
    fn test_generate_rsa_key() {
        let pem = create_rsa_private_key_pem(KeyStrength::Normal).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
    }
}
