//! JWT signing key and the published JWKS.
//!
//! The key is read once at startup from a PEM file. Three encodings are
//! tried in order: PKCS#8 wrapper, PKCS#1 RSA, SEC1 EC; the first decoder
//! whose format matches wins. The matching public JWK is derived with every
//! private parameter stripped, stamped with the configured `kid`, and served
//! as a single-key set.
//!
//! If either the key or the `kid` changes, the JWKS must be re-registered
//! with the workload identity provider.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey as _;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::IdentityError;

/// A public JSON Web Key. Only public parameters are ever populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// The served key set. Always holds exactly the one active key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Registered and custom claims of an issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomClaims {
    pub node_claims: NodeClaims,
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
}

/// Claims identifying a node. For workload identity federation these must
/// match the attribute mapping of the identity pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClaims {
    pub identity: String,
}

/// The process-wide signing key with its derived public JWK.
pub struct SigningKey {
    encoding_key: EncodingKey,
    algorithm: Algorithm,
    kid: String,
    jwks: Jwks,
}

enum LoadedKey {
    Rsa(Box<RsaPrivateKey>),
    EcP256(Box<p256::SecretKey>),
}

impl SigningKey {
    /// Loads the signing key from a PEM file.
    pub fn load(path: &std::path::Path, kid: &str) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IdentityError::Internal(format!("failed to read signing key {}: {e}", path.display()))
        })?;
        Self::from_pem(&raw, kid)
    }

    /// Parses a signing key from PEM data.
    pub fn from_pem(pem_data: &str, kid: &str) -> Result<Self, IdentityError> {
        let block = pem::parse(pem_data).map_err(|e| {
            IdentityError::Internal(format!("failed to decode PEM signing key: {e}"))
        })?;
        let der = block.contents();
        if der.is_empty() {
            return Err(IdentityError::Internal(
                "signing key PEM block is empty".to_string(),
            ));
        }

        let decoders: [fn(&[u8]) -> Option<Result<LoadedKey, IdentityError>>; 3] =
            [decode_pkcs8, decode_pkcs1_rsa, decode_sec1_ec];

        for decode in decoders {
            let Some(outcome) = decode(der) else {
                continue;
            };
            let key = outcome?;
            return Self::from_loaded(key, kid);
        }

        Err(IdentityError::Internal(
            "failed to parse signing key: unsupported format".to_string(),
        ))
    }

    fn from_loaded(key: LoadedKey, kid: &str) -> Result<Self, IdentityError> {
        match key {
            LoadedKey::Rsa(key) => {
                let der = key.to_pkcs1_der().map_err(|e| {
                    IdentityError::Internal(format!("failed to re-encode RSA key: {e}"))
                })?;
                let public = key.to_public_key();

                Ok(Self {
                    encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
                    algorithm: Algorithm::RS256,
                    kid: kid.to_string(),
                    jwks: Jwks {
                        keys: vec![Jwk {
                            kty: "RSA".to_string(),
                            key_use: "sig".to_string(),
                            kid: kid.to_string(),
                            alg: "RS256".to_string(),
                            n: Some(URL_SAFE_NO_PAD.encode(public.n().to_bytes_be())),
                            e: Some(URL_SAFE_NO_PAD.encode(public.e().to_bytes_be())),
                            crv: None,
                            x: None,
                            y: None,
                        }],
                    },
                })
            }
            LoadedKey::EcP256(key) => {
                let der = key.to_pkcs8_der().map_err(|e| {
                    IdentityError::Internal(format!("failed to re-encode EC key: {e}"))
                })?;
                let point = key.public_key().to_encoded_point(false);
                let (Some(x), Some(y)) = (point.x(), point.y()) else {
                    return Err(IdentityError::Internal(
                        "EC public key is not an uncompressed point".to_string(),
                    ));
                };

                Ok(Self {
                    encoding_key: EncodingKey::from_ec_der(der.as_bytes()),
                    algorithm: Algorithm::ES256,
                    kid: kid.to_string(),
                    jwks: Jwks {
                        keys: vec![Jwk {
                            kty: "EC".to_string(),
                            key_use: "sig".to_string(),
                            kid: kid.to_string(),
                            alg: "ES256".to_string(),
                            n: None,
                            e: None,
                            crv: Some("P-256".to_string()),
                            x: Some(URL_SAFE_NO_PAD.encode(x)),
                            y: Some(URL_SAFE_NO_PAD.encode(y)),
                        }],
                    },
                })
            }
        }
    }

    /// The public key set served at `/jwks.json`.
    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }

    /// The configured key id.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Signs the claims into a compact JWT with `{alg, typ, kid}` header.
    pub fn sign(&self, claims: &CustomClaims) -> Result<String, IdentityError> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());

        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| IdentityError::Internal(format!("failed to sign JWT: {e}")))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn decode_pkcs8(der: &[u8]) -> Option<Result<LoadedKey, IdentityError>> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
        return Some(Ok(LoadedKey::Rsa(Box::new(key))));
    }
    if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
        return Some(Ok(LoadedKey::EcP256(Box::new(key))));
    }
    // A well-formed PKCS#8 wrapper around an algorithm no signer supports.
    if rsa::pkcs8::PrivateKeyInfo::try_from(der).is_ok() {
        return Some(Err(IdentityError::Internal(
            "signing key uses an unsupported key type".to_string(),
        )));
    }
    None
}

fn decode_pkcs1_rsa(der: &[u8]) -> Option<Result<LoadedKey, IdentityError>> {
    RsaPrivateKey::from_pkcs1_der(der)
        .ok()
        .map(|key| Ok(LoadedKey::Rsa(Box::new(key))))
}

fn decode_sec1_ec(der: &[u8]) -> Option<Result<LoadedKey, IdentityError>> {
    p256::SecretKey::from_sec1_der(der)
        .ok()
        .map(|key| Ok(LoadedKey::EcP256(Box::new(key))))
}

/// Builds and signs an OIDC token for a verified client.
pub fn generate_oidc_token(
    signing: &SigningKey,
    issuer: &str,
    service_account: &str,
    hostname: &str,
    audiences: Vec<String>,
    lifetime: chrono::Duration,
) -> Result<String, IdentityError> {
    let now = chrono::Utc::now();

    // The JWT ID prevents replay. Hash the identity plus random bytes; if
    // the system RNG fails, a textual timestamp keeps issuance going.
    let mut jti = Sha256::new();
    jti.update(service_account.as_bytes());
    let mut random = [0u8; 8];
    match rand::RngCore::try_fill_bytes(&mut rand::rngs::OsRng, &mut random) {
        Ok(()) => jti.update(random),
        Err(err) => {
            warn!(error = %err, "failed to read random bytes for JWT ID, falling back to timestamp");
            jti.update(now.to_rfc3339().as_bytes());
        }
    }

    let claims = CustomClaims {
        node_claims: NodeClaims {
            identity: service_account.to_string(),
        },
        iss: issuer.to_string(),
        sub: hostname.to_string(),
        aud: audiences,
        exp: (now + lifetime).timestamp(),
        iat: now.timestamp(),
        nbf: now.timestamp(),
        jti: vouch_pki::cert::hex_encode(&jti.finalize()),
    };

    signing.sign(&claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
    use rsa::pkcs8::EncodePrivateKey;

    fn ec_pkcs8_pem() -> String {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        key.to_pkcs8_pem(p256::pkcs8::LineEnding::LF).unwrap().to_string()
    }

    fn claims() -> CustomClaims {
        let now = chrono::Utc::now();
        CustomClaims {
            node_claims: NodeClaims {
                identity: "node@gcp.project".into(),
            },
            iss: "https://identity-server".into(),
            sub: "node-1".into(),
            aud: vec!["aud-1".into()],
            exp: (now + chrono::Duration::minutes(10)).timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: "test".into(),
        }
    }

    #[test]
    fn test_load_ec_pkcs8_and_sign() {
        let signing = SigningKey::from_pem(&ec_pkcs8_pem(), "key-01").unwrap();
        let jwk = &signing.jwks().keys[0];
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.alg, "ES256");
        assert_eq!(jwk.key_use, "sig");
        assert_eq!(jwk.kid, "key-01");
        assert!(jwk.x.is_some() && jwk.y.is_some());
        assert!(jwk.n.is_none());

        let token = signing.sign(&claims()).unwrap();
        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("key-01"));

        // The published JWK verifies the signature.
        let key =
            DecodingKey::from_ec_components(jwk.x.as_ref().unwrap(), jwk.y.as_ref().unwrap())
                .unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&["aud-1"]);
        let decoded = decode::<CustomClaims>(&token, &key, &validation).unwrap();
        assert_eq!(decoded.claims.node_claims.identity, "node@gcp.project");
        assert_eq!(decoded.claims.sub, "node-1");
    }

    #[test]
    fn test_load_ec_sec1() {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let der = key.to_sec1_der().unwrap();
        let pem_text = pem::encode(&pem::Pem::new("EC PRIVATE KEY", der.to_vec()));

        let signing = SigningKey::from_pem(&pem_text, "key-02").unwrap();
        assert_eq!(signing.jwks().keys[0].kty, "EC");
    }

    #[test]
    fn test_load_rsa_pkcs1() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let der = key.to_pkcs1_der().unwrap();
        let pem_text = pem::encode(&pem::Pem::new("RSA PRIVATE KEY", der.as_bytes().to_vec()));

        let signing = SigningKey::from_pem(&pem_text, "key-03").unwrap();
        let jwk = &signing.jwks().keys[0];
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.alg, "RS256");
        assert!(jwk.n.is_some() && jwk.e.is_some());
    }

    #[test]
    fn test_load_rsa_pkcs8() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem_text = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();

        let signing = SigningKey::from_pem(&pem_text, "key-04").unwrap();
        assert_eq!(signing.jwks().keys[0].kty, "RSA");
    }

    #[test]
    fn test_garbage_key_rejected() {
        let pem_text = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        assert!(SigningKey::from_pem(&pem_text, "kid").is_err());
        assert!(SigningKey::from_pem("not pem at all", "kid").is_err());
    }

    #[test]
    fn test_generated_token_has_unique_jti() {
        let signing = SigningKey::from_pem(&ec_pkcs8_pem(), "key-05").unwrap();
        let a = generate_oidc_token(
            &signing,
            "https://issuer",
            "node@gcp.project",
            "node-1",
            vec!["aud".into()],
            chrono::Duration::minutes(10),
        )
        .unwrap();
        let b = generate_oidc_token(
            &signing,
            "https://issuer",
            "node@gcp.project",
            "node-1",
            vec!["aud".into()],
            chrono::Duration::minutes(10),
        )
        .unwrap();
        assert_ne!(a, b);
    }
}
