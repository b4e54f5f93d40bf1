//! Certificate, CSR and CRL handling for the vouch workload identity broker.
//!
//! # Components
//!
//! - [`key`] - private key generation (ECDSA via rcgen, RSA)
//! - [`cert`] - X.509 certificate parsing and PEM handling
//! - [`csr`] - renewal CSR construction and the renewal-equivalence verifier
//! - [`authority`] - REST client for the hosted certificate authority
//! - [`trust`] - trust-pool state with revocation snapshots and the
//!   self-regulating CRL refresher

use axum::http::StatusCode;
use vouch_core::StatusError;

pub mod authority;
pub mod cert;
pub mod csr;
pub mod key;
pub mod trust;

pub use authority::{AccessTokenSource, CaPoolConfig, CertificateAuthorityClient};
pub use cert::CertificatePem;
pub use trust::RevocationList;

/// Errors that can occur in vouch-pki operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The private key is in an encoding no signer supports.
    #[error("unsupported key type")]
    UnsupportedKeyType,

    /// The requested key strength has no backing curve or modulus size.
    #[error("unsupported key strength")]
    UnsupportedKeyStrength,

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate parsing or encoding error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CSR construction or parsing error.
    #[error("CSR error: {0}")]
    Csr(String),

    /// The CSR's self-signature does not verify.
    #[error("CSR signature invalid: {0}")]
    CsrSignature(String),

    /// The CSR is not an exact renewal of the held certificate.
    #[error("renewal rejected: {0}")]
    RenewalInvalid(String),

    /// A call to the hosted certificate authority failed.
    #[error("certificate authority error: {0}")]
    Authority(#[from] StatusError),

    /// The CRL refresh could not complete.
    #[error("CRL refresh failed: {0}")]
    CrlRefresh(String),
}

impl Error {
    /// The transport status this error surfaces as at the HTTP boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::RenewalInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Csr(_) | Error::CsrSignature(_) => StatusCode::BAD_REQUEST,
            Error::Authority(err) => err.status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type for vouch-pki operations.
pub type Result<T> = std::result::Result<T, Error>;
