//! Error kinds of the identity server.
//!
//! Each kind carries its transport status; handlers return the error and the
//! boundary renders it as `status + text`. Upstream failures mirror the
//! upstream status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use vouch_core::StatusError;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// TLS peer certificate absent.
    #[error("client certificate required")]
    MissingClientCert,

    /// Certificate has no email SAN.
    #[error("certificate does not contain an identity")]
    IdentityMissing,

    /// Certificate has no IP SANs.
    #[error("certificate does not contain any origin constraints")]
    OriginsMissing,

    /// Certificate has no serial number.
    #[error("certificate does not contain a serial number")]
    SerialMissing,

    /// The validity window has not started yet.
    #[error("certificate not valid yet")]
    NotValidYet,

    /// The validity window has passed.
    #[error("certificate has expired")]
    Expired,

    /// The issuer is not in the trust pool.
    #[error("certificate not signed by trust root")]
    UnknownIssuer,

    /// The serial is present in the revocation set.
    #[error("certificate has been revoked")]
    Revoked,

    /// The peer's source address is not among the certificate's IP SANs.
    #[error("token request not allowed for given origin")]
    OriginNotAllowed,

    /// No signing key is loaded.
    #[error("signing key not loaded")]
    SigningKeyUnavailable,

    /// The CSR is not an exact renewal of the held certificate.
    #[error("renewal rejected: {0}")]
    RenewalInvalid(String),

    /// A refresh completed within the rate-limit window.
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Malformed request input.
    #[error("{0}")]
    BadRequest(String),

    /// An outbound call failed; the status mirrors the upstream response.
    #[error("{0}")]
    Upstream(StatusError),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl IdentityError {
    /// The transport status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            IdentityError::MissingClientCert => StatusCode::UNAUTHORIZED,
            IdentityError::IdentityMissing
            | IdentityError::OriginsMissing
            | IdentityError::SerialMissing
            | IdentityError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IdentityError::NotValidYet
            | IdentityError::Expired
            | IdentityError::UnknownIssuer
            | IdentityError::OriginNotAllowed => StatusCode::FORBIDDEN,
            IdentityError::Revoked => StatusCode::GONE,
            IdentityError::RenewalInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IdentityError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            IdentityError::Upstream(err) => err.status,
            IdentityError::SigningKeyUnavailable | IdentityError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<vouch_pki::Error> for IdentityError {
    fn from(err: vouch_pki::Error) -> Self {
        match err {
            vouch_pki::Error::RenewalInvalid(msg) => IdentityError::RenewalInvalid(msg),
            vouch_pki::Error::Csr(msg) => IdentityError::BadRequest(msg),
            vouch_pki::Error::CsrSignature(msg) => {
                IdentityError::BadRequest(format!("CSR signature invalid: {msg}"))
            }
            vouch_pki::Error::Authority(status) => IdentityError::Upstream(status),
            other => IdentityError::Internal(other.to_string()),
        }
    }
}

impl From<StatusError> for IdentityError {
    fn from(err: StatusError) -> Self {
        IdentityError::Upstream(err)
    }
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, format!("{self}\n")).into_response();
        if let IdentityError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(IdentityError::MissingClientCert.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(IdentityError::IdentityMissing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(IdentityError::Expired.status(), StatusCode::FORBIDDEN);
        assert_eq!(IdentityError::Revoked.status(), StatusCode::GONE);
        assert_eq!(
            IdentityError::RenewalInvalid("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            IdentityError::RateLimited { retry_after_secs: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = IdentityError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }
}
