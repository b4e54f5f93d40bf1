//! Source-identity resolution, token caching and token exchange.
//!
//! This crate implements the trust-and-token pipeline behind the metadata
//! server:
//!
//! - [`identity`] - the closed [`SourceIdentity`] union (pod or host)
//! - [`lookup`] - cache keys derived from `(type, identity, scopes, audiences)`
//! - [`cache`] - sharded token cache with lifetime-aware eviction
//! - [`cluster`] - interface to the container orchestrator (external)
//! - [`kubelet`] - node-agent client listing pods on this node
//! - [`sacache`] - pod-IP to bound-identity cache with bulk reconciliation
//! - [`exchange`] - STS token exchange and IAM credentials calls
//! - [`kubernetes`] - pod-mode token provider
//! - [`host`] - host-mode token provider with client-certificate auto-refresh
//! - [`broker`] - the end-to-end pipeline fronted by the token cache

use axum::http::StatusCode;
use vouch_core::StatusError;

pub mod broker;
pub mod cache;
pub mod cluster;
pub mod exchange;
pub mod host;
pub mod identity;
pub mod kubelet;
pub mod kubernetes;
pub mod lookup;
pub mod sacache;

pub use broker::{IssuedToken, TokenBroker, TokenProvider};
pub use cache::{CachedToken, TokenCache};
pub use identity::{HostIdentity, PodIdentity, SourceIdentity};
pub use lookup::{TokenKind, TokenLookup, TokenUid};

/// Errors that can occur in vouch-tokens operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An upstream call failed; the status mirrors the upstream response.
    #[error("{0}")]
    Upstream(#[from] StatusError),

    /// Certificate or CSR handling failed.
    #[error("pki error: {0}")]
    Pki(#[from] vouch_pki::Error),

    /// Symlink rotation failed.
    #[error("file rotation failed: {0}")]
    Rotate(#[from] vouch_core::files::RotateError),

    /// Key or certificate file I/O failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// The caller's identity carries no bound cloud service account.
    #[error("source identity has no bound cloud service account")]
    UnboundIdentity,

    /// The client certificate is already expired; refresh cannot proceed.
    #[error("client certificate expired {since} ago, a manual refresh is needed")]
    CertificateExpired { since: chrono::Duration },

    /// Several pods share the caller's IP; the lookup cannot be resolved.
    #[error("ambiguous pod lookup: {0}")]
    AmbiguousPod(String),

    /// Invalid provider configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The transport status this error surfaces as at the HTTP boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Upstream(err) => err.status,
            Error::Pki(err) => err.status(),
            Error::UnboundIdentity => StatusCode::UNAUTHORIZED,
            Error::AmbiguousPod(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type for vouch-tokens operations.
pub type Result<T> = std::result::Result<T, Error>;
