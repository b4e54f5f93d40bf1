//! The server's own cloud credentials.
//!
//! Calls to the hosted CA authenticate with the identity server's service
//! account. In production that token comes from the ambient metadata
//! endpoint; tests substitute a static token through the same trait.

use async_trait::async_trait;
use axum::http::StatusCode;

use vouch_core::gcp::TokenExchangeResponse;
use vouch_core::http::HttpClient;
use vouch_core::StatusError;
use vouch_pki::authority::AccessTokenSource;

/// Fetches access tokens from the ambient instance-metadata endpoint.
#[derive(Debug, Clone)]
pub struct MetadataTokenSource {
    http: HttpClient,
    base_url: String,
}

impl MetadataTokenSource {
    /// Creates a source against `base_url`
    /// (typically `http://metadata.google.internal`).
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for MetadataTokenSource {
    async fn access_token(&self, scopes: &[&str]) -> Result<String, StatusError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token?scopes={}",
            self.base_url,
            scopes.join(",")
        );

        let response: TokenExchangeResponse = self
            .http
            .get_json(&url, &[("Metadata-Flavor", "Google")])
            .await?;

        if response.access_token.is_empty() {
            return Err(StatusError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "metadata endpoint returned an empty access token",
            ));
        }
        Ok(response.access_token)
    }
}

/// A fixed token, for tests and offline use.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self, _scopes: &[&str]) -> Result<String, StatusError> {
        Ok(self.token.clone())
    }
}
