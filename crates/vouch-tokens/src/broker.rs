//! The token-exchange pipeline, fronted by the token cache.
//!
//! The broker orchestrates both token kinds with the same skeleton: build a
//! lookup, consult the cache, and on a miss obtain a subject token, exchange
//! it, mint the final token, and cache the result until its expiry. A failed
//! exchange is never cached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vouch_core::gcp::{IamAccessTokenResponse, IamIdentityTokenResponse, TokenExchangeResponse};

use crate::cache::TokenCache;
use crate::identity::SourceIdentity;
use crate::lookup::{TokenKind, TokenLookup};
use crate::Result;

/// The two halves of the token exchange: resolving the caller and trading
/// its identity for cloud tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Resolves the caller's source identity from its direct peer IP.
    async fn identity_for_ip(&self, ip: &str) -> Result<SourceIdentity>;

    /// Obtains the token-request token: subject token plus STS exchange.
    async fn token_request_token(
        &self,
        identity: &SourceIdentity,
        lifetime: Duration,
        scopes: &[String],
        additional_audiences: &[String],
    ) -> Result<TokenExchangeResponse>;

    /// Mints an access token against the bound cloud identity.
    async fn access_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        lifetime: Duration,
        scopes: &[String],
        gsa: &str,
    ) -> Result<IamAccessTokenResponse>;

    /// Mints an identity token against the bound cloud identity.
    async fn id_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        gsa: &str,
        audience: &str,
    ) -> Result<IamIdentityTokenResponse>;
}

/// A token handed back to a caller, with its absolute expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires: DateTime<Utc>,
}

impl IssuedToken {
    /// Remaining validity in whole seconds.
    pub fn expires_in(&self) -> i64 {
        (self.expires - Utc::now()).num_seconds()
    }
}

/// Orchestrates token issuance across cache misses.
pub struct TokenBroker {
    provider: Arc<dyn TokenProvider>,
    cache: Arc<TokenCache>,
    access_lifetime: Duration,
    id_lifetime: Duration,
}

impl TokenBroker {
    /// Creates a broker over a provider and a shared token cache.
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        cache: Arc<TokenCache>,
        access_lifetime: Duration,
        id_lifetime: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            access_lifetime,
            id_lifetime,
        }
    }

    /// Resolves the caller's identity by its direct peer IP.
    pub async fn identity_for_ip(&self, peer_ip: &str) -> Result<SourceIdentity> {
        self.provider.identity_for_ip(peer_ip).await
    }

    /// Issues an access token for the caller behind `peer_ip`.
    ///
    /// `requested_gsa` of `None` or `"default"` selects the caller's bound
    /// identity. An extra audience extends the subject token only.
    pub async fn access_token(
        &self,
        peer_ip: &str,
        requested_gsa: Option<&str>,
        scopes: Vec<String>,
        extra_audience: Option<String>,
    ) -> Result<IssuedToken> {
        let identity = self.provider.identity_for_ip(peer_ip).await?;
        let gsa = resolve_gsa(requested_gsa, &identity);
        let audiences: Vec<String> = extra_audience.into_iter().collect();

        let lookup = TokenLookup::with_scopes_and_audiences(
            TokenKind::Access,
            identity.clone(),
            scopes.clone(),
            audiences.clone(),
        );
        if let Some(hit) = self.cache.get(&lookup) {
            return Ok(IssuedToken {
                token: hit.token,
                expires: hit.expires,
            });
        }

        let request_token = self
            .provider
            .token_request_token(&identity, self.access_lifetime, &scopes, &audiences)
            .await?;
        let minted = self
            .provider
            .access_token(&request_token, self.access_lifetime, &scopes, &gsa)
            .await?;

        let entry =
            self.cache
                .store_until_rfc3339(lookup, minted.access_token, &minted.expire_time);
        Ok(IssuedToken {
            token: entry.token,
            expires: entry.expires,
        })
    }

    /// Issues an identity token for the caller behind `peer_ip`.
    pub async fn identity_token(
        &self,
        peer_ip: &str,
        requested_gsa: Option<&str>,
        audience: String,
    ) -> Result<IssuedToken> {
        let identity = self.provider.identity_for_ip(peer_ip).await?;
        let gsa = resolve_gsa(requested_gsa, &identity);

        let lookup = TokenLookup::with_audience(TokenKind::Id, identity.clone(), audience.clone());
        if let Some(hit) = self.cache.get(&lookup) {
            return Ok(IssuedToken {
                token: hit.token,
                expires: hit.expires,
            });
        }

        let scopes = vec![vouch_core::gcp::IDENTITY_TOKEN_SCOPE.to_string()];
        let audiences = vec![audience.clone()];
        let request_token = self
            .provider
            .token_request_token(&identity, self.id_lifetime, &scopes, &audiences)
            .await?;
        let minted = self.provider.id_token(&request_token, &gsa, &audience).await?;

        let entry = self
            .cache
            .store_for(lookup, minted.token, self.id_lifetime);
        Ok(IssuedToken {
            token: entry.token,
            expires: entry.expires,
        })
    }
}

/// Resolves the target cloud identity from the request parameter.
fn resolve_gsa(requested: Option<&str>, identity: &SourceIdentity) -> String {
    match requested {
        Some(gsa) if !gsa.is_empty() && !gsa.eq_ignore_ascii_case("default") => gsa.to_string(),
        _ => identity.bound_gsa().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HostIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts provider calls and mints predictable tokens.
    struct CountingProvider {
        request_tokens: AtomicUsize,
        access_tokens: AtomicUsize,
        id_tokens: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                request_tokens: AtomicUsize::new(0),
                access_tokens: AtomicUsize::new(0),
                id_tokens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn identity_for_ip(&self, ip: &str) -> Result<SourceIdentity> {
            Ok(SourceIdentity::Host(HostIdentity {
                bound_gsa: format!("bound-{ip}@gcp.project"),
            }))
        }

        async fn token_request_token(
            &self,
            identity: &SourceIdentity,
            _lifetime: Duration,
            _scopes: &[String],
            _additional_audiences: &[String],
        ) -> Result<TokenExchangeResponse> {
            if identity.is_unbound() {
                return Err(crate::Error::UnboundIdentity);
            }
            self.request_tokens.fetch_add(1, Ordering::SeqCst);
            Ok(TokenExchangeResponse {
                access_token: "exchange-token".into(),
                expires_in: 600,
                token_type: "Bearer".into(),
                issued_token_type: None,
            })
        }

        async fn access_token(
            &self,
            _trt: &TokenExchangeResponse,
            lifetime: Duration,
            scopes: &[String],
            gsa: &str,
        ) -> Result<IamAccessTokenResponse> {
            let count = self.access_tokens.fetch_add(1, Ordering::SeqCst);
            Ok(IamAccessTokenResponse {
                access_token: format!("access-{gsa}-{}-{count}", scopes.join("+")),
                expire_time: (Utc::now() + chrono::Duration::from_std(lifetime).unwrap())
                    .to_rfc3339(),
            })
        }

        async fn id_token(
            &self,
            _trt: &TokenExchangeResponse,
            gsa: &str,
            audience: &str,
        ) -> Result<IamIdentityTokenResponse> {
            let count = self.id_tokens.fetch_add(1, Ordering::SeqCst);
            Ok(IamIdentityTokenResponse {
                token: format!("id-{gsa}-{audience}-{count}"),
            })
        }
    }

    fn broker(provider: Arc<CountingProvider>) -> TokenBroker {
        TokenBroker::new(
            provider,
            TokenCache::new(Duration::ZERO, Duration::ZERO),
            Duration::from_secs(600),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn test_access_token_round_trip_and_caching() {
        let provider = Arc::new(CountingProvider::new());
        let broker = broker(Arc::clone(&provider));

        let scopes = vec!["a".to_string(), "b".to_string()];
        let first = broker
            .access_token("10.0.0.1", Some("default"), scopes.clone(), Some("c".into()))
            .await
            .unwrap();
        assert!(first.token.contains("bound-10.0.0.1@gcp.project"));
        assert!(first.expires_in() <= 600);
        assert!(first.expires_in() > 0);

        // Identical parameters are served from cache.
        let second = broker
            .access_token("10.0.0.1", Some("default"), scopes, Some("c".into()))
            .await
            .unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(provider.access_tokens.load(Ordering::SeqCst), 1);
        assert_eq!(provider.request_tokens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_access_token_distinct_scopes_not_shared() {
        let provider = Arc::new(CountingProvider::new());
        let broker = broker(Arc::clone(&provider));

        let a = broker
            .access_token("10.0.0.1", None, vec!["a".into()], None)
            .await
            .unwrap();
        let b = broker
            .access_token("10.0.0.1", None, vec!["a".into(), "b".into()], None)
            .await
            .unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(provider.access_tokens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_explicit_gsa_overrides_bound_identity() {
        let provider = Arc::new(CountingProvider::new());
        let broker = broker(provider);

        let issued = broker
            .access_token("10.0.0.1", Some("other@gcp.project"), vec!["a".into()], None)
            .await
            .unwrap();
        assert!(issued.token.contains("other@gcp.project"));
    }

    #[tokio::test]
    async fn test_identity_token_cached_per_audience() {
        let provider = Arc::new(CountingProvider::new());
        let broker = broker(Arc::clone(&provider));

        let first = broker
            .identity_token("10.0.0.1", None, "https://svc.example".into())
            .await
            .unwrap();
        let second = broker
            .identity_token("10.0.0.1", None, "https://svc.example".into())
            .await
            .unwrap();
        assert_eq!(first.token, second.token);

        let other = broker
            .identity_token("10.0.0.1", None, "https://other.example".into())
            .await
            .unwrap();
        assert_ne!(first.token, other.token);
        assert_eq!(provider.id_tokens.load(Ordering::SeqCst), 2);
    }
}
