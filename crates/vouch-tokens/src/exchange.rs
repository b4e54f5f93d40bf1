//! STS token exchange and IAM credentials calls.
//!
//! The second half of the pipeline: a subject token (projected SA token or
//! identity-server JWT) is exchanged at the secure token service, and the
//! result authorizes `generateAccessToken` / `generateIdToken` against the
//! bound cloud identity.

use std::time::{Duration, Instant};

use tracing::{error, warn};

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::gcp::{
    assure_identity_scope, IamAccessTokenRequest, IamAccessTokenResponse, IamIdentityTokenRequest,
    IamIdentityTokenResponse, TokenExchangeRequest, TokenExchangeResponse, ENDPOINT_IAM_CREDENTIALS,
    ENDPOINT_STS,
};
use vouch_core::http::HttpClient;
use vouch_core::StatusError;

use crate::{Error, Result};

/// The STS rejects request-token lifetimes below ten minutes.
pub const MIN_REQUEST_TOKEN_LIFETIME: Duration = Duration::from_secs(600);

/// Clamps a requested lifetime to the STS floor, logging when it does.
pub fn clamp_request_lifetime(lifetime: Duration) -> Duration {
    if lifetime < MIN_REQUEST_TOKEN_LIFETIME {
        warn!(
            requested_secs = lifetime.as_secs(),
            "request token lifetime is clamped to 10 minutes minimum"
        );
        return MIN_REQUEST_TOKEN_LIFETIME;
    }
    lifetime
}

/// Client for the secure token service and the IAM credentials API.
#[derive(Debug, Clone)]
pub struct GcpExchanger {
    http: HttpClient,
    metrics: ApiMetrics,
    sts_url: String,
    iam_url: String,
}

impl GcpExchanger {
    /// Creates an exchanger against the production endpoints.
    pub fn new(http: HttpClient, metrics_namespace: &'static str) -> Self {
        Self {
            http,
            metrics: ApiMetrics::new(metrics_namespace),
            sts_url: format!("https://{ENDPOINT_STS}"),
            iam_url: format!("https://{ENDPOINT_IAM_CREDENTIALS}"),
        }
    }

    /// Overrides both endpoints. Intended for tests against local stubs.
    pub fn with_endpoints(mut self, sts_url: impl Into<String>, iam_url: impl Into<String>) -> Self {
        self.sts_url = sts_url.into();
        self.iam_url = iam_url.into();
        self
    }

    /// Exchanges a subject token for an STS access token.
    ///
    /// <https://cloud.google.com/iam/docs/reference/sts/rest/v1/TopLevel/token>
    pub async fn exchange_subject_token(
        &self,
        subject_token: &str,
        audience: &str,
        scopes: &[String],
        lifetime: Duration,
    ) -> Result<TokenExchangeResponse> {
        // Without the identity scope the follow-up impersonation call fails.
        let scopes = assure_identity_scope(scopes.to_vec());

        let request = TokenExchangeRequest {
            audience: audience.to_string(),
            grant_type: "urn:ietf:params:oauth:grant-type:token-exchange".to_string(),
            requested_token_type: "urn:ietf:params:oauth:token-type:access_token".to_string(),
            scope: scopes.join(" "),
            subject_token: subject_token.to_string(),
            subject_token_type: "urn:ietf:params:oauth:token-type:jwt".to_string(),
            lifetime_sec: lifetime.as_secs().to_string(),
        };

        let url = format!("{}/token", self.sts_url);
        let started = Instant::now();
        let response: std::result::Result<TokenExchangeResponse, StatusError> =
            self.http.post_json(&url, &request, &[]).await;
        self.metrics.track_call(
            &self.sts_url,
            "request_token",
            started,
            status_of(&response),
        );

        response.map_err(|err| {
            error!(audience, error = %err, "token exchange failed");
            Error::Upstream(err)
        })
    }

    /// Mints an access token for the bound cloud identity.
    ///
    /// <https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken>
    pub async fn access_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        lifetime: Duration,
        scopes: &[String],
        gsa: &str,
    ) -> Result<IamAccessTokenResponse> {
        let request = IamAccessTokenRequest {
            scope: scopes.to_vec(),
            lifetime_sec: format!("{}s", lifetime.as_secs()),
        };

        let url = format!(
            "{}/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_url, gsa
        );
        let started = Instant::now();
        let response: std::result::Result<IamAccessTokenResponse, StatusError> = self
            .http
            .post_json(
                &url,
                &request,
                &[(
                    "Authorization",
                    &format!("Bearer {}", token_request_token.access_token),
                )],
            )
            .await;
        self.metrics
            .track_call(&self.iam_url, "access_token", started, status_of(&response));

        response.map_err(|err| {
            // A rejection here usually means the workload-identity principal
            // lacks Workload Identity User on the target service account.
            error!(gsa, scopes = scopes.join(","), error = %err, "credentials endpoint rejected access token request");
            Error::Upstream(err)
        })
    }

    /// Mints an identity token for the bound cloud identity.
    ///
    /// <https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateIdToken>
    pub async fn id_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        gsa: &str,
        audience: &str,
    ) -> Result<IamIdentityTokenResponse> {
        let request = IamIdentityTokenRequest {
            audience: audience.to_string(),
            include_email: true,
        };

        let url = format!(
            "{}/projects/-/serviceAccounts/{}:generateIdToken",
            self.iam_url, gsa
        );
        let started = Instant::now();
        let response: std::result::Result<IamIdentityTokenResponse, StatusError> = self
            .http
            .post_json(
                &url,
                &request,
                &[(
                    "Authorization",
                    &format!("Bearer {}", token_request_token.access_token),
                )],
            )
            .await;
        self.metrics
            .track_call(&self.iam_url, "id_token", started, status_of(&response));

        response.map_err(|err| {
            error!(gsa, audience, error = %err, "credentials endpoint rejected identity token request");
            Error::Upstream(err)
        })
    }
}

fn status_of<T>(result: &std::result::Result<T, StatusError>) -> i32 {
    match result {
        Ok(_) => 200,
        Err(err) => err.status.as_u16() as i32,
    }
}
