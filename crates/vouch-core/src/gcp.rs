//! Google Cloud scope helpers and the STS / IAM credentials wire types.
//!
//! Only the fields this system consumes are modeled; the full REST schemas
//! live with the cloud provider.

use serde::{Deserialize, Serialize};

/// Scope granting access to all Google Cloud services.
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Scope required to call the IAM credentials endpoints.
pub const IDENTITY_TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/iam";

/// IAM credentials API host and version.
pub const ENDPOINT_IAM_CREDENTIALS: &str = "iamcredentials.googleapis.com/v1";

/// Secure token service host and version.
pub const ENDPOINT_STS: &str = "sts.googleapis.com/v1";

/// Ensures the scope list can be used for service-account impersonation.
///
/// If neither the cloud-platform scope nor the IAM scope is present, the IAM
/// scope is prepended. Without it the token exchange succeeds but the
/// follow-up impersonation call is rejected.
pub fn assure_identity_scope(scopes: Vec<String>) -> Vec<String> {
    let has_required = scopes
        .iter()
        .any(|s| s == DEFAULT_SCOPE || s == IDENTITY_TOKEN_SCOPE);
    if has_required {
        return scopes;
    }

    let mut extended = Vec::with_capacity(scopes.len() + 1);
    extended.push(IDENTITY_TOKEN_SCOPE.to_string());
    extended.extend(scopes);
    extended
}

/// Builds the workload identity pool audience for a provider.
pub fn workload_identity_audience(project_number: &str, pool: &str, provider: &str) -> String {
    format!(
        "//iam.googleapis.com/projects/{project_number}/locations/global/workloadIdentityPools/{pool}/providers/{provider}"
    )
}

/// Request body for the STS token exchange.
///
/// <https://cloud.google.com/iam/docs/reference/sts/rest/v1/TopLevel/token#request-body>
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub grant_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub audience: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub requested_token_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject_token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject_token_type: String,
    #[serde(rename = "lifetime", skip_serializing_if = "String::is_empty")]
    pub lifetime_sec: String,
}

/// Response body of the STS token exchange.
///
/// The metadata token endpoint happens to use the same shape, which is why
/// this type also derives `Serialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenExchangeResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,
}

/// Token request accepted by the identity server's `/token` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostTokenRequest {
    pub audiences: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lifetime: String,
}

/// Request body for `serviceAccounts/<gsa>:generateAccessToken`.
///
/// <https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken#request-body>
#[derive(Debug, Clone, Serialize)]
pub struct IamAccessTokenRequest {
    pub scope: Vec<String>,
    #[serde(rename = "lifetime", skip_serializing_if = "String::is_empty")]
    pub lifetime_sec: String,
}

/// Response body of `generateAccessToken`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamAccessTokenResponse {
    #[serde(default)]
    pub access_token: String,
    /// RFC 3339 expiry timestamp.
    #[serde(default)]
    pub expire_time: String,
}

/// Request body for `serviceAccounts/<gsa>:generateIdToken`.
///
/// <https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateIdToken#request-body>
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IamIdentityTokenRequest {
    pub audience: String,
    pub include_email: bool,
}

/// Response body of `generateIdToken`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IamIdentityTokenResponse {
    #[serde(default)]
    pub token: String,
}
