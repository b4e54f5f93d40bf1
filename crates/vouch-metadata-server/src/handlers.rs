//! Handlers of the metadata façade.
//!
//! Every non-root endpoint requires the `Metadata-Flavor: Google` request
//! header and stamps the same header on its response. The caller is always
//! identified by the direct network peer address, never by forwarded-for
//! headers; proxied requests fail origin resolution by design.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use vouch_core::gcp::{TokenExchangeResponse, DEFAULT_SCOPE};
use vouch_core::http::force_max_duration;
use vouch_tokens::broker::TokenBroker;

use crate::routes::EndpointTrie;

const METADATA_FLAVOR: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";

/// Shared state of the façade.
pub struct AppContext {
    pub broker: TokenBroker,
    pub trie: EndpointTrie,
    pub project_id: String,
    pub project_number: String,
    pub max_request_duration: Duration,
}

/// Error wrapper rendering pipeline failures at their tagged status.
struct MetaError(vouch_tokens::Error);

impl From<vouch_tokens::Error> for MetaError {
    fn from(err: vouch_tokens::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for MetaError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "token request failed");
        (self.0.status(), format!("{}\n", self.0)).into_response()
    }
}

/// Builds the façade router.
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let max_duration = ctx.max_request_duration;
    Router::new()
        // Root probe: client libraries race a plain GET / against DNS and
        // expect 200 plus the flavor header, no flavor check.
        .route("/", get(handle_ok))
        .route("/computeMetadata/", get(handle_ok))
        .route("/computeMetadata/v1/", get(handle_list))
        .route("/computeMetadata/v1/project/", get(handle_list))
        .route("/computeMetadata/v1/project/project-id", get(handle_project_id))
        .route(
            "/computeMetadata/v1/project/numeric-project-id",
            get(handle_project_number),
        )
        .route("/computeMetadata/v1/universe/", get(handle_list))
        .route(
            "/computeMetadata/v1/universe/universe-domain",
            get(handle_universe_domain),
        )
        .route("/computeMetadata/v1/instance/", get(handle_list))
        .route(
            "/computeMetadata/v1/instance/service-accounts/",
            get(handle_service_accounts),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/default/email",
            get(handle_default_email),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/{sa}",
            get(handle_service_account_info),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/{sa}/token",
            get(handle_access_token),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/{sa}/identity",
            get(handle_identity_token),
        )
        .route(
            "/computeMetadata/v1/instance/service-accounts/{sa}/scopes",
            get(handle_scopes),
        )
        .route("/healthz", get(handle_health))
        .route("/readyz", get(handle_health))
        .layer(middleware::from_fn_with_state(max_duration, force_max_duration))
        .with_state(ctx)
}

fn flavored(headers: &HeaderMap) -> bool {
    headers
        .get(METADATA_FLAVOR)
        .and_then(|value| value.to_str().ok())
        == Some(METADATA_FLAVOR_VALUE)
}

fn flavor_header() -> [(&'static str, &'static str); 1] {
    [(METADATA_FLAVOR, METADATA_FLAVOR_VALUE)]
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_ok() -> Response {
    (flavor_header(), StatusCode::OK).into_response()
}

/// Lists the immediate children of a directory endpoint.
async fn handle_list(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if !flavored(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let body = ctx.trie.listing_body(uri.path());
    (flavor_header(), body).into_response()
}

async fn handle_project_id(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> Response {
    if !flavored(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    (flavor_header(), ctx.project_id.clone()).into_response()
}

async fn handle_project_number(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Response {
    if !flavored(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    (flavor_header(), ctx.project_number.clone()).into_response()
}

/// The universe domain happens to always be googleapis.com.
async fn handle_universe_domain() -> Response {
    (flavor_header(), "googleapis.com").into_response()
}

async fn handle_scopes(headers: HeaderMap) -> Response {
    if !flavored(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    (flavor_header(), format!("{DEFAULT_SCOPE}\n")).into_response()
}

async fn handle_default_email(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, MetaError> {
    if !flavored(&headers) {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }
    let identity = ctx.broker.identity_for_ip(&peer.ip().to_string()).await?;
    Ok((flavor_header(), identity.bound_gsa().to_string()).into_response())
}

/// Entry in the recursive service-account listing.
#[derive(Debug, Clone, Serialize)]
struct ServiceAccountInfo {
    aliases: Vec<String>,
    email: String,
    scopes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    recursive: String,
}

/// Lists available service accounts: the caller's bound identity first,
/// then the literal `default` alias.
async fn handle_service_accounts(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, MetaError> {
    if !flavored(&headers) {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }

    let identity = ctx.broker.identity_for_ip(&peer.ip().to_string()).await?;
    let email = identity.bound_gsa().to_string();

    if query.recursive == "true" {
        let info = ServiceAccountInfo {
            aliases: vec!["default".to_string()],
            email: email.clone(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
        };
        let mut listing = serde_json::Map::new();
        listing.insert(email, serde_json::to_value(&info).unwrap_or_default());
        listing.insert(
            "default".to_string(),
            serde_json::to_value(&info).unwrap_or_default(),
        );
        return Ok((flavor_header(), Json(serde_json::Value::Object(listing))).into_response());
    }

    Ok((flavor_header(), format!("{email}/\ndefault/\n")).into_response())
}

/// Describes a single service account.
async fn handle_service_account_info(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(sa): Path<String>,
) -> Result<Response, MetaError> {
    if !flavored(&headers) {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }

    let identity = ctx.broker.identity_for_ip(&peer.ip().to_string()).await?;
    let bound = identity.bound_gsa();

    let mut info = ServiceAccountInfo {
        aliases: Vec::new(),
        email: sa.clone(),
        scopes: vec![DEFAULT_SCOPE.to_string()],
    };
    if sa == "default" {
        info.email = bound.to_string();
        info.aliases = vec!["default".to_string()];
    } else if sa == bound {
        info.aliases = vec!["default".to_string()];
    }

    Ok((flavor_header(), Json(info)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    scopes: Option<String>,
    audience: Option<String>,
}

/// Issues a cloud-native access token for the calling workload.
///
/// <https://cloud.google.com/compute/docs/access/authenticate-workloads#applications>
async fn handle_access_token(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(sa): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, MetaError> {
    if !flavored(&headers) {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }

    // The scope list defaults to cloud-platform, which covers all services.
    let scopes: Vec<String> = match query.scopes.as_deref() {
        Some(raw) if !raw.is_empty() => raw.split(',').map(str::to_string).collect(),
        _ => vec![DEFAULT_SCOPE.to_string()],
    };

    let issued = ctx
        .broker
        .access_token(&peer.ip().to_string(), Some(&sa), scopes, query.audience)
        .await?;

    // The response shape matches the STS endpoint's; client libraries
    // consume both interchangeably.
    let response = TokenExchangeResponse {
        access_token: issued.token.clone(),
        expires_in: issued.expires_in(),
        token_type: "Bearer".to_string(),
        issued_token_type: None,
    };
    Ok((flavor_header(), Json(response)).into_response())
}

/// Issues a signed identity token for the calling workload.
///
/// <https://cloud.google.com/compute/docs/instances/verifying-instance-identity>
async fn handle_identity_token(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(sa): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, MetaError> {
    if !flavored(&headers) {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }

    let Some(audience) = query.audience.filter(|a| !a.is_empty()) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            "audience parameter is required\n",
        )
            .into_response());
    };

    let issued = ctx
        .broker
        .identity_token(&peer.ip().to_string(), Some(&sa), audience)
        .await?;

    Ok((flavor_header(), issued.token).into_response())
}
