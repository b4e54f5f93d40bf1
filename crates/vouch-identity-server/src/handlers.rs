//! HTTP handlers of the identity server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use vouch_core::gcp::DEFAULT_SCOPE;
use vouch_core::http::force_max_duration;
use vouch_pki::authority::{AccessTokenSource, CertificateAuthorityClient};
use vouch_pki::csr::{verify_csr_signature, verify_renewal};
use vouch_pki::trust::RevocationList;

use crate::client::ClientIdentity;
use crate::error::IdentityError;
use crate::mtls::TlsConnectInfo;
use crate::signing::{generate_oidc_token, SigningKey};

/// Manual CRL refreshes are limited to one per this window.
const CRL_REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// Shared state of all handlers.
pub struct AppState {
    pub signing: Arc<SigningKey>,
    pub issuer: String,
    pub token_lifetime_default: Duration,
    pub token_lifetime_min: Duration,
    pub token_lifetime_max: Duration,
    pub max_request_duration: Duration,
    /// Populated when the trust pool could be built; otherwise only the
    /// JWKS endpoint is served.
    pub mtls: Option<MtlsContext>,
}

/// State backing the mTLS-gated endpoints.
pub struct MtlsContext {
    pub crl: Arc<RevocationList>,
    pub ca: CertificateAuthorityClient,
    pub tokens: Arc<dyn AccessTokenSource>,
    pub client_cert_lifetime: Duration,
    /// Completion time of the last successful manual refresh.
    pub last_crl_refresh: tokio::sync::Mutex<Option<Instant>>,
}

impl AppState {
    fn mtls(&self) -> Result<&MtlsContext, IdentityError> {
        self.mtls.as_ref().ok_or_else(|| {
            IdentityError::Internal("client certificate verification is unavailable".to_string())
        })
    }
}

/// Builds the router. mTLS-gated routes appear only when the trust pool is
/// available.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/jwks.json", get(handle_jwks))
        .route("/healthz", get(handle_ok))
        .route("/readyz", get(handle_ok));

    if state.mtls.is_some() {
        router = router
            .route("/token", get(handle_token))
            .route("/identity", get(handle_identity))
            .route("/refreshCrl", post(handle_refresh_crl))
            .route("/renew", post(handle_renew));
    }

    let max_duration = state.max_request_duration;
    router
        .layer(middleware::from_fn_with_state(max_duration, force_max_duration))
        .with_state(state)
}

async fn handle_ok() -> &'static str {
    "ok"
}

/// Serves the public key set. No client certificate needed.
async fn handle_jwks(State(state): State<Arc<AppState>>) -> Response {
    Json(state.signing.jwks().clone()).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    audiences: Vec<String>,
    #[serde(default)]
    lifetime: String,
}

/// Mints a signed OIDC token for the verified caller.
async fn handle_token(
    State(state): State<Arc<AppState>>,
    ConnectInfo(conn): ConnectInfo<TlsConnectInfo>,
    Json(request): Json<TokenRequest>,
) -> Result<Response, IdentityError> {
    let mtls = state.mtls()?;
    let client = ClientIdentity::from_connection(&conn, &mtls.crl)?;

    if request.audiences.is_empty() {
        error!("blocked token request with empty audience");
        return Err(IdentityError::BadRequest(
            "audience must not be empty".to_string(),
        ));
    }

    let lifetime = if request.lifetime.is_empty() {
        state.token_lifetime_default
    } else {
        parse_duration(&request.lifetime)
            .ok_or_else(|| IdentityError::BadRequest("invalid token lifetime".to_string()))?
    };
    let lifetime = lifetime.clamp(state.token_lifetime_min, state.token_lifetime_max);
    let lifetime = chrono::Duration::from_std(lifetime)
        .map_err(|e| IdentityError::Internal(e.to_string()))?;

    let token = generate_oidc_token(
        &state.signing,
        &state.issuer,
        &client.identity,
        &client.host,
        request.audiences,
        lifetime,
    )?;

    Ok(token.into_response())
}

/// Reports the caller's email-SAN identity, one line.
async fn handle_identity(
    State(state): State<Arc<AppState>>,
    ConnectInfo(conn): ConnectInfo<TlsConnectInfo>,
) -> Result<Response, IdentityError> {
    let mtls = state.mtls()?;
    let client = ClientIdentity::from_connection(&conn, &mtls.crl)?;
    Ok(format!("{}\n", client.identity).into_response())
}

/// Refreshes the revocation list, rate-limited to once per minute.
async fn handle_refresh_crl(
    State(state): State<Arc<AppState>>,
    ConnectInfo(conn): ConnectInfo<TlsConnectInfo>,
) -> Result<Response, IdentityError> {
    let mtls = state.mtls()?;
    ClientIdentity::from_connection(&conn, &mtls.crl)?;

    let mut last_refresh = mtls.last_crl_refresh.lock().await;
    if let Some(completed) = *last_refresh {
        let since = completed.elapsed();
        if since < CRL_REFRESH_WINDOW {
            let remaining = CRL_REFRESH_WINDOW - since;
            info!(retry_after_secs = remaining.as_secs(), "CRL refresh request rate-limited");
            return Err(IdentityError::RateLimited {
                retry_after_secs: remaining.as_secs() + 1,
            });
        }
    }

    mtls.crl.refresh().await.map_err(|err| {
        error!(error = %err, "failed to update certificate revocation list");
        IdentityError::from(err)
    })?;

    info!("CRL refresh completed successfully");
    *last_refresh = Some(Instant::now());
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
struct RenewRequest {
    csr: String,
}

/// Issues a renewed certificate for a CSR restating the caller's identity.
async fn handle_renew(
    State(state): State<Arc<AppState>>,
    ConnectInfo(conn): ConnectInfo<TlsConnectInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IdentityError> {
    let mtls = state.mtls()?;
    let client = ClientIdentity::from_connection(&conn, &mtls.crl)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let csr_pem = if content_type.starts_with("application/x-pem-file") {
        String::from_utf8(body.to_vec())
            .map_err(|_| IdentityError::BadRequest("CSR is not valid UTF-8".to_string()))?
    } else {
        let request: RenewRequest = serde_json::from_slice(&body)
            .map_err(|e| IdentityError::BadRequest(format!("failed to parse request: {e}")))?;
        request.csr
    };

    verify_csr_signature(&csr_pem)?;
    verify_renewal(&csr_pem, &client.certificate)?;

    let token = mtls
        .tokens
        .access_token(&[DEFAULT_SCOPE])
        .await
        .map_err(IdentityError::Upstream)?;

    let certificate = mtls
        .ca
        .create_certificate_from_csr(&token, &csr_pem, mtls.client_cert_lifetime)
        .await
        .map_err(|err| {
            error!(error = %err, "failed to create certificate from CSR");
            IdentityError::from(err)
        })?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=client.cert",
            ),
        ],
        certificate.to_pem().to_string(),
    )
        .into_response())
}

/// Parses durations of the form `300s`, `10m`, `2h`, or bare seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = value.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenSource;
    use crate::signing::CustomClaims;
    use axum::body::Body;
    use axum::http::Request;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
        KeyUsagePurpose, SerialNumber,
    };
    use std::net::SocketAddr;
    use tower::util::ServiceExt;
    use vouch_core::http::HttpClient;
    use vouch_pki::authority::CaPoolConfig;
    use vouch_pki::cert::CertificatePem;

    struct TestCa {
        params: CertificateParams,
        key: KeyPair,
        cert_pem: String,
    }

    fn test_ca() -> TestCa {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test-pool-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.clone().self_signed(&key).unwrap();
        TestCa {
            params,
            key,
            cert_pem: cert.pem(),
        }
    }

    fn issue_client_cert(ca: &TestCa, hostname: &str, email: &str, ips: &[&str]) -> Vec<u8> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        let mut sans = vec![
            rcgen::SanType::DnsName(hostname.to_string().try_into().unwrap()),
            rcgen::SanType::Rfc822Name(email.to_string().try_into().unwrap()),
        ];
        for ip in ips {
            sans.push(rcgen::SanType::IpAddress(ip.parse().unwrap()));
        }
        params.subject_alt_names = sans;
        params.serial_number = Some(SerialNumber::from_slice(&[0x42]));
        let issuer = Issuer::from_params(&ca.params, &ca.key);
        let cert = params.signed_by(&key, &issuer).unwrap();
        CertificatePem::from_pem(&cert.pem()).unwrap().der().to_vec()
    }

    fn test_state(ca: &TestCa) -> Arc<AppState> {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let key_pem = p256::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let signing = Arc::new(SigningKey::from_pem(&key_pem, "test-key-01").unwrap());

        let anchors = CertificatePem::parse_chain_pem(&ca.cert_pem).unwrap();
        let ca_client = CertificateAuthorityClient::new(
            HttpClient::new().unwrap(),
            CaPoolConfig {
                project: "p".into(),
                location: "l".into(),
                pool: "pool".into(),
                ca_name: "ca".into(),
            },
        );
        let crl = RevocationList::new(
            anchors,
            ca_client.clone(),
            Arc::new(StaticTokenSource::new("test-token")),
            Duration::from_secs(24 * 3600),
        );

        Arc::new(AppState {
            signing,
            issuer: "https://identity-server".into(),
            token_lifetime_default: Duration::from_secs(600),
            token_lifetime_min: Duration::from_secs(60),
            token_lifetime_max: Duration::from_secs(3600),
            max_request_duration: Duration::from_secs(5),
            mtls: Some(MtlsContext {
                crl,
                ca: ca_client,
                tokens: Arc::new(StaticTokenSource::new("test-token")),
                client_cert_lifetime: Duration::from_secs(90 * 24 * 3600),
                last_crl_refresh: tokio::sync::Mutex::new(None),
            }),
        })
    }

    fn connect_info(cert_der: Option<Vec<u8>>, peer: &str) -> ConnectInfo<TlsConnectInfo> {
        ConnectInfo(TlsConnectInfo {
            peer_addr: SocketAddr::new(peer.parse().unwrap(), 40000),
            client_cert_der: cert_der,
        })
    }

    async fn send(
        router: Router,
        mut request: Request<Body>,
        conn: ConnectInfo<TlsConnectInfo>,
    ) -> (StatusCode, Vec<u8>) {
        request.extensions_mut().insert(conn);
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_jwks_is_public() {
        let ca = test_ca();
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/jwks.json")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request, connect_info(None, "10.0.0.9")).await;

        assert_eq!(status, StatusCode::OK);
        let jwks: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(jwks["keys"][0]["kty"], "EC");
        assert_eq!(jwks["keys"][0]["kid"], "test-key-01");
        assert_eq!(jwks["keys"][0]["use"], "sig");
        // Private parameters never leave the process.
        assert!(jwks["keys"][0].get("d").is_none());
    }

    #[tokio::test]
    async fn test_token_issued_for_valid_client() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "node-1", "test@test", &["127.0.0.1", "::1"]);
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"audiences":["aud-1"],"lifetime":"10m"}"#))
            .unwrap();
        let (status, body) =
            send(router, request, connect_info(Some(cert), "127.0.0.1")).await;

        assert_eq!(status, StatusCode::OK);
        let token = String::from_utf8(body).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        let claims: CustomClaims = serde_json::from_slice(&payload).unwrap();
        assert_eq!(claims.node_claims.identity, "test@test");
        assert_eq!(claims.sub, "node-1");
        assert_eq!(claims.aud, vec!["aud-1"]);
        assert!(claims.exp > claims.iat);
    }

    #[tokio::test]
    async fn test_token_requires_client_cert() {
        let ca = test_ca();
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"audiences":["aud-1"]}"#))
            .unwrap();
        let (status, _) = send(router, request, connect_info(None, "127.0.0.1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_rejects_foreign_origin() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "node-1", "test@test", &["10.0.0.1"]);
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"audiences":["aud-1"]}"#))
            .unwrap();
        let (status, _) = send(router, request, connect_info(Some(cert), "192.168.0.7")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_token_rejects_unknown_issuer() {
        let ca = test_ca();
        let rogue = test_ca();
        let cert = issue_client_cert(&rogue, "node-1", "test@test", &["127.0.0.1"]);
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"audiences":["aud-1"]}"#))
            .unwrap();
        let (status, _) = send(router, request, connect_info(Some(cert), "127.0.0.1")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_token_rejects_empty_audiences() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "node-1", "test@test", &["127.0.0.1"]);
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/token")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"audiences":[]}"#))
            .unwrap();
        let (status, _) = send(router, request, connect_info(Some(cert), "127.0.0.1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_identity_reports_email_san() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "node-1", "machine@gcp.project", &["127.0.0.1"]);
        let router = build_router(test_state(&ca));

        let request = Request::builder()
            .uri("/identity")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request, connect_info(Some(cert), "127.0.0.1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).unwrap(), "machine@gcp.project\n");
    }

    #[tokio::test]
    async fn test_refresh_crl_rate_limited() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "node-1", "test@test", &["127.0.0.1"]);
        let state = test_state(&ca);

        // Pretend a refresh just completed.
        *state.mtls.as_ref().unwrap().last_crl_refresh.lock().await = Some(Instant::now());

        let router = build_router(Arc::clone(&state));
        let request = Request::builder()
            .method("POST")
            .uri("/refreshCrl")
            .body(Body::empty())
            .unwrap();

        let conn = connect_info(Some(cert), "127.0.0.1");
        let mut request = request;
        request.extensions_mut().insert(conn);
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn test_renew_rejects_identity_change() {
        let ca = test_ca();
        let cert = issue_client_cert(&ca, "test", "test@test", &["127.0.0.1", "::1"]);
        let router = build_router(test_state(&ca));

        // CSR restates everything except the hostname.
        let key = vouch_pki::key::create_ec_private_key_pem(vouch_pki::key::KeyStrength::Normal)
            .unwrap();
        let csr = vouch_pki::csr::build_client_csr(
            &key,
            "hacker",
            "test@test",
            &["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
        )
        .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/renew")
            .header("content-type", "application/x-pem-file")
            .body(Body::from(csr))
            .unwrap();
        let (status, _) = send(router, request, connect_info(Some(cert), "127.0.0.1")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("600s"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
    }
}
