//! Identity server: authenticates machine workloads by mTLS client
//! certificates issued from a hosted CA pool, mints short-lived OIDC JWTs,
//! and renews client certificates from validated CSRs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use vouch_core::apimetrics::describe_metrics;
use vouch_core::gcp::DEFAULT_SCOPE;
use vouch_core::http::HttpClient;
use vouch_pki::authority::{AccessTokenSource, CaPoolConfig, CertificateAuthorityClient};
use vouch_pki::cert::CertificatePem;
use vouch_pki::trust::RevocationList;

mod client;
mod credentials;
mod error;
mod handlers;
mod mtls;
mod signing;

use credentials::MetadataTokenSource;
use handlers::{build_router, AppState, MtlsContext};
use mtls::{server_config, MtlsListener, TlsConnectInfo};
use signing::SigningKey;

#[derive(Parser, Debug)]
#[command(name = "vouch-identity-server")]
#[command(about = "mTLS identity server minting OIDC tokens and renewing client certificates")]
struct Args {
    /// Listen port.
    #[arg(long, env = "VOUCH_IDS_PORT", default_value_t = 8443)]
    port: u16,
    /// Server TLS certificate chain (PEM).
    #[arg(long, env = "VOUCH_IDS_TLS_CERT", default_value = "/etc/certs/tls.crt")]
    tls_cert: PathBuf,
    /// Server TLS private key (PEM).
    #[arg(long, env = "VOUCH_IDS_TLS_KEY", default_value = "/etc/certs/tls.key")]
    tls_key: PathBuf,
    /// JWT signing key (PEM). If this changes, the JWKS must be
    /// re-registered with the workload identity provider.
    #[arg(long, env = "VOUCH_IDS_SIGNING_KEY", default_value = "server.pem")]
    signing_key: PathBuf,
    /// Key id stamped into tokens and the JWKS. Same re-registration caveat
    /// as the key itself.
    #[arg(long, env = "VOUCH_IDS_KEY_NAME", default_value = "vouch-identity-server-01")]
    key_name: String,
    /// Token issuer. Must match the workload identity provider.
    #[arg(long, env = "VOUCH_IDS_ISSUER", default_value = "https://identity-server")]
    issuer: String,
    /// Project of the hosted CA pool.
    #[arg(long, env = "VOUCH_IDS_CA_PROJECT", default_value = "vouch-testing")]
    ca_project: String,
    /// Region of the hosted CA pool.
    #[arg(long, env = "VOUCH_IDS_CA_REGION", default_value = "europe-west1")]
    ca_region: String,
    /// Name of the hosted CA pool.
    #[arg(long, env = "VOUCH_IDS_CA_POOL", default_value = "client-ca-pool")]
    ca_pool: String,
    /// Name of the certificate authority inside the pool.
    #[arg(long, env = "VOUCH_IDS_CA_NAME", default_value = "client-ca")]
    ca_name: String,
    /// Ceiling on the CRL refresh interval in seconds.
    #[arg(long, env = "VOUCH_IDS_CRL_REFRESH_SECS", default_value_t = 24 * 3600)]
    crl_refresh_secs: u64,
    /// Lifetime of issued client certificates in seconds (default 90 days).
    #[arg(long, env = "VOUCH_IDS_CLIENT_CERT_LIFETIME_SECS", default_value_t = 90 * 24 * 3600)]
    client_cert_lifetime_secs: i64,
    /// Upper bound on request handling time in seconds.
    #[arg(long, env = "VOUCH_IDS_MAX_REQUEST_SECS", default_value_t = 5)]
    max_request_secs: u64,
    /// Default lifetime of issued tokens in seconds.
    #[arg(long, env = "VOUCH_IDS_TOKEN_LIFETIME_SECS", default_value_t = 600)]
    token_lifetime_secs: u64,
    /// Floor on requested token lifetimes in seconds.
    #[arg(long, env = "VOUCH_IDS_TOKEN_MIN_LIFETIME_SECS", default_value_t = 60)]
    token_min_lifetime_secs: u64,
    /// Cap on requested token lifetimes in seconds.
    #[arg(long, env = "VOUCH_IDS_TOKEN_MAX_LIFETIME_SECS", default_value_t = 3600)]
    token_max_lifetime_secs: u64,
    /// Ambient metadata endpoint providing the server's own credentials.
    #[arg(long, env = "VOUCH_IDS_METADATA_URL", default_value = "http://metadata.google.internal")]
    metadata_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    describe_metrics();

    let signing = match SigningKey::load(&args.signing_key, &args.key_name) {
        Ok(key) => Arc::new(key),
        Err(err) => {
            error!(error = %err, "failed to initialize JWKS");
            std::process::exit(1);
        }
    };

    if args.client_cert_lifetime_secs <= 0 {
        error!("client certificate lifetime is negative or 0, refusing to start");
        std::process::exit(1);
    }
    let client_cert_lifetime = Duration::from_secs(args.client_cert_lifetime_secs as u64);
    if client_cert_lifetime < Duration::from_secs(24 * 3600) {
        warn!("client certificate lifetime is less than 24h, this is not recommended");
    }
    if client_cert_lifetime > Duration::from_secs(90 * 24 * 3600) {
        warn!("client certificate lifetime is more than 90d, this is not recommended");
    }

    let http = match HttpClient::new() {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            std::process::exit(1);
        }
    };
    let tokens: Arc<dyn AccessTokenSource> =
        Arc::new(MetadataTokenSource::new(http.clone(), &args.metadata_url));
    let ca_client = CertificateAuthorityClient::new(
        http,
        CaPoolConfig {
            project: args.ca_project.clone(),
            location: args.ca_region.clone(),
            pool: args.ca_pool.clone(),
            ca_name: args.ca_name.clone(),
        },
    );

    // Build the trust pool. Failure disables mTLS endpoints but the JWKS
    // keeps serving so existing tokens stay verifiable.
    let (mtls_context, client_roots, crl_for_shutdown) =
        match init_trust_pool(&ca_client, &tokens, &args).await {
            Ok((crl, anchors)) => {
                crl.start_auto_refresh();
                let context = MtlsContext {
                    crl: Arc::clone(&crl),
                    ca: ca_client,
                    tokens,
                    client_cert_lifetime,
                    last_crl_refresh: tokio::sync::Mutex::new(None),
                };
                (Some(context), Some(anchors), Some(crl))
            }
            Err(err) => {
                error!(error = %err, "failed to initialize client trust pool, switching to JWKS mode");
                (None, None, None)
            }
        };

    let state = Arc::new(AppState {
        signing,
        issuer: args.issuer.clone(),
        token_lifetime_default: Duration::from_secs(args.token_lifetime_secs),
        token_lifetime_min: Duration::from_secs(args.token_min_lifetime_secs),
        token_lifetime_max: Duration::from_secs(args.token_max_lifetime_secs),
        max_request_duration: Duration::from_secs(args.max_request_secs),
        mtls: mtls_context,
    });
    let router = build_router(state);

    let tls = match server_config(&args.tls_cert, &args.tls_key, client_roots.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to build TLS configuration");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port = args.port, "failed to bind");
            std::process::exit(1);
        }
    };
    let listener = MtlsListener::new(listener, tls);

    info!(port = args.port, "identity server listening");
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<TlsConnectInfo>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = serve.await {
        error!(error = %err, "server exited with error");
    }

    if let Some(crl) = crl_for_shutdown {
        crl.stop_auto_refresh();
    }
}

/// Fetches the trust anchors and primes the revocation list.
async fn init_trust_pool(
    ca_client: &CertificateAuthorityClient,
    tokens: &Arc<dyn AccessTokenSource>,
    args: &Args,
) -> Result<(Arc<RevocationList>, Vec<CertificatePem>), Box<dyn std::error::Error>> {
    let token = tokens.access_token(&[DEFAULT_SCOPE]).await?;
    let anchors = ca_client.fetch_ca_certs(&token).await?;
    info!(anchors = anchors.len(), "loaded client root CA pool");

    let crl = RevocationList::new(
        anchors.clone(),
        ca_client.clone(),
        Arc::clone(tokens),
        Duration::from_secs(args.crl_refresh_secs),
    );
    crl.refresh().await?;

    Ok((crl, anchors))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
