//! Metadata server: impersonates the cloud's native instance-metadata
//! endpoint for co-located workloads, trading their source identity for
//! cloud access and identity tokens.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use vouch_core::apimetrics::describe_metrics;
use vouch_core::gcp::workload_identity_audience;
use vouch_core::http::HttpClient;
use vouch_tokens::broker::{TokenBroker, TokenProvider};
use vouch_tokens::cache::TokenCache;
use vouch_tokens::exchange::GcpExchanger;
use vouch_tokens::host::{HostProviderConfig, HostTokenProvider};
use vouch_tokens::kubelet::KubeletClient;
use vouch_tokens::kubernetes::KubernetesTokenProvider;

mod handlers;
mod kube;
mod routes;

use handlers::{build_router, AppContext};
use kube::InClusterApi;
use routes::EndpointTrie;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Resolve callers by pod IP through the orchestrator.
    Kubernetes,
    /// Serve the local machine's own mTLS-bound identity.
    Host,
}

#[derive(Parser, Debug)]
#[command(name = "vouch-metadata-server")]
#[command(about = "Instance-metadata facade trading workload identities for cloud tokens")]
struct Args {
    /// Listen port.
    #[arg(long, env = "VOUCH_MDS_PORT", default_value_t = 8080)]
    port: u16,
    /// Caller resolution mode.
    #[arg(long, env = "VOUCH_MDS_MODE", value_enum, default_value = "kubernetes")]
    mode: Mode,
    /// Project id served at `project/project-id`.
    #[arg(long, env = "VOUCH_MDS_PROJECT_ID", default_value = "vouch-testing")]
    project_id: String,
    /// Project number served at `project/numeric-project-id` and used in the
    /// workload identity audience.
    #[arg(long, env = "VOUCH_MDS_PROJECT_NUMBER", default_value = "000000000000")]
    project_number: String,
    /// Workload identity pool name.
    #[arg(long, env = "VOUCH_MDS_POOL_NAME", default_value = "kubernetes-pool")]
    pool_name: String,
    /// Workload identity provider name.
    #[arg(long, env = "VOUCH_MDS_PROVIDER_NAME", default_value = "production")]
    provider_name: String,
    /// Upper bound on request handling time in seconds.
    #[arg(long, env = "VOUCH_MDS_MAX_REQUEST_SECS", default_value_t = 3)]
    max_request_secs: u64,
    /// TTL of the pod-IP to identity cache in seconds.
    #[arg(long, env = "VOUCH_MDS_SA_CACHE_TTL_SECS", default_value_t = 120)]
    sa_cache_ttl_secs: u64,
    /// Retry bound for pod lookups that find no pod yet.
    #[arg(long, env = "VOUCH_MDS_POD_LOOKUP_RETRIES", default_value_t = 3)]
    pod_lookup_retries: u32,
    /// Token-cache GC interval in seconds.
    #[arg(long, env = "VOUCH_MDS_TOKEN_GC_SECS", default_value_t = 3600)]
    token_gc_secs: u64,
    /// Minimum remaining lifetime of tokens served from cache, in seconds.
    #[arg(long, env = "VOUCH_MDS_TOKEN_MIN_LIFETIME_SECS", default_value_t = 60)]
    token_min_lifetime_secs: u64,
    /// Lifetime of issued access tokens in seconds.
    #[arg(long, env = "VOUCH_MDS_ACCESS_TOKEN_LIFETIME_SECS", default_value_t = 600)]
    access_token_lifetime_secs: u64,
    /// Lifetime of issued identity tokens in seconds.
    #[arg(long, env = "VOUCH_MDS_ID_TOKEN_LIFETIME_SECS", default_value_t = 600)]
    id_token_lifetime_secs: u64,
    /// Node-agent endpoint; empty switches pod lookups to the control plane.
    #[arg(long, env = "VOUCH_MDS_KUBELET_HOST", default_value = "https://127.0.0.1:10250")]
    kubelet_host: String,
    /// CA bundle for the node agent and control plane.
    #[arg(
        long,
        env = "VOUCH_MDS_KUBELET_CA",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
    )]
    kubelet_ca_path: PathBuf,
    /// Identity server base URL (host mode).
    #[arg(long, env = "VOUCH_MDS_IDENTITY_SERVER", default_value = "https://identity-server:443")]
    identity_server: String,
    /// CA bundle for the identity server (host mode; empty uses system roots).
    #[arg(long, env = "VOUCH_MDS_HOST_CA", default_value = "")]
    host_ca_path: String,
    /// Client certificate symlink (host mode).
    #[arg(long, env = "VOUCH_MDS_CLIENT_CERT", default_value = "/etc/certs/machine/client.cert")]
    client_cert: PathBuf,
    /// Client key symlink (host mode).
    #[arg(long, env = "VOUCH_MDS_CLIENT_KEY", default_value = "/etc/certs/machine/client.key")]
    client_key: PathBuf,
    /// Renew the client certificate below this remaining lifetime (seconds).
    #[arg(long, env = "VOUCH_MDS_CLIENT_CERT_MIN_LIFETIME_SECS", default_value_t = 10 * 24 * 3600)]
    client_cert_min_lifetime_secs: u64,
    /// Client-certificate check interval in seconds.
    #[arg(long, env = "VOUCH_MDS_CLIENT_CERT_REFRESH_SECS", default_value_t = 24 * 3600)]
    client_cert_refresh_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    describe_metrics();

    let audience = workload_identity_audience(
        &args.project_number,
        &args.pool_name,
        &args.provider_name,
    );

    let (provider, host_provider): (Arc<dyn TokenProvider>, Option<Arc<HostTokenProvider>>) =
        match args.mode {
            Mode::Host => {
                info!("using host mode");
                if args.client_cert_refresh_secs > args.client_cert_min_lifetime_secs {
                    error!("the client cert refresh interval must be less than the minimum lifetime");
                    std::process::exit(1);
                }

                let ca_cert_pem = if args.host_ca_path.is_empty() {
                    None
                } else {
                    match std::fs::read(&args.host_ca_path) {
                        Ok(pem) => Some(pem),
                        Err(err) => {
                            error!(error = %err, path = %args.host_ca_path, "failed to read CA certificate");
                            None
                        }
                    }
                };

                let exchange = match HttpClient::new() {
                    Ok(http) => GcpExchanger::new(http, "metadata_server_host"),
                    Err(err) => {
                        error!(error = %err, "failed to build HTTP client");
                        std::process::exit(1);
                    }
                };
                let config = HostProviderConfig {
                    identity_server_url: args.identity_server.clone(),
                    ca_cert_pem,
                    cert_path: args.client_cert.clone(),
                    key_path: args.client_key.clone(),
                    refresh_interval: Duration::from_secs(args.client_cert_refresh_secs),
                    min_lifetime: Duration::from_secs(args.client_cert_min_lifetime_secs),
                    main_audience: audience.clone(),
                };

                match HostTokenProvider::new(config, exchange).await {
                    Ok(provider) => (Arc::clone(&provider) as Arc<dyn TokenProvider>, Some(provider)),
                    Err(err) => {
                        error!(error = %err, "failed to create host token provider");
                        std::process::exit(1);
                    }
                }
            }

            Mode::Kubernetes => {
                info!("using kubernetes mode");
                let cluster_http = match build_cluster_client(&args.kubelet_ca_path) {
                    Ok(http) => http,
                    Err(err) => {
                        error!(error = %err, "failed to build cluster HTTP client");
                        std::process::exit(1);
                    }
                };

                let cluster = match InClusterApi::from_env(cluster_http.clone()) {
                    Ok(api) => Arc::new(api),
                    Err(err) => {
                        error!(error = %err, "failed to create cluster client");
                        std::process::exit(1);
                    }
                };

                let kubelet = if args.kubelet_host.is_empty() {
                    None
                } else {
                    Some(Arc::new(KubeletClient::new(
                        cluster_http,
                        args.kubelet_host.clone(),
                    )))
                };

                let exchange = match HttpClient::new() {
                    Ok(http) => GcpExchanger::new(http, "metadata_server_k8s"),
                    Err(err) => {
                        error!(error = %err, "failed to build HTTP client");
                        std::process::exit(1);
                    }
                };

                let provider = KubernetesTokenProvider::new(
                    exchange,
                    cluster,
                    kubelet,
                    audience.clone(),
                    Duration::from_secs(args.sa_cache_ttl_secs),
                    args.pod_lookup_retries,
                );
                (Arc::new(provider) as Arc<dyn TokenProvider>, None)
            }
        };

    let cache = TokenCache::new(
        Duration::from_secs(args.token_gc_secs),
        Duration::from_secs(args.token_min_lifetime_secs),
    );
    cache.start_gc();

    let context = Arc::new(AppContext {
        broker: TokenBroker::new(
            provider,
            Arc::clone(&cache),
            Duration::from_secs(args.access_token_lifetime_secs),
            Duration::from_secs(args.id_token_lifetime_secs),
        ),
        trie: EndpointTrie::new(),
        project_id: args.project_id.clone(),
        project_number: args.project_number.clone(),
        max_request_duration: Duration::from_secs(args.max_request_secs),
    });
    let router = build_router(context);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port = args.port, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(port = args.port, mode = ?args.mode, "metadata server listening");
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = serve.await {
        error!(error = %err, "server exited with error");
    }

    cache.stop_gc();
    if let Some(host) = host_provider {
        host.close();
    }
}

/// TLS client for the node agent and control plane, trusting the cluster CA.
fn build_cluster_client(ca_path: &std::path::Path) -> Result<HttpClient, vouch_core::StatusError> {
    let mut builder = HttpClient::builder();
    match std::fs::read(ca_path) {
        Ok(pem) => {
            builder = builder.add_root_pem(&pem)?;
        }
        Err(err) => {
            error!(error = %err, path = %ca_path.display(), "failed to read cluster CA bundle");
        }
    }
    builder.build()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
