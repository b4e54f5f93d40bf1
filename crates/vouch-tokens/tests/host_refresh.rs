//! End-to-end client-certificate refresh against a mock identity server.
//!
//! The mock signs renewal CSRs with a local CA, stamping incrementing serial
//! numbers. The provider starts with a certificate already inside its
//! renewal window, so construction performs a full renewal: key generation,
//! CSR, renew call, on-disk rotation, and in-memory swap.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};

use vouch_core::files::{readlink_abs, rotate_symlink};
use vouch_core::http::HttpClient;
use vouch_pki::cert::CertificatePem;
use vouch_pki::csr::build_client_csr;
use vouch_pki::key::{create_ec_private_key_pem, KeyStrength};
use vouch_tokens::exchange::GcpExchanger;
use vouch_tokens::host::{HostProviderConfig, HostTokenProvider};

struct MockCa {
    params: CertificateParams,
    key: KeyPair,
    next_serial: AtomicU64,
}

impl MockCa {
    fn new() -> Self {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mock-identity-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        // The seed certificate is stamped serial 1 outside this counter.
        Self {
            params,
            key,
            next_serial: AtomicU64::new(2),
        }
    }

    /// Signs a CSR, stamping the next serial and a 30-day window.
    fn sign_csr(&self, csr_pem: &str) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        csr.params.serial_number = Some(SerialNumber::from_slice(&[serial as u8]));
        csr.params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
        csr.params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(30);
        let issuer = Issuer::from_params(&self.params, &self.key);
        csr.signed_by(&issuer).unwrap().pem()
    }
}

async fn handle_renew(State(ca): State<Arc<MockCa>>, body: String) -> impl IntoResponse {
    let cert_pem = ca.sign_csr(&body);
    ([("Content-Type", "application/x-pem-file")], cert_pem)
}

async fn handle_identity() -> &'static str {
    "machine@gcp.project\n"
}

async fn spawn_mock_server(ca: Arc<MockCa>) -> String {
    let app = Router::new()
        .route("/renew", post(handle_renew))
        .route("/identity", get(handle_identity))
        .with_state(ca);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Seeds the cert/key symlinks with a certificate already due for renewal.
fn seed_initial_keypair(dir: &Path, ca: &MockCa) -> (String, String) {
    let key_pem = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
    let csr = build_client_csr(
        &key_pem,
        "machine-1",
        "machine@gcp.project",
        &["127.0.0.1".parse().unwrap()],
    )
    .unwrap();

    // Total lifetime 35 days, 5 remaining: well past a 10-day renewal floor.
    let mut csr = CertificateSigningRequestParams::from_pem(&csr).unwrap();
    csr.params.serial_number = Some(SerialNumber::from_slice(&[1]));
    csr.params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(30);
    csr.params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(5);
    let issuer = Issuer::from_params(&ca.params, &ca.key);
    let cert_pem = csr.signed_by(&issuer).unwrap().pem();

    let cert_file = dir.join("client.cert.seed");
    let key_file = dir.join("client.key.seed");
    std::fs::write(&cert_file, &cert_pem).unwrap();
    std::fs::write(&key_file, &key_pem).unwrap();
    rotate_symlink(&dir.join("client.cert"), &cert_file).unwrap();
    rotate_symlink(&dir.join("client.key"), &key_file).unwrap();

    (cert_pem, key_pem)
}

fn provider_config(dir: &Path, server_url: String) -> HostProviderConfig {
    HostProviderConfig {
        identity_server_url: server_url,
        ca_cert_pem: None,
        cert_path: dir.join("client.cert"),
        key_path: dir.join("client.key"),
        refresh_interval: Duration::from_secs(24 * 3600),
        min_lifetime: Duration::from_secs(10 * 24 * 3600),
        main_audience: "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/p/providers/x".into(),
    }
}

#[tokio::test]
async fn test_first_start_renewal_rotates_keypair() {
    let ca = Arc::new(MockCa::new());
    let dir = tempfile::tempdir().unwrap();
    seed_initial_keypair(dir.path(), &ca);
    let server_url = spawn_mock_server(Arc::clone(&ca)).await;

    let exchange = GcpExchanger::new(HttpClient::new().unwrap(), "test");
    let provider = HostTokenProvider::new(provider_config(dir.path(), server_url), exchange)
        .await
        .expect("provider constructs and renews");

    // The in-memory leaf carries the freshly issued serial.
    let leaf = provider.current_leaf().await;
    assert_eq!(leaf.serial_hex().unwrap(), "02");

    // Both symlinks moved to suffixed siblings.
    let cert_target = readlink_abs(&dir.path().join("client.cert")).unwrap();
    let key_target = readlink_abs(&dir.path().join("client.key")).unwrap();
    let cert_name = cert_target.file_name().unwrap().to_string_lossy().into_owned();
    let key_name = key_target.file_name().unwrap().to_string_lossy().into_owned();
    assert_ne!(cert_name, "client.cert.seed");
    assert_ne!(key_name, "client.key.seed");
    assert!(cert_name.starts_with("client.cert."));
    assert!(key_name.starts_with("client.key."));

    // Suffixes of cert and key match (same renewal step).
    let cert_suffix = cert_name.trim_start_matches("client.cert.");
    let key_suffix = key_name.trim_start_matches("client.key.");
    assert_eq!(cert_suffix, key_suffix);

    // The key file was persisted with owner-only permissions.
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&key_target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // The published certificate file parses and matches the leaf.
    let on_disk = CertificatePem::parse_chain_pem(
        &std::fs::read_to_string(dir.path().join("client.cert")).unwrap(),
    )
    .unwrap();
    assert_eq!(on_disk[0].serial_hex().unwrap(), "02");

    // A second check finds plenty of lifetime left and does nothing.
    provider.try_refresh_certificate().await.unwrap();
    assert_eq!(provider.current_leaf().await.serial_hex().unwrap(), "02");

    provider.close();
}

#[tokio::test]
async fn test_construction_rejects_too_short_total_lifetime() {
    let ca = Arc::new(MockCa::new());
    let dir = tempfile::tempdir().unwrap();
    seed_initial_keypair(dir.path(), &ca);
    let server_url = spawn_mock_server(Arc::clone(&ca)).await;

    let mut config = provider_config(dir.path(), server_url);
    // Floor beyond the certificate's 35-day total lifetime.
    config.min_lifetime = Duration::from_secs(40 * 24 * 3600);

    let exchange = GcpExchanger::new(HttpClient::new().unwrap(), "test");
    let result = HostTokenProvider::new(config, exchange).await;
    assert!(result.is_err());
}
