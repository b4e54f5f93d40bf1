//! REST client for the hosted certificate authority.
//!
//! Only brokers the CA: fetches root certificates, reads the authority
//! description (which advertises CRL distribution URLs), and creates or
//! fetches issued certificates from CSRs. Certificate ids are derived
//! deterministically from the CSR so repeated submissions of the same CSR
//! converge on one certificate.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::http::HttpClient;
use vouch_core::StatusError;

use crate::cert::CertificatePem;
use crate::{Error, Result};

const PRIVATE_CA_ENDPOINT: &str = "https://privateca.googleapis.com/v1";

/// Hosted CA names must stay below this length.
const MAX_CERTIFICATE_ID_LEN: usize = 63;

/// Source of bearer tokens for the broker's own cloud identity.
///
/// The production implementation reads the ambient metadata endpoint; tests
/// substitute a static token.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Returns an access token covering the given scopes.
    async fn access_token(&self, scopes: &[&str]) -> std::result::Result<String, StatusError>;
}

/// Coordinates of a CA pool and one of its authorities.
#[derive(Debug, Clone)]
pub struct CaPoolConfig {
    pub project: String,
    pub location: String,
    pub pool: String,
    pub ca_name: String,
}

/// Authority description returned by the hosted CA.
///
/// <https://cloud.google.com/certificate-authority-service/docs/reference/rest/v1/projects.locations.caPools.certificateAuthorities>
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthorityData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub access_urls: AccessUrls,
    #[serde(default)]
    pub pem_ca_certificates: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessUrls {
    #[serde(default)]
    pub ca_certificate_access_url: String,
    #[serde(default)]
    pub crl_access_urls: Vec<String>,
}

/// Certificate resource as created/fetched at the hosted CA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpCertificate {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    lifetime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pem_certificate: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pem_csr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchCaCertsResponse {
    #[serde(default)]
    ca_certs: Vec<CaCertChain>,
}

#[derive(Debug, Clone, Deserialize)]
struct CaCertChain {
    #[serde(default)]
    certificates: Vec<String>,
}

/// Client for the hosted certificate authority REST surface.
#[derive(Debug, Clone)]
pub struct CertificateAuthorityClient {
    http: HttpClient,
    config: CaPoolConfig,
    metrics: ApiMetrics,
    base: String,
}

impl CertificateAuthorityClient {
    /// Creates a client for the given pool coordinates.
    pub fn new(http: HttpClient, config: CaPoolConfig) -> Self {
        Self {
            http,
            config,
            metrics: ApiMetrics::new("certificate_authority"),
            base: PRIVATE_CA_ENDPOINT.to_string(),
        }
    }

    /// Overrides the API base URL. Intended for tests against a local stub.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Returns the configured pool coordinates.
    pub fn config(&self) -> &CaPoolConfig {
        &self.config
    }

    fn pool_url(&self) -> String {
        format!(
            "{}/projects/{}/locations/{}/caPools/{}",
            self.base, self.config.project, self.config.location, self.config.pool
        )
    }

    /// Fetches the pool's root CA certificates.
    ///
    /// <https://cloud.google.com/certificate-authority-service/docs/reference/rest/v1/projects.locations.caPools/fetchCaCerts>
    pub async fn fetch_ca_certs(&self, token: &str) -> Result<Vec<CertificatePem>> {
        let url = format!("{}:fetchCaCerts", self.pool_url());
        let started = Instant::now();
        let response: std::result::Result<FetchCaCertsResponse, StatusError> = self
            .http
            .post_json(&url, &serde_json::json!({}), &[("Authorization", &bearer(token))])
            .await;
        self.metrics
            .track_call(&self.base, "fetch_ca_certs", started, status_of(&response));
        let response = response?;

        let mut roots = Vec::new();
        for chain in response.ca_certs {
            for pem_data in chain.certificates {
                match CertificatePem::parse_chain_pem(&pem_data) {
                    Ok(certs) => roots.extend(certs),
                    Err(err) => warn!(error = %err, "failed to parse CA cert"),
                }
            }
        }

        if roots.is_empty() {
            return Err(Error::Certificate(
                "no CA certs found or all failed to parse".to_string(),
            ));
        }
        Ok(roots)
    }

    /// Reads the authority description, including its CRL URLs.
    pub async fn get_authority(&self, token: &str) -> Result<CertificateAuthorityData> {
        let url = format!(
            "{}/certificateAuthorities/{}",
            self.pool_url(),
            self.config.ca_name
        );
        let started = Instant::now();
        let response: std::result::Result<CertificateAuthorityData, StatusError> = self
            .http
            .get_json(&url, &[("Authorization", &bearer(token))])
            .await;
        self.metrics
            .track_call(&self.base, "authority", started, status_of(&response));
        Ok(response?)
    }

    /// Downloads every CRL the authority advertises.
    ///
    /// Returns the DER-encoded lists that could be fetched; per-URL failures
    /// are collected separately so one broken distribution point does not
    /// void the rest.
    pub async fn fetch_crls(
        &self,
        authority: &CertificateAuthorityData,
    ) -> (Vec<Vec<u8>>, Vec<StatusError>) {
        let mut lists = Vec::new();
        let mut failures = Vec::new();

        for crl_url in &authority.access_urls.crl_access_urls {
            let started = Instant::now();
            let response = self.http.get(crl_url, &[]).await;
            match response {
                Ok(response) if response.status().is_success() => {
                    self.metrics.track_call(crl_url, "crl", started, 200);
                    let body = vouch_core::http::read_body_limited(response, usize::MAX).await;
                    match pem::parse_many(&body) {
                        Ok(blocks) => {
                            for block in blocks {
                                if block.tag() != "X509 CRL" {
                                    failures.push(StatusError::new(
                                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                                        format!("invalid PEM block type: {}", block.tag()),
                                    ));
                                    continue;
                                }
                                lists.push(block.into_contents());
                            }
                        }
                        Err(err) => failures.push(StatusError::new(
                            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                            format!("CRL at {crl_url} is not valid PEM: {err}"),
                        )),
                    }
                }
                Ok(response) => {
                    self.metrics
                        .track_call(crl_url, "crl", started, response.status().as_u16() as i32);
                    failures.push(vouch_core::http::error_from_response(response).await);
                }
                Err(err) => {
                    self.metrics.track_call(crl_url, "crl", started, -1);
                    failures.push(err);
                }
            }
        }

        (lists, failures)
    }

    /// Fetches an issued certificate by its id.
    pub async fn get_certificate(
        &self,
        token: &str,
        certificate_id: &str,
    ) -> Result<CertificatePem> {
        let url = format!("{}/certificates/{}", self.pool_url(), certificate_id);
        debug!(url = %url, "requesting issued certificate");

        let started = Instant::now();
        let response: std::result::Result<GcpCertificate, StatusError> = self
            .http
            .get_json(&url, &[("Authorization", &bearer(token))])
            .await;
        self.metrics
            .track_call(&self.base, "get_certificate", started, status_of(&response));

        let certificate = response?;
        parse_issued_pem(&certificate.pem_certificate)
    }

    /// Creates a certificate from a CSR, or returns the existing one.
    ///
    /// The certificate id is derived from the CSR's common name plus a hash of
    /// the CSR bytes, so resubmitting the same CSR is idempotent.
    pub async fn create_certificate_from_csr(
        &self,
        token: &str,
        csr_pem: &str,
        lifetime: std::time::Duration,
    ) -> Result<CertificatePem> {
        if lifetime.is_zero() {
            return Err(Error::Csr("lifetime must be greater than 0".to_string()));
        }

        let certificate_id = certificate_id_for_csr(csr_pem)?;

        // An existing certificate for this CSR wins over creating a new one.
        match self.get_certificate(token, &certificate_id).await {
            Ok(existing) => return Ok(existing),
            Err(err) => {
                debug!(certificate_id = %certificate_id, error = %err, "certificate not found, creating");
            }
        }

        let request = GcpCertificate {
            lifetime: format!("{}s", lifetime.as_secs()),
            pem_csr: csr_pem.to_string(),
            ..GcpCertificate::default()
        };

        let url = format!(
            "{}/certificates?certificateId={}",
            self.pool_url(),
            certificate_id
        );
        debug!(url = %url, "creating certificate from CSR");

        let started = Instant::now();
        let response: std::result::Result<GcpCertificate, StatusError> = self
            .http
            .post_json(&url, &request, &[("Authorization", &bearer(token))])
            .await;
        self.metrics
            .track_call(&self.base, "create_certificate", started, status_of(&response));

        let certificate = response?;
        parse_issued_pem(&certificate.pem_certificate)
    }
}

fn parse_issued_pem(pem_certificate: &str) -> Result<CertificatePem> {
    if pem_certificate.is_empty() {
        return Err(Error::Certificate("empty certificate returned".to_string()));
    }
    CertificatePem::parse_chain_pem(pem_certificate)?
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::Certificate("returned certificate was not a valid PEM block".to_string())
        })
}

/// Derives the deterministic certificate id for a CSR.
pub fn certificate_id_for_csr(csr_pem: &str) -> Result<String> {
    let info = crate::csr::parse_csr_info(csr_pem)?;
    let block = pem::parse(csr_pem).map_err(|e| Error::Csr(format!("invalid PEM: {e}")))?;

    // A 32-bit FNV-1a over the raw CSR. The CSR is useless without its
    // private key, so this does not need to be a cryptographic hash.
    let hash = fnv1a32(block.contents());

    // Hash suffix is "-" + 8 hex chars; the hostname part fills the rest.
    let max_host_len = MAX_CERTIFICATE_ID_LEN - 9;
    let hostname = info.common_name.to_lowercase();
    let mut sanitized: String = hostname
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(max_host_len);

    Ok(format!("{sanitized}-{hash:08x}"))
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

fn status_of<T>(result: &std::result::Result<T, StatusError>) -> i32 {
    match result {
        Ok(_) => 200,
        Err(err) => err.status.as_u16() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{create_ec_private_key_pem, KeyStrength};

    #[test]
    fn test_fnv1a32_known_values() {
        // Reference vectors for FNV-1a 32.
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_certificate_id_is_stable_and_sanitized() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let csr = crate::csr::build_client_csr(
            &key,
            "Node.Example.COM",
            "node@example.com",
            &["10.0.0.1".parse().unwrap()],
        )
        .unwrap();

        let id1 = certificate_id_for_csr(&csr).unwrap();
        let id2 = certificate_id_for_csr(&csr).unwrap();
        assert_eq!(id1, id2);
        assert!(id1.starts_with("node-example-com-"));
        assert!(id1.len() <= MAX_CERTIFICATE_ID_LEN);

        // A different CSR for the same host gets a different id.
        let other_key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let other_csr = crate::csr::build_client_csr(
            &other_key,
            "Node.Example.COM",
            "node@example.com",
            &["10.0.0.1".parse().unwrap()],
        )
        .unwrap();
        assert_ne!(id1, certificate_id_for_csr(&other_csr).unwrap());
    }

    #[test]
    fn test_certificate_id_truncates_long_hostnames() {
        let key = create_ec_private_key_pem(KeyStrength::Normal).unwrap();
        let long_host = "a".repeat(100);
        let csr = crate::csr::build_client_csr(&key, &long_host, "", &[]).unwrap();
        let id = certificate_id_for_csr(&csr).unwrap();
        assert!(id.len() <= MAX_CERTIFICATE_ID_LEN);
    }
}
