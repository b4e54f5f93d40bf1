//! Host-mode token provider with client-certificate auto-refresh.
//!
//! The host authenticates to the identity server with an mTLS client
//! certificate published on disk behind `cert`/`key` symlinks. A background
//! task renews the certificate once its remaining lifetime drops below the
//! configured floor: reuse or generate a key under a deterministic suffix,
//! build a renewal CSR, POST it over the current certificate, write the
//! issued certificate next to the key, and rotate both symlinks atomically.
//!
//! The identity-lookup mutex doubles as the publication barrier for the
//! in-memory keypair: a concurrent lookup sees either the old or the new
//! certificate, never a torn pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::files::rotate_symlink_list;
use vouch_core::gcp::{
    HostTokenRequest, IamAccessTokenResponse, IamIdentityTokenResponse, TokenExchangeResponse,
};
use vouch_core::http::HttpClient;
use vouch_core::KvList;
use vouch_pki::cert::CertificatePem;
use vouch_pki::csr::build_renewal_csr;
use vouch_pki::key::{create_ec_private_key_pem, KeyStrength};

use crate::broker::TokenProvider;
use crate::exchange::{clamp_request_lifetime, GcpExchanger};
use crate::identity::{HostIdentity, SourceIdentity};
use crate::{Error, Result};

/// Configuration for the host-mode provider.
#[derive(Debug, Clone)]
pub struct HostProviderConfig {
    /// Base URL of the identity server.
    pub identity_server_url: String,
    /// Extra root CA bundle (PEM) for reaching the identity server.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Path of the `cert` symlink.
    pub cert_path: PathBuf,
    /// Path of the `key` symlink.
    pub key_path: PathBuf,
    /// How often the refresher checks the certificate.
    pub refresh_interval: Duration,
    /// Renew once less than this much lifetime remains.
    pub min_lifetime: Duration,
    /// Workload identity provider audience.
    pub main_audience: String,
}

struct HostState {
    /// mTLS client built from the current keypair.
    client: HttpClient,
    /// Leaf of the current client certificate.
    leaf: CertificatePem,
    /// Bound identity, cached after the first successful lookup.
    cached_identity: Option<String>,
}

/// Token provider for the local machine's own identity.
pub struct HostTokenProvider {
    exchange: GcpExchanger,
    config: HostProviderConfig,
    state: Mutex<HostState>,
    shutdown: watch::Sender<bool>,
    metrics: ApiMetrics,
}

impl HostTokenProvider {
    /// Loads the on-disk keypair, refreshes it if already due, and spawns
    /// the background refresh loop.
    ///
    /// Fails if the certificate's total lifetime does not exceed the
    /// refresh floor (the refresher would loop), or if a due refresh cannot
    /// complete.
    pub async fn new(config: HostProviderConfig, exchange: GcpExchanger) -> Result<Arc<Self>> {
        let cert_pem = read_text(&config.cert_path, "failed to read client certificate")?;
        let key_pem = read_text(&config.key_path, "failed to read client key")?;

        let leaf = leaf_from_chain(&cert_pem)?;
        let total_lifetime = leaf.not_after().map_err(Error::Pki)?
            - leaf.not_before().map_err(Error::Pki)?;
        let floor = chrono::Duration::from_std(config.min_lifetime)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if total_lifetime <= floor {
            return Err(Error::Config(format!(
                "client certificate total lifetime {total_lifetime} does not exceed the minimum remaining lifetime {floor}"
            )));
        }

        let client = build_mtls_client(&config, &cert_pem, &key_pem)?;
        let (shutdown, _) = watch::channel(false);

        let provider = Arc::new(Self {
            exchange,
            config,
            state: Mutex::new(HostState {
                client,
                leaf,
                cached_identity: None,
            }),
            shutdown,
            metrics: ApiMetrics::new("metadata_server_host"),
        });

        // A certificate may come up already inside the renewal window, e.g.
        // after prolonged downtime. Refresh before serving.
        provider.try_refresh_certificate().await?;

        let task = Arc::clone(&provider);
        tokio::spawn(task.run_refresh_loop());

        Ok(provider)
    }

    /// Stops the background refresh loop.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Drops the cached bound identity.
    pub async fn clear_identity_cache(&self) {
        self.state.lock().await.cached_identity = None;
    }

    /// The leaf certificate currently used for mTLS.
    pub async fn current_leaf(&self) -> CertificatePem {
        self.state.lock().await.leaf.clone()
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.try_refresh_certificate().await {
                        error!(error = %err, "failed to refresh client certificate");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("certificate refresher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Renews the client certificate if its remaining lifetime is below the
    /// floor. No-op while enough lifetime remains; an already expired
    /// certificate is unrecoverable here.
    pub async fn try_refresh_certificate(&self) -> Result<()> {
        let leaf = {
            let state = self.state.lock().await;
            state.leaf.clone()
        };

        let not_after = leaf.not_after().map_err(Error::Pki)?;
        let now = Utc::now();
        if not_after <= now {
            return Err(Error::CertificateExpired {
                since: now - not_after,
            });
        }

        let min_lifetime = chrono::Duration::from_std(self.config.min_lifetime)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if not_after - now > min_lifetime {
            debug!("certificate is still valid, no need to refresh");
            return Ok(());
        }

        // The suffix is derived from when this renewal became due, so a
        // restart mid-renewal picks up the same key file.
        let suffix = (not_after - min_lifetime).format("%Y%m%d%H%M%S").to_string();
        let key_file = sibling_with_suffix(&self.config.key_path, &suffix);

        let key_pem = if key_file.exists() {
            read_text(&key_file, "failed to read private key")?
        } else {
            let pem = create_ec_private_key_pem(KeyStrength::Normal).map_err(Error::Pki)?;
            info!(path = %key_file.display(), "writing new private key to disk");
            write_private(&key_file, pem.as_bytes())?;
            pem
        };

        let csr = build_renewal_csr(&key_pem, &leaf).map_err(Error::Pki)?;

        // Renew over the current client certificate.
        let client = {
            let state = self.state.lock().await;
            state.client.clone()
        };
        let url = format!("{}/renew", self.config.identity_server_url);
        let started = Instant::now();
        let response = client
            .post(
                &url,
                csr.into_bytes(),
                &[
                    ("Content-Type", "application/x-pem-file"),
                    ("Accept", "application/x-pem-file"),
                ],
            )
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => {
                self.metrics
                    .track_call(&self.config.identity_server_url, "renew", started, 200);
                response
            }
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                self.metrics
                    .track_call(&self.config.identity_server_url, "renew", started, status);
                return Err(Error::Upstream(
                    vouch_core::http::error_from_response(response).await,
                ));
            }
            Err(err) => {
                self.metrics
                    .track_call(&self.config.identity_server_url, "renew", started, -1);
                return Err(Error::Upstream(err));
            }
        };

        let cert_bytes = vouch_core::http::read_body_limited(response, usize::MAX).await;
        let cert_pem = String::from_utf8(cert_bytes).map_err(|_| {
            Error::Config("identity server returned a non-UTF-8 certificate".to_string())
        })?;
        let new_leaf = leaf_from_chain(&cert_pem)?;

        // Building the client up front also proves that certificate and key
        // actually belong together.
        let new_client = build_mtls_client(&self.config, &cert_pem, &key_pem)?;

        let cert_file = sibling_with_suffix(&self.config.cert_path, &suffix);
        info!(path = %cert_file.display(), "writing new client certificate to disk");
        std::fs::write(&cert_file, cert_pem.as_bytes()).map_err(|source| Error::Io {
            context: format!("failed to write {}", cert_file.display()),
            source,
        })?;

        let mut rotation = KvList::new();
        rotation.insert(self.config.cert_path.clone(), cert_file);
        rotation.insert(self.config.key_path.clone(), key_file);
        rotate_symlink_list(&rotation)?;

        // Publish the new keypair. Taking the identity lock here means any
        // in-flight lookup finished against the old pair.
        let mut state = self.state.lock().await;
        state.client = new_client;
        state.leaf = new_leaf;

        Ok(())
    }
}

#[async_trait]
impl TokenProvider for HostTokenProvider {
    /// Returns the bound identity of this host; the IP is ignored.
    async fn identity_for_ip(&self, _ip: &str) -> Result<SourceIdentity> {
        let mut state = self.state.lock().await;

        if let Some(gsa) = &state.cached_identity {
            return Ok(SourceIdentity::Host(HostIdentity {
                bound_gsa: gsa.clone(),
            }));
        }

        let url = format!("{}/identity", self.config.identity_server_url);
        let started = Instant::now();
        let response = state.client.get(&url, &[]).await;

        let response = match response {
            Ok(response) if response.status().is_success() => {
                self.metrics
                    .track_call(&self.config.identity_server_url, "identity", started, 200);
                response
            }
            Ok(response) => {
                let status = response.status().as_u16() as i32;
                self.metrics
                    .track_call(&self.config.identity_server_url, "identity", started, status);
                error!(status, "failed to get identity for current host");
                return Ok(SourceIdentity::Host(HostIdentity::default()));
            }
            Err(err) => {
                self.metrics
                    .track_call(&self.config.identity_server_url, "identity", started, -1);
                error!(error = %err, "failed to get identity for current host");
                return Ok(SourceIdentity::Host(HostIdentity::default()));
            }
        };

        let body = vouch_core::http::read_body_limited(response, 4 * 1024).await;
        let bound = String::from_utf8_lossy(&body)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if bound.is_empty() {
            error!("empty identity returned for current host");
            return Ok(SourceIdentity::Host(HostIdentity::default()));
        }

        state.cached_identity = Some(bound.clone());
        Ok(SourceIdentity::Host(HostIdentity { bound_gsa: bound }))
    }

    async fn token_request_token(
        &self,
        identity: &SourceIdentity,
        lifetime: Duration,
        scopes: &[String],
        additional_audiences: &[String],
    ) -> Result<TokenExchangeResponse> {
        if identity.is_unbound() {
            return Err(Error::UnboundIdentity);
        }

        let lifetime = clamp_request_lifetime(lifetime);

        // The first audience has to be the workload identity provider.
        let mut audiences = vec![self.config.main_audience.clone()];
        audiences.extend_from_slice(additional_audiences);

        let request = HostTokenRequest {
            audiences,
            lifetime: format!("{}s", lifetime.as_secs()),
        };
        let body = serde_json::to_vec(&request).map_err(|e| {
            Error::Config(format!("failed to encode identity server token request: {e}"))
        })?;

        let client = {
            let state = self.state.lock().await;
            state.client.clone()
        };
        let url = format!("{}/token", self.config.identity_server_url);
        let started = Instant::now();
        let response = client
            .get_with_body(&url, body, &[("Content-Type", "application/json")])
            .await
            .map_err(|err| {
                self.metrics.track_call(
                    &self.config.identity_server_url,
                    "request_token",
                    started,
                    -1,
                );
                Error::Upstream(err)
            })?;

        let status = response.status();
        self.metrics.track_call(
            &self.config.identity_server_url,
            "request_token",
            started,
            status.as_u16() as i32,
        );
        if !status.is_success() {
            return Err(Error::Upstream(
                vouch_core::http::error_from_response(response).await,
            ));
        }

        let oidc_token = vouch_core::http::read_body_limited(response, 64 * 1024).await;
        let oidc_token = String::from_utf8_lossy(&oidc_token).trim().to_string();

        self.exchange
            .exchange_subject_token(&oidc_token, &self.config.main_audience, scopes, lifetime)
            .await
    }

    async fn access_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        lifetime: Duration,
        scopes: &[String],
        gsa: &str,
    ) -> Result<IamAccessTokenResponse> {
        self.exchange
            .access_token(token_request_token, lifetime, scopes, gsa)
            .await
    }

    async fn id_token(
        &self,
        token_request_token: &TokenExchangeResponse,
        gsa: &str,
        audience: &str,
    ) -> Result<IamIdentityTokenResponse> {
        self.exchange.id_token(token_request_token, gsa, audience).await
    }
}

fn leaf_from_chain(cert_pem: &str) -> Result<CertificatePem> {
    CertificatePem::parse_chain_pem(cert_pem)
        .map_err(Error::Pki)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Config("certificate file contains no certificate".to_string()))
}

fn build_mtls_client(
    config: &HostProviderConfig,
    cert_pem: &str,
    key_pem: &str,
) -> Result<HttpClient> {
    let mut builder = HttpClient::builder();
    if let Some(ca_pem) = &config.ca_cert_pem {
        builder = builder.add_root_pem(ca_pem).map_err(Error::Upstream)?;
    }
    let identity = format!("{cert_pem}\n{key_pem}");
    builder = builder
        .identity_pem(identity.as_bytes())
        .map_err(Error::Upstream)?;
    builder.build().map_err(Error::Upstream)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "client".to_string());
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{name}.{suffix}"))
}

fn read_text(path: &Path, context: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Io {
        context: format!("{context} {}", path.display()),
        source,
    })
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|source| Error::Io {
            context: format!("failed to create {}", path.display()),
            source,
        })?;
    file.write_all(data).map_err(|source| Error::Io {
        context: format!("failed to write {}", path.display()),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_with_suffix() {
        let path = Path::new("/etc/certs/machine/client.key");
        assert_eq!(
            sibling_with_suffix(path, "20240101000000"),
            PathBuf::from("/etc/certs/machine/client.key.20240101000000")
        );
    }
}
