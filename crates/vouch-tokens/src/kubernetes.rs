//! Pod-mode token provider.
//!
//! Resolves callers by pod IP through the service-account cache, requests a
//! projected service-account token from the orchestrator, and exchanges it at
//! the STS.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::error;

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::gcp::{IamAccessTokenResponse, IamIdentityTokenResponse, TokenExchangeResponse};

use crate::broker::TokenProvider;
use crate::cluster::ClusterApi;
use crate::exchange::{clamp_request_lifetime, GcpExchanger};
use crate::identity::SourceIdentity;
use crate::kubelet::KubeletClient;
use crate::sacache::{ControlPlaneBackend, KubeletBackend, PodBackend, ServiceAccountCache};
use crate::{Error, Result};

const KUBE_API_ENDPOINT: &str = "kubeapi";

/// Token provider backed by the container orchestrator.
pub struct KubernetesTokenProvider {
    exchange: GcpExchanger,
    cluster: Arc<dyn ClusterApi>,
    service_accounts: ServiceAccountCache,
    main_audience: String,
    metrics: ApiMetrics,
}

impl KubernetesTokenProvider {
    /// Creates a provider.
    ///
    /// When `kubelet` is given, pod lookups go through the node agent with
    /// bulk cache reconciliation; otherwise each lookup asks the control
    /// plane.
    pub fn new(
        exchange: GcpExchanger,
        cluster: Arc<dyn ClusterApi>,
        kubelet: Option<Arc<KubeletClient>>,
        main_audience: impl Into<String>,
        sa_cache_ttl: Duration,
        lookup_retries: u32,
    ) -> Self {
        let backend: Box<dyn PodBackend> = match kubelet {
            Some(kubelet) => Box::new(KubeletBackend::new(kubelet, Arc::clone(&cluster))),
            None => Box::new(ControlPlaneBackend::new(Arc::clone(&cluster))),
        };

        Self {
            exchange,
            cluster,
            service_accounts: ServiceAccountCache::new(backend, sa_cache_ttl, lookup_retries),
            main_audience: main_audience.into(),
            metrics: ApiMetrics::new("metadata_server_k8s"),
        }
    }
}

#[async_trait]
impl TokenProvider for KubernetesTokenProvider {
    async fn identity_for_ip(&self, ip: &str) -> Result<SourceIdentity> {
        let started = Instant::now();
        let identity = self.service_accounts.get(ip).await?;

        let status = if identity.bound_gsa.is_empty() { 404 } else { 200 };
        self.metrics
            .track_call(KUBE_API_ENDPOINT, "identity", started, status);

        Ok(SourceIdentity::Pod(identity))
    }

    async fn token_request_token(
        &self,
        identity: &SourceIdentity,
        lifetime: Duration,
        scopes: &[String],
        additional_audiences: &[String],
    ) -> Result<TokenExchangeResponse> {
        let SourceIdentity::Pod(pod) = identity else {
            return Err(Error::Config(
                "pod-mode provider received a non-pod identity".to_string(),
            ));
        };
        if identity.is_unbound() {
            return Err(Error::UnboundIdentity);
        }

        let lifetime = clamp_request_lifetime(lifetime);

        // The first audience has to be the workload identity provider; the
        // caller's extra audiences only extend the subject token.
        let mut audiences = vec![self.main_audience.clone()];
        audiences.extend_from_slice(additional_audiences);

        let started = Instant::now();
        let subject_token = self
            .cluster
            .service_account_token(
                &pod.namespace,
                &pod.name,
                lifetime,
                &audiences,
                pod.owner.as_ref(),
            )
            .await;
        let status = match &subject_token {
            Ok(_) => 200,
            Err(err) => err.status.as_u16() as i32,
        };
        self.metrics
            .track_call(KUBE_API_ENDPOINT, "request_token", started, status);

        let subject_token = subject_token.map_err(|err| {
            error!(
                namespace = %pod.namespace,
                name = %pod.name,
                error = %err,
                "failed to get projected service account token"
            );
            Error::Upstream(err)
        })?;

        self.exchange
            .exchange_subject_token(&subject_token, &self.main_audience, scopes, lifetime)
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
