//! Pod-IP to bound-identity cache.
//!
//! Pod IPs recycle, so entries carry a short TTL. A stale entry is first
//! re-validated cheaply (does the pod still exist, same owner?) before the
//! full resolve runs. When the node agent backs the cache, a miss refreshes
//! every entry at once: the agent returns all pods on the node, so entries
//! that disappeared are evicted and changed ownerships overwritten in the
//! same pass.
//!
//! One mutex serializes all access; it is intentionally held across the
//! single backend call of a refresh, so backend calls must honor deadlines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use vouch_core::apimetrics;

use crate::cluster::{retry_backoff, select_pod_for_ip, ClusterApi, PodRecord};
use crate::identity::{PodIdentity, PodRef};
use crate::kubelet::KubeletClient;
use crate::{Error, Result};

const CACHE_NAME: &str = "service_accounts";

/// Outcome of a full backend resolve.
pub enum Resolution {
    /// The identity for the one requested IP.
    Single(PodIdentity),
    /// All identities on this node, keyed by pod IP.
    Bulk(HashMap<String, PodIdentity>),
}

/// Backend answering pod-identity questions.
#[async_trait]
pub trait PodBackend: Send + Sync {
    /// One-shot pod lookup used to re-validate a stale cache entry.
    async fn peek_pod(&self, ip: &str) -> Result<Option<PodRecord>>;

    /// Full resolution on a cache miss.
    async fn resolve(&self, ip: &str, retries: u32) -> Result<Resolution>;
}

/// Node-agent backed resolution with bulk reconciliation.
pub struct KubeletBackend {
    kubelet: Arc<KubeletClient>,
    cluster: Arc<dyn ClusterApi>,
}

impl KubeletBackend {
    pub fn new(kubelet: Arc<KubeletClient>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { kubelet, cluster }
    }
}

#[async_trait]
impl PodBackend for KubeletBackend {
    async fn peek_pod(&self, ip: &str) -> Result<Option<PodRecord>> {
        let (pod, _) = self.kubelet.pod_by_ip(ip, 0).await?;
        Ok(pod)
    }

    async fn resolve(&self, _ip: &str, _retries: u32) -> Result<Resolution> {
        let pods = self.kubelet.list_pods().await?;

        // Host-networking pods share the node IP and IP-less pods cannot
        // call us; neither belongs in the map.
        let pods: Vec<PodRecord> = pods
            .into_iter()
            .filter(|p| p.is_active() && !p.pod_ip.is_empty() && p.pod_ip != p.host_ip)
            .collect();
        if pods.is_empty() {
            return Err(Error::Config(
                "no valid pods returned from the node agent".to_string(),
            ));
        }

        let service_accounts = self
            .cluster
            .list_service_accounts()
            .await
            .map_err(Error::Upstream)?;

        let mut found = HashMap::with_capacity(pods.len());
        for pod in pods {
            let sa_name = pod.service_account_or_default().to_string();
            let bound_gsa = service_accounts
                .iter()
                .find(|sa| sa.namespace == pod.namespace && sa.name == sa_name)
                .map(|sa| sa.bound_gsa())
                .unwrap_or_default();
            if bound_gsa.is_empty() {
                error!(
                    service_account = %sa_name,
                    namespace = %pod.namespace,
                    "service account has no bound cloud identity annotation"
                );
            }

            found.insert(
                pod.pod_ip.clone(),
                PodIdentity {
                    name: sa_name,
                    namespace: pod.namespace.clone(),
                    bound_gsa,
                    owner: Some(PodRef {
                        name: pod.name.clone(),
                        uid: pod.uid.clone(),
                    }),
                    first_seen: Utc::now(),
                },
            );
        }

        Ok(Resolution::Bulk(found))
    }
}

/// Control-plane backed resolution, one pod at a time.
pub struct ControlPlaneBackend {
    cluster: Arc<dyn ClusterApi>,
}

impl ControlPlaneBackend {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    async fn pod_by_ip(&self, ip: &str, retries: u32) -> Result<Option<PodRecord>> {
        let mut attempt = 1;
        loop {
            let candidates = self
                .cluster
                .list_pods_by_ip(ip)
                .await
                .map_err(Error::Upstream)?;
            match select_pod_for_ip(candidates, ip)? {
                Some(pod) => return Ok(Some(pod)),
                None if attempt <= retries => {
                    info!(ip, attempt, retries, "no pod found for IP, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt += 1;
                }
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl PodBackend for ControlPlaneBackend {
    async fn peek_pod(&self, ip: &str) -> Result<Option<PodRecord>> {
        self.pod_by_ip(ip, 0).await
    }

    async fn resolve(&self, ip: &str, retries: u32) -> Result<Resolution> {
        let Some(pod) = self.pod_by_ip(ip, retries).await? else {
            return Ok(Resolution::Single(PodIdentity::empty()));
        };

        let sa_name = pod.service_account_or_default().to_string();
        let mut identity = PodIdentity {
            name: sa_name.clone(),
            namespace: pod.namespace.clone(),
            bound_gsa: String::new(),
            owner: Some(PodRef {
                name: pod.name.clone(),
                uid: pod.uid.clone(),
            }),
            first_seen: Utc::now(),
        };

        match self
            .cluster
            .get_service_account(&pod.namespace, &sa_name)
            .await
        {
            Ok(sa) => {
                identity.bound_gsa = sa.bound_gsa();
                if identity.bound_gsa.is_empty() {
                    error!(
                        service_account = %sa_name,
                        namespace = %pod.namespace,
                        "service account has no bound cloud identity annotation"
                    );
                }
            }
            Err(err) => {
                error!(
                    pod = %pod.name,
                    service_account = %sa_name,
                    namespace = %pod.namespace,
                    error = %err,
                    "failed to get service account for pod"
                );
            }
        }

        Ok(Resolution::Single(identity))
    }
}

/// TTL cache of pod-IP to bound identity.
pub struct ServiceAccountCache {
    inner: tokio::sync::Mutex<HashMap<String, PodIdentity>>,
    backend: Box<dyn PodBackend>,
    ttl: Duration,
    lookup_retries: u32,
}

impl ServiceAccountCache {
    /// Creates a cache over the given backend.
    pub fn new(backend: Box<dyn PodBackend>, ttl: Duration, lookup_retries: u32) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(HashMap::new()),
            backend,
            ttl,
            lookup_retries,
        }
    }

    /// Returns the identity for a pod IP, resolving it if necessary.
    ///
    /// An unresolvable pod yields an empty identity; an ambiguous lookup is
    /// an explicit error.
    pub async fn get(&self, ip: &str) -> Result<PodIdentity> {
        let mut data = self.inner.lock().await;

        if let Some(cached) = data.get(ip).cloned() {
            if self.age_of(&cached) < self.ttl {
                apimetrics::cache_hit(CACHE_NAME);
                return Ok(cached);
            }

            // Past TTL: one cheap existence check can extend the entry
            // instead of paying for a full resolve.
            if let Ok(Some(pod)) = self.backend.peek_pod(ip).await {
                if cached.owned_by(&pod.uid) {
                    let mut refreshed = cached;
                    refreshed.first_seen = Utc::now();
                    data.insert(ip.to_string(), refreshed.clone());
                    apimetrics::cache_hit(CACHE_NAME);
                    return Ok(refreshed);
                }
            }
            data.remove(ip);
        }

        apimetrics::cache_miss(CACHE_NAME);

        match self.backend.resolve(ip, self.lookup_retries).await {
            Ok(Resolution::Single(identity)) => {
                data.insert(ip.to_string(), identity.clone());
                Ok(identity)
            }
            Ok(Resolution::Bulk(found)) => {
                self.reconcile(&mut data, found);
                Ok(data.get(ip).cloned().unwrap_or_else(PodIdentity::empty))
            }
            Err(err @ Error::AmbiguousPod(_)) => Err(err),
            Err(err) => {
                warn!(ip, error = %err, "failed to resolve pod identity");
                Ok(PodIdentity::empty())
            }
        }
    }

    /// Applies a full node listing to the cache.
    ///
    /// Fresh, unchanged entries keep their timestamps; changed or new entries
    /// are overwritten; entries whose IP is gone are evicted.
    fn reconcile(&self, data: &mut HashMap<String, PodIdentity>, found: HashMap<String, PodIdentity>) {
        for (ip, info) in &found {
            if let Some(cached) = data.get(ip) {
                if cached == info && self.age_of(cached) < self.ttl {
                    continue;
                }
            }
            data.insert(ip.clone(), info.clone());
        }
        data.retain(|ip, _| found.contains_key(ip));
    }

    fn age_of(&self, identity: &PodIdentity) -> Duration {
        (Utc::now() - identity.first_seen)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// True if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        peeks: AtomicUsize,
        resolves: AtomicUsize,
        peek_result: Option<PodRecord>,
        resolution: fn() -> Resolution,
    }

    #[async_trait]
    impl PodBackend for ScriptedBackend {
        async fn peek_pod(&self, _ip: &str) -> Result<Option<PodRecord>> {
            self.peeks.fetch_add(1, Ordering::SeqCst);
            Ok(self.peek_result.clone())
        }

        async fn resolve(&self, _ip: &str, _retries: u32) -> Result<Resolution> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok((self.resolution)())
        }
    }

    fn identity(name: &str, gsa: &str, uid: &str) -> PodIdentity {
        PodIdentity {
            name: name.into(),
            namespace: "apps".into(),
            bound_gsa: gsa.into(),
            owner: Some(PodRef {
                name: "web-1".into(),
                uid: uid.into(),
            }),
            first_seen: Utc::now(),
        }
    }

    fn pod_with_uid(uid: &str) -> PodRecord {
        PodRecord {
            name: "web-1".into(),
            namespace: "apps".into(),
            uid: uid.into(),
            service_account: "web".into(),
            pod_ip: "10.0.0.5".into(),
            host_ip: "10.1.0.1".into(),
            phase: "Running".into(),
        }
    }

    #[tokio::test]
    async fn test_miss_resolves_and_caches() {
        let backend = ScriptedBackend {
            peeks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            peek_result: None,
            resolution: || Resolution::Single(identity("web", "web@gcp.project", "u-1")),
        };
        let cache = ServiceAccountCache::new(Box::new(backend), Duration::from_secs(60), 0);

        let first = cache.get("10.0.0.5").await.unwrap();
        assert_eq!(first.bound_gsa, "web@gcp.project");

        // Second call within TTL is served from cache: no further resolves.
        let second = cache.get("10.0.0.5").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_entry_extended_when_owner_unchanged() {
        let backend = ScriptedBackend {
            peeks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            peek_result: Some(pod_with_uid("u-1")),
            resolution: || Resolution::Single(identity("other", "other@gcp.project", "u-9")),
        };
        let cache = ServiceAccountCache::new(Box::new(backend), Duration::ZERO, 0);

        // Seed an entry that is immediately stale (ttl = 0).
        cache
            .inner
            .lock()
            .await
            .insert("10.0.0.5".into(), identity("web", "web@gcp.project", "u-1"));

        let result = cache.get("10.0.0.5").await.unwrap();
        // The owner matched, so the cached identity survived.
        assert_eq!(result.bound_gsa, "web@gcp.project");
    }

    #[tokio::test]
    async fn test_stale_entry_evicted_when_owner_changed() {
        let backend = ScriptedBackend {
            peeks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            peek_result: Some(pod_with_uid("u-2")),
            resolution: || Resolution::Single(identity("new", "new@gcp.project", "u-2")),
        };
        let cache = ServiceAccountCache::new(Box::new(backend), Duration::ZERO, 0);

        cache
            .inner
            .lock()
            .await
            .insert("10.0.0.5".into(), identity("web", "web@gcp.project", "u-1"));

        let result = cache.get("10.0.0.5").await.unwrap();
        assert_eq!(result.bound_gsa, "new@gcp.project");
    }

    #[tokio::test]
    async fn test_bulk_reconcile_evicts_missing_ips() {
        let backend = ScriptedBackend {
            peeks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            peek_result: None,
            resolution: || {
                let mut found = HashMap::new();
                found.insert("10.0.0.5".into(), identity("web", "web@gcp.project", "u-1"));
                found.insert("10.0.0.6".into(), identity("api", "api@gcp.project", "u-2"));
                Resolution::Bulk(found)
            },
        };
        let cache = ServiceAccountCache::new(Box::new(backend), Duration::from_secs(60), 0);

        // Seed a cache entry for an IP the node no longer reports.
        cache
            .inner
            .lock()
            .await
            .insert("10.0.0.9".into(), identity("gone", "gone@gcp.project", "u-9"));

        let result = cache.get("10.0.0.5").await.unwrap();
        assert_eq!(result.bound_gsa, "web@gcp.project");
        assert_eq!(cache.len().await, 2);
        assert!(!cache.inner.lock().await.contains_key("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_unresolvable_ip_yields_empty_identity() {
        let backend = ScriptedBackend {
            peeks: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
            peek_result: None,
            resolution: || Resolution::Single(PodIdentity::empty()),
        };
        let cache = ServiceAccountCache::new(Box::new(backend), Duration::from_secs(60), 0);

        let result = cache.get("10.9.9.9").await.unwrap();
        assert!(result.bound_gsa.is_empty());
    }
}
