//! Node-agent (kubelet) client.
//!
//! When the broker runs in host-network mode on a node, the kubelet's
//! read-only `/pods` endpoint lists exactly the pods that can reach us,
//! which is both faster and cheaper than asking the control plane. The
//! service account needs a role allowing `get` on `nodes/proxy`.

use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::info;

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::http::HttpClient;
use vouch_core::StatusError;

use crate::cluster::{retry_backoff, select_pod_for_ip, PodRecord};
use crate::{Error, Result};

/// Default mount point of the projected service-account token.
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

const KUBELET_ENDPOINT_LABEL: &str = "kubeapi";

#[derive(Debug, Clone, Default, Deserialize)]
struct KubeletPodList {
    #[serde(default)]
    items: Vec<KubeletPodInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KubeletPodInfo {
    #[serde(default)]
    metadata: KubeletPodMetadata,
    #[serde(default)]
    spec: KubeletPodSpec,
    #[serde(default)]
    status: KubeletPodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KubeletPodMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletPodSpec {
    #[serde(default)]
    service_account_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletPodStatus {
    #[serde(default)]
    pod_ip: String,
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    phase: String,
}

impl KubeletPodInfo {
    fn into_record(self) -> PodRecord {
        PodRecord {
            name: self.metadata.name,
            namespace: self.metadata.namespace,
            uid: self.metadata.uid,
            service_account: self.spec.service_account_name,
            pod_ip: self.status.pod_ip,
            host_ip: self.status.host_ip,
            phase: self.status.phase,
        }
    }
}

/// Client for the node agent's `/pods` endpoint.
pub struct KubeletClient {
    http: HttpClient,
    host: String,
    token_path: PathBuf,
    token: OnceCell<String>,
    metrics: ApiMetrics,
}

impl KubeletClient {
    /// Creates a client for `host` (e.g. `https://127.0.0.1:10250`).
    pub fn new(http: HttpClient, host: impl Into<String>) -> Self {
        Self {
            http,
            host: host.into(),
            token_path: PathBuf::from(SERVICE_ACCOUNT_TOKEN_PATH),
            token: OnceCell::new(),
            metrics: ApiMetrics::new("metadata_server_k8s"),
        }
    }

    /// Overrides the token file location. Intended for tests.
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Reads the projected service-account token, cached after first use.
    ///
    /// The mount can lag pod start, so missing files are retried briefly.
    /// These tokens never rotate in place, caching is safe.
    async fn service_account_token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let mut last_err = None;
                for _ in 0..6 {
                    match tokio::fs::read_to_string(&self.token_path).await {
                        Ok(raw) => return Ok(raw.trim().to_string()),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                            last_err = Some(err);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(last_err
                    .unwrap_or_else(|| std::io::Error::other("token file never appeared")))
            })
            .await
            .map_err(|source| Error::Io {
                context: "failed to read service account token from disk".to_string(),
                source,
            })?;
        Ok(token)
    }

    /// Lists every pod on this node.
    pub async fn list_pods(&self) -> Result<Vec<PodRecord>> {
        let token = self.service_account_token().await?.to_string();
        let url = format!("{}/pods", self.host);

        let started = Instant::now();
        let result: std::result::Result<KubeletPodList, StatusError> = self
            .http
            .get_json(
                &url,
                &[
                    ("User-Agent", "vouch-metadata-server"),
                    ("Authorization", &format!("Bearer {token}")),
                ],
            )
            .await;
        let status = match &result {
            Ok(_) => 200,
            Err(err) => err.status.as_u16() as i32,
        };
        self.metrics
            .track_call(KUBELET_ENDPOINT_LABEL, "pods", started, status);

        let list = result?;
        if list.items.is_empty() {
            // This process runs as a pod itself, so an empty answer means the
            // node-agent API is broken or forbidden.
            return Err(Error::Config(
                "kubelet returned no pods; check nodes/proxy permissions and reachability"
                    .to_string(),
            ));
        }

        Ok(list.items.into_iter().map(KubeletPodInfo::into_record).collect())
    }

    /// Finds the pod behind `ip`, retrying with linear backoff.
    ///
    /// The full pod list of the last attempt is returned alongside so
    /// callers can reconcile their caches without a second listing.
    pub async fn pod_by_ip(
        &self,
        ip: &str,
        retries: u32,
    ) -> Result<(Option<PodRecord>, Vec<PodRecord>)> {
        let mut attempt = 1;
        loop {
            let pods = self.list_pods().await?;
            let candidates: Vec<PodRecord> =
                pods.iter().filter(|p| p.pod_ip == ip).cloned().collect();

            match select_pod_for_ip(candidates, ip)? {
                Some(pod) => return Ok((Some(pod), pods)),
                None if attempt <= retries => {
                    info!(ip, attempt, retries, "no pod found for IP, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    attempt += 1;
                }
                None => return Ok((None, pods)),
            }
        }
    }
}

impl std::fmt::Debug for KubeletClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeletClient")
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_list_deserialization() {
        let raw = r#"{
            "items": [{
                "metadata": {"name": "web-1", "namespace": "apps", "uid": "u-1"},
                "spec": {"serviceAccountName": "web"},
                "status": {"podIP": "10.0.0.5", "hostIP": "10.1.0.1", "phase": "Running"}
            }]
        }"#;
        let list: KubeletPodList = serde_json::from_str(raw).unwrap();
        let record = list.items.into_iter().next().unwrap().into_record();
        assert_eq!(record.name, "web-1");
        assert_eq!(record.namespace, "apps");
        assert_eq!(record.service_account, "web");
        assert_eq!(record.pod_ip, "10.0.0.5");
        assert!(record.is_active());
    }

    #[tokio::test]
    async fn test_token_read_and_caching() {
        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token");
        std::fs::write(&token_file, "  projected-token\n").unwrap();

        let client = KubeletClient::new(HttpClient::new().unwrap(), "https://127.0.0.1:10250")
            .with_token_path(&token_file);

        assert_eq!(client.service_account_token().await.unwrap(), "projected-token");

        // A later change on disk does not invalidate the cached value.
        std::fs::write(&token_file, "other").unwrap();
        assert_eq!(client.service_account_token().await.unwrap(), "projected-token");
    }
}
