//! In-cluster REST client for the orchestrator control plane.
//!
//! Implements the narrow [`ClusterApi`] slice against the API server:
//! pod lookup by IP via field selector, service-account listing, and
//! projected-token requests bound to a pod. Authenticates with the
//! projected service-account token mounted into the pod.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use vouch_core::apimetrics::ApiMetrics;
use vouch_core::http::HttpClient;
use vouch_core::StatusError;
use vouch_tokens::cluster::{ClusterApi, PodRecord, ServiceAccountRecord};
use vouch_tokens::identity::PodRef;
use vouch_tokens::kubelet::SERVICE_ACCOUNT_TOKEN_PATH;

const ENDPOINT_LABEL: &str = "kubeapi";

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    service_account_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    pod_ip: String,
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    phase: String,
}

#[derive(Debug, Default, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceAccount {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceAccountList {
    #[serde(default)]
    items: Vec<ServiceAccount>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestSpec {
    audiences: Vec<String>,
    expiration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bound_object_ref: Option<BoundObjectRef>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BoundObjectRef {
    kind: String,
    api_version: String,
    name: String,
    uid: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    api_version: String,
    kind: String,
    spec: TokenRequestSpec,
}

#[derive(Debug, Default, Deserialize)]
struct TokenRequestStatus {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenRequestResponse {
    #[serde(default)]
    status: TokenRequestStatus,
}

/// Control-plane client using in-cluster configuration.
pub struct InClusterApi {
    http: HttpClient,
    base: String,
    token_path: PathBuf,
    token: OnceCell<String>,
    metrics: ApiMetrics,
}

impl InClusterApi {
    /// Creates a client from the in-cluster environment
    /// (`KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`).
    pub fn from_env(http: HttpClient) -> Result<Self, StatusError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            StatusError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "KUBERNETES_SERVICE_HOST is not set, not running in a cluster",
            )
        })?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        Ok(Self::new(http, format!("https://{host}:{port}")))
    }

    /// Creates a client against an explicit API server URL.
    pub fn new(http: HttpClient, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
            token_path: PathBuf::from(SERVICE_ACCOUNT_TOKEN_PATH),
            token: OnceCell::new(),
            metrics: ApiMetrics::new("metadata_server_k8s"),
        }
    }

    async fn bearer(&self) -> Result<String, StatusError> {
        let token = self
            .token
            .get_or_try_init(|| async {
                tokio::fs::read_to_string(&self.token_path)
                    .await
                    .map(|raw| raw.trim().to_string())
            })
            .await
            .map_err(|e| {
                StatusError::with_context(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to read service account token",
                    &e,
                )
            })?;
        Ok(format!("Bearer {token}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_label: &'static str,
        url: &str,
    ) -> Result<T, StatusError> {
        let bearer = self.bearer().await?;
        let started = Instant::now();
        let result: Result<T, StatusError> =
            self.http.get_json(url, &[("Authorization", &bearer)]).await;
        self.metrics.track_call(
            ENDPOINT_LABEL,
            path_label,
            started,
            match &result {
                Ok(_) => 200,
                Err(err) => err.status.as_u16() as i32,
            },
        );
        result
    }
}

fn pod_record(pod: Pod) -> PodRecord {
    PodRecord {
        name: pod.metadata.name,
        namespace: pod.metadata.namespace,
        uid: pod.metadata.uid,
        service_account: pod.spec.service_account_name,
        pod_ip: pod.status.pod_ip,
        host_ip: pod.status.host_ip,
        phase: pod.status.phase,
    }
}

fn sa_record(sa: ServiceAccount) -> ServiceAccountRecord {
    ServiceAccountRecord {
        name: sa.metadata.name,
        namespace: sa.metadata.namespace,
        annotations: sa.metadata.annotations,
    }
}

#[async_trait]
impl ClusterApi for InClusterApi {
    async fn list_pods_by_ip(&self, ip: &str) -> Result<Vec<PodRecord>, StatusError> {
        let selector = format!(
            "status.podIP%3D%3D{ip},status.phase!%3DSucceeded,status.phase!%3DFailed,status.phase!%3DUnknown"
        );
        let url = format!("{}/api/v1/pods?fieldSelector={selector}", self.base);
        let list: PodList = self.get_json("pods", &url).await?;
        Ok(list.items.into_iter().map(pod_record).collect())
    }

    async fn list_service_accounts(&self) -> Result<Vec<ServiceAccountRecord>, StatusError> {
        let url = format!("{}/api/v1/serviceaccounts", self.base);
        let list: ServiceAccountList = self.get_json("serviceaccounts", &url).await?;
        Ok(list.items.into_iter().map(sa_record).collect())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccountRecord, StatusError> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/serviceaccounts/{name}",
            self.base
        );
        let sa: ServiceAccount = self.get_json("serviceaccounts", &url).await?;
        Ok(sa_record(sa))
    }

    async fn service_account_token(
        &self,
        namespace: &str,
        name: &str,
        lifetime: Duration,
        audiences: &[String],
        bound_pod: Option<&PodRef>,
    ) -> Result<String, StatusError> {
        let request = TokenRequest {
            api_version: "authentication.k8s.io/v1".to_string(),
            kind: "TokenRequest".to_string(),
            spec: TokenRequestSpec {
                audiences: audiences.to_vec(),
                expiration_seconds: lifetime.as_secs(),
                bound_object_ref: bound_pod.map(|pod| BoundObjectRef {
                    kind: "Pod".to_string(),
                    api_version: "v1".to_string(),
                    name: pod.name.clone(),
                    uid: pod.uid.clone(),
                }),
            },
        };

        let url = format!(
            "{}/api/v1/namespaces/{namespace}/serviceaccounts/{name}/token",
            self.base
        );
        let bearer = self.bearer().await?;
        let started = Instant::now();
        let result: Result<TokenRequestResponse, StatusError> = self
            .http
            .post_json(&url, &request, &[("Authorization", &bearer)])
            .await;
        self.metrics.track_call(
            ENDPOINT_LABEL,
            "request_token",
            started,
            match &result {
                Ok(_) => 200,
                Err(err) => err.status.as_u16() as i32,
            },
        );

        let response = result?;
        if response.status.token.is_empty() {
            return Err(StatusError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token request returned an empty token",
            ));
        }
        Ok(response.status.token)
    }
}

impl std::fmt::Debug for InClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InClusterApi")
            .field("base", &self.base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_request_serialization() {
        let request = TokenRequest {
            api_version: "authentication.k8s.io/v1".into(),
            kind: "TokenRequest".into(),
            spec: TokenRequestSpec {
                audiences: vec!["aud".into()],
                expiration_seconds: 600,
                bound_object_ref: Some(BoundObjectRef {
                    kind: "Pod".into(),
                    api_version: "v1".into(),
                    name: "web-1".into(),
                    uid: "u-1".into(),
                }),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["spec"]["expirationSeconds"], 600);
        assert_eq!(json["spec"]["boundObjectRef"]["kind"], "Pod");
    }

    #[test]
    fn test_pod_list_parsing() {
        let raw = r#"{"items":[{
            "metadata": {"name":"web-1","namespace":"apps","uid":"u-1"},
            "spec": {"serviceAccountName":"web"},
            "status": {"podIP":"10.0.0.5","hostIP":"10.1.0.1","phase":"Running"}
        }]}"#;
        let list: PodList = serde_json::from_str(raw).unwrap();
        let record = pod_record(list.items.into_iter().next().unwrap());
        assert_eq!(record.service_account, "web");
        assert_eq!(record.pod_ip, "10.0.0.5");
    }

    #[test]
    fn test_service_account_annotation_parsing() {
        let raw = r#"{"metadata":{"name":"web","namespace":"apps",
            "annotations":{"iam.gke.io/gcp-service-account":"web@gcp.project"}}}"#;
        let sa: ServiceAccount = serde_json::from_str(raw).unwrap();
        assert_eq!(sa_record(sa).bound_gsa(), "web@gcp.project");
    }
}
