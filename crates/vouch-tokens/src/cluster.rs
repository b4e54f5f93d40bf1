//! Interface to the container orchestrator.
//!
//! The orchestrator client library is an external collaborator; this module
//! pins down exactly the slice of it the resolver consumes, plus the shared
//! pod-selection rules applied to any pod listing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use vouch_core::StatusError;

use crate::identity::PodRef;
use crate::{Error, Result};

/// Annotation binding a service account to its cloud identity.
pub const GSA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";

/// The slice of a pod this system consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub service_account: String,
    pub pod_ip: String,
    pub host_ip: String,
    pub phase: String,
}

impl PodRecord {
    /// True for phases whose pods can originate traffic (init containers
    /// run while the pod is still `Pending`).
    pub fn is_active(&self) -> bool {
        self.phase == "Running" || self.phase == "Pending"
    }

    /// The pod's service account, defaulting like the orchestrator does.
    pub fn service_account_or_default(&self) -> &str {
        if self.service_account.is_empty() {
            "default"
        } else {
            &self.service_account
        }
    }
}

/// The slice of a service account this system consumes.
#[derive(Debug, Clone, Default)]
pub struct ServiceAccountRecord {
    pub name: String,
    pub namespace: String,
    pub annotations: HashMap<String, String>,
}

impl ServiceAccountRecord {
    /// The bound cloud identity, empty when the annotation is absent.
    pub fn bound_gsa(&self) -> String {
        self.annotations
            .get(GSA_ANNOTATION)
            .cloned()
            .unwrap_or_default()
    }
}

/// Control-plane operations the resolver depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists active pods whose status IP equals `ip`.
    async fn list_pods_by_ip(&self, ip: &str) -> std::result::Result<Vec<PodRecord>, StatusError>;

    /// Lists all service accounts in the cluster.
    async fn list_service_accounts(
        &self,
    ) -> std::result::Result<Vec<ServiceAccountRecord>, StatusError>;

    /// Fetches one service account.
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<ServiceAccountRecord, StatusError>;

    /// Requests a projected service-account token bound to a pod.
    async fn service_account_token(
        &self,
        namespace: &str,
        name: &str,
        lifetime: Duration,
        audiences: &[String],
        bound_pod: Option<&PodRef>,
    ) -> std::result::Result<String, StatusError>;
}

/// Applies the shared ambiguity rules to a set of candidate pods.
///
/// - no candidate: `Ok(None)`, the caller may retry
/// - exactly one: that pod
/// - several sharing the host's own IP: host-networking collision,
///   unresolvable by design
/// - several otherwise: unresolvable
pub(crate) fn select_pod_for_ip(candidates: Vec<PodRecord>, ip: &str) -> Result<Option<PodRecord>> {
    let mut active: Vec<PodRecord> = candidates.into_iter().filter(PodRecord::is_active).collect();

    match active.len() {
        0 => Ok(None),
        1 => Ok(Some(active.remove(0))),
        n => {
            if active[0].host_ip == ip {
                return Err(Error::AmbiguousPod(
                    "multiple pods found using host networking, lookup cannot be resolved"
                        .to_string(),
                ));
            }
            Err(Error::AmbiguousPod(format!(
                "{n} pods found for IP {ip}, lookup cannot be resolved"
            )))
        }
    }
}

/// Linear backoff applied between pod-lookup retries.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(200) * attempt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, pod_ip: &str, host_ip: &str, phase: &str) -> PodRecord {
        PodRecord {
            name: name.into(),
            namespace: "default".into(),
            uid: format!("uid-{name}"),
            service_account: "sa".into(),
            pod_ip: pod_ip.into(),
            host_ip: host_ip.into(),
            phase: phase.into(),
        }
    }

    #[test]
    fn test_single_active_pod_selected() {
        let selected = select_pod_for_ip(
            vec![
                pod("a", "10.0.0.1", "10.1.0.1", "Running"),
                pod("b", "10.0.0.1", "10.1.0.1", "Succeeded"),
            ],
            "10.0.0.1",
        )
        .unwrap();
        assert_eq!(selected.unwrap().name, "a");
    }

    #[test]
    fn test_pending_pods_count_as_active() {
        let selected =
            select_pod_for_ip(vec![pod("a", "10.0.0.1", "10.1.0.1", "Pending")], "10.0.0.1")
                .unwrap();
        assert!(selected.is_some());
    }

    #[test]
    fn test_no_match_yields_none() {
        assert!(select_pod_for_ip(vec![], "10.0.0.1").unwrap().is_none());
    }

    #[test]
    fn test_host_networking_collision() {
        let err = select_pod_for_ip(
            vec![
                pod("a", "10.1.0.1", "10.1.0.1", "Running"),
                pod("b", "10.1.0.1", "10.1.0.1", "Running"),
            ],
            "10.1.0.1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::AmbiguousPod(_)));
        assert!(err.to_string().contains("host networking"));
    }

    #[test]
    fn test_duplicate_pod_ip_collision() {
        let err = select_pod_for_ip(
            vec![
                pod("a", "10.0.0.1", "10.1.0.1", "Running"),
                pod("b", "10.0.0.1", "10.1.0.2", "Running"),
            ],
            "10.0.0.1",
        )
        .unwrap_err();
        assert!(matches!(err, Error::AmbiguousPod(_)));
    }

    #[test]
    fn test_retry_backoff_is_linear() {
        assert_eq!(retry_backoff(1), Duration::from_millis(200));
        assert_eq!(retry_backoff(3), Duration::from_millis(600));
    }

    #[test]
    fn test_service_account_defaulting() {
        let mut record = pod("a", "10.0.0.1", "10.1.0.1", "Running");
        record.service_account = String::new();
        assert_eq!(record.service_account_or_default(), "default");
    }

    #[test]
    fn test_bound_gsa_from_annotation() {
        let mut sa = ServiceAccountRecord {
            name: "sa".into(),
            namespace: "ns".into(),
            annotations: HashMap::new(),
        };
        assert_eq!(sa.bound_gsa(), "");
        sa.annotations
            .insert(GSA_ANNOTATION.into(), "sa@gcp.project".into());
        assert_eq!(sa.bound_gsa(), "sa@gcp.project");
    }
}
