//! The caller's source identity.
//!
//! Two concrete variants exist: a pod resolved by its IP, and the local host
//! authenticated by its mTLS certificate. Equality and hashing consider only
//! the fields that name an identity; bookkeeping fields (`first_seen`, the
//! owning pod reference) are excluded so a re-resolved pod compares equal to
//! its cached entry.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

/// Reference to the pod an identity was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub uid: String,
}

/// A workload identity resolved from a pod behind an IP.
#[derive(Debug, Clone)]
pub struct PodIdentity {
    /// Service-account name the pod runs as.
    pub name: String,
    /// Namespace of the pod and its service account.
    pub namespace: String,
    /// Cloud service account bound via the workload-identity annotation.
    pub bound_gsa: String,
    /// The owning pod. Not part of the identity.
    pub owner: Option<PodRef>,
    /// When this entry was resolved. Not part of the identity.
    pub first_seen: DateTime<Utc>,
}

impl PodIdentity {
    /// An unresolved identity: every field empty.
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            namespace: String::new(),
            bound_gsa: String::new(),
            owner: None,
            first_seen: Utc::now(),
        }
    }

    /// True if this entry still refers to the same pod.
    pub fn owned_by(&self, pod_uid: &str) -> bool {
        self.owner.as_ref().map(|o| o.uid.as_str()) == Some(pod_uid)
    }
}

impl PartialEq for PodIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && self.bound_gsa == other.bound_gsa
    }
}

impl Eq for PodIdentity {}

/// The local machine's identity, bound through its client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    /// Cloud service account the host impersonates.
    pub bound_gsa: String,
}

/// Closed union over the known source-identity variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentity {
    Pod(PodIdentity),
    Host(HostIdentity),
}

impl SourceIdentity {
    /// The bound cloud identity, empty if resolution failed.
    pub fn bound_gsa(&self) -> &str {
        match self {
            SourceIdentity::Pod(pod) => &pod.bound_gsa,
            SourceIdentity::Host(host) => &host.bound_gsa,
        }
    }

    /// True if no cloud identity is bound.
    pub fn is_unbound(&self) -> bool {
        self.bound_gsa().is_empty()
    }

    /// A stable 64-bit hash over the identity-relevant fields.
    ///
    /// Stable within one process; used only for in-memory cache keys.
    pub fn hash64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            SourceIdentity::Pod(pod) => {
                0u8.hash(&mut hasher);
                pod.namespace.hash(&mut hasher);
                pod.name.hash(&mut hasher);
                pod.bound_gsa.hash(&mut hasher);
            }
            SourceIdentity::Host(host) => {
                1u8.hash(&mut hasher);
                host.bound_gsa.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
