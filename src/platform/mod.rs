//! Platform seam.
//!
//! Everything the engine asks of the orchestrator goes through three narrow
//! traits, bundled as [`Platform`]. [`kubernetes::KubePlatform`] talks to a real API
//! server; tests substitute an in-memory implementation.

pub mod kubernetes;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;

use crate::crd::{RedisCluster, RedisClusterStatus};
use crate::error::Result;

/// Deletion propagation for workload deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Foreground,
    Background,
    Orphan,
}

impl Propagation {
    /// Parse an annotation value; anything unrecognised is foreground.
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("orphan") => Propagation::Orphan,
            Some("background") => Propagation::Background,
            _ => Propagation::Foreground,
        }
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Event attached to a cluster resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
}

impl ClusterEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.into(),
            note: note.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.into(),
            note: note.into(),
        }
    }
}

/// StatefulSets and their storage claims.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// `None` when the StatefulSet does not exist.
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    /// Full update guarded by the object's resource version.
    async fn replace_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    async fn delete_statefulset(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<()>;

    async fn list_claims(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    async fn replace_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Pods and remote execution.
#[async_trait]
pub trait PodGateway: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>>;

    /// Full update guarded by the pod's resource version.
    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    /// Run `command` in a container and capture its output. Fails when the
    /// channel cannot be opened or the process exits non-zero.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;
}

/// Services, disruption budgets, secrets, and the cluster resource itself.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create or update with server-side apply.
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// Create or update with server-side apply.
    async fn apply_disruption_budget(&self, namespace: &str, budget: &PodDisruptionBudget) -> Result<()>;

    /// Delete if present; a missing budget is not an error.
    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<()>;

    /// `None` when the secret or key is missing.
    async fn read_secret_key(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>>;

    async fn patch_cluster_status(&self, cluster: &RedisCluster, status: &RedisClusterStatus) -> Result<()>;

    async fn set_cluster_finalizers(&self, cluster: &RedisCluster, finalizers: &[String]) -> Result<()>;

    async fn publish_event(&self, cluster: &RedisCluster, event: ClusterEvent) -> Result<()>;
}

/// Everything the engine needs from the orchestrator.
pub trait Platform: WorkloadStore + PodGateway + ResourceStore {}

impl<T: WorkloadStore + PodGateway + ResourceStore + ?Sized> Platform for T {}

/// Publish an event. Failures are logged and otherwise ignored.
pub async fn emit(platform: &dyn Platform, cluster: &RedisCluster, event: ClusterEvent) {
    let reason = event.reason.clone();
    if let Err(e) = platform.publish_event(cluster, event).await {
        tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
    }
}
