//! Custom Resource Definition for sharded Redis clusters

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::naming::Role;

/// Annotation that makes the controller skip a resource entirely.
pub const SKIP_RECONCILE_ANNOTATION: &str = "shardkeeper.io/skip-reconcile";

/// Annotation enabling delete-and-recreate when a workload update is rejected.
pub const RECREATE_ANNOTATION: &str = "shardkeeper.io/recreate-statefulset";

/// Deletion propagation used by the recreate fallback.
pub const RECREATE_STRATEGY_ANNOTATION: &str = "shardkeeper.io/recreate-statefulset-strategy";

// ============================================================================
// RedisCluster CRD
// ============================================================================

/// RedisCluster represents a sharded, replicated Redis cluster
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "shardkeeper.io",
    version = "v1beta1",
    kind = "RedisCluster",
    plural = "redisclusters",
    shortname = "rc",
    status = "RedisClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.clusterSize"}"#,
    printcolumn = r#"{"name":"Ready Leaders","type":"integer","jsonPath":".status.readyLeaderReplicas"}"#,
    printcolumn = r#"{"name":"Ready Followers","type":"integer","jsonPath":".status.readyFollowerReplicas"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterSpec {
    /// Default number of leaders, and of followers
    #[serde(default = "default_cluster_size")]
    pub cluster_size: i32,

    /// Port every member listens on
    #[serde(default = "default_port")]
    pub port: i32,

    /// Major version; `v7` members are addressed by stable hostname
    #[serde(default = "default_cluster_version")]
    pub cluster_version: String,

    /// Container and service settings
    #[serde(default)]
    pub kubernetes_config: KubernetesConfig,

    /// Leader role overrides
    #[serde(default)]
    pub redis_leader: RoleConfig,

    /// Follower role overrides
    #[serde(default)]
    pub redis_follower: RoleConfig,

    /// Runtime configuration
    #[serde(default)]
    pub redis_config: Option<RedisConfig>,

    /// Persistent storage
    #[serde(default)]
    pub storage: Option<StorageConfig>,

    /// Enable append-only persistence
    #[serde(default)]
    pub persistence_enabled: Option<bool>,

    /// TLS material
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_cluster_size() -> i32 {
    3
}

fn default_port() -> i32 {
    6379
}

fn default_cluster_version() -> String {
    "v7".to_string()
}

/// Container settings shared by both roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Container image
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy
    #[serde(default)]
    pub image_pull_policy: Option<String>,

    /// Resource requirements
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Secret holding the password
    #[serde(default)]
    pub redis_secret: Option<SecretRef>,

    /// Service settings
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            image_pull_policy: None,
            resources: ResourceConfig::default(),
            redis_secret: None,
            service: ServiceConfig::default(),
        }
    }
}

fn default_image() -> String {
    "redis:7.2".to_string()
}

/// Resource requirements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Reference to a key inside a secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

/// Service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Type of the additional service
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Annotations added to every service
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

/// Per-role settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    /// Overrides `clusterSize` for this role
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Node selector for pod placement
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// ConfigMap with extra server configuration, mounted into the container
    #[serde(default)]
    pub additional_redis_config: Option<String>,

    /// Disruption budget for the role's pods
    #[serde(default, rename = "pdb")]
    pub pod_disruption_budget: Option<DisruptionBudgetConfig>,
}

/// PodDisruptionBudget settings. With neither bound set, a majority of the
/// role's pods must stay available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_available: Option<i32>,
    #[serde(default)]
    pub max_unavailable: Option<i32>,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// `"<parameter> <value>"` entries applied with CONFIG SET
    #[serde(default)]
    pub dynamic_config: Vec<String>,
}

/// Persistent storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Requested capacity of the data volume
    #[serde(default = "default_volume_size")]
    pub size: String,

    /// Storage class
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Access modes
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    /// Keep claims when the cluster is deleted
    #[serde(default)]
    pub keep_after_delete: bool,

    /// Persist nodes.conf on its own volume
    #[serde(default)]
    pub node_conf_volume: bool,

    /// Capacity of the nodes.conf volume
    #[serde(default = "default_node_conf_size")]
    pub node_conf_size: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            size: default_volume_size(),
            storage_class: None,
            access_modes: default_access_modes(),
            keep_after_delete: false,
            node_conf_volume: false,
            node_conf_size: default_node_conf_size(),
        }
    }
}

fn default_volume_size() -> String {
    "1Gi".to_string()
}

fn default_node_conf_size() -> String {
    "1Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

/// TLS material, mounted from a secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret holding the files below
    pub secret_name: String,

    #[serde(default = "default_ca_file")]
    pub ca: String,

    #[serde(default = "default_cert_file")]
    pub cert: String,

    #[serde(default = "default_key_file")]
    pub key: String,
}

fn default_ca_file() -> String {
    "ca.crt".to_string()
}

fn default_cert_file() -> String {
    "tls.crt".to_string()
}

fn default_key_file() -> String {
    "tls.key".to_string()
}

impl RedisClusterSpec {
    /// Desired replica count for a role.
    pub fn replicas(&self, role: Role) -> i32 {
        let role_config = match role {
            Role::Leader => &self.redis_leader,
            Role::Follower => &self.redis_follower,
        };
        role_config.replicas.unwrap_or(self.cluster_size)
    }

    pub fn leader_replicas(&self) -> i32 {
        self.replicas(Role::Leader)
    }

    pub fn follower_replicas(&self) -> i32 {
        self.replicas(Role::Follower)
    }

    /// Leaders plus followers.
    pub fn total_replicas(&self) -> i32 {
        self.leader_replicas() + self.follower_replicas()
    }

    /// Members advertise stable DNS hostnames instead of pod IPs.
    pub fn uses_hostnames(&self) -> bool {
        self.cluster_version == "v7"
    }

    pub fn role_config(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Leader => &self.redis_leader,
            Role::Follower => &self.redis_follower,
        }
    }

    pub fn dynamic_config(&self) -> &[String] {
        self.redis_config
            .as_ref()
            .map(|c| c.dynamic_config.as_slice())
            .unwrap_or_default()
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum ClusterState {
    #[default]
    Initializing,
    Bootstrap,
    Ready,
    Failed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Initializing => "Initializing",
            ClusterState::Bootstrap => "Bootstrap",
            ClusterState::Ready => "Ready",
            ClusterState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of a RedisCluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterStatus {
    /// Lifecycle state
    pub state: ClusterState,

    /// Human-readable reason for the state
    #[serde(default)]
    pub reason: String,

    /// Ready leader pods
    #[serde(default)]
    pub ready_leader_replicas: i32,

    /// Ready follower pods
    #[serde(default)]
    pub ready_follower_replicas: i32,

    /// Resource generation this status was written for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
