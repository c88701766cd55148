//! Operator configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Environment variable that overrides the claim template name used when
/// cleaning up storage claims.
pub const PVC_TEMPLATE_ENV: &str = "OPERATOR_STS_PVC_TEMPLATE_NAME";

/// Requeue intervals handed back to the controller framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequeueConfig {
    /// After every scaling step.
    pub scaling_secs: u64,
    /// While the cluster is bootstrapping or a follower join is pending.
    pub bootstrap_secs: u64,
    /// While workloads are not ready yet, or the cluster is unhealthy.
    pub not_ready_secs: u64,
    /// Steady-state polling once the cluster is ready.
    pub steady_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            scaling_secs: 10,
            bootstrap_secs: 60,
            not_ready_secs: 120,
            steady_secs: 10,
        }
    }
}

impl RequeueConfig {
    pub fn scaling(&self) -> Duration {
        Duration::from_secs(self.scaling_secs)
    }

    pub fn bootstrap(&self) -> Duration {
        Duration::from_secs(self.bootstrap_secs)
    }

    pub fn not_ready(&self) -> Duration {
        Duration::from_secs(self.not_ready_secs)
    }

    pub fn steady(&self) -> Duration {
        Duration::from_secs(self.steady_secs)
    }
}

/// Main configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Field manager used for server-side apply and status patches.
    pub field_manager: String,
    /// Requeue intervals.
    pub requeue: RequeueConfig,
    /// Repair verification: attempts and fixed delay between re-checks.
    pub repair_retry: RetryPolicy,
    /// Conflict retries for role-label patches.
    pub conflict_retry: RetryPolicy,
    /// Claim template name override for finalizer cleanup.
    pub pvc_template_name: Option<String>,
    /// Administrative CLI binary inside the store container.
    pub admin_binary: String,
    /// Where TLS material is mounted inside the store container.
    pub tls_mount_path: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            field_manager: "shardkeeper-operator".to_string(),
            requeue: RequeueConfig::default(),
            repair_retry: RetryPolicy::fixed(3, Duration::from_secs(5)),
            conflict_retry: RetryPolicy::conflict(),
            pvc_template_name: None,
            admin_binary: "redis-cli".to_string(),
            tls_mount_path: "/tls".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.field_manager.is_empty() {
            return Err(Error::InvalidConfig {
                field: "fieldManager".to_string(),
                reason: "Field manager must not be empty".to_string(),
            });
        }

        if self.repair_retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                field: "repairRetry.maxAttempts".to_string(),
                reason: "At least one repair attempt is required".to_string(),
            });
        }

        if self.conflict_retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                field: "conflictRetry.maxAttempts".to_string(),
                reason: "At least one attempt is required".to_string(),
            });
        }

        if self.admin_binary.is_empty() {
            return Err(Error::InvalidConfig {
                field: "adminBinary".to_string(),
                reason: "Admin binary must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Configuration with no waiting between repair re-checks, for tests and
    /// local runs against a fake platform.
    pub fn development() -> Self {
        Self {
            repair_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            conflict_retry: RetryPolicy::fixed(5, Duration::from_millis(1)),
            ..Self::default()
        }
    }
}
