//! Status reasons and writes.

use tracing::info;

use crate::crd::{ClusterState, RedisCluster, RedisClusterStatus};
use crate::error::Result;
use crate::platform::Platform;

pub const REASON_INITIALIZING_LEADERS: &str = "RedisCluster is initializing leaders";
pub const REASON_INITIALIZING_FOLLOWERS: &str = "RedisCluster is initializing followers";
pub const REASON_BOOTSTRAP: &str = "RedisCluster is bootstrapping";
pub const REASON_SCALING: &str = "RedisCluster is scaling";
pub const REASON_READY: &str = "RedisCluster is ready";
pub const REASON_UNHEALTHY: &str = "RedisCluster has unhealthy nodes";
pub const REASON_NOT_STABLE: &str = "RedisCluster slot ownership is not stable";
pub const REASON_BROKEN: &str = "RedisCluster is broken and requires manual intervention";

/// Tracks the status of one cluster during a pass and writes only changes.
pub struct StatusWriter<'a> {
    platform: &'a dyn Platform,
    cluster: &'a RedisCluster,
    current: RedisClusterStatus,
}

impl<'a> StatusWriter<'a> {
    pub fn new(platform: &'a dyn Platform, cluster: &'a RedisCluster) -> Self {
        Self {
            platform,
            cluster,
            current: cluster.status.clone().unwrap_or_default(),
        }
    }

    pub fn current(&self) -> &RedisClusterStatus {
        &self.current
    }

    /// The cluster was declared broken and its generation has not changed since.
    pub fn broken_at_current_generation(&self) -> bool {
        self.current.state == ClusterState::Failed
            && self.current.reason == REASON_BROKEN
            && self.current.observed_generation == self.cluster.metadata.generation
    }

    /// Persist `state` with `reason` and the ready counts. Returns whether a
    /// write happened.
    pub async fn set(
        &mut self,
        state: ClusterState,
        reason: &str,
        ready_leaders: i32,
        ready_followers: i32,
    ) -> Result<bool> {
        let next = RedisClusterStatus {
            state,
            reason: reason.to_string(),
            ready_leader_replicas: ready_leaders,
            ready_follower_replicas: ready_followers,
            observed_generation: self.cluster.metadata.generation,
        };
        if next == self.current {
            return Ok(false);
        }

        info!(
            cluster = %self.cluster.metadata.name.as_deref().unwrap_or_default(),
            from = %self.current.state,
            to = %next.state,
            reason = %reason,
            "Updating cluster status"
        );
        self.platform.patch_cluster_status(self.cluster, &next).await?;
        self.current = next;
        Ok(true)
    }
}
