//! Multi-step playbooks for changing the shard count.
//!
//! Administrative commands run one at a time, from leader 0 unless a step
//! names another member. Each step is safe to repeat on the next pass: adding
//! an already joined node or resharding zero slots does nothing. Shard
//! removal stops with [`Error::UnhealthyNodes`] as soon as the node table
//! shows a failing member.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crd::RedisCluster;
use crate::error::{Error, Result};
use crate::health;
use crate::node::{AdminPayload, Member, NodeDirectory, NodeRecord, NodeRole};
use crate::platform::{emit, ClusterEvent, Platform};

/// Runs scaling playbooks for one cluster.
pub struct ScalingOrchestrator<'a> {
    platform: Arc<dyn Platform>,
    directory: &'a NodeDirectory,
    cluster: &'a RedisCluster,
}

impl<'a> ScalingOrchestrator<'a> {
    pub fn new(platform: Arc<dyn Platform>, directory: &'a NodeDirectory, cluster: &'a RedisCluster) -> Self {
        Self {
            platform,
            directory,
            cluster,
        }
    }

    async fn event(&self, event: ClusterEvent) {
        emit(self.platform.as_ref(), self.cluster, event).await;
    }

    async fn anchor_endpoint(&self) -> Result<String> {
        self.directory.endpoint(Member::leader(0)).await
    }

    async fn run(&self, payload: AdminPayload) -> Result<String> {
        self.run_in(Member::leader(0), payload).await
    }

    async fn run_in(&self, member: Member, payload: AdminPayload) -> Result<String> {
        let command = self.directory.admin(payload);
        match self.directory.run_admin(member, &command).await {
            Ok(output) => Ok(output),
            Err(e) => {
                self.event(ClusterEvent::warning(
                    "AdminCommandFailed",
                    format!("cluster {} failed: {e}", command.name()),
                ))
                .await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Scale down
    // ========================================================================

    /// Scale-down may start once every running leader is a joined master.
    pub async fn ready_for_scale_down(&self, running: i32) -> Result<bool> {
        let records = self.directory.query_node_table(Member::leader(0)).await?;
        Ok(health::count_masters(&records) == usize::try_from(running).unwrap_or(0))
    }

    /// Some leader with index in `desired..running` still owns slots.
    pub async fn retiring_shards_own_slots(&self, running: i32, desired: i32) -> Result<bool> {
        let ownership = self.directory.query_slot_map(Member::leader(0)).await?;
        for shard in desired..running {
            let node_id = self.directory.node_id(Member::leader(shard)).await?;
            let slots = ownership.slots_of(&node_id);
            if slots > 0 {
                debug!(shard = shard, slots = slots, "Retiring shard still owns slots");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fails with [`Error::UnhealthyNodes`] when leader 0 sees failing members.
    async fn ensure_healthy(&self) -> Result<()> {
        let records = self.directory.query_node_table(Member::leader(0)).await?;
        match health::count_unhealthy(&records) {
            0 => Ok(()),
            unhealthy => {
                warn!(cluster = %self.directory.cluster(), unhealthy = unhealthy, "Unhealthy nodes, pausing scale-down");
                Err(Error::UnhealthyNodes { unhealthy })
            }
        }
    }

    /// Remove shards `running - 1` down to `desired`, then rebalance.
    ///
    /// Health is checked before every shard and before the rebalance; an
    /// unhealthy member stops the playbook. A failed failover aborts it too.
    /// Other failures are recorded and the remaining shards are still
    /// processed; the last such error is returned at the end.
    pub async fn scale_down(&self, running: i32, desired: i32) -> Result<()> {
        let mut last_error = None;

        for shard in (desired..running).rev() {
            self.ensure_healthy().await?;
            info!(cluster = %self.directory.cluster(), shard = shard, "Removing shard");
            self.event(ClusterEvent::normal(
                "ScalingDown",
                format!("removing shard {shard}"),
            ))
            .await;

            match self.remove_shard(shard, desired).await {
                Ok(()) => {}
                Err(ShardFailure::Promotion(e)) => {
                    self.event(ClusterEvent::warning(
                        "FailoverFailed",
                        format!("shard {shard} could not be promoted: {e}"),
                    ))
                    .await;
                    return Err(e);
                }
                Err(ShardFailure::Step(e)) => {
                    warn!(cluster = %self.directory.cluster(), shard = shard, error = %e, "Shard removal incomplete");
                    last_error = Some(e);
                }
            }
        }

        self.ensure_healthy().await?;
        if let Err(e) = self.rebalance(false).await {
            last_error = Some(e);
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn remove_shard(&self, shard: i32, desired: i32) -> std::result::Result<(), ShardFailure> {
        self.promote(Member::leader(shard))
            .await
            .map_err(ShardFailure::Promotion)?;
        self.detach_and_remove(shard, desired)
            .await
            .map_err(ShardFailure::Step)
    }

    /// Fail over to `member` unless it already is a master.
    async fn promote(&self, member: Member) -> Result<()> {
        if self.directory.query_role(member).await? != NodeRole::Master {
            self.directory.failover(member).await?;
        }
        Ok(())
    }

    /// Detach followers, move slots away and remove the shard's leader.
    async fn detach_and_remove(&self, shard: i32, desired: i32) -> Result<()> {
        let member = Member::leader(shard);
        let node_id = self.directory.node_id(member).await?;
        let anchor = self.anchor_endpoint().await?;

        let mut last_error = None;
        for replica in self.directory.replicas_of(&node_id).await? {
            let payload = AdminPayload::DelNode {
                existing: anchor.clone(),
                node_id: replica.id().to_string(),
            };
            if let Err(e) = self.run(payload).await {
                last_error = Some(e);
            }
        }

        let slots = self
            .directory
            .query_slot_map(Member::leader(0))
            .await?
            .slots_of(&node_id);
        if slots > 0 {
            let target = Member::leader(shard % desired.max(1));
            let target_id = self.directory.node_id(target).await?;
            info!(shard = shard, slots = slots, to = %target_id, "Migrating slots off shard");
            self.run_in(
                target,
                AdminPayload::Reshard {
                    endpoint: anchor.clone(),
                    from: node_id.clone(),
                    to: target_id,
                    slots,
                },
            )
            .await?;
        }

        self.run(AdminPayload::DelNode {
            existing: anchor,
            node_id,
        })
        .await?;

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Scale up and bootstrap
    // ========================================================================

    /// Form the cluster from the first `leaders` leader pods.
    pub async fn create_cluster(&self, leaders: i32) -> Result<()> {
        let mut endpoints = Vec::new();
        for index in 0..leaders {
            endpoints.push(self.directory.endpoint(Member::leader(index)).await?);
        }
        self.event(ClusterEvent::normal(
            "ClusterCreate",
            format!("creating cluster from {leaders} leaders"),
        ))
        .await;
        self.run(AdminPayload::Create { endpoints }).await?;
        Ok(())
    }

    /// Join leader `index` as a new master.
    pub async fn add_leader(&self, index: i32) -> Result<()> {
        let new = self.directory.endpoint(Member::leader(index)).await?;
        let existing = self.anchor_endpoint().await?;
        self.event(ClusterEvent::normal(
            "ScalingUp",
            format!("adding leader {index}"),
        ))
        .await;
        self.run(AdminPayload::AddNode {
            new,
            existing,
            as_replica: false,
        })
        .await?;
        Ok(())
    }

    /// Attach followers that are not yet in the node table; follower `i`
    /// joins through leader `i % leaders`.
    pub async fn join_followers(&self, records: &[NodeRecord], leaders: i32, followers: i32) -> Result<usize> {
        let mut joined = 0;
        let mut last_error = None;

        for index in 0..followers {
            let follower = Member::follower(index);
            if self.directory.is_member_listed(records, follower).await? {
                continue;
            }
            let leader = Member::leader(index % leaders.max(1));
            let payload = AdminPayload::AddNode {
                new: self.directory.endpoint(follower).await?,
                existing: self.directory.endpoint(leader).await?,
                as_replica: true,
            };
            info!(follower = index, leader = leader.index, "Joining follower");
            match self.run(payload).await {
                Ok(_) => joined += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(joined),
        }
    }

    /// Rebalance slots, optionally onto empty masters only.
    pub async fn rebalance(&self, use_empty_masters: bool) -> Result<()> {
        let endpoint = self.anchor_endpoint().await?;
        self.run(AdminPayload::Rebalance {
            endpoint,
            use_empty_masters,
        })
        .await?;
        Ok(())
    }
}

/// Why a shard could not be removed.
enum ShardFailure {
    /// The shard's member could not be made a master; nothing may be removed.
    Promotion(Error),
    /// A later step failed; other shards can still proceed.
    Step(Error),
}
