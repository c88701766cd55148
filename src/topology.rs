//! Per-cluster reconciliation pass.
//!
//! One call to [`TopologyController::reconcile`] moves a `RedisCluster` one
//! step closer to its desired topology:
//!
//! 1. Deletion runs the finalizer; the skip annotation ends the pass, and so
//!    does a cluster declared broken for the current spec generation.
//! 2. A shrinking leader count runs the scale-down playbook and requeues.
//!    Unhealthy members pause it until repaired.
//! 3. Leader, then follower, workloads, services and disruption budgets are
//!    applied.
//! 4. Once both workloads are ready, members are joined until the node
//!    count matches the desired total.
//! 5. Health is checked and repaired; a stable cluster gets its dynamic
//!    configuration and is marked `Ready`. An unstable one loses `Ready`.
//!
//! Role labels are refreshed at the end of every pass that reached the
//! workloads.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{ClusterState, RedisCluster, SKIP_RECONCILE_ANNOTATION};
use crate::error::{Error, Result};
use crate::finalizer;
use crate::health::{self, RepairOutcome};
use crate::labels;
use crate::naming::{workload_name, Role};
use crate::node::{check_passed, AdminPayload, Member, NodeDirectory, NodeTransport};
use crate::platform::{emit, ClusterEvent, Platform};
use crate::scaling::ScalingOrchestrator;
use crate::status::{self, StatusWriter};
use crate::workload::{self, builder, UpdatePolicy, WorkloadReconciler};

/// What the controlling framework should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait for the next change to the resource.
    Done,
    RequeueAfter(Duration),
}

/// Reconciles `RedisCluster` resources.
pub struct TopologyController {
    platform: Arc<dyn Platform>,
    transport: Arc<dyn NodeTransport>,
    config: OperatorConfig,
}

impl TopologyController {
    pub fn new(platform: Arc<dyn Platform>, transport: Arc<dyn NodeTransport>, config: OperatorConfig) -> Self {
        Self {
            platform,
            transport,
            config,
        }
    }

    /// Run one pass for `cluster`.
    pub async fn reconcile(&self, cluster: &RedisCluster) -> Result<Next> {
        if cluster.metadata.deletion_timestamp.is_some() {
            finalizer::finalize(self.platform.as_ref(), cluster, &self.config).await?;
            return Ok(Next::Done);
        }
        if cluster
            .annotations()
            .get(SKIP_RECONCILE_ANNOTATION)
            .is_some_and(|v| v == "true")
        {
            info!("Reconcile skipped by annotation");
            return Ok(Next::Done);
        }
        finalizer::ensure(self.platform.as_ref(), cluster).await?;

        let directory = NodeDirectory::for_cluster(
            self.platform.clone(),
            self.transport.clone(),
            cluster,
            &self.config,
        )
        .await?;
        let mut pass = Pass {
            controller: self,
            cluster,
            directory: &directory,
            status: StatusWriter::new(self.platform.as_ref(), cluster),
        };

        let next = pass.run().await;
        pass.refresh_labels().await;
        next
    }
}

/// State of a single pass.
struct Pass<'a> {
    controller: &'a TopologyController,
    cluster: &'a RedisCluster,
    directory: &'a NodeDirectory,
    status: StatusWriter<'a>,
}

impl Pass<'_> {
    fn platform(&self) -> &dyn Platform {
        self.controller.platform.as_ref()
    }

    fn config(&self) -> &OperatorConfig {
        &self.controller.config
    }

    fn namespace(&self) -> &str {
        self.directory.namespace()
    }

    async fn event(&self, event: ClusterEvent) {
        emit(self.platform(), self.cluster, event).await;
    }

    fn scaling(&self) -> ScalingOrchestrator<'_> {
        ScalingOrchestrator::new(self.controller.platform.clone(), self.directory, self.cluster)
    }

    async fn run(&mut self) -> Result<Next> {
        let leaders = self.cluster.spec.leader_replicas();
        let followers = self.cluster.spec.follower_replicas();
        let total = self.cluster.spec.total_replicas();
        let requeue = self.config().requeue.clone();
        let name = self.cluster.name_any();

        if self.status.broken_at_current_generation() {
            info!("Cluster is broken, waiting for a spec change");
            return Ok(Next::Done);
        }

        // Scale down before the leader workload shrinks.
        let stored_leader = self
            .platform()
            .get_statefulset(self.namespace(), &workload_name(&name, Role::Leader))
            .await?;
        if let Some(sts) = &stored_leader {
            let running = workload::spec_replicas(sts);
            if running > leaders {
                if let Some(next) = self.scale_down(running, leaders).await? {
                    return Ok(next);
                }
            }
        }

        // Leader workload.
        let ready_leaders = stored_leader.as_ref().map_or(0, workload::ready_replicas);
        if ready_leaders != leaders {
            let ready_followers = self.status.current().ready_follower_replicas;
            self.status
                .set(
                    ClusterState::Initializing,
                    status::REASON_INITIALIZING_LEADERS,
                    ready_leaders,
                    ready_followers,
                )
                .await?;
        }
        self.apply_role(Role::Leader, leaders > 0).await?;

        let Some(leader_sts) = self.get_workload(Role::Leader).await? else {
            return Ok(Next::RequeueAfter(requeue.not_ready()));
        };
        if !workload::is_ready(&leader_sts) {
            debug!("Leader workload not ready");
            return Ok(Next::RequeueAfter(requeue.not_ready()));
        }

        // Follower workload.
        let stored_follower = self.get_workload(Role::Follower).await?;
        let ready_followers = stored_follower.as_ref().map_or(0, workload::ready_replicas);
        if ready_followers != followers {
            self.status
                .set(
                    ClusterState::Initializing,
                    status::REASON_INITIALIZING_FOLLOWERS,
                    workload::ready_replicas(&leader_sts),
                    ready_followers,
                )
                .await?;
        }
        self.apply_role(Role::Follower, followers > 0).await?;

        let follower_ready = self
            .get_workload(Role::Follower)
            .await?
            .is_some_and(|sts| workload::is_ready(&sts));
        if !follower_ready {
            debug!("Follower workload not ready");
            return Ok(Next::RequeueAfter(requeue.not_ready()));
        }

        let current = self.status.current();
        if current.ready_leader_replicas != leaders || current.ready_follower_replicas != followers {
            self.status
                .set(ClusterState::Bootstrap, status::REASON_BOOTSTRAP, leaders, followers)
                .await?;
        }

        // Membership.
        let anchor = Member::leader(0);
        if leaders == 1 {
            let info = self.directory.query_cluster_info(anchor).await?;
            if !health::all_slots_assigned(&info) {
                info!("Assigning all slots to the single leader");
                self.directory.assign_all_slots(anchor).await?;
            }
        }

        let records = self.directory.query_node_table(anchor).await?;
        let joined = health::count_nodes(&records);
        if joined != usize::try_from(total).unwrap_or(0) {
            if health::count_unhealthy(&records) == 0 {
                self.leave(&[ClusterState::Ready], ClusterState::Bootstrap, status::REASON_BOOTSTRAP)
                    .await?;
            }
            self.grow(&records, leaders, followers).await?;
            return Ok(Next::RequeueAfter(requeue.bootstrap()));
        }

        // Health.
        if let Some(next) = self.check_health(usize::try_from(total).unwrap_or(0)).await? {
            return Ok(next);
        }

        let records = self.directory.query_node_table(anchor).await?;
        if health::has_empty_masters(&records) {
            info!("Rebalancing onto empty masters");
            self.leave(
                &[ClusterState::Ready, ClusterState::Failed],
                ClusterState::Initializing,
                status::REASON_SCALING,
            )
            .await?;
            self.scaling().rebalance(true).await?;
            return Ok(Next::RequeueAfter(requeue.scaling()));
        }

        let info = self.directory.query_cluster_info(anchor).await?;
        if health::is_stable(&info, &records) {
            let current = self.status.current();
            if current.ready_leader_replicas == leaders && current.ready_follower_replicas == followers {
                self.apply_dynamic_config(leaders, followers).await?;
                self.status
                    .set(ClusterState::Ready, status::REASON_READY, leaders, followers)
                    .await?;
            }
        } else {
            self.leave(
                &[ClusterState::Ready, ClusterState::Failed],
                ClusterState::Initializing,
                status::REASON_NOT_STABLE,
            )
            .await?;
            self.diagnose().await;
        }

        Ok(Next::RequeueAfter(requeue.steady()))
    }

    /// Replace a status in one of the `from` states, keeping the ready counts.
    async fn leave(&mut self, from: &[ClusterState], state: ClusterState, reason: &str) -> Result<()> {
        let current = self.status.current().clone();
        if from.contains(&current.state) {
            self.status
                .set(state, reason, current.ready_leader_replicas, current.ready_follower_replicas)
                .await?;
        }
        Ok(())
    }

    /// Check and repair member health over `total` nodes. `Some` ends the
    /// pass: members are still unhealthy, or the cluster is beyond repair.
    async fn check_health(&mut self, total: usize) -> Result<Option<Next>> {
        let requeue = self.config().requeue.clone();
        let current = self.status.current().clone();
        let outcome = health::check_and_repair(self.directory, &self.config().repair_retry, total).await;

        match outcome {
            Ok(RepairOutcome::Healthy) => Ok(None),
            Ok(RepairOutcome::Repaired) => {
                self.event(ClusterEvent::normal("NodesRepaired", "unhealthy nodes recovered"))
                    .await;
                Ok(None)
            }
            Ok(RepairOutcome::Degraded { unhealthy }) => {
                self.status
                    .set(
                        ClusterState::Failed,
                        status::REASON_UNHEALTHY,
                        current.ready_leader_replicas,
                        current.ready_follower_replicas,
                    )
                    .await?;
                self.event(ClusterEvent::warning(
                    "NodesUnhealthy",
                    format!("{unhealthy} node(s) still unhealthy after repair"),
                ))
                .await;
                Ok(Some(Next::RequeueAfter(requeue.bootstrap())))
            }
            Err(Error::ClusterBroken { unhealthy, total }) => {
                warn!(unhealthy = unhealthy, total = total, "Cluster declared broken");
                self.status
                    .set(
                        ClusterState::Failed,
                        status::REASON_BROKEN,
                        current.ready_leader_replicas,
                        current.ready_follower_replicas,
                    )
                    .await?;
                self.event(ClusterEvent::warning(
                    "ClusterBroken",
                    format!("{unhealthy} of {total} nodes unhealthy, manual intervention required"),
                ))
                .await;
                Ok(Some(Next::Done))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_workload(&self, role: Role) -> Result<Option<StatefulSet>> {
        let name = workload_name(&self.cluster.name_any(), role);
        self.platform().get_statefulset(self.namespace(), &name).await
    }

    /// Apply the role's StatefulSet and, when it has members, its services
    /// and disruption budget. A role without members or with the budget
    /// disabled has its budget removed.
    async fn apply_role(&self, role: Role, with_services: bool) -> Result<()> {
        let desired = builder::statefulset(self.cluster, role, self.config());
        let policy = UpdatePolicy::from_annotations(self.cluster.annotations());
        let outcome = WorkloadReconciler::new(self.controller.platform.clone())
            .reconcile(desired, policy)
            .await?;
        debug!(role = %role, outcome = ?outcome, "Workload reconciled");

        if with_services {
            for service in builder::services(self.cluster, role) {
                self.platform().apply_service(self.namespace(), &service).await?;
            }
        }

        match builder::disruption_budget(self.cluster, role).filter(|_| with_services) {
            Some(budget) => {
                self.platform()
                    .apply_disruption_budget(self.namespace(), &budget)
                    .await
            }
            None => {
                let name = workload_name(&self.cluster.name_any(), role);
                self.platform()
                    .delete_disruption_budget(self.namespace(), &name)
                    .await
            }
        }
    }

    /// Scale-down gate and playbook. `None` means the pass continues.
    async fn scale_down(&mut self, running: i32, leaders: i32) -> Result<Option<Next>> {
        let requeue = self.config().requeue.clone();
        let leader_ready = self.get_workload(Role::Leader).await?.is_some_and(|s| workload::is_ready(&s));
        let follower_ready = self.get_workload(Role::Follower).await?.is_some_and(|s| workload::is_ready(&s));
        if !(leader_ready && follower_ready) {
            debug!("Workloads not ready, delaying scale-down");
            return Ok(Some(Next::RequeueAfter(requeue.not_ready())));
        }

        let scaling = self.scaling();
        if !scaling.ready_for_scale_down(running).await? {
            if scaling.retiring_shards_own_slots(running, leaders).await? {
                warn!(
                    running = running,
                    desired = leaders,
                    "Retiring shards still own slots, keeping the leader workload"
                );
                return Ok(Some(Next::RequeueAfter(requeue.not_ready())));
            }
            // Shards already left the cluster; let the workload shrink.
            return Ok(None);
        }

        let records = self.directory.query_node_table(Member::leader(0)).await?;
        if health::count_unhealthy(&records) > 0 {
            return self.pause_scale_down(health::count_nodes(&records)).await.map(Some);
        }

        info!(running = running, desired = leaders, "Scaling down leaders");
        let current = self.status.current().clone();
        self.status
            .set(
                ClusterState::Initializing,
                status::REASON_SCALING,
                current.ready_leader_replicas,
                current.ready_follower_replicas,
            )
            .await?;
        let result = self.scaling().scale_down(running, leaders).await;
        match result {
            Ok(()) => Ok(Some(Next::RequeueAfter(requeue.scaling()))),
            Err(Error::UnhealthyNodes { .. }) => {
                let records = self.directory.query_node_table(Member::leader(0)).await?;
                self.pause_scale_down(health::count_nodes(&records)).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    /// Repair instead of moving slots; the next pass resumes the playbook.
    async fn pause_scale_down(&mut self, nodes: usize) -> Result<Next> {
        self.event(ClusterEvent::warning(
            "ScalingPaused",
            "unhealthy nodes present, scale-down paused for repair",
        ))
        .await;
        let requeue = self.config().requeue.clone();
        Ok(self
            .check_health(nodes)
            .await?
            .unwrap_or(Next::RequeueAfter(requeue.scaling())))
    }

    /// Bring the node count up to the desired total.
    async fn grow(&self, records: &[crate::node::NodeRecord], leaders: i32, followers: i32) -> Result<()> {
        let scaling = self.scaling();
        let masters = health::count_masters(records);
        let wanted = usize::try_from(leaders).unwrap_or(0);

        if health::count_unhealthy(records) > 0 {
            warn!("Unhealthy nodes present, not growing the cluster");
            self.directory.repair_disconnected_masters().await?;
            return Ok(());
        }

        if masters != wanted {
            if masters <= 2 {
                if leaders > 1 {
                    scaling.create_cluster(leaders).await?;
                }
            } else if masters < wanted {
                let index = i32::try_from(masters).unwrap_or(i32::MAX);
                scaling.add_leader(index).await?;

                let anchor = Member::leader(0);
                let info = self.directory.query_cluster_info(anchor).await?;
                let records = self.directory.query_node_table(anchor).await?;
                if health::is_stable(&info, &records) {
                    scaling.rebalance(true).await?;
                } else {
                    debug!("Cluster not stable after add-node, rebalance deferred");
                }
            }
        } else if followers > 0 {
            let joined = scaling.join_followers(records, leaders, followers).await?;
            info!(joined = joined, "Followers joined");
        }
        Ok(())
    }

    /// Apply `"<parameter> <value>"` entries to every member.
    async fn apply_dynamic_config(&self, leaders: i32, followers: i32) -> Result<()> {
        let entries = self.cluster.spec.dynamic_config();
        if entries.is_empty() {
            return Ok(());
        }

        let members = (0..leaders)
            .map(Member::leader)
            .chain((0..followers).map(Member::follower));
        for member in members {
            for entry in entries {
                let Some((parameter, value)) = entry.trim().split_once(char::is_whitespace) else {
                    warn!(entry = %entry, "Ignoring malformed dynamic config entry");
                    continue;
                };
                self.directory
                    .config_set(member, parameter, value.trim())
                    .await?;
            }
        }
        debug!(entries = entries.len(), "Dynamic configuration applied");
        Ok(())
    }

    /// Run `cluster check` and record its verdict.
    async fn diagnose(&self) {
        let anchor = Member::leader(0);
        let result = match self.directory.endpoint(anchor).await {
            Ok(endpoint) => {
                let command = self.directory.admin(AdminPayload::Check { endpoint });
                self.directory.run_admin(anchor, &command).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(output) if check_passed(&output) => {
                debug!("Cluster check passed while cluster is not yet stable");
            }
            Ok(output) => {
                warn!(output = %output, "Cluster check failed");
                self.event(ClusterEvent::warning("ClusterCheckFailed", "cluster check reported problems"))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Cluster check could not run");
                self.event(ClusterEvent::warning("ClusterCheckFailed", e.to_string()))
                    .await;
            }
        }
    }

    async fn refresh_labels(&self) {
        let result = labels::refresh_role_labels(
            self.platform(),
            self.directory,
            &self.config().conflict_retry,
        )
        .await;
        match result {
            Ok(updated) if updated > 0 => debug!(updated = updated, "Role labels refreshed"),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Role label refresh incomplete");
                self.event(ClusterEvent::warning("RoleLabelFailed", e.to_string()))
                    .await;
            }
        }
    }
}
