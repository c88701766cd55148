//! Topology reconciliation integration tests
//!
//! Whole passes against the in-memory platform and a scripted cluster.

#[allow(dead_code)]
mod common;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use common::*;
use shardkeeper::crd::{ClusterState, RedisCluster, RedisClusterStatus, SKIP_RECONCILE_ANNOTATION};
use shardkeeper::finalizer::FINALIZER;
use shardkeeper::labels::ROLE_LABEL;
use shardkeeper::naming::Role;
use shardkeeper::status;
use shardkeeper::workload::builder::statefulset;
use shardkeeper::{Next, TopologyController};

const LEADER_0: &str = "cache-leader-0";
const THREE_LEADERS: &str = r#"{"clusterSize":3,"redisFollower":{"replicas":0}}"#;
const FOUR_LEADERS: &str = r#"{"clusterSize":4,"redisFollower":{"replicas":0}}"#;
const TWO_LEADERS: &str = r#"{"clusterSize":2,"redisFollower":{"replicas":0}}"#;

/// A cluster whose stored status already reads `state` for its spec.
fn with_status(mut cluster: RedisCluster, state: ClusterState, reason: &str) -> RedisCluster {
    let generation = 2;
    cluster.metadata.generation = Some(generation);
    cluster.status = Some(RedisClusterStatus {
        state,
        reason: reason.to_string(),
        ready_leader_replicas: cluster.spec.leader_replicas(),
        ready_follower_replicas: cluster.spec.follower_replicas(),
        observed_generation: Some(generation),
    });
    cluster
}

struct Harness {
    platform: Arc<FakePlatform>,
    transport: Arc<FakeTransport>,
}

impl Harness {
    fn new(leaders: i32, followers: i32) -> Self {
        let platform = Arc::new(FakePlatform::new());
        let transport = Arc::new(FakeTransport::new());
        seed_pods(&platform, leaders, followers);
        transport.reply_all("CLUSTER INFO", CLUSTER_INFO_OK);
        transport.reply_all("INFO replication", ROLE_MASTER);
        Self { platform, transport }
    }

    fn node_table(&self, lines: &[String]) {
        self.transport.reply(LEADER_0, "CLUSTER NODES", &lines.join("\n"));
    }

    fn controller(&self) -> TopologyController {
        TopologyController::new(self.platform.clone(), self.transport.clone(), config())
    }

    async fn reconcile(&self, cluster: &RedisCluster) -> Next {
        self.controller().reconcile(cluster).await.unwrap()
    }

    fn last_status(&self) -> (ClusterState, String) {
        let status = self.platform.statuses().pop().expect("a status write");
        (status.state, status.reason)
    }

    /// Both workloads already running at `running`'s size.
    fn seed_workloads(&self, running: &RedisCluster) {
        self.platform
            .insert_statefulset(statefulset(running, Role::Leader, &config()));
        self.platform
            .insert_statefulset(statefulset(running, Role::Follower, &config()));
    }

    /// Node ids for every leader, and a slot map read from the node table.
    fn script_slot_lookup(&self, leaders: i32) {
        self.transport
            .reply_with(Some(LEADER_0), "CLUSTER SLOTS", shardkeeper::node::Reply::Bulk(String::new()));
        for i in 0..leaders {
            self.transport
                .reply(&format!("cache-leader-{i}"), "CLUSTER MYID", &node_id(Role::Leader, i));
        }
    }

    fn exec_pods(&self, subcommand: &str) -> Vec<String> {
        self.platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec { pod, argv } if argv[2] == subcommand => Some(pod),
                _ => None,
            })
            .collect()
    }
}

// =============================================================================
// Steady state
// =============================================================================

#[tokio::test]
async fn test_formed_cluster_becomes_ready_without_admin_commands() {
    let h = Harness::new(3, 0);
    h.node_table(&healthy_masters(3));
    let cluster = cluster(THREE_LEADERS);

    let next = h.reconcile(&cluster).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(10)));
    assert!(h.platform.execs().is_empty());

    let states: Vec<ClusterState> = h.platform.statuses().iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![ClusterState::Initializing, ClusterState::Bootstrap, ClusterState::Ready]
    );
    let ready = h.platform.statuses().pop().unwrap();
    assert_eq!(ready.reason, status::REASON_READY);
    assert_eq!(ready.ready_leader_replicas, 3);
    assert_eq!(ready.ready_follower_replicas, 0);

    assert!(h.platform.calls().contains(&Call::Finalizers(vec![FINALIZER.to_string()])));
    assert_eq!(
        h.platform.service_names(),
        vec!["cache-leader", "cache-leader-additional", "cache-leader-headless"]
    );
    assert!(h.platform.statefulset("cache-leader").is_some());
    assert!(h.platform.statefulset("cache-follower").is_some());
}

#[tokio::test]
async fn test_role_labels_follow_replication_role() {
    let h = Harness::new(3, 0);
    h.node_table(&healthy_masters(3));
    h.transport.reply("cache-leader-2", "INFO replication", ROLE_REPLICA);

    h.reconcile(&cluster(THREE_LEADERS)).await;

    let label = |pod: &str| {
        h.platform
            .pod(pod)
            .and_then(|p| p.metadata.labels)
            .and_then(|l| l.get(ROLE_LABEL).cloned())
    };
    assert_eq!(label("cache-leader-0").as_deref(), Some("master"));
    assert_eq!(label("cache-leader-2").as_deref(), Some("slave"));
}

#[tokio::test]
async fn test_role_label_conflicts_are_retried() {
    let h = Harness::new(3, 0);
    h.node_table(&healthy_masters(3));
    h.platform.conflict_pods(2);

    h.reconcile(&cluster(THREE_LEADERS)).await;

    assert_eq!(h.platform.count_calls(|c| matches!(c, Call::ReplacePod(_))), 3);
    assert!(!h.platform.event_reasons().contains(&"RoleLabelFailed".to_string()));
}

#[tokio::test]
async fn test_dynamic_config_applied_before_ready() {
    let h = Harness::new(3, 0);
    h.node_table(&healthy_masters(3));
    let cluster = cluster(
        r#"{"clusterSize":3,"redisFollower":{"replicas":0},
            "redisConfig":{"dynamicConfig":["maxmemory-policy allkeys-lru"]}}"#,
    );

    h.reconcile(&cluster).await;

    let sets = h.transport.calls_to("CONFIG SET");
    assert_eq!(sets.len(), 3);
    assert!(sets
        .iter()
        .all(|(_, line)| line == "CONFIG SET maxmemory-policy allkeys-lru"));
    assert_eq!(h.last_status().0, ClusterState::Ready);
}

#[tokio::test]
async fn test_ready_cluster_with_open_slots_loses_ready() {
    let h = Harness::new(3, 0);
    let ranges = slot_ranges(3);
    h.node_table(&[
        master_line(0, "myself,master", &format!("{} [5->-x]", ranges[0])),
        master_line(1, "master", &ranges[1]),
        master_line(2, "master", &ranges[2]),
    ]);
    let cluster = with_status(cluster(THREE_LEADERS), ClusterState::Ready, status::REASON_READY);
    h.seed_workloads(&cluster);

    let next = h.reconcile(&cluster).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(10)));
    assert_eq!(
        h.last_status(),
        (ClusterState::Initializing, status::REASON_NOT_STABLE.to_string())
    );
    let written = h.platform.statuses().pop().unwrap();
    assert_eq!(written.ready_leader_replicas, 3);
    assert_eq!(written.observed_generation, Some(2));
}

#[tokio::test]
async fn test_disruption_budgets_follow_role_settings() {
    let h = Harness::new(3, 3);
    let mut table = healthy_masters(3);
    for i in 0..3 {
        table.push(replica_line(Role::Follower, i, &node_id(Role::Leader, i)));
    }
    h.node_table(&table);

    let both = cluster(
        r#"{"clusterSize":3,"redisLeader":{"pdb":{"enabled":true}},
            "redisFollower":{"pdb":{"enabled":true,"maxUnavailable":1}}}"#,
    );
    h.reconcile(&both).await;

    let leader = h.platform.budget("cache-leader").expect("leader budget");
    assert_eq!(
        leader.spec.unwrap().min_available,
        Some(IntOrString::Int(2))
    );
    assert!(h.platform.budget("cache-follower").is_some());

    h.platform.clear_calls();
    h.reconcile(&cluster(r#"{"clusterSize":3,"redisLeader":{"pdb":{"enabled":true}}}"#))
        .await;

    let calls = h.platform.calls();
    assert!(calls.contains(&Call::ApplyBudget("cache-leader".to_string())));
    assert!(calls.contains(&Call::DeleteBudget("cache-follower".to_string())));
    assert!(h.platform.budget("cache-follower").is_none());
    assert!(h.platform.budget("cache-leader").is_some());
}

#[tokio::test]
async fn test_skip_annotation_does_nothing() {
    let h = Harness::new(3, 0);
    let mut cluster = cluster(THREE_LEADERS);
    cluster
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SKIP_RECONCILE_ANNOTATION.to_string(), "true".to_string());

    assert_eq!(h.reconcile(&cluster).await, Next::Done);
    assert!(h.platform.calls().is_empty());
    assert!(h.transport.calls().is_empty());
}

// =============================================================================
// Bootstrap
// =============================================================================

#[tokio::test]
async fn test_unready_leaders_wait() {
    let h = Harness::new(3, 0);
    h.platform.hold_not_ready("cache-leader");

    let next = h.reconcile(&cluster(THREE_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(120)));
    assert!(h.platform.statefulset("cache-follower").is_none());
    assert_eq!(
        h.last_status(),
        (ClusterState::Initializing, status::REASON_INITIALIZING_LEADERS.to_string())
    );
}

#[tokio::test]
async fn test_unformed_cluster_is_created() {
    let h = Harness::new(3, 0);
    h.node_table(&[master_line(0, "myself,master", "")]);

    let next = h.reconcile(&cluster(THREE_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(60)));
    let execs = h.platform.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0][2], "create");
    assert_eq!(execs[0].len(), 3 + 3 + 1);
}

#[tokio::test]
async fn test_single_leader_gets_every_slot() {
    let h = Harness::new(1, 0);
    h.transport.reply_all(
        "CLUSTER INFO",
        "cluster_state:fail\r\ncluster_slots_assigned:0\r\n",
    );
    h.node_table(&[master_line(0, "myself,master", "0-16383")]);

    let cluster = cluster(r#"{"clusterSize":1,"redisFollower":{"replicas":0}}"#);
    h.reconcile(&cluster).await;

    let assigned = h.transport.calls_to("CLUSTER ADDSLOTSRANGE");
    assert_eq!(
        assigned,
        vec![(LEADER_0.to_string(), "CLUSTER ADDSLOTSRANGE 0 16383".to_string())]
    );
    // Still not stable: the diagnostic check runs and reports.
    assert_eq!(h.platform.execs()[0][2], "check");
    assert!(h.platform.event_reasons().contains(&"ClusterCheckFailed".to_string()));
}

#[tokio::test]
async fn test_followers_join_round_robin() {
    let h = Harness::new(3, 3);
    h.node_table(&healthy_masters(3));

    let next = h.reconcile(&cluster(r#"{"clusterSize":3}"#)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(60)));
    let execs = h.platform.execs();
    assert_eq!(execs.len(), 3);
    assert!(execs.iter().all(|argv| argv[2] == "add-node"));
    assert!(execs.iter().all(|argv| argv.last().map(String::as_str) == Some("--cluster-slave")));
    assert!(execs[1][3].starts_with("cache-follower-1."));
    assert!(execs[1][4].starts_with("cache-leader-1."));
}

#[tokio::test]
async fn test_new_leader_joins_then_rebalances() {
    let h = Harness::new(4, 0);
    h.node_table(&healthy_masters(3));

    let cluster = cluster(r#"{"clusterSize":4,"redisFollower":{"replicas":0}}"#);
    h.reconcile(&cluster).await;

    let execs = h.platform.execs();
    assert_eq!(execs[0][2], "add-node");
    assert!(execs[0][3].starts_with("cache-leader-3."));
    assert_eq!(execs[1][2], "rebalance");
    assert_eq!(execs[1].last().map(String::as_str), Some("--cluster-use-empty-masters"));
}

#[tokio::test]
async fn test_empty_master_triggers_rebalance() {
    let h = Harness::new(3, 0);
    let mut table = healthy_masters(2);
    table.push(master_line(2, "master", ""));
    h.node_table(&table);

    let next = h.reconcile(&cluster(THREE_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(10)));
    let execs = h.platform.execs();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0][2], "rebalance");
    assert_ne!(h.last_status().0, ClusterState::Ready);
}

// =============================================================================
// Scale down
// =============================================================================

#[tokio::test]
async fn test_shrinking_runs_scale_down_before_workload_update() {
    let h = Harness::new(4, 0);
    h.node_table(&healthy_masters(4));
    h.script_slot_lookup(4);
    h.seed_workloads(&cluster(FOUR_LEADERS));

    let next = h.reconcile(&cluster(TWO_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(10)));
    assert_eq!(
        h.last_status(),
        (ClusterState::Initializing, status::REASON_SCALING.to_string())
    );
    let subcommands: Vec<String> = h.platform.execs().iter().map(|a| a[2].clone()).collect();
    assert_eq!(
        subcommands,
        vec!["reshard", "del-node", "reshard", "del-node", "rebalance"]
    );
    // Slots move from the receiving leader's container.
    assert_eq!(h.exec_pods("reshard"), vec!["cache-leader-1", "cache-leader-0"]);
    assert_eq!(h.exec_pods("del-node"), vec![LEADER_0, LEADER_0]);
    // The workload keeps its size until the shards are gone.
    let stored = h.platform.statefulset("cache-leader").unwrap();
    assert_eq!(stored.spec.unwrap().replicas, Some(4));
}

#[tokio::test]
async fn test_workload_shrinks_once_shards_are_gone() {
    let h = Harness::new(4, 0);
    h.node_table(&healthy_masters(2));
    h.script_slot_lookup(4);
    h.seed_workloads(&cluster(FOUR_LEADERS));

    let next = h.reconcile(&cluster(TWO_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(10)));
    let stored = h.platform.statefulset("cache-leader").unwrap();
    assert_eq!(stored.spec.unwrap().replicas, Some(2));
    assert!(h.platform.execs().is_empty());
}

#[tokio::test]
async fn test_workload_kept_while_retiring_shard_owns_slots() {
    let h = Harness::new(4, 0);
    // Shard 2 already left; shard 3 is still a master with slots.
    let ranges = slot_ranges(3);
    h.node_table(&[
        master_line(0, "myself,master", &ranges[0]),
        master_line(1, "master", &ranges[1]),
        master_line(3, "master", &ranges[2]),
    ]);
    h.script_slot_lookup(4);
    h.seed_workloads(&cluster(FOUR_LEADERS));

    let next = h.reconcile(&cluster(TWO_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(120)));
    let stored = h.platform.statefulset("cache-leader").unwrap();
    assert_eq!(stored.spec.unwrap().replicas, Some(4));
    assert!(h.platform.execs().is_empty());
}

#[tokio::test]
async fn test_scale_down_waits_for_failed_master_repair() {
    let h = Harness::new(4, 0);
    let ranges = slot_ranges(4);
    h.node_table(&[
        master_line(0, "myself,master", &ranges[0]),
        master_line(1, "master,fail", &ranges[1]),
        master_line(2, "master", &ranges[2]),
        master_line(3, "master", &ranges[3]),
    ]);
    h.script_slot_lookup(4);
    h.seed_workloads(&cluster(FOUR_LEADERS));

    let next = h.reconcile(&cluster(TWO_LEADERS)).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(60)));
    assert!(h.platform.execs().is_empty());
    assert_eq!(
        h.transport.calls_to("CLUSTER MEET"),
        vec![(LEADER_0.to_string(), "CLUSTER MEET 10.0.0.2 6379".to_string())]
    );
    assert_eq!(
        h.last_status(),
        (ClusterState::Failed, status::REASON_UNHEALTHY.to_string())
    );
    assert!(h.platform.event_reasons().contains(&"ScalingPaused".to_string()));
    let stored = h.platform.statefulset("cache-leader").unwrap();
    assert_eq!(stored.spec.unwrap().replicas, Some(4));
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_broken_cluster_is_declared_failed() {
    let h = Harness::new(3, 0);
    let ranges = slot_ranges(3);
    h.node_table(&[
        master_line(0, "myself,master", &ranges[0]),
        master_line(1, "master,fail", &ranges[1]),
        master_line(2, "master,fail", &ranges[2]),
    ]);

    let next = h.reconcile(&cluster(THREE_LEADERS)).await;

    assert_eq!(next, Next::Done);
    assert_eq!(
        h.last_status(),
        (ClusterState::Failed, status::REASON_BROKEN.to_string())
    );
    assert!(h.platform.event_reasons().contains(&"ClusterBroken".to_string()));
    // Both failed masters were met again before giving up.
    let meets = h.transport.calls_to("CLUSTER MEET");
    assert!(meets.iter().any(|(_, line)| line == "CLUSTER MEET 10.0.0.2 6379"));
    assert!(meets.iter().any(|(_, line)| line == "CLUSTER MEET 10.0.0.3 6379"));
}

#[tokio::test]
async fn test_single_unhealthy_node_fails_ready_cluster_without_giving_up() {
    let h = Harness::new(4, 0);
    let ranges = slot_ranges(4);
    h.node_table(&[
        master_line(0, "myself,master", &ranges[0]),
        master_line(1, "master", &ranges[1]),
        master_line(2, "master", &ranges[2]),
        master_line(3, "master,fail", &ranges[3]),
    ]);
    let cluster = with_status(cluster(FOUR_LEADERS), ClusterState::Ready, status::REASON_READY);
    h.seed_workloads(&cluster);

    let next = h.reconcile(&cluster).await;

    assert_eq!(next, Next::RequeueAfter(Duration::from_secs(60)));
    assert!(h.platform.event_reasons().contains(&"NodesUnhealthy".to_string()));
    assert_eq!(
        h.last_status(),
        (ClusterState::Failed, status::REASON_UNHEALTHY.to_string())
    );
}

#[tokio::test]
async fn test_broken_cluster_is_left_alone_until_spec_changes() {
    let h = Harness::new(3, 0);
    let ranges = slot_ranges(3);
    h.node_table(&[
        master_line(0, "myself,master", &ranges[0]),
        master_line(1, "master,fail", &ranges[1]),
        master_line(2, "master,fail", &ranges[2]),
    ]);
    let mut cluster = with_status(cluster(THREE_LEADERS), ClusterState::Failed, status::REASON_BROKEN);

    assert_eq!(h.reconcile(&cluster).await, Next::Done);
    assert!(h.transport.calls_to("CLUSTER MEET").is_empty());
    assert!(h.platform.statuses().is_empty());
    assert!(h.platform.execs().is_empty());

    // An edited spec gets another round of repair.
    cluster.metadata.generation = Some(3);
    assert_eq!(h.reconcile(&cluster).await, Next::Done);
    assert!(!h.transport.calls_to("CLUSTER MEET").is_empty());
    let written = h.platform.statuses().pop().unwrap();
    assert_eq!(written.reason, status::REASON_BROKEN);
    assert_eq!(written.observed_generation, Some(3));
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_deletion_removes_claims_and_finalizer() {
    let h = Harness::new(1, 0);
    let mut cluster = cluster(
        r#"{"clusterSize":1,"redisFollower":{"replicas":1},"storage":{"nodeConfVolume":true}}"#,
    );
    cluster.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    h.platform.insert_claim(data_claim(Role::Leader, 0, "1Gi"));

    let next = h.reconcile(&cluster).await;

    assert_eq!(next, Next::Done);
    let calls = h.platform.calls();
    assert!(calls.contains(&Call::DeleteClaim("cache-leader-cache-leader-0".to_string())));
    assert!(calls.contains(&Call::DeleteClaim("node-conf-cache-follower-0".to_string())));
    assert_eq!(calls.last(), Some(&Call::Finalizers(Vec::new())));
    assert!(h.platform.claim("cache-leader-cache-leader-0").is_none());
}
