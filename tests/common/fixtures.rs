//! Test fixtures and builders.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodStatus, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use shardkeeper::config::OperatorConfig;
use shardkeeper::crd::{RedisCluster, RedisClusterSpec};
use shardkeeper::naming::{pod_name, workload_name, Role};
use shardkeeper::node::NodeDirectory;
use shardkeeper::workload::builder::workload_labels;

use super::{FakePlatform, FakeTransport};

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "cache";

/// A `RedisCluster` named `cache` in `default` from a JSON spec.
pub fn cluster(spec: &str) -> RedisCluster {
    let spec: RedisClusterSpec = serde_json::from_str(spec).expect("valid spec");
    let mut cluster = RedisCluster::new(CLUSTER, spec);
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some("uid-cache".to_string());
    cluster
}

/// Deterministic pod IP: leaders in 10.0.0.x, followers in 10.0.1.x.
pub fn member_ip(role: Role, index: i32) -> String {
    let net = match role {
        Role::Leader => 0,
        Role::Follower => 1,
    };
    format!("10.0.{}.{}", net, index + 1)
}

pub fn member_pod(role: Role, index: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(CLUSTER, role, index)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(workload_labels(CLUSTER, role)),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(member_ip(role, index)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Register `leaders` leader pods and `followers` follower pods.
pub fn seed_pods(platform: &FakePlatform, leaders: i32, followers: i32) {
    for i in 0..leaders {
        platform.insert_pod(member_pod(Role::Leader, i));
    }
    for i in 0..followers {
        platform.insert_pod(member_pod(Role::Follower, i));
    }
}

/// Data claim of one member as the StatefulSet controller would create it.
pub fn data_claim(role: Role, index: i32, size: &str) -> PersistentVolumeClaim {
    let sts = workload_name(CLUSTER, role);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("{sts}-{sts}-{index}")),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), sts.clone())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config() -> OperatorConfig {
    OperatorConfig::development()
}

pub fn directory(
    platform: &Arc<FakePlatform>,
    transport: &Arc<FakeTransport>,
    cluster: &RedisCluster,
) -> NodeDirectory {
    NodeDirectory::new(platform.clone(), transport.clone(), cluster, None, &config())
        .expect("valid directory")
}

// ============================================================================
// Node tables
// ============================================================================

/// Node id used in scripted tables.
pub fn node_id(role: Role, index: i32) -> String {
    format!("{}{:038}", &role.as_str()[..1], index)
}

fn address(role: Role, index: i32) -> String {
    format!(
        "{}:6379@16379,{}",
        member_ip(role, index),
        pod_name(CLUSTER, role, index)
    )
}

/// A connected master line owning `slots`.
pub fn master_line(index: i32, flags: &str, slots: &str) -> String {
    format!(
        "{} {} {} - 0 0 {} connected {}",
        node_id(Role::Leader, index),
        address(Role::Leader, index),
        flags,
        index + 1,
        slots
    )
    .trim_end()
    .to_string()
}

/// A connected replica line.
pub fn replica_line(role: Role, index: i32, master: &str) -> String {
    format!(
        "{} {} slave {} 0 0 1 connected",
        node_id(role, index),
        address(role, index),
        master
    )
}

/// Evenly split slot ranges for `n` masters.
pub fn slot_ranges(n: i32) -> Vec<String> {
    let total = 16384;
    (0..n)
        .map(|i| {
            let start = total * i / n;
            let end = total * (i + 1) / n - 1;
            format!("{start}-{end}")
        })
        .collect()
}

/// Node table of `masters` healthy masters sharing every slot, leader 0 is
/// `myself`.
pub fn healthy_masters(masters: i32) -> Vec<String> {
    slot_ranges(masters)
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            let i = i as i32;
            let flags = if i == 0 { "myself,master" } else { "master" };
            master_line(i, flags, &range)
        })
        .collect()
}

pub const CLUSTER_INFO_OK: &str =
    "cluster_state:ok\r\ncluster_slots_assigned:16384\r\ncluster_known_nodes:3\r\n";

pub const ROLE_MASTER: &str = "# Replication\r\nrole:master\r\nconnected_slaves:0\r\n";
pub const ROLE_REPLICA: &str = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\n";
