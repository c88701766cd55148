//! Resource naming for cluster members.
//!
//! Every object the engine owns is named after the cluster and a [`Role`]:
//! workloads are `<cluster>-<role>`, pods `<cluster>-<role>-<index>`.

use std::fmt;

/// Shard role of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Leader, Role::Follower];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// StatefulSet (and client service) name for a role.
pub fn workload_name(cluster: &str, role: Role) -> String {
    format!("{cluster}-{role}")
}

pub fn pod_name(cluster: &str, role: Role, index: i32) -> String {
    format!("{cluster}-{role}-{index}")
}

pub fn headless_service_name(cluster: &str, role: Role) -> String {
    format!("{cluster}-{role}-headless")
}

pub fn additional_service_name(cluster: &str, role: Role) -> String {
    format!("{cluster}-{role}-additional")
}

/// Stable DNS name of a member behind its role's headless service.
pub fn pod_hostname(cluster: &str, role: Role, index: i32, namespace: &str) -> String {
    format!(
        "{}.{}.{}.svc",
        pod_name(cluster, role, index),
        headless_service_name(cluster, role),
        namespace
    )
}

/// Data claim name for a member. `template` overrides the claim template
/// prefix, which otherwise equals the workload name.
pub fn data_claim_name(template: Option<&str>, cluster: &str, role: Role, index: i32) -> String {
    let prefix = template
        .map(str::to_string)
        .unwrap_or_else(|| workload_name(cluster, role));
    format!("{prefix}-{cluster}-{role}-{index}")
}

pub fn node_conf_claim_name(cluster: &str, role: Role, index: i32) -> String {
    format!("node-conf-{cluster}-{role}-{index}")
}
