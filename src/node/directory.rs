//! Member lookup and command execution for one cluster.
//!
//! A [`NodeDirectory`] knows how to reach every member of a `RedisCluster`:
//! direct protocol calls go to the pod IP through a [`NodeTransport`], while
//! administrative commands run through the CLI inside a member's container.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::command::{AdminCommand, AdminPayload};
use super::record::{parse_node_table, NodeRecord, NodeRole, SlotOwnership, SLOT_COUNT};
use super::transport::{NodeTarget, NodeTransport, Reply};
use crate::config::OperatorConfig;
use crate::crd::RedisCluster;
use crate::error::{Error, Result};
use crate::naming::{pod_hostname, pod_name, workload_name, Role};
use crate::platform::Platform;

/// One member of the cluster, addressed by role and ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub role: Role,
    pub index: i32,
}

impl Member {
    pub fn leader(index: i32) -> Self {
        Self {
            role: Role::Leader,
            index,
        }
    }

    pub fn follower(index: i32) -> Self {
        Self {
            role: Role::Follower,
            index,
        }
    }
}

/// Resolves members and runs commands against them.
pub struct NodeDirectory {
    platform: Arc<dyn Platform>,
    transport: Arc<dyn NodeTransport>,
    cluster: String,
    namespace: String,
    port: u16,
    hostnames: bool,
    password: Option<String>,
    tls_ca: Option<String>,
    admin_binary: String,
}

impl NodeDirectory {
    /// Build a directory for `cluster`, reading the password from its secret
    /// when one is configured.
    pub async fn for_cluster(
        platform: Arc<dyn Platform>,
        transport: Arc<dyn NodeTransport>,
        cluster: &RedisCluster,
        config: &OperatorConfig,
    ) -> Result<Self> {
        let namespace = cluster.namespace().unwrap_or_default();
        let password = match &cluster.spec.kubernetes_config.redis_secret {
            Some(secret) => {
                platform
                    .read_secret_key(&namespace, &secret.name, &secret.key)
                    .await?
            }
            None => None,
        };
        Self::new(platform, transport, cluster, password, config)
    }

    pub fn new(
        platform: Arc<dyn Platform>,
        transport: Arc<dyn NodeTransport>,
        cluster: &RedisCluster,
        password: Option<String>,
        config: &OperatorConfig,
    ) -> Result<Self> {
        let spec = &cluster.spec;
        let port = u16::try_from(spec.port).map_err(|_| Error::InvalidConfig {
            field: "port".into(),
            reason: format!("{} is not a valid port", spec.port),
        })?;
        let tls_ca = spec
            .tls
            .as_ref()
            .map(|tls| format!("{}/{}", config.tls_mount_path.trim_end_matches('/'), tls.ca));

        Ok(Self {
            platform,
            transport,
            cluster: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            port,
            hostnames: spec.uses_hostnames(),
            password,
            tls_ca,
            admin_binary: config.admin_binary.clone(),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pod_name(&self, member: Member) -> String {
        pod_name(&self.cluster, member.role, member.index)
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// IP of a pod, failing when the pod is missing or not yet scheduled.
    pub async fn pod_ip_by_name(&self, pod: &str) -> Result<String> {
        let found = self
            .platform
            .get_pod(&self.namespace, pod)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pod {}/{}", self.namespace, pod)))?;
        pod_ip(&found).ok_or_else(|| Error::NotFound(format!("IP of pod {}/{}", self.namespace, pod)))
    }

    pub async fn pod_ip(&self, member: Member) -> Result<String> {
        self.pod_ip_by_name(&self.pod_name(member)).await
    }

    /// Endpoint used in administrative commands: the stable hostname when
    /// members advertise hostnames, otherwise the pod IP.
    pub async fn endpoint(&self, member: Member) -> Result<String> {
        if self.hostnames {
            let host = pod_hostname(&self.cluster, member.role, member.index, &self.namespace);
            return Ok(format!("{}:{}", host, self.port));
        }
        let ip = self.pod_ip(member).await?;
        Ok(join_host_port(&ip, self.port))
    }

    fn target_for(&self, pod: String, role: Role, host: String) -> NodeTarget {
        NodeTarget {
            namespace: self.namespace.clone(),
            pod,
            container: workload_name(&self.cluster, role),
            host,
            port: self.port,
            password: self.password.clone(),
            tls_ca: self.tls_ca.clone(),
        }
    }

    /// Direct-call target for a member, addressed by pod IP.
    pub async fn target(&self, member: Member) -> Result<NodeTarget> {
        let pod = self.pod_name(member);
        let ip = self.pod_ip_by_name(&pod).await?;
        Ok(self.target_for(pod, member.role, ip))
    }

    /// Whether `member` already appears in the node table, matched by
    /// advertised hostname or by pod IP.
    pub async fn is_member_listed(&self, records: &[NodeRecord], member: Member) -> Result<bool> {
        let hostname = pod_hostname(&self.cluster, member.role, member.index, &self.namespace);
        let short = self.pod_name(member);
        let ip = self.pod_ip(member).await.ok();

        Ok(records.iter().filter_map(NodeRecord::address).any(|addr| {
            let by_host = addr
                .hostname
                .as_deref()
                .is_some_and(|h| h == hostname || h == short);
            let by_ip = ip.is_some() && addr.ip == ip;
            by_host || by_ip
        }))
    }

    // ========================================================================
    // Direct calls
    // ========================================================================

    async fn call(&self, member: Member, argv: &[&str]) -> Result<Reply> {
        let target = self.target(member).await?;
        self.call_target(&target, argv).await
    }

    async fn call_target(&self, target: &NodeTarget, argv: &[&str]) -> Result<Reply> {
        let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        self.transport.call(target, &argv).await
    }

    /// `CLUSTER NODES`, tokenized.
    pub async fn query_node_table(&self, member: Member) -> Result<Vec<NodeRecord>> {
        let text = self
            .call(member, &["CLUSTER", "NODES"])
            .await?
            .into_text("CLUSTER NODES")?;
        Ok(parse_node_table(&text))
    }

    /// Slot counts per node id from `CLUSTER SLOTS`. Transports that only
    /// return text fall back to summing node-table ranges.
    pub async fn query_slot_map(&self, member: Member) -> Result<SlotOwnership> {
        let reply = self.call(member, &["CLUSTER", "SLOTS"]).await?;
        match SlotOwnership::from_slots_reply(&reply) {
            Some(ownership) => Ok(ownership),
            None => {
                debug!(pod = %self.pod_name(member), "Slot map not structured, using node table");
                let records = self.query_node_table(member).await?;
                Ok(SlotOwnership::from_records(&records))
            }
        }
    }

    /// Replication role from `INFO replication`.
    pub async fn query_role(&self, member: Member) -> Result<NodeRole> {
        let target = self.target(member).await?;
        self.query_role_of(&target).await
    }

    /// Replication role of an already listed pod.
    pub async fn query_pod_role(&self, pod: &Pod, role: Role) -> Result<NodeRole> {
        let name = pod.name_any();
        let ip = pod_ip(pod).ok_or_else(|| Error::NotFound(format!("IP of pod {}/{}", self.namespace, name)))?;
        let target = self.target_for(name, role, ip);
        self.query_role_of(&target).await
    }

    async fn query_role_of(&self, target: &NodeTarget) -> Result<NodeRole> {
        let info = self
            .call_target(target, &["INFO", "replication"])
            .await?
            .into_text("INFO")?;
        Ok(NodeRole::from_info(&info))
    }

    /// Raw `CLUSTER INFO` text.
    pub async fn query_cluster_info(&self, member: Member) -> Result<String> {
        self.call(member, &["CLUSTER", "INFO"])
            .await?
            .into_text("CLUSTER INFO")
    }

    /// Node id of a member (`CLUSTER MYID`).
    pub async fn node_id(&self, member: Member) -> Result<String> {
        let id = self
            .call(member, &["CLUSTER", "MYID"])
            .await?
            .into_text("CLUSTER MYID")?;
        Ok(id.trim().to_string())
    }

    /// Introduce the node at `host:port` to `from`.
    pub async fn meet(&self, from: Member, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        self.call(from, &["CLUSTER", "MEET", host, &port]).await?;
        Ok(())
    }

    /// Promote a replica to master.
    pub async fn failover(&self, member: Member) -> Result<()> {
        info!(pod = %self.pod_name(member), "Issuing cluster failover");
        self.call(member, &["CLUSTER", "FAILOVER"]).await?;
        Ok(())
    }

    /// Apply one runtime parameter.
    pub async fn config_set(&self, member: Member, parameter: &str, value: &str) -> Result<()> {
        self.call(member, &["CONFIG", "SET", parameter, value]).await?;
        Ok(())
    }

    /// Give the whole slot space to a single member.
    pub async fn assign_all_slots(&self, member: Member) -> Result<()> {
        let last = (SLOT_COUNT - 1).to_string();
        self.call(member, &["CLUSTER", "ADDSLOTSRANGE", "0", &last]).await?;
        Ok(())
    }

    /// Replicas attached to `master_id`, from leader 0's node table.
    pub async fn replicas_of(&self, master_id: &str) -> Result<Vec<NodeRecord>> {
        let records = self.query_node_table(Member::leader(0)).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.is_well_formed() && r.is_replica() && r.master_id() == Some(master_id))
            .collect())
    }

    // ========================================================================
    // Administrative commands
    // ========================================================================

    /// Typed command with this cluster's auth and TLS settings.
    pub fn admin(&self, payload: AdminPayload) -> AdminCommand {
        AdminCommand::new(self.admin_binary.clone(), payload)
            .with_auth(self.password.clone())
            .with_tls(self.tls_ca.clone())
    }

    /// Run an administrative command inside `member` and return its stdout.
    pub async fn run_admin(&self, member: Member, command: &AdminCommand) -> Result<String> {
        let pod = self.pod_name(member);
        let container = workload_name(&self.cluster, member.role);

        info!(
            cluster = %self.cluster,
            pod = %pod,
            command = %command.masked().join(" "),
            "Running administrative command"
        );
        let output = self
            .platform
            .exec(&self.namespace, &pod, &container, &command.argv())
            .await?;
        debug!(command = command.name(), stdout = %output.stdout, "Administrative command finished");
        Ok(output.stdout)
    }

    // ========================================================================
    // Repair
    // ========================================================================

    /// Re-introduce every failed or disconnected master to leader 0.
    ///
    /// Each master is attempted independently; the last error, if any, is
    /// returned once all have been tried.
    pub async fn repair_disconnected_masters(&self) -> Result<()> {
        let anchor = Member::leader(0);
        let records = self.query_node_table(anchor).await?;
        let mut last_error = None;

        for record in records.iter().filter(|r| needs_meet(r)) {
            let result = async {
                let host = self.advertised_host(record).await?;
                let port = record
                    .address()
                    .and_then(|a| a.port)
                    .filter(|p| *p != 0)
                    .unwrap_or(self.port);
                info!(node_id = %record.id(), host = %host, port = port, "Meeting disconnected master");
                self.meet(anchor, &host, port).await
            }
            .await;

            if let Err(e) = result {
                warn!(node_id = %record.id(), error = %e, "Failed to repair master");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reachable host of a record. An advertised hostname is resolved to the
    /// pod's current IP, since a restarted pod keeps its name but not its
    /// address; the advertised IP is used when there is no hostname or the
    /// pod cannot be found.
    async fn advertised_host(&self, record: &NodeRecord) -> Result<String> {
        let address = record
            .address()
            .ok_or_else(|| Error::Protocol(format!("node {} has no address", record.id())))?;
        let pod = address
            .hostname
            .as_deref()
            .and_then(|h| h.split('.').next())
            .filter(|p| !p.is_empty());

        match (pod, address.ip) {
            (Some(pod), ip) => match self.pod_ip_by_name(pod).await {
                Ok(current) => Ok(current),
                Err(e) if e.is_not_found() => match ip {
                    Some(ip) => {
                        debug!(pod = %pod, ip = %ip, "Pod not found, using advertised IP");
                        Ok(ip)
                    }
                    None => Err(e),
                },
                Err(e) => Err(e),
            },
            (None, Some(ip)) => Ok(ip),
            (None, None) => Err(Error::Protocol(format!("node {} advertises no host", record.id()))),
        }
    }
}

fn needs_meet(record: &NodeRecord) -> bool {
    record.is_well_formed()
        && record.is_master()
        && (record.has_any_flag(&["fail", "fail?"]) || !record.is_connected())
}

fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
