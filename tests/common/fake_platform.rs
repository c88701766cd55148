//! In-memory platform.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use shardkeeper::crd::{RedisCluster, RedisClusterStatus};
use shardkeeper::platform::{
    ClusterEvent, ExecOutput, PodGateway, Propagation, ResourceStore, WorkloadStore,
};
use shardkeeper::{Error, Result};

/// Kubernetes API error with the given status code.
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from fake platform"),
        reason: reason.to_string(),
        code,
    }))
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateStatefulSet(String),
    ReplaceStatefulSet(String),
    DeleteStatefulSet(String, Propagation),
    ReplaceClaim(String),
    DeleteClaim(String),
    ReplacePod(String),
    ApplyService(String),
    ApplyBudget(String),
    DeleteBudget(String),
    Exec { pod: String, argv: Vec<String> },
    Status(RedisClusterStatus),
    Finalizers(Vec<String>),
}

#[derive(Default)]
struct State {
    statefulsets: BTreeMap<String, StatefulSet>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    budgets: BTreeMap<String, PodDisruptionBudget>,
    secrets: BTreeMap<(String, String), String>,
    events: Vec<ClusterEvent>,
    calls: Vec<Call>,
    exec_script: Vec<(String, std::result::Result<String, String>)>,
    reject_statefulset_updates: bool,
    failing_claims: BTreeSet<String>,
    pod_conflicts: usize,
    not_ready: BTreeSet<String>,
}

/// Single-namespace in-memory platform. StatefulSets become ready as soon
/// as they are written unless marked otherwise.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    pub fn insert_statefulset(&self, sts: StatefulSet) {
        let ready = !self.with(|s| s.not_ready.contains(&sts.name_any()));
        let sts = settle(sts, ready);
        self.with(|s| s.statefulsets.insert(sts.name_any(), sts));
    }

    pub fn insert_claim(&self, claim: PersistentVolumeClaim) {
        self.with(|s| s.claims.insert(claim.name_any(), claim));
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.with(|s| s.pods.insert(pod.name_any(), pod));
    }

    pub fn insert_secret(&self, name: &str, key: &str, value: &str) {
        self.with(|s| s.secrets.insert((name.to_string(), key.to_string()), value.to_string()));
    }

    /// Answer execs whose command line contains `needle`. Earlier scripts win.
    pub fn script_exec(&self, needle: &str, reply: std::result::Result<&str, &str>) {
        let reply = reply.map(str::to_string).map_err(str::to_string);
        self.with(|s| s.exec_script.push((needle.to_string(), reply)));
    }

    /// Reject every StatefulSet replace as invalid.
    pub fn reject_statefulset_updates(&self) {
        self.with(|s| s.reject_statefulset_updates = true);
    }

    pub fn fail_claim(&self, name: &str) {
        self.with(|s| s.failing_claims.insert(name.to_string()));
    }

    /// Fail the next `count` pod replaces with a conflict.
    pub fn conflict_pods(&self, count: usize) {
        self.with(|s| s.pod_conflicts = count);
    }

    /// Keep a StatefulSet unready after writes.
    pub fn hold_not_ready(&self, name: &str) {
        self.with(|s| s.not_ready.insert(name.to_string()));
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn count_calls(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.with(|s| s.calls.iter().filter(|c| matches(c)).count())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn statefulset(&self, name: &str) -> Option<StatefulSet> {
        self.with(|s| s.statefulsets.get(name).cloned())
    }

    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.with(|s| s.claims.get(name).cloned())
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.with(|s| s.pods.get(name).cloned())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.with(|s| s.services.keys().cloned().collect())
    }

    pub fn budget(&self, name: &str) -> Option<PodDisruptionBudget> {
        self.with(|s| s.budgets.get(name).cloned())
    }

    pub fn statuses(&self) -> Vec<RedisClusterStatus> {
        self.with(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Status(status) => Some(status.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.with(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Exec { argv, .. } => Some(argv.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.with(|s| s.events.iter().map(|e| e.reason.clone()).collect())
    }
}

/// Bump the generation and, when `ready`, report every replica rolled out.
fn settle(mut sts: StatefulSet, ready: bool) -> StatefulSet {
    let generation = sts.metadata.generation.unwrap_or(0) + 1;
    sts.metadata.generation = Some(generation);
    let version = sts
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    sts.metadata.resource_version = Some(version.to_string());

    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    sts.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(if ready { replicas } else { 0 }),
        updated_replicas: Some(replicas),
        current_revision: Some("rev-1".to_string()),
        update_revision: Some("rev-1".to_string()),
        observed_generation: Some(generation),
        ..Default::default()
    });
    sts
}

fn matches_labels(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl WorkloadStore for FakePlatform {
    async fn get_statefulset(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.statefulset(name))
    }

    async fn create_statefulset(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = sts.name_any();
        if self.statefulset(&name).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }
        self.with(|s| s.calls.push(Call::CreateStatefulSet(name.clone())));
        self.insert_statefulset(sts.clone());
        Ok(self.statefulset(&name).unwrap_or_default())
    }

    async fn replace_statefulset(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = sts.name_any();
        let stored = self
            .statefulset(&name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.metadata.resource_version != sts.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        if self.with(|s| s.reject_statefulset_updates) {
            return Err(api_error(422, "Invalid"));
        }
        self.with(|s| s.calls.push(Call::ReplaceStatefulSet(name.clone())));

        let mut next = sts.clone();
        next.metadata.generation = stored.metadata.generation;
        self.insert_statefulset(next);
        Ok(self.statefulset(&name).unwrap_or_default())
    }

    async fn delete_statefulset(&self, _namespace: &str, name: &str, propagation: Propagation) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::DeleteStatefulSet(name.to_string(), propagation));
            s.statefulsets.remove(name);
        });
        Ok(())
    }

    async fn list_claims(
        &self,
        _namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.with(|s| {
            s.claims
                .values()
                .filter(|c| matches_labels(c.labels(), labels))
                .cloned()
                .collect()
        }))
    }

    async fn replace_claim(&self, _namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let name = claim.name_any();
        self.with(|s| {
            if s.failing_claims.contains(&name) {
                return Err(api_error(403, "Forbidden"));
            }
            s.calls.push(Call::ReplaceClaim(name.clone()));
            s.claims.insert(name, claim.clone());
            Ok(())
        })
    }

    async fn delete_claim(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::DeleteClaim(name.to_string()));
            match s.claims.remove(name) {
                Some(_) => Ok(()),
                None => Err(api_error(404, "NotFound")),
            }
        })
    }
}

#[async_trait]
impl PodGateway for FakePlatform {
    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(name))
    }

    async fn list_pods(&self, _namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        Ok(self.with(|s| {
            s.pods
                .values()
                .filter(|p| matches_labels(p.labels(), labels))
                .cloned()
                .collect()
        }))
    }

    async fn replace_pod(&self, _namespace: &str, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        self.with(|s| {
            if s.pod_conflicts > 0 {
                s.pod_conflicts -= 1;
                return Err(api_error(409, "Conflict"));
            }
            s.calls.push(Call::ReplacePod(name.clone()));
            s.pods.insert(name, pod.clone());
            Ok(())
        })
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let line = command.join(" ");
        self.with(|s| {
            s.calls.push(Call::Exec {
                pod: pod.to_string(),
                argv: command.to_vec(),
            });
            let reply = s
                .exec_script
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Ok(String::new()));
            match reply {
                Ok(stdout) => Ok(ExecOutput {
                    stdout,
                    stderr: String::new(),
                }),
                Err(reason) => Err(Error::Exec {
                    pod: pod.to_string(),
                    reason,
                }),
            }
        })
    }
}

#[async_trait]
impl ResourceStore for FakePlatform {
    async fn apply_service(&self, _namespace: &str, service: &Service) -> Result<()> {
        let name = service.name_any();
        self.with(|s| {
            s.calls.push(Call::ApplyService(name.clone()));
            s.services.insert(name, service.clone());
        });
        Ok(())
    }

    async fn apply_disruption_budget(&self, _namespace: &str, budget: &PodDisruptionBudget) -> Result<()> {
        let name = budget.name_any();
        self.with(|s| {
            s.calls.push(Call::ApplyBudget(name.clone()));
            s.budgets.insert(name, budget.clone());
        });
        Ok(())
    }

    async fn delete_disruption_budget(&self, _namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            if s.budgets.remove(name).is_some() {
                s.calls.push(Call::DeleteBudget(name.to_string()));
            }
        });
        Ok(())
    }

    async fn read_secret_key(&self, _namespace: &str, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self.with(|s| s.secrets.get(&(name.to_string(), key.to_string())).cloned()))
    }

    async fn patch_cluster_status(&self, _cluster: &RedisCluster, status: &RedisClusterStatus) -> Result<()> {
        self.with(|s| s.calls.push(Call::Status(status.clone())));
        Ok(())
    }

    async fn set_cluster_finalizers(&self, _cluster: &RedisCluster, finalizers: &[String]) -> Result<()> {
        self.with(|s| s.calls.push(Call::Finalizers(finalizers.to_vec())));
        Ok(())
    }

    async fn publish_event(&self, _cluster: &RedisCluster, event: ClusterEvent) -> Result<()> {
        self.with(|s| s.events.push(event));
        Ok(())
    }
}
