//! Kubernetes implementation of the platform traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{
    ClusterEvent, EventKind, ExecOutput, PodGateway, Propagation, ResourceStore, WorkloadStore,
};
use crate::crd::{RedisCluster, RedisClusterStatus};
use crate::error::{Error, Result};

/// Platform backed by a live API server.
pub struct KubePlatform {
    client: Client,
    field_manager: String,
    recorder: Recorder,
}

impl KubePlatform {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        let field_manager = field_manager.into();
        let reporter = Reporter {
            controller: field_manager.clone(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            field_manager,
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn label_selector(labels: &BTreeMap<String, String>) -> ListParams {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        ListParams::default().labels(&selector)
    }

    fn clusters(&self, cluster: &RedisCluster) -> Api<RedisCluster> {
        Api::namespaced(self.client.clone(), &cluster.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl WorkloadStore for KubePlatform {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&self.post_params(), sts).await?)
    }

    async fn replace_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(&sts.name_any(), &self.post_params(), sts).await?)
    }

    async fn delete_statefulset(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let dp = match propagation {
            Propagation::Foreground => DeleteParams::foreground(),
            Propagation::Background => DeleteParams::background(),
            Propagation::Orphan => DeleteParams::orphan(),
        };
        api.delete(name, &dp).await?;
        Ok(())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::label_selector(labels)).await?.items)
    }

    async fn replace_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&claim.name_any(), &self.post_params(), claim).await?;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl PodGateway for KubePlatform {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&Self::label_selector(labels)).await?.items)
    }

    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&pod.name_any(), &self.post_params(), pod).await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let exec_error = |reason: String| Error::Exec {
            pod: pod.to_string(),
            reason,
        };

        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = api
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let stdout = process.stdout();
        let stderr = process.stderr();
        let output = read_streams(stdout, stderr)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = process.join().await {
            debug!(pod = %pod, error = %e, "Exec stream closed with error");
        }

        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => {
                let message = s.message.unwrap_or_default();
                Err(exec_error(format!("{message}: {}", output.stderr.trim())))
            }
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl ResourceStore for KubePlatform {
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(&service.name_any(), &pp, &Patch::Apply(service)).await?;
        Ok(())
    }

    async fn apply_disruption_budget(&self, namespace: &str, budget: &PodDisruptionBudget) -> Result<()> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(&budget.name_any(), &pp, &Patch::Apply(budget)).await?;
        Ok(())
    }

    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(namespace = %namespace, budget = %name, "PodDisruptionBudget deleted");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_secret_key(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|value| String::from_utf8_lossy(&value.0).trim().to_string()))
    }

    async fn patch_cluster_status(&self, cluster: &RedisCluster, status: &RedisClusterStatus) -> Result<()> {
        let patch = serde_json::json!({
            "status": status
        });
        let pp = PatchParams::apply(&self.field_manager);
        self.clusters(cluster)
            .patch_status(&cluster.name_any(), &pp, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_cluster_finalizers(&self, cluster: &RedisCluster, finalizers: &[String]) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.clusters(cluster)
            .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_event(&self, cluster: &RedisCluster, event: ClusterEvent) -> Result<()> {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    action: event.reason.clone(),
                    reason: event.reason,
                    note: Some(event.note),
                    secondary: None,
                },
                &cluster.object_ref(&()),
            )
            .await?;
        Ok(())
    }
}

/// Drain both output streams together, so a chatty stderr cannot stall the
/// process while stdout is still open.
async fn read_streams<O, E>(stdout: Option<O>, stderr: Option<E>) -> std::io::Result<ExecOutput>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
        let mut text = String::new();
        if let Some(mut stream) = stream {
            stream.read_to_string(&mut text).await?;
        }
        Ok(text)
    }

    let (stdout, stderr) = tokio::join!(drain(stdout), drain(stderr));
    Ok(ExecOutput {
        stdout: stdout?,
        stderr: stderr?,
    })
}
