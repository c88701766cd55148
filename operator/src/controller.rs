//! Kubernetes controller for RedisCluster resources

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use shardkeeper::crd::RedisCluster;
use shardkeeper::{Next, TopologyController};

use crate::error::Error;
use crate::metrics::Metrics;

/// Delay before retrying a pass that returned an error.
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state handed to every reconciliation.
pub struct Context {
    pub engine: TopologyController,
    pub metrics: Arc<Metrics>,
}

/// Watches RedisClusters and the StatefulSets they own.
pub struct Controller {
    client: Client,
    namespace: String,
    context: Arc<Context>,
}

impl Controller {
    pub fn new(client: Client, namespace: String, context: Context) -> Self {
        Self {
            client,
            namespace,
            context: Arc::new(context),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    /// Run the controller until a shutdown signal arrives.
    pub async fn run(&self) -> Result<(), Error> {
        info!("Starting RedisCluster controller");

        let clusters: Api<RedisCluster> = self.api();
        let workloads: Api<StatefulSet> = self.api();

        // Verify CRD is installed
        if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
            error!("Failed to list RedisClusters. Is the CRD installed? Error: {}", e);
            return Err(Error::CrdNotInstalled);
        }
        info!("CRD verification successful");

        KubeController::new(clusters, Config::default())
            .owns(workloads, Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context.clone())
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, ?action, "Reconciliation successful");
                    }
                    Err(e) => {
                        warn!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Map the engine's verdict onto a controller action.
pub fn action_for(next: Next) -> Action {
    match next {
        Next::Done => Action::await_change(),
        Next::RequeueAfter(delay) => Action::requeue(delay),
    }
}

async fn reconcile(cluster: Arc<RedisCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling RedisCluster");

    let started = Instant::now();
    let result = ctx.engine.reconcile(&cluster).await;
    let elapsed = started.elapsed().as_secs_f64();

    if cluster.metadata.deletion_timestamp.is_some() {
        ctx.metrics.forget_cluster(&namespace, &name);
    } else if let Some(status) = &cluster.status {
        ctx.metrics.set_cluster_state(&namespace, &name, status.state);
    }

    match result {
        Ok(next) => {
            ctx.metrics.record_success(&name, elapsed);
            Ok(action_for(next))
        }
        Err(e) => {
            ctx.metrics.record_failure(&name, e.kind(), elapsed);
            error!(name = %name, namespace = %namespace, error = %e, "Reconciliation failed");
            Err(Error::Engine(e))
        }
    }
}

/// Error policy for reconciliation failures
fn error_policy(_cluster: Arc<RedisCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "Reconciliation error, will retry");
    Action::requeue(ERROR_REQUEUE)
}
