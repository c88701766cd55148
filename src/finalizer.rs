//! Finalizer handling: claim cleanup before a cluster is removed.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::crd::RedisCluster;
use crate::error::Result;
use crate::naming::{data_claim_name, node_conf_claim_name, Role};
use crate::platform::Platform;

pub const FINALIZER: &str = "shardkeeper.io/redis-cluster-finalizer";

/// Attach the finalizer if missing.
pub async fn ensure(platform: &dyn Platform, cluster: &RedisCluster) -> Result<()> {
    if cluster.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    platform.set_cluster_finalizers(cluster, &finalizers).await?;
    debug!(cluster = %cluster.name_any(), "Finalizer added");
    Ok(())
}

/// Claims removed on deletion, in deletion order.
pub fn claims_to_delete(cluster: &RedisCluster, config: &OperatorConfig) -> Vec<String> {
    let Some(storage) = &cluster.spec.storage else {
        return Vec::new();
    };
    if storage.keep_after_delete {
        return Vec::new();
    }

    let name = cluster.name_any();
    let template = config.pvc_template_name.as_deref();
    let mut claims = Vec::new();
    for role in Role::ALL {
        for index in 0..cluster.spec.replicas(role) {
            claims.push(data_claim_name(template, &name, role, index));
            if storage.node_conf_volume {
                claims.push(node_conf_claim_name(&name, role, index));
            }
        }
    }
    claims
}

/// Delete the cluster's claims unless retention is requested, then release
/// the finalizer. Missing claims are not an error.
pub async fn finalize(platform: &dyn Platform, cluster: &RedisCluster, config: &OperatorConfig) -> Result<()> {
    if !cluster.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let namespace = cluster.namespace().unwrap_or_default();

    for claim in claims_to_delete(cluster, config) {
        match platform.delete_claim(&namespace, &claim).await {
            Ok(()) => info!(namespace = %namespace, claim = %claim, "Storage claim deleted"),
            Err(e) if e.is_not_found() => debug!(claim = %claim, "Storage claim already gone"),
            Err(e) => return Err(e),
        }
    }

    let remaining: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    platform.set_cluster_finalizers(cluster, &remaining).await?;
    info!(cluster = %cluster.name_any(), "Finalizer released");
    Ok(())
}
