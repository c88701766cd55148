//! Pod role labels.
//!
//! Every member pod carries `redis-role=master|slave`, refreshed from a live
//! `INFO replication` query on each pass.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::naming::Role;
use crate::node::{NodeDirectory, NodeRole};
use crate::platform::Platform;
use crate::retry::{retry, RetryPolicy};
use crate::workload::builder::workload_labels;

pub const ROLE_LABEL: &str = "redis-role";

/// Refresh the role label of every member pod. Pods are handled
/// independently; the last error is returned after all were attempted.
pub async fn refresh_role_labels(
    platform: &dyn Platform,
    directory: &NodeDirectory,
    policy: &RetryPolicy,
) -> Result<usize> {
    let namespace = directory.namespace();
    let mut updated = 0;
    let mut last_error = None;

    for role in Role::ALL {
        let pods = platform
            .list_pods(namespace, &workload_labels(directory.cluster(), role))
            .await?;

        for pod in pods {
            match refresh_pod(platform, directory, policy, &pod, role).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(pod = %pod.name_any(), error = %e, "Failed to refresh role label");
                    last_error = Some(e);
                }
            }
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(updated),
    }
}

async fn refresh_pod(
    platform: &dyn Platform,
    directory: &NodeDirectory,
    policy: &RetryPolicy,
    pod: &Pod,
    role: Role,
) -> Result<bool> {
    let wanted = directory.query_pod_role(pod, role).await?;
    if current_label(pod) == Some(wanted.label_value()) {
        return Ok(false);
    }

    let namespace = directory.namespace();
    let name = pod.name_any();
    let pod_name = name.as_str();
    retry(policy, Error::is_conflict, move || {
        set_label(platform, namespace, pod_name, wanted)
    })
    .await?;
    debug!(pod = %name, role = wanted.label_value(), "Role label updated");
    Ok(true)
}

/// Read-modify-write of the label on the latest pod revision.
async fn set_label(platform: &dyn Platform, namespace: &str, name: &str, role: NodeRole) -> Result<()> {
    let mut pod = platform
        .get_pod(namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name}")))?;
    if current_label(&pod) == Some(role.label_value()) {
        return Ok(());
    }
    pod.labels_mut()
        .insert(ROLE_LABEL.to_string(), role.label_value().to_string());
    platform.replace_pod(namespace, &pod).await
}

fn current_label(pod: &Pod) -> Option<&str> {
    pod.labels().get(ROLE_LABEL).map(String::as_str)
}
