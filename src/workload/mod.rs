//! Declarative management of per-role StatefulSets.
//!
//! [`builder`] renders the desired objects, [`reconciler`] brings the stored
//! StatefulSet and its claims in line with them.

pub mod builder;
pub mod diff;
pub mod quantity;
pub mod reconciler;

use k8s_openapi::api::apps::v1::StatefulSet;

pub use reconciler::{UpdatePolicy, WorkloadOutcome, WorkloadReconciler};

/// Serialized desired object as of the last write.
pub const LAST_APPLIED_ANNOTATION: &str = "shardkeeper.io/last-applied";

/// Storage capacity, in bytes, last propagated to the data claims.
pub const STORAGE_CAPACITY_ANNOTATION: &str = "shardkeeper.io/storage-capacity";

/// The StatefulSet has rolled out its current revision and every replica is
/// ready.
pub fn is_ready(sts: &StatefulSet) -> bool {
    let (Some(spec), Some(status)) = (&sts.spec, &sts.status) else {
        return false;
    };
    let replicas = spec.replicas.unwrap_or(1);
    let partition = spec
        .update_strategy
        .as_ref()
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0);

    if status.updated_replicas.unwrap_or(0) < replicas - partition {
        return false;
    }
    if partition == 0 && status.current_revision != status.update_revision {
        return false;
    }
    if status.observed_generation != sts.metadata.generation {
        return false;
    }
    status.ready_replicas.unwrap_or(0) == replicas
}

/// Ready replicas reported by the StatefulSet.
pub fn ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Replica count in the stored spec.
pub fn spec_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}
