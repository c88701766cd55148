//! Cluster health predicates and the repair loop.
//!
//! The predicates work on node-table records and never fail. Records with
//! fewer than eight fields are skipped when counting, but make a cluster
//! unstable. [`check_and_repair`] drives the
//! best-effort repair and decides when a cluster is beyond automatic help.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::node::record::{looks_like_slot_token, parse_info_fields, NodeRecord};
use crate::node::{Member, NodeDirectory};
use crate::retry::{retry, RetryPolicy};

const FAILING_FLAGS: &[&str] = &["fail", "fail?", "handshake", "noaddr"];

/// Master that is linked up and not flagged as failing.
fn is_healthy_master(record: &NodeRecord) -> bool {
    record.is_well_formed()
        && record.is_master()
        && !record.has_any_flag(FAILING_FLAGS)
        && record.is_connected()
}

/// Some healthy master owns no slots.
///
/// A master counts as owning slots when any token looks like a slot number, a
/// bracketed slot, or a migration marker; a master that is only importing or
/// migrating is therefore not empty here.
pub fn has_empty_masters(records: &[NodeRecord]) -> bool {
    records
        .iter()
        .filter(|r| is_healthy_master(r))
        .any(|r| !r.slot_tokens().iter().any(|t| looks_like_slot_token(t)))
}

/// `CLUSTER INFO` reports `ok`, no migration task is running, and every
/// record is well formed, connected, not failing, and has no open slots.
pub fn is_stable(cluster_info: &str, records: &[NodeRecord]) -> bool {
    let info = parse_info_fields(cluster_info);
    if info.get("cluster_state").map(String::as_str) != Some("ok") {
        return false;
    }
    let migrating = info
        .get("cluster_slot_migration_active_tasks")
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0);
    if migrating {
        return false;
    }

    records.iter().all(|r| {
        r.is_well_formed() && !r.has_any_flag(FAILING_FLAGS) && r.is_connected() && !r.has_open_slots()
    })
}

/// Records flagged as failed or with a disconnected link.
pub fn count_unhealthy(records: &[NodeRecord]) -> usize {
    records
        .iter()
        .filter(|r| r.is_well_formed())
        .filter(|r| r.has_any_flag(&["fail", "fail?"]) || !r.is_connected())
        .count()
}

/// Well-formed records, i.e. joined members.
pub fn count_nodes(records: &[NodeRecord]) -> usize {
    records.iter().filter(|r| r.is_well_formed()).count()
}

/// Joined members flagged `master`.
pub fn count_masters(records: &[NodeRecord]) -> usize {
    records
        .iter()
        .filter(|r| r.is_well_formed() && r.is_master())
        .count()
}

/// Slots are fully assigned according to `CLUSTER INFO`.
pub fn all_slots_assigned(cluster_info: &str) -> bool {
    parse_info_fields(cluster_info)
        .get("cluster_slots_assigned")
        .and_then(|v| v.parse::<u32>().ok())
        == Some(crate::node::SLOT_COUNT)
}

/// The unhealthy count at which automatic repair gives up.
pub fn is_broken(unhealthy: usize, total: usize) -> bool {
    unhealthy > 0 && unhealthy >= total.saturating_sub(1).max(1)
}

// ============================================================================
// Repair
// ============================================================================

/// Result of a health pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Nothing was unhealthy.
    Healthy,
    /// Unhealthy members recovered after repair.
    Repaired,
    /// Some members are still unhealthy, but not enough to give up.
    Degraded { unhealthy: usize },
}

/// Check the node table from leader 0 and repair when needed.
///
/// Returns [`Error::ClusterBroken`] when the unhealthy count is still at or
/// above `total - 1` after `policy` re-checks.
pub async fn check_and_repair(
    directory: &NodeDirectory,
    policy: &RetryPolicy,
    total: usize,
) -> Result<RepairOutcome> {
    let anchor = Member::leader(0);
    let records = directory.query_node_table(anchor).await?;
    let unhealthy = count_unhealthy(&records);
    if unhealthy == 0 {
        return Ok(RepairOutcome::Healthy);
    }

    warn!(
        cluster = %directory.cluster(),
        unhealthy = unhealthy,
        total = total,
        "Unhealthy nodes detected, repairing"
    );
    if let Err(e) = directory.repair_disconnected_masters().await {
        warn!(cluster = %directory.cluster(), error = %e, "Repair of disconnected masters incomplete");
    }

    let recheck = retry(
        policy,
        |e| matches!(e, Error::ClusterBroken { .. }),
        move || async move {
            let records = directory.query_node_table(anchor).await?;
            match count_unhealthy(&records) {
                0 => Ok(()),
                unhealthy => Err(Error::ClusterBroken { unhealthy, total }),
            }
        },
    )
    .await;

    match recheck {
        Ok(()) => {
            info!(cluster = %directory.cluster(), "Unhealthy nodes repaired");
            Ok(RepairOutcome::Repaired)
        }
        Err(Error::ClusterBroken { unhealthy, total }) if is_broken(unhealthy, total) => {
            Err(Error::ClusterBroken { unhealthy, total })
        }
        Err(Error::ClusterBroken { unhealthy, .. }) => Ok(RepairOutcome::Degraded { unhealthy }),
        Err(e) => Err(e),
    }
}
