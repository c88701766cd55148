//! Create-or-update of a StatefulSet and its storage claims.
//!
//! Claim templates of a StatefulSet are immutable once created. Capacity
//! changes therefore bypass the template: the reconciler resizes every
//! matching claim directly and remembers the propagated capacity in an
//! annotation on the StatefulSet. Only with the recreate policy is the new
//! template sent to the server, where the rejected update triggers a delete
//! and the next pass recreates the object.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::builder::NODE_CONF_TEMPLATE;
use super::diff::diff;
use super::quantity::quantity_bytes;
use super::{LAST_APPLIED_ANNOTATION, STORAGE_CAPACITY_ANNOTATION};
use crate::crd::{RECREATE_ANNOTATION, RECREATE_STRATEGY_ANNOTATION};
use crate::error::{Error, Result};
use crate::platform::{Platform, Propagation};

/// How to handle updates the server rejects as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdatePolicy {
    /// Delete the StatefulSet and let the next pass recreate it.
    pub recreate: bool,
    pub propagation: Propagation,
}

impl UpdatePolicy {
    /// Read the recreate annotations of the owning resource.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            recreate: annotations
                .get(RECREATE_ANNOTATION)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            propagation: Propagation::from_annotation(
                annotations.get(RECREATE_STRATEGY_ANNOTATION).map(String::as_str),
            ),
        }
    }
}

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Created,
    Updated,
    Unchanged,
    /// The StatefulSet was deleted after an invalid update.
    Recreating,
}

/// Reconciles StatefulSets against a platform.
pub struct WorkloadReconciler {
    platform: Arc<dyn Platform>,
}

impl WorkloadReconciler {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Bring the stored StatefulSet in line with `desired`.
    pub async fn reconcile(&self, mut desired: StatefulSet, policy: UpdatePolicy) -> Result<WorkloadOutcome> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        let Some(stored) = self.platform.get_statefulset(&namespace, &name).await? else {
            if let Some(bytes) = data_template(&desired).and_then(template_bytes) {
                set_annotation(&mut desired, STORAGE_CAPACITY_ANNOTATION, bytes.to_string());
            }
            stamp_last_applied(&mut desired)?;
            self.platform.create_statefulset(&namespace, &desired).await?;
            info!(namespace = %namespace, statefulset = %name, "StatefulSet created");
            return Ok(WorkloadOutcome::Created);
        };

        desired.metadata.resource_version = stored.metadata.resource_version.clone();
        desired.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();

        let capacity_changed = self.sync_capacity(&namespace, &stored, &mut desired).await?;

        if !policy.recreate {
            if let (Some(d), Some(s)) = (desired.spec.as_mut(), stored.spec.as_ref()) {
                d.volume_claim_templates = s.volume_claim_templates.clone();
            }
        }

        let changes = diff(&serde_json::to_value(&stored)?, &serde_json::to_value(&desired)?);
        if changes.is_empty() && !capacity_changed {
            debug!(namespace = %namespace, statefulset = %name, "StatefulSet unchanged");
            return Ok(WorkloadOutcome::Unchanged);
        }

        merge_missing_annotations(&mut desired, &stored);
        stamp_last_applied(&mut desired)?;
        info!(
            namespace = %namespace,
            statefulset = %name,
            changes = ?changes,
            capacity_changed = capacity_changed,
            "Updating StatefulSet"
        );

        match self.platform.replace_statefulset(&namespace, &desired).await {
            Ok(_) => Ok(WorkloadOutcome::Updated),
            Err(e) if e.is_invalid() && policy.recreate => {
                warn!(
                    namespace = %namespace,
                    statefulset = %name,
                    error = %e,
                    propagation = ?policy.propagation,
                    "Update rejected, deleting StatefulSet for recreation"
                );
                self.platform
                    .delete_statefulset(&namespace, &name, policy.propagation)
                    .await?;
                Ok(WorkloadOutcome::Recreating)
            }
            Err(e) if e.is_invalid() => Err(Error::InvalidUpdate {
                name,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Propagate a changed data capacity to the claims. Returns whether the
    /// capacity annotation changed. The annotation on `desired` is always set
    /// to the value that should be stored.
    async fn sync_capacity(&self, namespace: &str, stored: &StatefulSet, desired: &mut StatefulSet) -> Result<bool> {
        let stored_count = claim_template_count(stored);
        if stored_count == 0 || stored_count != claim_template_count(desired) {
            return Ok(false);
        }
        let Some(template) = data_template(desired).cloned() else {
            return Ok(false);
        };
        let (Some(wanted), Some(quantity)) = (template_bytes(&template), template_quantity(&template)) else {
            return Ok(false);
        };

        let recorded = stored
            .annotations()
            .get(STORAGE_CAPACITY_ANNOTATION)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if recorded == wanted {
            set_annotation(desired, STORAGE_CAPACITY_ANNOTATION, recorded.to_string());
            return Ok(false);
        }

        let template_name = template.name_any();
        self.resize_claims(namespace, &stored.name_any(), &template_name, &quantity, wanted)
            .await?;
        set_annotation(desired, STORAGE_CAPACITY_ANNOTATION, wanted.to_string());
        Ok(true)
    }

    /// Update every claim of the StatefulSet whose requested capacity
    /// differs. All claims are attempted; failures are reported together.
    async fn resize_claims(
        &self,
        namespace: &str,
        sts_name: &str,
        template: &str,
        quantity: &Quantity,
        wanted: i64,
    ) -> Result<()> {
        let labels = BTreeMap::from([("app".to_string(), sts_name.to_string())]);
        let prefix = format!("{template}-");
        let claims = self.platform.list_claims(namespace, &labels).await?;

        let mut failures = Vec::new();
        for mut claim in claims.into_iter().filter(|c| c.name_any().starts_with(&prefix)) {
            if claim_bytes(&claim) == Some(wanted) {
                continue;
            }
            let claim_name = claim.name_any();
            set_claim_request(&mut claim, quantity.clone());
            match self.platform.replace_claim(namespace, &claim).await {
                Ok(()) => info!(namespace = %namespace, claim = %claim_name, capacity = %quantity.0, "Storage claim resized"),
                Err(e) => {
                    warn!(namespace = %namespace, claim = %claim_name, error = %e, "Storage claim resize failed");
                    failures.push(format!("{claim_name}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ClaimResize { failures })
        }
    }
}

fn claim_template_count(sts: &StatefulSet) -> usize {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .map_or(0, Vec::len)
}

/// The data claim template; the nodes.conf template is never resized.
fn data_template(sts: &StatefulSet) -> Option<&PersistentVolumeClaim> {
    sts.spec
        .as_ref()?
        .volume_claim_templates
        .as_ref()?
        .iter()
        .find(|t| t.metadata.name.as_deref() != Some(NODE_CONF_TEMPLATE))
}

fn template_quantity(template: &PersistentVolumeClaim) -> Option<Quantity> {
    template
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .cloned()
}

fn template_bytes(template: &PersistentVolumeClaim) -> Option<i64> {
    template_quantity(template).and_then(|q| quantity_bytes(&q))
}

fn claim_bytes(claim: &PersistentVolumeClaim) -> Option<i64> {
    template_bytes(claim)
}

fn set_claim_request(claim: &mut PersistentVolumeClaim, quantity: Quantity) {
    let spec = claim.spec.get_or_insert_with(Default::default);
    let resources = spec.resources.get_or_insert_with(Default::default);
    resources
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert("storage".to_string(), quantity);
}

fn set_annotation(sts: &mut StatefulSet, key: &str, value: String) {
    sts.annotations_mut().insert(key.to_string(), value);
}

fn merge_missing_annotations(desired: &mut StatefulSet, stored: &StatefulSet) {
    let stored_annotations = stored.annotations().clone();
    let annotations = desired.annotations_mut();
    for (key, value) in stored_annotations {
        annotations.entry(key).or_insert(value);
    }
}

fn stamp_last_applied(sts: &mut StatefulSet) -> Result<()> {
    sts.annotations_mut().remove(LAST_APPLIED_ANNOTATION);
    let applied = serde_json::to_string(sts)?;
    set_annotation(sts, LAST_APPLIED_ANNOTATION, applied);
    Ok(())
}
