use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use cascade_core::error::{CascadeError, Result};
use cascade_core::event::EventBus;
use cascade_core::traits::ChangeStore;
use cascade_core::types::{
    CascadeEvent, ChangeAction, ChangeStatus, PendingChange, SubmitOutcome,
};

use crate::json_path;

/// A change-plan document as produced by an SSOT-update node.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangePlan {
    pub changes: Vec<PlannedChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedChange {
    #[serde(default, alias = "changeId")]
    pub change_id: Option<String>,
    #[serde(default, alias = "targetDomain")]
    pub target_domain: Option<String>,
    #[serde(alias = "targetPath")]
    pub target_path: String,
    #[serde(default)]
    pub action: Option<ChangeAction>,
    #[serde(default, alias = "proposedValue")]
    pub proposed_value: Value,
}

impl PlannedChange {
    /// Domain defaults to the first segment of the target path.
    pub fn domain(&self) -> String {
        self.target_domain.clone().unwrap_or_else(|| {
            self.target_path
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string()
        })
    }

    /// Depth of the target in the field hierarchy.
    pub fn level(&self) -> usize {
        self.target_path.split('.').filter(|s| !s.is_empty()).count()
    }

    /// Explicit id, else one derived from the entity and target so a
    /// regenerated plan lands on the same pending row.
    pub fn id(&self, entity_id: &str) -> String {
        if let Some(id) = self.change_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(entity_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.domain().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.target_path.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("chg-{}", &digest[..16])
    }
}

impl ChangePlan {
    /// Parse a plan from a node output: a JSON object, or text containing
    /// one (optionally fenced).
    pub fn from_output(output: &Value) -> Result<Self> {
        let doc = match output {
            Value::String(text) => json_path::parse_embedded_json(text).ok_or_else(|| {
                CascadeError::InvalidChangePlan("output text holds no JSON document".into())
            })?,
            other => other.clone(),
        };
        let plan: ChangePlan = serde_json::from_value(doc)
            .map_err(|e| CascadeError::InvalidChangePlan(e.to_string()))?;
        if let Some(bad) = plan.changes.iter().find(|c| c.target_path.trim().is_empty()) {
            return Err(CascadeError::InvalidChangePlan(format!(
                "change {:?} has an empty target_path",
                bad.change_id
            )));
        }
        Ok(plan)
    }
}

/// Pending → approved | rejected lifecycle over the change store.
pub struct ChangeReview {
    changes: Arc<dyn ChangeStore>,
    event_bus: Arc<EventBus>,
}

impl ChangeReview {
    pub fn new(changes: Arc<dyn ChangeStore>, event_bus: Arc<EventBus>) -> Self {
        Self { changes, event_bus }
    }

    /// Queue a change for review. Resubmitting an identical pending change
    /// is a no-op.
    pub async fn submit(&self, change: &PendingChange) -> Result<SubmitOutcome> {
        let outcome = self.changes.submit_change(change).await?;
        if outcome != SubmitOutcome::Duplicate {
            info!(
                change_id = %change.change_id,
                node_id = %change.node_id,
                target = %change.target_path,
                ?outcome,
                "Change queued for review"
            );
            self.event_bus.publish(CascadeEvent::ChangeQueued {
                change_id: change.change_id.clone(),
                node_id: change.node_id.clone(),
            });
        }
        Ok(outcome)
    }

    async fn pending(&self, entity_id: &str, change_id: &str) -> Result<PendingChange> {
        let change = self
            .changes
            .get_change(entity_id, change_id)
            .await?
            .ok_or_else(|| CascadeError::ChangeNotFound(format!("{}/{}", entity_id, change_id)))?;
        if change.status != ChangeStatus::Pending {
            return Err(CascadeError::ChangeAlreadyResolved {
                change_id: change_id.to_string(),
                status: change.status.to_string(),
            });
        }
        Ok(change)
    }

    /// Approve and commit the proposed value to the master field store.
    pub async fn approve(
        &self,
        entity_id: &str,
        change_id: &str,
        resolved_by: &str,
    ) -> Result<PendingChange> {
        let mut change = self.pending(entity_id, change_id).await?;
        let now = Utc::now();
        if !self.changes.approve_change(&change, resolved_by, now).await? {
            // Lost a race with another reviewer
            return Err(CascadeError::ChangeAlreadyResolved {
                change_id: change_id.to_string(),
                status: "resolved".into(),
            });
        }
        info!(entity_id, change_id, resolved_by, target = %change.target_path, "Change approved");
        change.status = ChangeStatus::Approved;
        change.resolved_at = Some(now);
        change.resolved_by = Some(resolved_by.to_string());
        Ok(change)
    }

    /// Reject; the field store is left untouched.
    pub async fn reject(
        &self,
        entity_id: &str,
        change_id: &str,
        resolved_by: &str,
    ) -> Result<PendingChange> {
        let mut change = self.pending(entity_id, change_id).await?;
        let now = Utc::now();
        if !self.changes.reject_change(&change, resolved_by, now).await? {
            return Err(CascadeError::ChangeAlreadyResolved {
                change_id: change_id.to_string(),
                status: "resolved".into(),
            });
        }
        info!(entity_id, change_id, resolved_by, "Change rejected");
        change.status = ChangeStatus::Rejected;
        change.resolved_at = Some(now);
        change.resolved_by = Some(resolved_by.to_string());
        Ok(change)
    }

    /// Submit and immediately approve, for changes the approval policy lets
    /// through without a human.
    pub async fn auto_approve(&self, change: &PendingChange, reason: &str) -> Result<()> {
        self.changes.submit_change(change).await?;
        let resolver = format!("auto:{}", reason);
        self.changes
            .approve_change(change, &resolver, Utc::now())
            .await?;
        info!(change_id = %change.change_id, reason, "Change auto-approved");
        Ok(())
    }

    pub async fn list(
        &self,
        status: Option<ChangeStatus>,
        entity_id: Option<&str>,
    ) -> Result<Vec<PendingChange>> {
        self.changes.list_changes(status, entity_id).await
    }
}
