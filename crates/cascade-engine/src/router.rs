use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cascade_core::destination::{DestinationKind, DestinationProfile, OutputDestination};
use cascade_core::error::{CascadeError, Result};
use cascade_core::event::EventBus;
use cascade_core::graph::WorkflowNode;
use cascade_core::traits::{DestinationTransport, FieldStore, SharedCacheStore};
use cascade_core::types::{
    CascadeEvent, ChangeAction, ChangeStatus, DestinationResult, DestinationStatus, PendingChange,
    RunId, SharedCacheEntry,
};

use crate::json_path;
use crate::review::{ChangePlan, ChangeReview};

/// Hierarchy depth whose edits `auto_approve_l4` lets through.
pub const LEAF_LEVEL: usize = 4;

/// Identity of the node output being routed.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub run_id: RunId,
    pub entity_id: String,
    pub workflow_id: String,
    pub version: u64,
    pub content_hash: String,
}

/// Lowercase, non-alphanumerics collapsed to `_`.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut gap = false;
    for c in label.chars() {
        if c.is_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('_');
            }
            slug.extend(c.to_lowercase());
            gap = false;
        } else {
            gap = true;
        }
    }
    if slug.is_empty() {
        "output".to_string()
    } else {
        slug
    }
}

/// Fans a node's output out to its destinations and shared caches.
///
/// Every write is independent: a failing destination is reported on its own
/// result and as a `DestinationFailed` event, never as an error.
pub struct OutputRouter {
    fields: Arc<dyn FieldStore>,
    shared: Arc<dyn SharedCacheStore>,
    review: Arc<ChangeReview>,
    transport: Arc<dyn DestinationTransport>,
    event_bus: Arc<EventBus>,
}

impl OutputRouter {
    pub fn new(
        fields: Arc<dyn FieldStore>,
        shared: Arc<dyn SharedCacheStore>,
        review: Arc<ChangeReview>,
        transport: Arc<dyn DestinationTransport>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            fields,
            shared,
            review,
            transport,
            event_bus,
        }
    }

    pub async fn route(
        &self,
        ctx: &RouteContext,
        node: &WorkflowNode,
        output: &Value,
    ) -> Vec<DestinationResult> {
        let mut results = Vec::new();

        for dest in node.destinations.iter() {
            let result = if !dest.enabled {
                DestinationResult {
                    destination_id: dest.id.clone(),
                    status: DestinationStatus::Skipped {
                        reason: "disabled".into(),
                    },
                    payload: None,
                }
            } else {
                match self.write_destination(ctx, node, dest, output).await {
                    Ok((status, payload)) => DestinationResult {
                        destination_id: dest.id.clone(),
                        status,
                        payload,
                    },
                    Err(e) => self.failed(ctx, node, &dest.id, e),
                }
            };
            results.push(result);
        }

        for cache_id in &node.shared_cache_outputs {
            let destination_id = format!("shared_cache:{}", cache_id);
            let entry = SharedCacheEntry {
                cache_id: cache_id.clone(),
                entity_id: ctx.entity_id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                node_id: node.id.clone(),
                data: output.clone(),
                content_hash: ctx.content_hash.clone(),
                version: ctx.version,
                updated_at: Utc::now(),
            };
            let result = match self.shared.upsert_entry(&entry).await {
                Ok(()) => DestinationResult {
                    destination_id,
                    status: DestinationStatus::Written,
                    payload: None,
                },
                Err(e) => self.failed(ctx, node, &destination_id, e),
            };
            results.push(result);
        }

        debug!(
            node_id = %node.id,
            routed = results.len(),
            failed = results.iter().filter(|r| r.is_failure()).count(),
            "Output routed"
        );
        results
    }

    fn failed(
        &self,
        ctx: &RouteContext,
        node: &WorkflowNode,
        destination_id: &str,
        error: CascadeError,
    ) -> DestinationResult {
        let error = CascadeError::DestinationWrite {
            destination_id: destination_id.to_string(),
            message: error.to_string(),
        }
        .to_string();
        warn!(
            run_id = %ctx.run_id,
            node_id = %node.id,
            destination_id,
            error = %error,
            "Destination write failed"
        );
        self.event_bus.publish(CascadeEvent::DestinationFailed {
            run_id: ctx.run_id.clone(),
            node_id: node.id.clone(),
            destination_id: destination_id.to_string(),
            error: error.clone(),
        });
        DestinationResult {
            destination_id: destination_id.to_string(),
            status: DestinationStatus::Failed { error },
            payload: None,
        }
    }

    async fn write_destination(
        &self,
        ctx: &RouteContext,
        node: &WorkflowNode,
        dest: &OutputDestination,
        output: &Value,
    ) -> Result<(DestinationStatus, Option<Value>)> {
        dest.validate()?;

        let selected = json_path::select(output, dest.field_mapping.source_path.as_deref())
            .ok_or_else(|| {
                CascadeError::InvalidDestination(format!(
                    "{}: source path {} matched nothing",
                    dest.id,
                    dest.field_mapping.source_path.as_deref().unwrap_or("$")
                ))
            })?;

        match (dest.kind, dest.profile) {
            (DestinationKind::InternalDb, DestinationProfile::MasterData) => {
                let (domain, field_key) = match (
                    dest.field_mapping.domain.as_deref(),
                    dest.field_mapping.field_key.as_deref(),
                ) {
                    (Some(d), Some(k)) => (d, k),
                    _ => {
                        return Err(CascadeError::InvalidDestination(format!(
                            "{}: master_data requires domain and field_key",
                            dest.id
                        )))
                    }
                };
                self.fields
                    .write_field(&ctx.entity_id, domain, field_key, selected)
                    .await?;
                Ok((DestinationStatus::Written, None))
            }
            (DestinationKind::InternalDb, DestinationProfile::SsotUpdate) => {
                self.write_change_plan(ctx, node, dest, &selected).await
            }
            (DestinationKind::Webhook, _) | (DestinationKind::ExternalApi, _) => {
                let field_name = dest
                    .field_mapping
                    .field_name
                    .clone()
                    .unwrap_or_else(|| slugify(node.display_label()));
                let mut payload = json!({ field_name: selected });
                if dest.kind == DestinationKind::Webhook {
                    payload = json!({
                        "entity_id": ctx.entity_id,
                        "workflow_id": ctx.workflow_id,
                        "node_id": node.id,
                        "version": ctx.version,
                        "data": payload,
                    });
                }
                if let Some(url) = dest.endpoint.as_deref() {
                    self.transport.post_json(url, payload.clone()).await?;
                }
                Ok((DestinationStatus::Written, Some(payload)))
            }
            (DestinationKind::InternalDb, DestinationProfile::Plain) => Err(
                CascadeError::InvalidDestination(format!("{}: internal_db needs a profile", dest.id)),
            ),
        }
    }

    async fn write_change_plan(
        &self,
        ctx: &RouteContext,
        node: &WorkflowNode,
        dest: &OutputDestination,
        output: &Value,
    ) -> Result<(DestinationStatus, Option<Value>)> {
        let plan = ChangePlan::from_output(output)?;
        let mut queued = Vec::new();
        let mut auto = Vec::new();

        for planned in &plan.changes {
            let domain = planned.domain();
            let existing = self
                .fields
                .get_field(&ctx.entity_id, &domain, &planned.target_path)
                .await?;
            let action = planned.action.unwrap_or(if existing.is_some() {
                ChangeAction::Update
            } else {
                ChangeAction::Create
            });

            let change = PendingChange {
                change_id: planned.id(&ctx.entity_id),
                entity_id: ctx.entity_id.clone(),
                node_id: node.id.clone(),
                target_domain: domain,
                target_path: planned.target_path.clone(),
                action,
                proposed_value: planned.proposed_value.clone(),
                status: ChangeStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                resolved_by: None,
            };

            let auto_reason = if dest.approval.auto_approve_l4 && planned.level() == LEAF_LEVEL {
                Some("l4")
            } else if existing.as_ref().is_some_and(|f| !f.require_approval_create) {
                Some("field_policy")
            } else {
                None
            };

            match auto_reason {
                Some(reason) => {
                    self.review.auto_approve(&change, reason).await?;
                    auto.push(change.change_id);
                }
                None => {
                    self.review.submit(&change).await?;
                    queued.push(change.change_id);
                }
            }
        }

        let payload = json!({ "queued": queued, "auto_approved": auto });
        let status = if queued.is_empty() {
            DestinationStatus::AutoApproved { change_ids: auto }
        } else {
            DestinationStatus::Queued { change_ids: queued }
        };
        Ok((status, Some(payload)))
    }
}
