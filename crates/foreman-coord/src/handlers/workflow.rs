// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Workflow intake: validate the submission, persist the workflow, and
//! answer with a ranked list of volunteers that can carry it.
//!
//! The coordinator does not assign tasks here. The manager receives the
//! candidate list on `workflow/submit_response` and directs tasks itself
//! via `task/assignment`; an empty list is still a success — the manager
//! may simply re-submit later.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_protocol::Envelope;
use foreman_store::{ManagerStatus, Workflow, WorkflowStatus};

use crate::handlers::{data_object, require_str, respond, respond_error, HandlerContext};
use crate::scheduler;

const SUBMIT_RESPONSE: &str = "workflow/submit_response";

/// `workflow/submit`
pub async fn workflow_submission_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
    let request_id = envelope.request_id;
    let Some(data) = data_object(&envelope) else {
        respond_error(&ctx, SUBMIT_RESPONSE, request_id, "Format de données invalide").await;
        return;
    };

    let fields = (
        require_str(data, "workflow_id"),
        require_str(data, "workflow_name"),
        require_str(data, "workflow_type"),
        require_str(data, "owner"),
    );
    let (workflow_id, workflow_name, workflow_type, owner) = match fields {
        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
        (Err(m), _, _, _) | (_, Err(m), _, _) | (_, _, Err(m), _) | (_, _, _, Err(m)) => {
            respond_error(&ctx, SUBMIT_RESPONSE, request_id, m).await;
            return;
        }
    };

    let Ok(workflow_uuid) = Uuid::parse_str(workflow_id) else {
        respond_error(&ctx, SUBMIT_RESPONSE, request_id, "workflow_id invalide").await;
        return;
    };
    let Ok(owner_uuid) = Uuid::parse_str(owner) else {
        respond_error(&ctx, SUBMIT_RESPONSE, request_id, "Manager not found").await;
        return;
    };

    let estimated_resources = scheduler::parse_estimate(data.get("estimated_resources"));

    // The owner must exist and be in good standing.
    match ctx.catalog.manager_by_id(owner_uuid).await {
        Ok(Some(manager)) if manager.status == ManagerStatus::Suspended => {
            respond_error(&ctx, SUBMIT_RESPONSE, request_id, "Ce compte n'est pas actif").await;
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            respond_error(&ctx, SUBMIT_RESPONSE, request_id, "Manager not found").await;
            return;
        }
        Err(e) => {
            respond_error(&ctx, SUBMIT_RESPONSE, request_id, e.to_string()).await;
            return;
        }
    }

    let now = Utc::now();
    let workflow = Workflow {
        id: workflow_uuid,
        name: workflow_name.to_string(),
        description: data
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        workflow_type: workflow_type.to_string(),
        owner: owner_uuid,
        status: WorkflowStatus::Created,
        priority: data
            .get("priority")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32,
        estimated_resources,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = ctx.catalog.insert_workflow(&workflow).await {
        respond_error(&ctx, SUBMIT_RESPONSE, request_id, e.to_string()).await;
        return;
    }

    let available = match ctx.catalog.available_volunteers().await {
        Ok(list) => list,
        Err(e) => {
            warn!(workflow = %workflow.id, "volunteer scan failed: {e}");
            Vec::new()
        }
    };
    let candidates = scheduler::select(available, &estimated_resources);
    let volunteers: Vec<_> = candidates.iter().map(scheduler::candidate_summary).collect();

    info!(
        workflow = %workflow.id,
        name = workflow_name,
        candidates = volunteers.len(),
        "workflow accepted"
    );
    respond(
        &ctx,
        SUBMIT_RESPONSE,
        request_id,
        json!({
            "status": "success",
            "message": "Workflow accepté",
            "workflow_id": workflow.id.to_string(),
            "volunteers": volunteers,
        }),
    )
    .await;
}
