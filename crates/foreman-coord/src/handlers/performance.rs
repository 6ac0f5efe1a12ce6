// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Volunteer performance accounting and task reassignment.
//!
//! Task-status events drive the trust score. The same terminal event may be
//! republished (retries, multiple observers), so accounting is memoised on
//! the `(volunteer, task, status)` triple — replaying an event any number
//! of times leaves the counters where a single application put them.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use foreman_protocol::{Envelope, MessageType};
use foreman_store::{TaskStatus, VolunteerStatus};

use crate::handlers::{data_object, HandlerContext};
use crate::scheduler;

const REASSIGNMENT_RESPONSE: &str = "task/reassignment/response";

const COMPLETED_STATUSES: &[&str] = &["completed", "success", "done"];
const FAILED_STATUSES: &[&str] = &["failed", "error", "timeout"];

// ── Status memoisation ────────────────────────────────────────────────────────

/// Bounded dedup cache for status events. FIFO eviction keeps it from
/// growing without limit on a long-lived coordinator.
pub struct StatusMemo {
    inner: std::sync::Mutex<MemoInner>,
    capacity: usize,
}

struct MemoInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl Default for StatusMemo {
    fn default() -> Self {
        Self::with_capacity(65_536)
    }
}

impl StatusMemo {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(MemoInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Record the triple; returns `false` when it was already seen.
    pub fn record(&self, volunteer_id: &str, task_id: &str, status: &str) -> bool {
        let key = format!("{volunteer_id}_{task_id}_{status}");
        let mut inner = self.inner.lock().expect("memo lock poisoned");
        if !inner.seen.insert(key.clone()) {
            return false;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
        true
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `task/status` — update the volunteer's counters on terminal outcomes.
pub async fn task_status_handler(ctx: Arc<HandlerContext>, _channel: String, envelope: Envelope) {
    let Some(data) = data_object(&envelope) else {
        error!("task/status without data object");
        return;
    };
    let (Some(task_id), Some(status), Some(volunteer_id)) = (
        data.get("task_id").and_then(|v| v.as_str()),
        data.get("status").and_then(|v| v.as_str()),
        data.get("volunteer_id").and_then(|v| v.as_str()),
    ) else {
        error!("task/status missing task_id/status/volunteer_id");
        return;
    };

    let status_lower = status.to_lowercase();
    let completed = COMPLETED_STATUSES.contains(&status_lower.as_str());
    let failed = FAILED_STATUSES.contains(&status_lower.as_str());
    if !completed && !failed {
        // Progress updates and the like: no accounting impact.
        return;
    }

    if !ctx.memo.record(volunteer_id, task_id, &status_lower) {
        info!(volunteer_id, task_id, status = %status_lower, "status event already counted");
        return;
    }

    let Ok(volunteer_uuid) = Uuid::parse_str(volunteer_id) else {
        error!(volunteer_id, "invalid volunteer id in task/status");
        return;
    };
    let mut volunteer = match ctx.catalog.volunteer_by_id(volunteer_uuid).await {
        Ok(Some(v)) => v,
        Ok(None) => {
            error!(volunteer_id, "volunteer not found for status event");
            return;
        }
        Err(e) => {
            error!(volunteer_id, "volunteer load failed: {e}");
            return;
        }
    };

    volunteer.performance.tasks_total += 1;
    if completed {
        volunteer.performance.tasks_completed += 1;
    } else {
        volunteer.performance.tasks_failed += 1;
    }
    volunteer.performance.recompute();

    if let Err(e) = ctx.catalog.update_volunteer(&volunteer).await {
        error!(volunteer_id, "performance update failed: {e}");
        return;
    }
    info!(
        volunteer_id,
        task_id,
        trust_score = volunteer.performance.trust_score,
        "trust score updated"
    );
}

/// `task/assignment` — the manager handed a task to a volunteer.
pub async fn task_assignment_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
    let Some(data) = data_object(&envelope) else {
        return;
    };
    let (Some(task_id), Some(volunteer_id)) = (
        data.get("task_id").and_then(|v| v.as_str()),
        data.get("volunteer_id").and_then(|v| v.as_str()),
    ) else {
        error!("task/assignment missing task_id/volunteer_id");
        return;
    };

    let Ok(volunteer_uuid) = Uuid::parse_str(volunteer_id) else {
        return;
    };
    let mut volunteer = match ctx.catalog.volunteer_by_id(volunteer_uuid).await {
        Ok(Some(v)) => v,
        _ => {
            error!(volunteer_id, "volunteer not found for assignment");
            return;
        }
    };
    volunteer.status = VolunteerStatus::Busy;
    volunteer.last_activity = Utc::now();
    if let Err(e) = ctx.catalog.update_volunteer(&volunteer).await {
        error!(volunteer_id, "assignment bookkeeping failed: {e}");
        return;
    }
    info!(volunteer_id, task_id, "volunteer marked busy");
}

/// `task/reassignment` — find a new volunteer for a task that lost its
/// original one.
pub async fn task_reassignment_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
    let Some(data) = data_object(&envelope) else {
        return;
    };
    let Some(task_id) = data.get("task_id").and_then(|v| v.as_str()) else {
        error!("task/reassignment without task_id");
        return;
    };
    let manager_id = data.get("manager_id").and_then(|v| v.as_str());
    let estimate = scheduler::parse_estimate(data.get("estimated_resources"));
    let request_id = envelope.request_id;

    let Ok(task_uuid) = Uuid::parse_str(task_id) else {
        send_reassignment_response(&ctx, request_id, task_id, manager_id, None, Some("Tâche non trouvée"))
            .await;
        return;
    };
    let mut task = match ctx.catalog.task_by_id(task_uuid).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            warn!(task_id, "reassignment for unknown task");
            send_reassignment_response(
                &ctx,
                request_id,
                task_id,
                manager_id,
                None,
                Some("Tâche non trouvée"),
            )
            .await;
            return;
        }
        Err(e) => {
            send_reassignment_response(&ctx, request_id, task_id, manager_id, None, Some(&e.to_string()))
                .await;
            return;
        }
    };

    // Controlled failed → pending transition; each pass costs an attempt.
    task.status = TaskStatus::PendingReassignment;
    task.assigned_volunteer = None;
    task.attempts += 1;
    if let Err(e) = ctx.catalog.update_task(&task).await {
        send_reassignment_response(&ctx, request_id, task_id, manager_id, None, Some(&e.to_string()))
            .await;
        return;
    }

    let available = match ctx.catalog.available_volunteers().await {
        Ok(list) => list,
        Err(e) => {
            send_reassignment_response(&ctx, request_id, task_id, manager_id, None, Some(&e.to_string()))
                .await;
            return;
        }
    };
    let candidates = scheduler::select(available, &estimate);

    let Some(best) = candidates.first() else {
        warn!(task_id, "no volunteer available for reassignment");
        send_reassignment_response(
            &ctx,
            request_id,
            task_id,
            manager_id,
            None,
            Some("Aucun volontaire disponible"),
        )
        .await;
        return;
    };

    task.assigned_volunteer = Some(best.id);
    task.status = TaskStatus::Assigned;
    if let Err(e) = ctx.catalog.update_task(&task).await {
        send_reassignment_response(&ctx, request_id, task_id, manager_id, None, Some(&e.to_string()))
            .await;
        return;
    }

    info!(task_id, volunteer_id = %best.id, "task reassigned");
    send_reassignment_response(&ctx, request_id, task_id, manager_id, Some(best.id), None).await;
}

async fn send_reassignment_response(
    ctx: &HandlerContext,
    request_id: Uuid,
    task_id: &str,
    manager_id: Option<&str>,
    volunteer_id: Option<Uuid>,
    error_message: Option<&str>,
) {
    let mut data = json!({
        "task_id": task_id,
        "manager_id": manager_id,
        "success": volunteer_id.is_some(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(id) = volunteer_id {
        data["volunteer_id"] = json!(id.to_string());
    }
    if let Some(message) = error_message {
        data["error"] = json!(message);
    }

    let result = ctx
        .client
        .publish(
            REASSIGNMENT_RESPONSE,
            data,
            Some(request_id),
            Some(ctx.coordinator_token.clone()),
            Some(MessageType::Response),
            None,
        )
        .await;
    if let Err(e) = result {
        error!(task_id, "reassignment response publish failed: {e}");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
