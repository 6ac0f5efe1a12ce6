// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Volunteer selection for workflow placement and task reassignment.
//!
//! Selection is a dominance filter — the volunteer's resources must meet or
//! exceed the estimate on every axis — followed by a deterministic ranking:
//! trust score descending, completed tasks descending, id ascending.

use serde_json::{json, Value};

use foreman_store::{ResourceEstimate, Volunteer};

/// Whether a volunteer's resources dominate the estimate on each axis.
pub fn meets_requirements(volunteer: &Volunteer, required: &ResourceEstimate) -> bool {
    if volunteer.cpu_cores < required.cpu_cores {
        return false;
    }
    if volunteer.total_ram_mb < required.memory_mb {
        return false;
    }
    if volunteer.available_storage_mb() < required.disk_mb {
        return false;
    }
    // GPU is an implication: only required when the estimate asks for one.
    if required.gpu && !volunteer.gpu_available {
        return false;
    }
    true
}

/// Filter `volunteers` by the dominance rule and rank the survivors.
pub fn select(volunteers: Vec<Volunteer>, required: &ResourceEstimate) -> Vec<Volunteer> {
    let mut candidates: Vec<Volunteer> = volunteers
        .into_iter()
        .filter(|v| meets_requirements(v, required))
        .collect();
    rank(&mut candidates);
    candidates
}

/// Deterministic ordering: best trust first, ties by completed count, then
/// by id so equal records always sort the same way.
pub fn rank(candidates: &mut [Volunteer]) {
    candidates.sort_by(|a, b| {
        b.performance
            .trust_score
            .total_cmp(&a.performance.trust_score)
            .then_with(|| b.performance.tasks_completed.cmp(&a.performance.tasks_completed))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// The candidate shape carried in `workflow/submit_response`.
pub fn candidate_summary(volunteer: &Volunteer) -> Value {
    json!({
        "volunteer_id": volunteer.id.to_string(),
        "username": volunteer.username,
        "trust_score": volunteer.performance.trust_score,
        "resources": {
            "cpu_cores": volunteer.cpu_cores,
            "memory_mb": volunteer.total_ram_mb,
            "disk_space_mb": volunteer.available_storage_mb(),
            "gpu": volunteer.gpu_available,
        },
    })
}

/// Parse an `estimated_resources` object, falling back to the defaults for
/// absent fields (or the whole object).
pub fn parse_estimate(data: Option<&Value>) -> ResourceEstimate {
    let defaults = ResourceEstimate::default();
    let Some(obj) = data.and_then(|v| v.as_object()) else {
        return defaults;
    };
    ResourceEstimate {
        cpu_cores: obj
            .get("cpu_cores")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(defaults.cpu_cores),
        memory_mb: obj
            .get("memory_mb")
            .and_then(|v| v.as_u64())
            .unwrap_or(defaults.memory_mb),
        disk_mb: obj
            .get("disk_mb")
            .and_then(|v| v.as_u64())
            .or_else(|| obj.get("disk_space_mb").and_then(|v| v.as_u64()))
            .unwrap_or(defaults.disk_mb),
        gpu: obj
            .get("gpu")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.gpu),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
