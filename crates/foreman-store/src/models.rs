// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable entities: managers, volunteers, workflows, tasks, and the
//! append-only message log.
//!
//! Cross-entity links are stored as ids and resolved at read time
//! (`Task::assigned_volunteer` is a `Uuid`, never an embedded record).
//! All timestamps are UTC and serialise as ISO-8601 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Managers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerStatus {
    Active,
    Inactive,
    Suspended,
}

/// A user who submits workflows. `username` and `email` are globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manager {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Argon2 hash; never the plaintext.
    pub password_hash: String,
    pub status: ManagerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl Manager {
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            status: ManagerStatus::Active,
            registered_at: Utc::now(),
            last_login: None,
        }
    }
}

// ── Volunteers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolunteerStatus {
    Available,
    Busy,
    Offline,
}

/// Task-outcome counters. The trust score is derived, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Performance {
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// `100 × tasks_completed / max(1, tasks_total)`, always in `[0, 100]`.
    pub trust_score: f64,
}

impl Performance {
    /// Recompute the trust score from the counters.
    pub fn recompute(&mut self) {
        let total = self.tasks_total.max(1);
        let score = 100.0 * self.tasks_completed as f64 / total as f64;
        self.trust_score = (score * 100.0).round() / 100.0;
    }
}

/// Hardware the volunteer advertises, used for placement decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volunteer {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub name: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    pub total_ram_mb: u64,
    pub available_storage_gb: u64,
    pub os: String,
    pub gpu_available: bool,
    pub gpu_model: Option<String>,
    pub gpu_memory_mb: Option<u64>,
    pub ip: String,
    pub port: u16,
    pub status: VolunteerStatus,
    pub last_activity: DateTime<Utc>,
    pub performance: Performance,
    /// Stable hardware attributes used to recognise a returning node.
    pub machine_fingerprint: serde_json::Map<String, serde_json::Value>,
}

impl Volunteer {
    /// Disk capacity in MB, the unit resource estimates use.
    pub fn available_storage_mb(&self) -> u64 {
        self.available_storage_gb * 1024
    }
}

// ── Workflows & tasks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Validated,
    Splitting,
    Assigning,
    Pending,
    Running,
    Paused,
    PartialFailure,
    Reassigning,
    Aggregating,
    Completed,
    Failed,
}

/// Per-workflow resource estimate. Axes are compared independently during
/// volunteer selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub gpu: bool,
}

impl Default for ResourceEstimate {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            memory_mb: 1024,
            disk_mb: 500,
            gpu: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub workflow_type: String,
    pub owner: Uuid,
    pub status: WorkflowStatus,
    pub priority: u32,
    pub estimated_resources: ResourceEstimate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    /// Controlled FAILED → PENDING transition while a new volunteer is sought.
    PendingReassignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow: Uuid,
    pub name: String,
    pub command: String,
    pub dependencies: Vec<Uuid>,
    pub status: TaskStatus,
    pub assigned_volunteer: Option<Uuid>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    pub required_resources: ResourceEstimate,
    pub attempts: u32,
    pub results: Option<serde_json::Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

// ── Message log ───────────────────────────────────────────────────────────────

/// One row per publication. Append-only; rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: Uuid,
    pub sender_type: String,
    pub sender_id: String,
    pub receiver_type: Option<String>,
    pub receiver_id: Option<String>,
    pub channel: String,
    pub request_id: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
