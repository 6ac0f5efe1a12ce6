// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The document-store seam.
//!
//! The coordinator consumes document-oriented CRUD with unique-field
//! indexes; the concrete backend is deployment-specific and plugs in behind
//! [`DocumentStore`]. The typed [`Catalog`] wrapper is what handlers use —
//! it serialises the models from [`crate::models`] in and out of the store
//! so no handler touches raw JSON documents.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Manager, MessageLog, Task, Volunteer, VolunteerStatus, Workflow};

// ── Collections ───────────────────────────────────────────────────────────────

pub const MANAGERS: &str = "managers";
pub const VOLUNTEERS: &str = "volunteers";
pub const WORKFLOWS: &str = "workflows";
pub const TASKS: &str = "tasks";
pub const MESSAGE_LOGS: &str = "message_logs";

/// Unique-field constraints the backend must enforce. Handler races on
/// registration are resolved by these, not by application-level locking.
pub const UNIQUE_INDEXES: &[(&str, &str)] = &[
    (MANAGERS, "username"),
    (MANAGERS, "email"),
    (VOLUNTEERS, "username"),
];

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Durable CRUD over JSON documents. Every document carries an `id` field.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, collection: &str, doc: Value) -> Result<(), StoreError>;

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, StoreError>;

    /// Replace the document whose `id` equals `id`.
    async fn update_by_id(&self, collection: &str, id: &str, doc: Value)
        -> Result<(), StoreError>;

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

    async fn count_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError>;
}

// ── Typed catalogue ───────────────────────────────────────────────────────────

/// Typed access to the store for the coordinator's handlers.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn DocumentStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    // ── Managers ──────────────────────────────────────────────────────────

    pub async fn insert_manager(&self, manager: &Manager) -> Result<(), StoreError> {
        self.store
            .insert(MANAGERS, serde_json::to_value(manager)?)
            .await
    }

    pub async fn manager_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Manager>, StoreError> {
        self.find_one(MANAGERS, "username", &Value::from(username)).await
    }

    pub async fn manager_by_email(&self, email: &str) -> Result<Option<Manager>, StoreError> {
        self.find_one(MANAGERS, "email", &Value::from(email)).await
    }

    pub async fn manager_by_id(&self, id: Uuid) -> Result<Option<Manager>, StoreError> {
        self.find_one(MANAGERS, "id", &Value::from(id.to_string())).await
    }

    pub async fn update_manager(&self, manager: &Manager) -> Result<(), StoreError> {
        self.store
            .update_by_id(
                MANAGERS,
                &manager.id.to_string(),
                serde_json::to_value(manager)?,
            )
            .await
    }

    // ── Volunteers ────────────────────────────────────────────────────────

    pub async fn insert_volunteer(&self, volunteer: &Volunteer) -> Result<(), StoreError> {
        self.store
            .insert(VOLUNTEERS, serde_json::to_value(volunteer)?)
            .await
    }

    pub async fn volunteer_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Volunteer>, StoreError> {
        self.find_one(VOLUNTEERS, "username", &Value::from(username)).await
    }

    pub async fn volunteer_by_id(&self, id: Uuid) -> Result<Option<Volunteer>, StoreError> {
        self.find_one(VOLUNTEERS, "id", &Value::from(id.to_string())).await
    }

    pub async fn update_volunteer(&self, volunteer: &Volunteer) -> Result<(), StoreError> {
        self.store
            .update_by_id(
                VOLUNTEERS,
                &volunteer.id.to_string(),
                serde_json::to_value(volunteer)?,
            )
            .await
    }

    /// Volunteers currently online and idle.
    pub async fn available_volunteers(&self) -> Result<Vec<Volunteer>, StoreError> {
        let status = serde_json::to_value(VolunteerStatus::Available)?;
        let docs = self
            .store
            .find_by_field(VOLUNTEERS, "status", &status)
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(StoreError::from))
            .collect()
    }

    /// Every registered volunteer, used by fingerprint matching.
    pub async fn all_volunteers(&self) -> Result<Vec<Volunteer>, StoreError> {
        // A document store has no unconditional scan in the required
        // operation set; enumerate the three status values instead.
        let mut all = Vec::new();
        for status in [
            VolunteerStatus::Available,
            VolunteerStatus::Busy,
            VolunteerStatus::Offline,
        ] {
            let value = serde_json::to_value(status)?;
            for doc in self.store.find_by_field(VOLUNTEERS, "status", &value).await? {
                all.push(serde_json::from_value(doc)?);
            }
        }
        Ok(all)
    }

    // ── Workflows & tasks ─────────────────────────────────────────────────

    pub async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.store
            .insert(WORKFLOWS, serde_json::to_value(workflow)?)
            .await
    }

    pub async fn workflow_by_id(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        self.find_one(WORKFLOWS, "id", &Value::from(id.to_string())).await
    }

    pub async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.store.insert(TASKS, serde_json::to_value(task)?).await
    }

    pub async fn task_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.find_one(TASKS, "id", &Value::from(id.to_string())).await
    }

    pub async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        self.store
            .update_by_id(TASKS, &task.id.to_string(), serde_json::to_value(task)?)
            .await
    }

    // ── Message log ───────────────────────────────────────────────────────

    pub async fn insert_message_log(&self, row: &MessageLog) -> Result<(), StoreError> {
        self.store
            .insert(MESSAGE_LOGS, serde_json::to_value(row)?)
            .await
    }

    pub async fn count_messages_on_channel(&self, channel: &str) -> Result<usize, StoreError> {
        self.store
            .count_by_field(MESSAGE_LOGS, "channel", &Value::from(channel))
            .await
    }

    // ── Internal ──────────────────────────────────────────────────────────

    async fn find_one<T: serde::de::DeserializeOwned>(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<T>, StoreError> {
        let mut docs = self.store.find_by_field(collection, field, value).await?;
        match docs.pop() {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }
}
