// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable data model and the document-store seam the coordinator consumes.

pub mod error;
pub mod memory;
pub mod models;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{
    Manager, ManagerStatus, MessageLog, Performance, ResourceEstimate, Task, TaskStatus,
    Volunteer, VolunteerStatus, Workflow, WorkflowStatus,
};
pub use store::{Catalog, DocumentStore};
