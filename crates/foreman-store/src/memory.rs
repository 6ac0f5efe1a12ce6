// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! In-memory [`DocumentStore`] backend.
//!
//! Selected by `STORE_URI=memory://`. This is the reference backend used by
//! tests and single-node deployments; a persistent backend implements the
//! same trait and the same unique-index contract. All state is lost on
//! restart — acceptable for everything except production message-log
//! retention, which is a deployment concern.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{DocumentStore, UNIQUE_INDEXES};

/// Mutex-guarded collection map: `collection → (id → document)`.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unique_fields(collection: &str) -> impl Iterator<Item = &'static str> + '_ {
        UNIQUE_INDEXES
            .iter()
            .filter(move |(c, _)| *c == collection)
            .map(|(_, f)| *f)
    }
}

fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Unavailable("document without id".into()))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?;
        let mut collections = self.collections.lock().await;
        let table = collections.entry(collection.to_string()).or_default();

        for field in Self::unique_fields(collection) {
            if let Some(value) = doc.get(field) {
                let taken = table
                    .values()
                    .any(|existing| existing.get(field) == Some(value));
                if taken {
                    return Err(StoreError::duplicate(field));
                }
            }
        }
        if table.contains_key(&id) {
            return Err(StoreError::duplicate("id"));
        }

        table.insert(id, doc);
        Ok(())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(table) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|doc| doc.get(field) == Some(value))
            .cloned()
            .collect())
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        let table = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        if !table.contains_key(id) {
            return Err(StoreError::not_found(collection));
        }

        for field in Self::unique_fields(collection) {
            if let Some(value) = doc.get(field) {
                let taken = table.iter().any(|(other_id, existing)| {
                    other_id != id && existing.get(field) == Some(value)
                });
                if taken {
                    return Err(StoreError::duplicate(field));
                }
            }
        }

        table.insert(id.to_string(), doc);
        Ok(())
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().await;
        Ok(collections
            .get_mut(collection)
            .map(|table| table.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn count_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<usize, StoreError> {
        Ok(self.find_by_field(collection, field, value).await?.len())
    }
}

/// Open the backend selected by a `STORE_URI` value.
pub fn open(uri: &str) -> Result<std::sync::Arc<dyn DocumentStore>, StoreError> {
    match uri.split_once("://").map(|(scheme, _)| scheme) {
        Some("memory") => Ok(std::sync::Arc::new(MemoryStore::new())),
        _ => Err(StoreError::Unavailable(format!(
            "unsupported store uri: {uri}"
        ))),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_and_find_by_field() {
        let store = MemoryStore::new();
        store
            .insert("managers", json!({"id": "1", "username": "alice", "email": "a@x.io"}))
            .await
            .unwrap();
        let found = store
            .find_by_field("managers", "username", &json!("alice"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["email"], "a@x.io");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStore::new();
        store
            .insert("managers", json!({"id": "1", "username": "alice", "email": "a@x.io"}))
            .await
            .unwrap();
        let err = store
            .insert("managers", json!({"id": "2", "username": "bob", "email": "a@x.io"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { ref field } if field == "email"));
    }

    #[tokio::test]
    async fn unique_index_is_per_collection() {
        let store = MemoryStore::new();
        store
            .insert("message_logs", json!({"id": "1", "channel": "a"}))
            .await
            .unwrap();
        // No unique constraint on message_logs: same channel twice is fine.
        store
            .insert("message_logs", json!({"id": "2", "channel": "a"}))
            .await
            .unwrap();
        assert_eq!(
            store
                .count_by_field("message_logs", "channel", &json!("a"))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn update_replaces_document() {
        let store = MemoryStore::new();
        store
            .insert("tasks", json!({"id": "t1", "status": "pending"}))
            .await
            .unwrap();
        store
            .update_by_id("tasks", "t1", json!({"id": "t1", "status": "assigned"}))
            .await
            .unwrap();
        let found = store
            .find_by_field("tasks", "status", &json!("assigned"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn update_missing_id_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_by_id("tasks", "nope", json!({"id": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_cannot_steal_unique_value() {
        let store = MemoryStore::new();
        store
            .insert("volunteers", json!({"id": "1", "username": "v1", "status": "available"}))
            .await
            .unwrap();
        store
            .insert("volunteers", json!({"id": "2", "username": "v2", "status": "available"}))
            .await
            .unwrap();
        let err = store
            .update_by_id("volunteers", "2", json!({"id": "2", "username": "v1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.insert("tasks", json!({"id": "t1"})).await.unwrap();
        assert!(store.delete_by_id("tasks", "t1").await.unwrap());
        assert!(!store.delete_by_id("tasks", "t1").await.unwrap());
    }

    #[test]
    fn open_accepts_memory_scheme_only() {
        assert!(open("memory://").is_ok());
        assert!(open("mongodb://localhost").is_err());
    }
}
