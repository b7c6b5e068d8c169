//! Generic document store contract and in-memory implementation
//!
//! Every document carries a `version` maintained by the store. `update` with
//! `expected_version` is a compare-and-swap: it fails with `VersionConflict`
//! when another writer got there first. Per-door serialization across engine
//! instances relies on this, not on in-process locks.

use crate::domain::error::EngineError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const DOORS: &str = "doors";
pub const TENANTS: &str = "tenants";
pub const LEASES: &str = "leases";
pub const ACCESS_EVENTS: &str = "access_events";
pub const AUDIT_LOG: &str = "audit_log";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("{collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("{collection}/{id} version conflict (expected {expected}, found {actual})")]
    VersionConflict { collection: String, id: String, expected: u64, actual: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub data: Value,
}

impl Document {
    /// Decode the document body into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| StoreError::Serialization(format!("{}: {}", self.id, e)))
    }
}

/// Encode a typed record into a document body
pub fn encode<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Eq(String, Value),
    Since(String, DateTime<Utc>),
}

/// Conjunction of field predicates for `list`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value.into()));
        self
    }

    /// Field holds an RFC 3339 timestamp at or after `since`
    pub fn since(mut self, field: &str, since: DateTime<Utc>) -> Self {
        self.clauses.push(Clause::Since(field.to_string(), since));
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, expected) => data.get(field) == Some(expected),
            Clause::Since(field, since) => data
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|ts| ts.with_timezone(&Utc) >= *since),
        })
    }
}

/// Persistence collaborator: generic document CRUD
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    /// Insert a new document. The id is taken from `data.id` or generated.
    async fn create(&self, collection: &str, data: Value) -> Result<Document, StoreError>;

    /// Replace a document body. With `expected_version`, only succeeds if the
    /// stored version still matches.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expected_version: Option<u64>,
    ) -> Result<Document, StoreError>;
}

type Collection = BTreeMap<String, Document>;

/// In-process document store
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<FxHashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load seed documents from a JSON file shaped `{ "<collection>": [ {..}, .. ] }`
    ///
    /// Returns the number of documents inserted.
    pub fn load_seed<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let seed: FxHashMap<String, Vec<Value>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))?;

        let mut inserted = 0;
        for (collection, docs) in seed {
            for data in docs {
                self.insert(&collection, data)
                    .with_context(|| format!("Failed to seed collection {}", collection))?;
                inserted += 1;
            }
        }

        info!(file = %path.display(), documents = %inserted, "store_seeded");
        Ok(inserted)
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections.read().get(collection).map_or(0, |c| c.len())
    }

    fn insert(&self, collection: &str, mut data: Value) -> Result<Document, StoreError> {
        let Value::Object(ref mut fields) = data else {
            return Err(StoreError::Serialization(format!(
                "{collection}: document must be a JSON object"
            )));
        };
        let id = match fields.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::now_v7().to_string();
                fields.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::AlreadyExists { collection: collection.to_string(), id });
        }
        let doc = Document { id: id.clone(), version: 1, data };
        docs.insert(id, doc.clone());
        Ok(doc)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.collections.read().get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn list(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs.values().filter(|doc| filter.matches(&doc.data)).cloned().collect())
    }

    async fn create(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
        let doc = self.insert(collection, data)?;
        debug!(collection = %collection, id = %doc.id, "document_created");
        Ok(doc)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        mut data: Value,
        expected_version: Option<u64>,
    ) -> Result<Document, StoreError> {
        if let Value::Object(ref mut fields) = data {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }

        let mut collections = self.collections.write();
        let doc = collections.get_mut(collection).and_then(|c| c.get_mut(id)).ok_or_else(|| {
            StoreError::NotFound { collection: collection.to_string(), id: id.to_string() }
        })?;

        if let Some(expected) = expected_version {
            if doc.version != expected {
                return Err(StoreError::VersionConflict {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected,
                    actual: doc.version,
                });
            }
        }

        doc.version += 1;
        doc.data = data;
        debug!(collection = %collection, id = %id, version = %doc.version, "document_updated");
        Ok(doc.clone())
    }
}
