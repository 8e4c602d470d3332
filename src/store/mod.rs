//! Repository contract for persisted entities.
//!
//! The repository is the system of record; flows only read snapshots and
//! write status updates through it. Entities travel as JSON documents so a
//! backend never needs to know the concrete types.

pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{Amphora, Listener, LoadBalancer, Pool};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid update for {kind} {id}: {reason}")]
    InvalidUpdate {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// A persisted entity type.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Entity for LoadBalancer {
    const KIND: &'static str = "load_balancer";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Amphora {
    const KIND: &'static str = "amphora";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Listener {
    const KIND: &'static str = "listener";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Pool {
    const KIND: &'static str = "pool";
    fn id(&self) -> &str {
        &self.id
    }
}

/// Field updates applied to a stored document (top-level keys replaced).
pub type Fields = Map<String, Value>;

/// Equality filter over top-level fields.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| document.get(field).unwrap_or(&Value::Null) == expected)
    }
}

/// Storage backend. Implementations only handle untyped documents; use the
/// typed helpers on `dyn Repository`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_document(&self, kind: &'static str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn insert_document(&self, kind: &'static str, id: &str, document: Value)
        -> Result<(), StoreError>;

    async fn put_document(&self, kind: &'static str, id: &str, document: Value)
        -> Result<(), StoreError>;

    /// Merge `fields` into the stored document and return the result.
    async fn update_document(
        &self,
        kind: &'static str,
        id: &str,
        fields: Fields,
    ) -> Result<Value, StoreError>;

    /// Merge `fields` only if the stored document still matches `expected`,
    /// checked and written under one lock. `None` when it no longer matches.
    async fn update_document_if(
        &self,
        kind: &'static str,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Value>, StoreError>;

    async fn delete_document(&self, kind: &'static str, id: &str) -> Result<bool, StoreError>;

    async fn list_documents(&self, kind: &'static str, filter: &Filter)
        -> Result<Vec<Value>, StoreError>;
}

fn changes_to_fields(kind: &'static str, id: &str, changes: Value) -> Result<Fields, StoreError> {
    match changes {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidUpdate {
            kind,
            id: id.to_string(),
            reason: format!("expected an object, got {}", other),
        }),
    }
}

fn decode_updated<T: Entity>(id: &str, updated: Value) -> Result<T, StoreError> {
    serde_json::from_value(updated).map_err(|e| StoreError::InvalidUpdate {
        kind: T::KIND,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

impl dyn Repository {
    pub async fn get<T: Entity>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.get_document(T::KIND, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing row is an error.
    pub async fn require<T: Entity>(&self, id: &str) -> Result<T, StoreError> {
        self.get::<T>(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }

    pub async fn insert<T: Entity>(&self, entity: &T) -> Result<(), StoreError> {
        self.insert_document(T::KIND, entity.id(), serde_json::to_value(entity)?)
            .await
    }

    pub async fn put<T: Entity>(&self, entity: &T) -> Result<(), StoreError> {
        self.put_document(T::KIND, entity.id(), serde_json::to_value(entity)?)
            .await
    }

    /// Apply `changes` (a JSON object) and return the updated entity.
    pub async fn update<T: Entity>(&self, id: &str, changes: Value) -> Result<T, StoreError> {
        let fields = changes_to_fields(T::KIND, id, changes)?;
        let updated = self.update_document(T::KIND, id, fields).await?;
        decode_updated(id, updated)
    }

    /// Conditional `update`: `None` when the stored entity no longer matches
    /// `expected`.
    pub async fn update_if<T: Entity>(
        &self,
        id: &str,
        expected: &Filter,
        changes: Value,
    ) -> Result<Option<T>, StoreError> {
        let fields = changes_to_fields(T::KIND, id, changes)?;
        match self.update_document_if(T::KIND, id, expected, fields).await? {
            Some(updated) => decode_updated::<T>(id, updated).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete<T: Entity>(&self, id: &str) -> Result<bool, StoreError> {
        self.delete_document(T::KIND, id).await
    }

    pub async fn list<T: Entity>(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        self.list_documents(T::KIND, filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
            .collect()
    }

    /// Amphorae bound to a load balancer, deleted ones excluded.
    pub async fn amphorae_for(&self, load_balancer_id: &str) -> Result<Vec<Amphora>, StoreError> {
        let mut amphorae: Vec<Amphora> = self
            .list(&Filter::new().eq("load_balancer_id", load_balancer_id))
            .await?;
        amphorae.retain(|amp| !amp.is_deleted());
        amphorae.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(amphorae)
    }
}
