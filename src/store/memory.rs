//! In-process document store keyed by entity kind and id.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{Fields, Filter, Repository, StoreError};

type Documents = BTreeMap<&'static str, BTreeMap<String, Value>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<Documents>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Documents>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Number of stored documents of one kind.
    pub fn count(&self, kind: &'static str) -> usize {
        self.lock()
            .map(|docs| docs.get(kind).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

fn stored_mut<'a>(
    docs: &'a mut Documents,
    kind: &'static str,
    id: &str,
) -> Result<&'a mut Value, StoreError> {
    docs.get_mut(kind)
        .and_then(|rows| rows.get_mut(id))
        .ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })
}

fn merge(document: &mut Value, kind: &'static str, id: &str, fields: Fields) -> Result<Value, StoreError> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidUpdate {
            kind,
            id: id.to_string(),
            reason: "stored document is not an object".to_string(),
        })?;
    for (field, value) in fields {
        object.insert(field, value);
    }
    Ok(document.clone())
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_document(&self, kind: &'static str, id: &str) -> Result<Option<Value>, StoreError> {
        let docs = self.lock()?;
        Ok(docs.get(kind).and_then(|rows| rows.get(id)).cloned())
    }

    async fn insert_document(
        &self,
        kind: &'static str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let mut docs = self.lock()?;
        let rows = docs.entry(kind).or_default();
        if rows.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        rows.insert(id.to_string(), document);
        Ok(())
    }

    async fn put_document(
        &self,
        kind: &'static str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let mut docs = self.lock()?;
        docs.entry(kind).or_default().insert(id.to_string(), document);
        Ok(())
    }

    async fn update_document(
        &self,
        kind: &'static str,
        id: &str,
        fields: Fields,
    ) -> Result<Value, StoreError> {
        let mut docs = self.lock()?;
        let document = stored_mut(&mut docs, kind, id)?;
        merge(document, kind, id, fields)
    }

    async fn update_document_if(
        &self,
        kind: &'static str,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Value>, StoreError> {
        let mut docs = self.lock()?;
        let document = stored_mut(&mut docs, kind, id)?;
        if !expected.matches(document) {
            return Ok(None);
        }
        merge(document, kind, id, fields).map(Some)
    }

    async fn delete_document(&self, kind: &'static str, id: &str) -> Result<bool, StoreError> {
        let mut docs = self.lock()?;
        Ok(docs
            .get_mut(kind)
            .map(|rows| rows.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn list_documents(
        &self,
        kind: &'static str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let docs = self.lock()?;
        Ok(docs
            .get(kind)
            .map(|rows| rows.values().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }
}
