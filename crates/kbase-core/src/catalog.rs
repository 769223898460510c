//! Catalog document and its mutation rules.
//!
//! The catalog is persisted as one whole document (`files` plus
//! `collections`) by a [`CatalogStore`]. Backends only get and set the whole
//! document; the read-modify-write merge lives in the functions here, which
//! the application runs under its own lock.
//!
//! Invariants maintained by these functions:
//! - `files` holds at most one record per normalized key.
//! - Every key in a collection's `files` names an existing record
//!   ([`prune_collections`] runs on every read).

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KbError;
use crate::models::{Collection, SourceRecord, SourceVersion};
use crate::paths::normalize_key;

/// Number of previous ingestions kept per record.
pub const MAX_VERSIONS: usize = 10;

/// The persisted catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub files: Vec<SourceRecord>,
    #[serde(default)]
    pub collections: Vec<Collection>,
}

/// Partial update applied by [`update_collection`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionPatch {
    pub name: Option<String>,
    pub files: Option<Vec<String>>,
}

/// Whole-document persistence for the catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self) -> Result<CatalogDocument>;
    async fn save(&self, doc: &CatalogDocument) -> Result<()>;
}

/// In-memory [`CatalogStore`] for tests and embedded use.
#[derive(Default)]
pub struct InMemoryCatalogStore {
    doc: RwLock<CatalogDocument>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(doc: CatalogDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn load(&self) -> Result<CatalogDocument> {
        Ok(self.doc.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, doc: &CatalogDocument) -> Result<()> {
        *self.doc.write().unwrap_or_else(|e| e.into_inner()) = doc.clone();
        Ok(())
    }
}

pub fn find<'a>(doc: &'a CatalogDocument, key: &str) -> Option<&'a SourceRecord> {
    doc.files.iter().find(|r| r.key == key)
}

/// Insert or replace a record by key. Returns `true` if the record is new.
///
/// On replacement the previous state is pushed onto `versions` and
/// user-assigned tags are kept when the incoming record carries none.
pub fn upsert_record(doc: &mut CatalogDocument, mut record: SourceRecord) -> bool {
    record.key = normalize_key(&record.key);
    match doc.files.iter_mut().find(|r| r.key == record.key) {
        Some(existing) => {
            let mut versions = existing.versions.take().unwrap_or_default();
            versions.push(SourceVersion {
                updated_at: existing.updated_at,
                chunk_count: existing.chunk_count,
                content_hash: existing.content_hash.clone(),
            });
            if versions.len() > MAX_VERSIONS {
                let excess = versions.len() - MAX_VERSIONS;
                versions.drain(..excess);
            }
            if record.tags.is_none() {
                record.tags = existing.tags.take();
            }
            record.versions = Some(versions);
            *existing = record;
            false
        }
        None => {
            doc.files.push(record);
            true
        }
    }
}

/// Remove a record and every collection reference to it.
pub fn remove_record(doc: &mut CatalogDocument, key: &str) -> Option<SourceRecord> {
    let pos = doc.files.iter().position(|r| r.key == key)?;
    let removed = doc.files.remove(pos);
    for c in &mut doc.collections {
        c.files.retain(|f| f != key);
    }
    Some(removed)
}

/// Drop collection references to keys with no record. Returns the number of
/// references removed.
pub fn prune_collections(doc: &mut CatalogDocument) -> usize {
    let known: HashSet<&str> = doc.files.iter().map(|r| r.key.as_str()).collect();
    let mut removed = 0;
    for c in &mut doc.collections {
        let before = c.files.len();
        let mut seen = HashSet::new();
        c.files
            .retain(|f| known.contains(f.as_str()) && seen.insert(f.clone()));
        removed += before - c.files.len();
    }
    removed
}

/// Keys of a collection that belong to no other collection.
pub fn exclusive_members(doc: &CatalogDocument, collection_id: &str) -> Vec<String> {
    let Some(target) = doc.collections.iter().find(|c| c.id == collection_id) else {
        return Vec::new();
    };
    let shared: HashSet<&str> = doc
        .collections
        .iter()
        .filter(|c| c.id != collection_id)
        .flat_map(|c| c.files.iter().map(String::as_str))
        .collect();
    target
        .files
        .iter()
        .filter(|f| !shared.contains(f.as_str()))
        .cloned()
        .collect()
}

fn resolve_members<S: AsRef<str>>(doc: &CatalogDocument, files: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .iter()
        .map(|f| normalize_key(f.as_ref()))
        .filter(|k| find(doc, k).is_some() && seen.insert(k.clone()))
        .collect()
}

pub fn create_collection<S: AsRef<str>>(
    doc: &mut CatalogDocument,
    name: &str,
    files: &[S],
) -> Result<Collection> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KbError::InvalidInput("collection name must not be empty".into()).into());
    }
    let now = chrono::Utc::now().timestamp();
    let collection = Collection {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        files: resolve_members(doc, files),
        created_at: now,
        updated_at: now,
    };
    doc.collections.push(collection.clone());
    Ok(collection)
}

pub fn update_collection(
    doc: &mut CatalogDocument,
    id: &str,
    patch: CollectionPatch,
) -> Result<Collection> {
    let files = patch.files.as_ref().map(|f| resolve_members(doc, f));
    let collection = doc
        .collections
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| KbError::NotFound(format!("collection {}", id)))?;
    if let Some(name) = patch.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(KbError::InvalidInput("collection name must not be empty".into()).into());
        }
        collection.name = name.to_string();
    }
    if let Some(files) = files {
        collection.files = files;
    }
    collection.updated_at = chrono::Utc::now().timestamp();
    Ok(collection.clone())
}

pub fn delete_collection(doc: &mut CatalogDocument, id: &str) -> Result<Collection> {
    let pos = doc
        .collections
        .iter()
        .position(|c| c.id == id)
        .ok_or_else(|| KbError::NotFound(format!("collection {}", id)))?;
    Ok(doc.collections.remove(pos))
}
