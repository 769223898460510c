//! Serialized access to the catalog document.
//!
//! Backends only get and set the whole document. [`Catalog`] performs
//! read-modify-write under an async mutex so concurrent mutations from the
//! CLI, the HTTP server, and rebuild tasks never lose each other's updates.
//! Dangling collection references are pruned on every read.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use kbase_core::catalog::{prune_collections, CatalogDocument, CatalogStore};

/// The `{files, collections}` document returned by mutating operations.
pub type CatalogSnapshot = CatalogDocument;

pub struct Catalog {
    store: Arc<dyn CatalogStore>,
    write: Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            write: Mutex::new(()),
        }
    }

    /// Current document with dangling collection references removed.
    /// A pruned document is written back.
    pub async fn read(&self) -> Result<CatalogSnapshot> {
        let mut doc = self.store.load().await.context("loading catalog")?;
        if prune_collections(&mut doc) > 0 {
            return self.update(|_| Ok(())).await.map(|(_, doc)| doc);
        }
        Ok(doc)
    }

    /// Apply `f` to the latest document and persist the result. Nothing is
    /// written when `f` fails.
    pub async fn update<T>(
        &self,
        f: impl FnOnce(&mut CatalogDocument) -> Result<T>,
    ) -> Result<(T, CatalogSnapshot)> {
        let _guard = self.write.lock().await;
        let mut doc = self.store.load().await.context("loading catalog")?;
        let value = f(&mut doc)?;
        let pruned = prune_collections(&mut doc);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned dangling collection references");
        }
        self.store.save(&doc).await.context("saving catalog")?;
        Ok((value, doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::catalog::{upsert_record, InMemoryCatalogStore};
    use kbase_core::models::{Collection, SourceKind, SourceRecord};

    fn record(key: &str) -> SourceRecord {
        SourceRecord {
            id: key.into(),
            key: key.into(),
            name: key.into(),
            chunk_count: 1,
            preview: String::new(),
            updated_at: 0,
            kind: SourceKind::File,
            site_name: None,
            site_url: None,
            tags: None,
            versions: None,
            content_hash: None,
        }
    }

    #[tokio::test]
    async fn read_prunes_and_persists() {
        let mut doc = CatalogDocument::default();
        doc.files.push(record("/a.md"));
        doc.collections.push(Collection {
            id: "c".into(),
            name: "c".into(),
            files: vec!["/a.md".into(), "/gone.md".into()],
            created_at: 0,
            updated_at: 0,
        });
        let store = Arc::new(InMemoryCatalogStore::with_document(doc));
        let catalog = Catalog::new(store.clone());

        let read = catalog.read().await.unwrap();
        assert_eq!(read.collections[0].files, vec!["/a.md".to_string()]);
        assert_eq!(store.load().await.unwrap(), read);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let catalog = Arc::new(Catalog::new(Arc::new(InMemoryCatalogStore::new())));
        let mut handles = Vec::new();
        for i in 0..16 {
            let catalog = catalog.clone();
            handles.push(tokio::spawn(async move {
                catalog
                    .update(|doc| {
                        upsert_record(doc, record(&format!("/f{}.md", i)));
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(catalog.read().await.unwrap().files.len(), 16);
    }

    #[tokio::test]
    async fn failed_update_writes_nothing() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let catalog = Catalog::new(store.clone());
        let result: Result<((), _)> = catalog
            .update(|doc| {
                doc.files.push(record("/a.md"));
                anyhow::bail!("nope")
            })
            .await;
        assert!(result.is_err());
        assert!(store.load().await.unwrap().files.is_empty());
    }
}
