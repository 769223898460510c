//! Vector table lifecycle.
//!
//! [`TableManager`] sits between the engine and a [`VectorStore`]. It owns
//! the table state (absent, ready, or stale against the active embedding
//! binding), creates the table lazily on first write, routes deletes by
//! source key, and caches the row count.
//!
//! A stale table is never recreated here. Writes against it fail with
//! [`KbError::SchemaMismatch`] and the rebuild path recreates it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use kbase_core::embedding::EmbeddingBinding;
use kbase_core::error::{is_schema_mismatch, KbError};
use kbase_core::models::VectorRow;
use kbase_core::paths::{key_variants, normalize_key};
use kbase_core::store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// No table on disk; the first write creates it.
    Absent,
    Ready { dims: usize },
    /// The table's dimensionality differs from the active binding.
    Stale { table_dims: usize, model_dims: usize },
}

struct Inner {
    binding: Option<EmbeddingBinding>,
    /// `None` until [`TableManager::open`] runs against the current binding.
    state: Option<TableState>,
    row_count: Option<(usize, Instant)>,
}

pub struct TableManager {
    store: Arc<dyn VectorStore>,
    row_count_ttl: Duration,
    inner: Mutex<Inner>,
}

impl TableManager {
    pub fn new(
        store: Arc<dyn VectorStore>,
        binding: Option<EmbeddingBinding>,
        row_count_ttl: Duration,
    ) -> Self {
        Self {
            store,
            row_count_ttl,
            inner: Mutex::new(Inner {
                binding,
                state: None,
                row_count: None,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn binding(&self) -> Option<EmbeddingBinding> {
        self.inner().binding.clone()
    }

    /// Switch the active binding. The table is considered uninitialized
    /// until the next [`open`](Self::open).
    pub fn set_binding(&self, binding: Option<EmbeddingBinding>) {
        let mut inner = self.inner();
        inner.binding = binding;
        inner.state = None;
        inner.row_count = None;
    }

    /// Cached state, if the table has been opened since the last binding change.
    pub fn state(&self) -> Option<TableState> {
        self.inner().state
    }

    /// Inspect the on-disk table. Idempotent; a dimensionality mismatch is
    /// logged and recorded as [`TableState::Stale`], never returned as an error.
    pub async fn open(&self) -> Result<TableState> {
        let table_dims = self.store.table_dims().await?;
        let model_dims = self.inner().binding.as_ref().map(|b| b.dims);
        let state = match (table_dims, model_dims) {
            (None, _) => TableState::Absent,
            (Some(t), Some(m)) if t != m => {
                tracing::warn!(
                    table_dims = t,
                    model_dims = m,
                    "vector table does not match the embedding model; a rebuild is required"
                );
                TableState::Stale {
                    table_dims: t,
                    model_dims: m,
                }
            }
            (Some(t), _) => TableState::Ready { dims: t },
        };
        self.inner().state = Some(state);
        Ok(state)
    }

    async fn current_state(&self) -> Result<TableState> {
        match self.state() {
            Some(s) => Ok(s),
            None => self.open().await,
        }
    }

    /// Append rows, creating the table on first write.
    pub async fn upsert(&self, rows: &[VectorRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.current_state().await? {
            TableState::Stale {
                table_dims,
                model_dims,
            } => {
                return Err(KbError::SchemaMismatch {
                    table_dims,
                    model_dims,
                }
                .into())
            }
            TableState::Absent => {
                let (dims, model) = match self.binding() {
                    Some(b) => (b.dims, b.model),
                    None => (rows[0].vector.len(), String::new()),
                };
                self.store.create_table(dims, &model).await?;
                tracing::info!(dims, model = %model, "created vector table");
                self.inner().state = Some(TableState::Ready { dims });
            }
            TableState::Ready { .. } => {}
        }

        let result = self.store.append(rows).await;
        self.invalidate_row_count();
        if let Err(e) = &result {
            if is_schema_mismatch(e) {
                self.inner().state = None;
            }
        }
        result
    }

    /// Delete every row belonging to `identifier`.
    ///
    /// Deletes on the canonical `source` key first, then on the historical
    /// `origin` shapes. Only if both matched nothing are all rows scanned and
    /// matched after normalization.
    pub async fn remove_by_source(&self, identifier: &str) -> Result<usize> {
        let key = normalize_key(identifier);
        let mut deleted = self.store.delete_by_source(&key).await?;

        let mut origins = key_variants(identifier);
        for v in key_variants(&key) {
            if !origins.contains(&v) {
                origins.push(v);
            }
        }
        deleted += self.store.delete_by_origin(&origins).await?;

        if deleted == 0 {
            let ids: Vec<i64> = self
                .store
                .scan()
                .await?
                .into_iter()
                .filter(|r| normalize_key(&r.source) == key || normalize_key(&r.origin) == key)
                .map(|r| r.row_id)
                .collect();
            if !ids.is_empty() {
                tracing::debug!(key = %key, rows = ids.len(), "removed rows via full scan");
                deleted = self.store.delete_rows(&ids).await?;
            }
        }

        self.invalidate_row_count();
        Ok(deleted)
    }

    /// Whether any row is stored under `key`.
    pub async fn has_rows(&self, key: &str) -> Result<bool> {
        Ok(self.store.count_by_source(key).await? > 0)
    }

    /// Total rows, cached for the configured TTL.
    pub async fn row_count(&self) -> Result<usize> {
        let cached = self.inner().row_count;
        if let Some((n, at)) = cached {
            if at.elapsed() < self.row_count_ttl {
                return Ok(n);
            }
        }
        let n = self.store.count_rows().await?;
        self.inner().row_count = Some((n, Instant::now()));
        Ok(n)
    }

    pub fn invalidate_row_count(&self) {
        self.inner().row_count = None;
    }

    /// Drop the table. The next write creates it with the active binding.
    pub async fn recreate(&self) -> Result<()> {
        self.store.drop_table().await?;
        let mut inner = self.inner();
        inner.state = Some(TableState::Absent);
        inner.row_count = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::error::ErrorKind;
    use kbase_core::store::memory::InMemoryVectorStore;

    fn binding(dims: usize) -> EmbeddingBinding {
        EmbeddingBinding {
            provider: "test".into(),
            model: "m".into(),
            endpoint: None,
            dims,
        }
    }

    fn row(source: &str, origin: &str, v: Vec<f32>) -> VectorRow {
        VectorRow {
            vector: v,
            text: format!("text of {}", origin),
            source: source.into(),
            origin: origin.into(),
            page: None,
        }
    }

    fn manager(dims: usize) -> TableManager {
        TableManager::new(
            Arc::new(InMemoryVectorStore::new()),
            Some(binding(dims)),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn first_write_creates_table() {
        let t = manager(2);
        assert_eq!(t.open().await.unwrap(), TableState::Absent);
        t.upsert(&[row("/a.md", "/a.md", vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(t.state(), Some(TableState::Ready { dims: 2 }));
        assert_eq!(t.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn binding_change_marks_table_stale() {
        let t = manager(2);
        t.upsert(&[row("/a.md", "/a.md", vec![1.0, 0.0])]).await.unwrap();

        t.set_binding(Some(binding(3)));
        assert_eq!(t.state(), None);
        let state = t.open().await.unwrap();
        assert_eq!(
            state,
            TableState::Stale {
                table_dims: 2,
                model_dims: 3
            }
        );
        let err = t
            .upsert(&[row("/b.md", "/b.md", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::SchemaMismatch);

        t.recreate().await.unwrap();
        t.upsert(&[row("/b.md", "/b.md", vec![1.0, 0.0, 0.0])]).await.unwrap();
        assert_eq!(t.state(), Some(TableState::Ready { dims: 3 }));
        assert_eq!(t.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_covers_historical_shapes() {
        let t = manager(2);
        t.upsert(&[
            row("/docs/a.md", "/Docs/A.md", vec![1.0, 0.0]),
            // Written by an older build with a raw source key.
            row("C:\\Docs\\B.md", "C:\\Docs\\B.md", vec![0.0, 1.0]),
            row("/docs/keep.md", "/docs/keep.md", vec![0.5, 0.5]),
        ])
        .await
        .unwrap();

        assert_eq!(t.remove_by_source("/Docs/A.md").await.unwrap(), 1);
        // Neither targeted delete matches "c:/docs/b.md"; the scan does.
        assert_eq!(t.remove_by_source("c:/docs/b.md").await.unwrap(), 1);
        assert_eq!(t.row_count().await.unwrap(), 1);
        assert!(t.has_rows("/docs/keep.md").await.unwrap());
    }

    #[tokio::test]
    async fn row_count_is_cached_until_invalidated() {
        let store = Arc::new(InMemoryVectorStore::new());
        let t = TableManager::new(store.clone(), Some(binding(2)), Duration::from_secs(60));
        t.upsert(&[row("/a.md", "/a.md", vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(t.row_count().await.unwrap(), 1);

        // A write behind the manager's back is not seen until invalidation.
        store
            .append(&[row("/b.md", "/b.md", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(t.row_count().await.unwrap(), 1);
        t.invalidate_row_count();
        assert_eq!(t.row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remove_on_absent_table_is_zero() {
        let t = manager(2);
        assert_eq!(t.remove_by_source("/nothing.md").await.unwrap(), 0);
    }
}
