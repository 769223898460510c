//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! Rows live in a `Vec` behind `std::sync::RwLock`. Search is brute-force
//! cosine distance over all stored vectors.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::KbError;
use crate::models::{Neighbor, StoredRow, VectorRow};

use super::VectorStore;

struct Table {
    dims: usize,
    _model: String,
    next_id: i64,
    rows: Vec<(i64, VectorRow)>,
}

/// In-memory vector table.
#[derive(Default)]
pub struct InMemoryVectorStore {
    table: RwLock<Option<Table>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn stored(id: i64, row: &VectorRow) -> StoredRow {
    StoredRow {
        row_id: id,
        text: row.text.clone(),
        source: row.source.clone(),
        origin: row.origin.clone(),
        page: row.page,
    }
}

impl InMemoryVectorStore {
    fn ranked(&self, query: &[f32], limit: usize, sources: Option<&[String]>) -> Vec<Neighbor> {
        let guard = self.table.read().unwrap_or_else(|e| e.into_inner());
        let Some(table) = guard.as_ref() else {
            return Vec::new();
        };
        let allowed: Option<HashSet<&str>> =
            sources.map(|s| s.iter().map(String::as_str).collect());
        let mut scored: Vec<Neighbor> = table
            .rows
            .iter()
            .filter(|(_, r)| {
                allowed
                    .as_ref()
                    .map_or(true, |a| a.contains(r.source.as_str()))
            })
            .map(|(id, r)| Neighbor {
                row: stored(*id, r),
                distance: cosine_distance(query, &r.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.row.row_id.cmp(&b.row.row_id))
        });
        scored.truncate(limit);
        scored
    }

    fn delete_where(&self, pred: impl Fn(i64, &VectorRow) -> bool) -> usize {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        let Some(table) = guard.as_mut() else {
            return 0;
        };
        let before = table.rows.len();
        table.rows.retain(|(id, r)| !pred(*id, r));
        before - table.rows.len()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn table_dims(&self) -> Result<Option<usize>> {
        Ok(self.table.read().unwrap_or_else(|e| e.into_inner()).as_ref().map(|t| t.dims))
    }

    async fn create_table(&self, dims: usize, model: &str) -> Result<()> {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            bail!("vector table already exists");
        }
        *guard = Some(Table {
            dims,
            _model: model.to_string(),
            next_id: 1,
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn append(&self, rows: &[VectorRow]) -> Result<()> {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        let Some(table) = guard.as_mut() else {
            bail!("vector table does not exist");
        };
        if let Some(bad) = rows.iter().find(|r| r.vector.len() != table.dims) {
            return Err(KbError::SchemaMismatch {
                table_dims: table.dims,
                model_dims: bad.vector.len(),
            }
            .into());
        }
        for row in rows {
            let id = table.next_id;
            table.next_id += 1;
            table.rows.push((id, row.clone()));
        }
        Ok(())
    }

    async fn count_rows(&self) -> Result<usize> {
        Ok(self
            .table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |t| t.rows.len()))
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        Ok(self.table.read().unwrap_or_else(|e| e.into_inner()).as_ref().map_or(0, |t| {
            t.rows.iter().filter(|(_, r)| r.source == source).count()
        }))
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        Ok(self.delete_where(|_, r| r.source == source))
    }

    async fn delete_by_origin(&self, origins: &[String]) -> Result<usize> {
        Ok(self.delete_where(|_, r| origins.iter().any(|o| *o == r.origin)))
    }

    async fn scan(&self) -> Result<Vec<StoredRow>> {
        Ok(self.table.read().unwrap_or_else(|e| e.into_inner()).as_ref().map_or_else(Vec::new, |t| {
            t.rows.iter().map(|(id, r)| stored(*id, r)).collect()
        }))
    }

    async fn delete_rows(&self, row_ids: &[i64]) -> Result<usize> {
        let ids: HashSet<i64> = row_ids.iter().copied().collect();
        Ok(self.delete_where(|id, _| ids.contains(&id)))
    }

    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<Neighbor>> {
        Ok(self.ranked(query, limit, sources))
    }

    async fn similar(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<StoredRow>> {
        Ok(self
            .ranked(query, limit, sources)
            .into_iter()
            .map(|n| n.row)
            .collect())
    }
}
