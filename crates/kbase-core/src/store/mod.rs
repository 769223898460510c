//! Storage abstraction for the vector table.
//!
//! The [`VectorStore`] trait is the row-level contract the table manager
//! drives. Backends know nothing about caching, lifecycle state, or key
//! normalization; they store rows and answer distance queries.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Neighbor, StoredRow, VectorRow};

/// Row storage backend for one vector table.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`table_dims`](VectorStore::table_dims) | Dimensionality of the table, `None` if absent |
/// | [`create_table`](VectorStore::create_table) | Create an empty table bound to a model |
/// | [`drop_table`](VectorStore::drop_table) | Drop the table and all rows |
/// | [`append`](VectorStore::append) | Append rows |
/// | [`count_rows`](VectorStore::count_rows) | Full row count |
/// | [`count_by_source`](VectorStore::count_by_source) | Rows for one source key |
/// | [`delete_by_source`](VectorStore::delete_by_source) | Targeted delete on `source` |
/// | [`delete_by_origin`](VectorStore::delete_by_origin) | Targeted delete on `origin IN (…)` |
/// | [`scan`](VectorStore::scan) | Load every row (without vectors) |
/// | [`delete_rows`](VectorStore::delete_rows) | Delete by row id |
/// | [`nearest`](VectorStore::nearest) | Distance-ranked search with optional `source IN (…)` pushdown |
/// | [`similar`](VectorStore::similar) | Rank-ordered search without distances |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn table_dims(&self) -> Result<Option<usize>>;

    async fn create_table(&self, dims: usize, model: &str) -> Result<()>;

    /// Idempotent: dropping an absent table is not an error.
    async fn drop_table(&self) -> Result<()>;

    /// Fails with [`KbError::SchemaMismatch`](crate::error::KbError) when a
    /// row's vector length differs from the table's dimensionality.
    async fn append(&self, rows: &[VectorRow]) -> Result<()>;

    async fn count_rows(&self) -> Result<usize>;

    async fn count_by_source(&self, source: &str) -> Result<usize>;

    async fn delete_by_source(&self, source: &str) -> Result<usize>;

    async fn delete_by_origin(&self, origins: &[String]) -> Result<usize>;

    async fn scan(&self) -> Result<Vec<StoredRow>>;

    async fn delete_rows(&self, row_ids: &[i64]) -> Result<usize>;

    /// Up to `limit` rows by ascending distance to `query`, restricted to
    /// rows whose `source` is in `sources` when given.
    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<Neighbor>>;

    /// Up to `limit` rows in similarity order, without distances, with the
    /// same `source IN (…)` restriction as [`nearest`](VectorStore::nearest).
    async fn similar(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<StoredRow>>;
}
