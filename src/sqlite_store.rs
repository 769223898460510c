//! SQLite-backed [`VectorStore`] and [`CatalogStore`] implementations.
//!
//! Vectors are stored as little-endian f32 BLOBs; distance ranking is
//! brute-force cosine distance computed in Rust over the candidate rows,
//! with the `source IN (…)` predicate pushed into SQL when given.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use kbase_core::catalog::{CatalogDocument, CatalogStore};
use kbase_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use kbase_core::error::KbError;
use kbase_core::models::{Neighbor, StoredRow, VectorRow};
use kbase_core::store::VectorStore;

use crate::migrate;

/// SQLite bound-parameter budget per statement, with headroom.
const MAX_BIND: usize = 900;

/// SQLite implementation of [`VectorStore`] over the `vectors` and
/// `vector_meta` tables.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn vectors_exist(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'vectors'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn delete_in(&self, column: &str, values: &[String]) -> Result<usize> {
        if values.is_empty() || !self.vectors_exist().await? {
            return Ok(0);
        }
        let mut deleted = 0u64;
        for batch in values.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("DELETE FROM vectors WHERE {} IN (", column));
            let mut sep = qb.separated(", ");
            for v in batch {
                sep.push_bind(v);
            }
            sep.push_unseparated(")");
            deleted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted as usize)
    }

    async fn candidates(&self, sources: Option<&[String]>) -> Result<Vec<SqliteRow>> {
        if !self.vectors_exist().await? {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, source, origin, page, text, vector FROM vectors");
        if let Some(sources) = sources {
            if sources.is_empty() {
                return Ok(Vec::new());
            }
            // Oversized filters scan everything; callers re-verify sources.
            if sources.len() <= MAX_BIND {
                qb.push(" WHERE source IN (");
                let mut sep = qb.separated(", ");
                for s in sources {
                    sep.push_bind(s);
                }
                sep.push_unseparated(")");
            }
        }
        Ok(qb.build().fetch_all(&self.pool).await?)
    }
}

fn to_stored(row: &SqliteRow) -> StoredRow {
    let page: Option<i64> = row.get("page");
    StoredRow {
        row_id: row.get("id"),
        text: row.get("text"),
        source: row.get("source"),
        origin: row.get("origin"),
        page: page.map(|p| p as u32),
    }
}

fn rank(rows: Vec<SqliteRow>, query: &[f32], limit: usize) -> Vec<Neighbor> {
    let mut scored: Vec<Neighbor> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            Neighbor {
                row: to_stored(row),
                distance: cosine_distance(query, &blob_to_vec(&blob)),
            }
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

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn table_dims(&self) -> Result<Option<usize>> {
        if !self.vectors_exist().await? {
            return Ok(None);
        }
        let dims: Option<String> =
            sqlx::query_scalar("SELECT value FROM vector_meta WHERE key = 'dims'")
                .fetch_optional(&self.pool)
                .await?;
        match dims {
            Some(d) => Ok(Some(
                d.parse().with_context(|| format!("corrupt vector_meta dims: {}", d))?,
            )),
            None => Ok(None),
        }
    }

    async fn create_table(&self, dims: usize, model: &str) -> Result<()> {
        migrate::create_vectors_table(&self.pool).await?;
        let mut tx = self.pool.begin().await?;
        for (key, value) in [("dims", dims.to_string()), ("model", model.to_string())] {
            sqlx::query(
                "INSERT INTO vector_meta (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn drop_table(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS vectors")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_meta")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append(&self, rows: &[VectorRow]) -> Result<()> {
        let Some(dims) = self.table_dims().await? else {
            anyhow::bail!("vector table does not exist");
        };
        if let Some(bad) = rows.iter().find(|r| r.vector.len() != dims) {
            return Err(KbError::SchemaMismatch {
                table_dims: dims,
                model_dims: bad.vector.len(),
            }
            .into());
        }

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO vectors (source, origin, page, text, vector) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&row.source)
            .bind(&row.origin)
            .bind(row.page.map(|p| p as i64))
            .bind(&row.text)
            .bind(vec_to_blob(&row.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_rows(&self) -> Result<usize> {
        if !self.vectors_exist().await? {
            return Ok(0);
        }
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn count_by_source(&self, source: &str) -> Result<usize> {
        if !self.vectors_exist().await? {
            return Ok(0);
        }
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        self.delete_in("source", &[source.to_string()]).await
    }

    async fn delete_by_origin(&self, origins: &[String]) -> Result<usize> {
        self.delete_in("origin", origins).await
    }

    async fn scan(&self) -> Result<Vec<StoredRow>> {
        if !self.vectors_exist().await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id, source, origin, page, text FROM vectors")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(to_stored).collect())
    }

    async fn delete_rows(&self, row_ids: &[i64]) -> Result<usize> {
        if row_ids.is_empty() || !self.vectors_exist().await? {
            return Ok(0);
        }
        let mut deleted = 0u64;
        for batch in row_ids.chunks(MAX_BIND) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM vectors WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in batch {
                sep.push_bind(*id);
            }
            sep.push_unseparated(")");
            deleted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted as usize)
    }

    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<Neighbor>> {
        let rows = self.candidates(sources).await?;
        Ok(rank(rows, query, limit))
    }

    async fn similar(
        &self,
        query: &[f32],
        limit: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<StoredRow>> {
        let rows = self.candidates(sources).await?;
        Ok(rank(rows, query, limit).into_iter().map(|n| n.row).collect())
    }
}

/// SQLite implementation of [`CatalogStore`]: the whole document as JSON in
/// a single `catalog` row.
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn load(&self) -> Result<CatalogDocument> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM catalog WHERE key = 'catalog'")
                .fetch_optional(&self.pool)
                .await?;
        match value {
            Some(json) => serde_json::from_str(&json).context("Failed to parse stored catalog"),
            None => Ok(CatalogDocument::default()),
        }
    }

    async fn save(&self, doc: &CatalogDocument) -> Result<()> {
        let json = serde_json::to_string(doc)?;
        sqlx::query(
            "INSERT INTO catalog (key, value, updated_at) VALUES ('catalog', ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
