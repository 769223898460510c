//! Schema setup.
//!
//! The `vectors` table itself is not created here: it is created on first
//! write by [`SqliteVectorStore`](crate::sqlite_store::SqliteVectorStore)
//! with the active model's dimensionality recorded in `vector_meta`.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Key/value metadata of the vector table: `dims`, `model`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Whole-document catalog storage; a single row keyed `catalog`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// DDL for the vector table, run by the store on first write.
pub(crate) async fn create_vectors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            origin TEXT NOT NULL,
            page INTEGER,
            text TEXT NOT NULL,
            vector BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_source ON vectors(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_origin ON vectors(origin)")
        .execute(pool)
        .await?;
    Ok(())
}
