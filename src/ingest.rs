//! Ingestion pipeline: chunks → embeddings → vector rows.
//!
//! One call ingests one source. Chunks are embedded and written in batches
//! of `embedding.batch_size`; progress advances across the caller's span as
//! batches complete. A schema mismatch on write is not fatal here: it is
//! returned as [`IngestOutcome::RebuildNeeded`] so the engine can recreate
//! the table with the active model.

use anyhow::{Context, Result};

use kbase_core::embedding::Embedder;
use kbase_core::error::is_schema_mismatch;
use kbase_core::models::{DocumentChunk, VectorRow};

use crate::progress::ProgressSpan;
use crate::table::TableManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Rows written.
    Written(usize),
    /// Nothing to write.
    Empty,
    /// The table no longer matches the embedding model.
    RebuildNeeded,
}

pub struct IngestPipeline<'a> {
    pub table: &'a TableManager,
    pub embedder: &'a dyn Embedder,
    pub batch_size: usize,
}

impl IngestPipeline<'_> {
    /// Embed and write `chunks` under `source_key`.
    ///
    /// `origin` is the identifier exactly as loaded. Rows already written
    /// for this source are not removed on failure; callers own cleanup.
    pub async fn ingest(
        &self,
        source_key: &str,
        origin: &str,
        chunks: &[DocumentChunk],
        progress: &ProgressSpan<'_>,
    ) -> Result<IngestOutcome> {
        if chunks.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let total = chunks.len();
        let batch_size = self.batch_size.max(1);
        let mut written = 0;
        progress.processing(0.0, format!("embedding {}", origin));

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .with_context(|| format!("embedding {}", origin))?;
            anyhow::ensure!(
                vectors.len() == batch.len(),
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );

            let rows: Vec<VectorRow> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRow {
                    vector,
                    text: chunk.text.clone(),
                    source: source_key.to_string(),
                    origin: origin.to_string(),
                    page: chunk.page,
                })
                .collect();

            if let Err(e) = self.table.upsert(&rows).await {
                if is_schema_mismatch(&e) {
                    tracing::warn!(source = %source_key, error = %e, "write rejected; rebuild needed");
                    return Ok(IngestOutcome::RebuildNeeded);
                }
                return Err(e.context(format!("writing rows for {}", origin)));
            }

            written += rows.len();
            progress.processing(
                written as f64 / total as f64,
                format!("embedded {}/{} chunks of {}", written, total, origin),
            );
        }

        tracing::debug!(source = %source_key, rows = written, "ingested");
        Ok(IngestOutcome::Written(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kbase_core::embedding::EmbeddingBinding;
    use kbase_core::models::{NullProgress, TaskKind};
    use kbase_core::store::memory::InMemoryVectorStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Counter {
        dims: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for Counter {
        fn model_name(&self) -> &str {
            "counter"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }
    }

    fn chunks(n: usize) -> Vec<DocumentChunk> {
        (0..n)
            .map(|i| DocumentChunk {
                text: format!("chunk {}", i),
                source: "/a.md".into(),
                page: None,
                offset: Some(i * 10),
            })
            .collect()
    }

    fn table(dims: usize) -> TableManager {
        TableManager::new(
            Arc::new(InMemoryVectorStore::new()),
            Some(EmbeddingBinding {
                provider: "test".into(),
                model: "counter".into(),
                endpoint: None,
                dims,
            }),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn writes_in_batches() {
        let table = table(2);
        let embedder = Counter {
            dims: 2,
            calls: AtomicUsize::new(0),
        };
        let pipeline = IngestPipeline {
            table: &table,
            embedder: &embedder,
            batch_size: 2,
        };
        let span = ProgressSpan::full(&NullProgress, TaskKind::Ingest);
        let out = pipeline.ingest("/a.md", "/A.md", &chunks(5), &span).await.unwrap();
        assert_eq!(out, IngestOutcome::Written(5));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(table.row_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn empty_is_a_no_op() {
        let table = table(2);
        let embedder = Counter {
            dims: 2,
            calls: AtomicUsize::new(0),
        };
        let pipeline = IngestPipeline {
            table: &table,
            embedder: &embedder,
            batch_size: 8,
        };
        let span = ProgressSpan::full(&NullProgress, TaskKind::Ingest);
        let out = pipeline.ingest("/a.md", "/a.md", &[], &span).await.unwrap();
        assert_eq!(out, IngestOutcome::Empty);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mismatch_requests_rebuild() {
        let table = table(2);
        let old = Counter {
            dims: 2,
            calls: AtomicUsize::new(0),
        };
        let span = ProgressSpan::full(&NullProgress, TaskKind::Ingest);
        IngestPipeline {
            table: &table,
            embedder: &old,
            batch_size: 8,
        }
        .ingest("/a.md", "/a.md", &chunks(1), &span)
        .await
        .unwrap();

        // A model with different dims against the existing table.
        let new = Counter {
            dims: 3,
            calls: AtomicUsize::new(0),
        };
        let out = IngestPipeline {
            table: &table,
            embedder: &new,
            batch_size: 8,
        }
        .ingest("/b.md", "/b.md", &chunks(1), &span)
        .await
        .unwrap();
        assert_eq!(out, IngestOutcome::RebuildNeeded);
    }
}
