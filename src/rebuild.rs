//! Rebuild orchestration.
//!
//! A rebuild recomputes the vector table from the catalog while holding the
//! global operation lock. Progress is reported on one 0-100 scale:
//!
//! | Range | Phase |
//! |-------|-------|
//! | 0-5% | Embedding model check / download |
//! | 5-30% | Loading every cataloged source (concurrently) |
//! | 30-100% | Embedding and writing changed sources |
//!
//! [`RebuildMode::Full`] drops and recreates the table first.
//! [`RebuildMode::Incremental`] keeps sources whose content hash is
//! unchanged and whose rows are present. A stale table always forces a full
//! rebuild.
//!
//! A source whose loader reports it missing is dropped (rows and record).
//! Other load failures keep the record and are reported, unless
//! `rebuild.drop_unreachable` is set.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use anyhow::Result;

use kbase_core::catalog as rules;
use kbase_core::chunk::content_hash;
use kbase_core::models::{ProgressSink, ProgressStatus, SourceRecord, TaskKind};

use crate::catalog::CatalogSnapshot;
use crate::engine::{KnowledgeBase, SourceError};
use crate::loader::{LoadError, LoadedSource};
use crate::progress::ProgressSpan;
use crate::table::TableState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebuildMode {
    Full,
    #[default]
    Incremental,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub snapshot: CatalogSnapshot,
    /// Keys left untouched.
    pub kept: Vec<String>,
    /// Keys re-embedded.
    pub updated: Vec<String>,
    /// Keys removed because their source is gone.
    pub dropped: Vec<String>,
    pub failed: Vec<SourceError>,
}

enum Pass {
    Done(RebuildReport),
    /// The table rejected a write; start over as a full rebuild.
    Escalate,
}

impl KnowledgeBase {
    /// Recompute the vector table from the catalog.
    pub async fn rebuild(
        &self,
        mode: RebuildMode,
        progress: &dyn ProgressSink,
    ) -> Result<RebuildReport> {
        let _guard = self.acquire("rebuild").await?;
        let root = ProgressSpan::full(progress, TaskKind::Rebuild);

        root.processing(0.0, "checking embedding model");
        let embedder = self.embedder()?;
        if let Err(e) = embedder.warm_up(progress).await {
            root.report(ProgressStatus::Error, 0.0, format!("model unavailable: {:#}", e));
            return Err(e);
        }
        root.processing(0.05, "embedding model ready");

        let mut mode = mode;
        if let TableState::Stale {
            table_dims,
            model_dims,
        } = self.state.table.open().await?
        {
            tracing::info!(table_dims, model_dims, "table is stale; rebuilding in full");
            mode = RebuildMode::Full;
        }

        let report = loop {
            match self.rebuild_pass(mode, embedder.as_ref(), &root).await {
                Ok(Pass::Done(report)) => break report,
                Ok(Pass::Escalate) => {
                    tracing::warn!("schema mismatch during incremental rebuild; restarting in full");
                    mode = RebuildMode::Full;
                }
                Err(e) => {
                    root.report(ProgressStatus::Error, 1.0, format!("{:#}", e));
                    return Err(e);
                }
            }
        };

        tracing::info!(
            ?mode,
            kept = report.kept.len(),
            updated = report.updated.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "rebuild finished"
        );
        root.report(
            ProgressStatus::Completed,
            1.0,
            format!(
                "rebuild complete: {} updated, {} kept, {} dropped, {} failed",
                report.updated.len(),
                report.kept.len(),
                report.dropped.len(),
                report.failed.len()
            ),
        );
        Ok(report)
    }

    async fn rebuild_pass(
        &self,
        mode: RebuildMode,
        embedder: &dyn kbase_core::embedding::Embedder,
        root: &ProgressSpan<'_>,
    ) -> Result<Pass> {
        let table = &self.state.table;
        if mode == RebuildMode::Full {
            table.recreate().await?;
        }

        let records = self.catalog.read().await?.files;
        let loaded = self.load_all(&records, &root.sub(0.05, 0.30)).await;

        let embed = root.sub(0.30, 1.0);
        let total = loaded.len().max(1) as f64;
        let mut kept = Vec::new();
        let mut updated: Vec<SourceRecord> = Vec::new();
        let mut dropped = Vec::new();
        let mut failed = Vec::new();

        for (i, (record, result)) in loaded.into_iter().enumerate() {
            let span = embed.sub(i as f64 / total, (i + 1) as f64 / total);
            let source = match result {
                Ok(source) => source,
                Err(e) if self.should_drop(&e) => {
                    tracing::info!(source = %record.key, reason = %e, "dropping source");
                    table.remove_by_source(&record.key).await?;
                    dropped.push(record.key);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(source = %record.key, error = %e, "source could not be loaded; keeping it");
                    failed.push(SourceError::new(&record.key, &e.into_kb_error().into()));
                    continue;
                }
            };

            if mode == RebuildMode::Incremental
                && record.content_hash.as_deref() == Some(content_hash(&source.chunks).as_str())
                && (source.chunks.is_empty() || table.has_rows(&record.key).await?)
            {
                kept.push(record.key);
                span.processing(1.0, format!("unchanged {}", record.name));
                continue;
            }

            if mode == RebuildMode::Incremental {
                table.remove_by_source(&record.key).await?;
            }
            match self.index_loaded(&source, embedder, &span).await {
                Ok(indexed) if indexed.rebuild_needed => {
                    if mode == RebuildMode::Full {
                        failed.push(SourceError::new(
                            &record.key,
                            &anyhow::anyhow!("embedder output does not match the table"),
                        ));
                        continue;
                    }
                    return Ok(Pass::Escalate);
                }
                Ok(indexed) => {
                    let mut next = indexed.record;
                    // Keep the identifier the source was cataloged under.
                    next.id = record.id.clone();
                    updated.push(next);
                }
                Err(e) => {
                    tracing::warn!(source = %record.key, error = %format!("{:#}", e), "re-embedding failed");
                    if let Err(cleanup) = table.remove_by_source(&record.key).await {
                        tracing::warn!(source = %record.key, error = %cleanup, "cleanup failed");
                    }
                    failed.push(SourceError::new(&record.key, &e));
                }
            }
        }

        let updated_keys: Vec<String> = updated.iter().map(|r| r.key.clone()).collect();
        let (_, snapshot) = self
            .catalog
            .update(|doc| {
                for r in updated {
                    rules::upsert_record(doc, r);
                }
                for key in &dropped {
                    rules::remove_record(doc, key);
                }
                Ok(())
            })
            .await?;

        Ok(Pass::Done(RebuildReport {
            snapshot,
            kept,
            updated: updated_keys,
            dropped,
            failed,
        }))
    }

    fn should_drop(&self, err: &LoadError) -> bool {
        match err {
            LoadError::Missing(_) => true,
            LoadError::Unreachable { .. } => self.config.rebuild.drop_unreachable,
            LoadError::Unparseable { .. } => false,
        }
    }

    /// Load every record concurrently, in catalog order.
    async fn load_all(
        &self,
        records: &[SourceRecord],
        span: &ProgressSpan<'_>,
    ) -> Vec<(SourceRecord, Result<LoadedSource, LoadError>)> {
        let total = records.len().max(1) as f64;
        let concurrency = self.config.rebuild.concurrency.max(1);
        let mut done = 0usize;
        span.processing(0.0, format!("loading {} sources", records.len()));

        let mut results: Vec<(usize, SourceRecord, Result<LoadedSource, LoadError>)> =
            Vec::with_capacity(records.len());
        let mut loads = stream::iter(records.iter().cloned().enumerate())
            .map(|(i, record)| {
                let loader = self.loader.clone();
                async move {
                    let result = loader.load(&record.id).await;
                    (i, record, result)
                }
            })
            .buffer_unordered(concurrency);

        while let Some((i, record, result)) = loads.next().await {
            done += 1;
            span.processing(done as f64 / total, format!("loaded {}", record.name));
            results.push((i, record, result));
        }
        results.sort_by_key(|(i, _, _)| *i);
        results.into_iter().map(|(_, r, res)| (r, res)).collect()
    }
}
