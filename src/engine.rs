//! The knowledge-base engine.
//!
//! [`KnowledgeBase`] ties the collaborators together: a [`Loader`] for
//! sources, an embedding provider resolved from the active binding, the
//! vector table behind [`TableManager`], the [`Catalog`], an optional query
//! [`Translator`], and the [`OperationLock`] that serializes structural
//! mutations (rebuild, reindex, delete-collection).
//!
//! All mutable runtime state (table handle, row-count cache, binding,
//! embedder and translation caches) lives in one [`EngineState`] owned by
//! the engine. Reads never take the lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use kbase_core::catalog::{
    self as rules, CatalogStore, CollectionPatch, InMemoryCatalogStore,
};
use kbase_core::chunk::{content_hash, preview};
use kbase_core::embedding::{Embedder, EmbeddingBinding};
use kbase_core::error::{ErrorKind, KbError};
use kbase_core::filter::SourceFilter;
use kbase_core::models::{ProgressSink, ProgressStatus, SearchHit, SourceRecord, TaskKind};
use kbase_core::paths::normalize_key;
use kbase_core::store::memory::InMemoryVectorStore;
use kbase_core::store::VectorStore;

use crate::catalog::{Catalog, CatalogSnapshot};
use crate::config::{Config, EmbeddingConfig};
use crate::embedding::{create_embedder, EmbedderCache};
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::loader::{FsUrlLoader, LoadedSource, Loader};
use crate::lock::{HolderInfo, LockGuard, OperationLock, GLOBAL_LOCK};
use crate::progress::ProgressSpan;
use crate::rebuild::RebuildMode;
use crate::retrieval::{Retriever, SearchOptions};
use crate::table::{TableManager, TableState};
use crate::translate::{create_translator, TranslationCache, Translator};

/// Builds an embedder for an `[embedding]` section.
pub type EmbedderFactory =
    Arc<dyn Fn(&EmbeddingConfig) -> Result<Arc<dyn Embedder>> + Send + Sync>;

/// Why one source in a batch failed.
#[derive(Debug, Clone, Serialize)]
pub struct SourceError {
    pub source: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(source: &str, err: &anyhow::Error) -> Self {
        Self {
            source: source.to_string(),
            kind: ErrorKind::of(err),
            message: format!("{:#}", err),
        }
    }
}

/// Result of ingesting one or more sources.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// At least one source succeeded.
    pub success: bool,
    /// Chunks written across all successful sources.
    pub count: usize,
    /// Preview of the first successful source.
    pub preview: Option<String>,
    pub errors: Vec<SourceError>,
}

impl IngestReport {
    /// Fail with [`KbError::PartialFailure`] if no source succeeded.
    pub fn into_result(self) -> Result<Self> {
        if !self.success && !self.errors.is_empty() {
            return Err(KbError::PartialFailure {
                failed: self.errors.len(),
            }
            .into());
        }
        Ok(self)
    }
}

/// Health information for hosts.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub rows: usize,
    pub sources: usize,
    pub collections: usize,
    pub table: &'static str,
    pub binding: Option<EmbeddingBinding>,
    pub locks: Vec<HolderInfo>,
}

/// Outcome of indexing one loaded source.
pub(crate) struct Indexed {
    pub record: SourceRecord,
    pub rows: usize,
    pub rebuild_needed: bool,
}

/// Runtime state owned by one engine.
pub struct EngineState {
    pub(crate) table: TableManager,
    pub(crate) embedding: RwLock<EmbeddingConfig>,
    pub(crate) embedders: EmbedderCache,
    pub(crate) make_embedder: EmbedderFactory,
    pub(crate) translations: TranslationCache,
}

pub struct KnowledgeBase {
    pub(crate) config: Config,
    pub(crate) state: EngineState,
    pub(crate) catalog: Catalog,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) translator: Option<Arc<dyn Translator>>,
    pub(crate) lock: OperationLock,
}

/// Assembles a [`KnowledgeBase`] from its collaborators. Anything not set
/// falls back to in-memory stores, the default loader, and the providers
/// named in the config.
pub struct KnowledgeBaseBuilder {
    config: Config,
    vectors: Option<Arc<dyn VectorStore>>,
    catalog: Option<Arc<dyn CatalogStore>>,
    loader: Option<Arc<dyn Loader>>,
    make_embedder: Option<EmbedderFactory>,
    translator: Option<Option<Arc<dyn Translator>>>,
}

impl KnowledgeBaseBuilder {
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(store);
        self
    }

    pub fn catalog_store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.catalog = Some(store);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use a fixed embedder; the binding is derived from it.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.config.embedding.provider = "custom".into();
        self.config.embedding.model = Some(embedder.model_name().to_string());
        self.config.embedding.dims = Some(embedder.dims());
        self.config.embedding.url = None;
        let factory: EmbedderFactory =
            Arc::new(move |_: &EmbeddingConfig| -> Result<Arc<dyn Embedder>> {
                Ok(embedder.clone())
            });
        self.make_embedder = Some(factory);
        self
    }

    pub fn embedder_factory(mut self, factory: EmbedderFactory) -> Self {
        self.make_embedder = Some(factory);
        self
    }

    pub fn translator(mut self, translator: Option<Arc<dyn Translator>>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn build(self) -> Result<KnowledgeBase> {
        let config = self.config;
        let vectors = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(InMemoryCatalogStore::new()));
        let loader: Arc<dyn Loader> = match self.loader {
            Some(l) => l,
            None => Arc::new(FsUrlLoader::new(&config.loader, &config.chunking)?),
        };
        let translator = match self.translator {
            Some(t) => t,
            None => create_translator(&config.translation)?,
        };
        let make_embedder = self
            .make_embedder
            .unwrap_or_else(|| Arc::new(create_embedder) as EmbedderFactory);

        let table = TableManager::new(
            vectors,
            config.embedding.binding(),
            Duration::from_secs(config.table.row_count_ttl_secs),
        );
        Ok(KnowledgeBase {
            state: EngineState {
                table,
                embedding: RwLock::new(config.embedding.clone()),
                embedders: EmbedderCache::new(),
                make_embedder,
                translations: TranslationCache::from_config(&config.translation),
            },
            catalog: Catalog::new(catalog),
            loader,
            translator,
            lock: OperationLock::new(),
            config,
        })
    }
}

impl KnowledgeBase {
    pub fn builder(config: Config) -> KnowledgeBaseBuilder {
        KnowledgeBaseBuilder {
            config,
            vectors: None,
            catalog: None,
            loader: None,
            make_embedder: None,
            translator: None,
        }
    }

    /// Open the SQLite-backed engine described by `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = crate::db::connect(&config).await?;
        crate::migrate::run_migrations(&pool).await?;
        let kb = Self::builder(config)
            .vector_store(Arc::new(crate::sqlite_store::SqliteVectorStore::new(
                pool.clone(),
            )))
            .catalog_store(Arc::new(crate::sqlite_store::SqliteCatalogStore::new(pool)))
            .build()?;
        kb.state.table.open().await?;
        Ok(kb)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    pub(crate) async fn acquire(&self, op: &str) -> Result<LockGuard> {
        self.lock
            .acquire(
                op,
                GLOBAL_LOCK,
                Duration::from_secs(self.config.lock.max_wait_secs),
            )
            .await
    }

    fn embedding_config(&self) -> EmbeddingConfig {
        self.state
            .embedding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The embedder for the active binding.
    pub fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        let config = self.embedding_config();
        let binding = config.binding().ok_or_else(|| {
            KbError::ProviderUnavailable(
                "embedding provider is disabled; set [embedding] provider in the config".into(),
            )
        })?;
        self.state
            .embedders
            .get_or_create(&binding, || (self.state.make_embedder)(&config))
    }

    /// Switch the embedding model. Clears the provider cache and the
    /// row-count cache; the table is re-checked against the new binding on
    /// next use and needs a rebuild if the dimensionality changed.
    pub fn set_embedding_binding(&self, config: EmbeddingConfig) {
        let binding = config.binding();
        *self
            .state
            .embedding
            .write()
            .unwrap_or_else(|e| e.into_inner()) = config;
        self.state.embedders.clear();
        self.state.table.set_binding(binding.clone());
        tracing::info!(binding = ?binding.map(|b| b.fingerprint()), "embedding binding changed");
    }

    pub fn binding(&self) -> Option<EmbeddingBinding> {
        self.state.table.binding()
    }

    pub async fn snapshot(&self) -> Result<CatalogSnapshot> {
        self.catalog.read().await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let doc = self.catalog.read().await?;
        let table = match self.state.table.open().await? {
            TableState::Absent => "absent",
            TableState::Ready { .. } => "ready",
            TableState::Stale { .. } => "stale",
        };
        Ok(EngineStatus {
            rows: self.state.table.row_count().await?,
            sources: doc.files.len(),
            collections: doc.collections.len(),
            table,
            binding: self.binding(),
            locks: self.lock.holders(),
        })
    }

    // ---- sources ----

    /// Load, embed, and catalog one source.
    pub async fn ingest_source(
        &self,
        identifier: &str,
        progress: &dyn ProgressSink,
    ) -> Result<IngestReport> {
        let embedder = self.embedder()?;
        embedder.warm_up(progress).await?;
        let span = ProgressSpan::full(progress, TaskKind::Ingest);
        let loaded = self
            .loader
            .load(identifier)
            .await
            .map_err(|e| anyhow::Error::from(e.into_kb_error()))?;
        let indexed = self.index_new(loaded, embedder.as_ref(), &span).await;
        let indexed = match indexed {
            Ok(i) => i,
            Err(e) => {
                span.report(ProgressStatus::Error, 1.0, format!("{:#}", e));
                return Err(e);
            }
        };
        if indexed.rebuild_needed {
            self.rebuild(RebuildMode::Full, progress).await?;
        }
        span.report(ProgressStatus::Completed, 1.0, "done");
        Ok(IngestReport {
            success: true,
            count: indexed.rows,
            preview: Some(indexed.record.preview),
            errors: Vec::new(),
        })
    }

    /// Ingest several sources. Directories are expanded; one source
    /// failing does not stop the others.
    pub async fn ingest_sources<S: AsRef<str>>(
        &self,
        identifiers: &[S],
        progress: &dyn ProgressSink,
    ) -> Result<IngestReport> {
        let mut errors = Vec::new();
        let mut targets = Vec::new();
        for id in identifiers {
            let id = id.as_ref();
            match self.loader.expand(id) {
                Ok(expanded) => targets.extend(expanded),
                Err(e) => errors.push(SourceError::new(id, &e)),
            }
        }

        let embedder = self.embedder()?;
        embedder.warm_up(progress).await?;

        let root = ProgressSpan::full(progress, TaskKind::Ingest);
        let n = targets.len().max(1) as f64;
        let mut count = 0;
        let mut first_preview = None;
        let mut succeeded = 0;
        let mut rebuild_needed = false;

        for (i, id) in targets.iter().enumerate() {
            let span = root.sub(i as f64 / n, (i + 1) as f64 / n);
            let result = match self.loader.load(id).await {
                Ok(loaded) => self.index_new(loaded, embedder.as_ref(), &span).await,
                Err(e) => Err(e.into_kb_error().into()),
            };
            match result {
                Ok(indexed) => {
                    succeeded += 1;
                    count += indexed.rows;
                    rebuild_needed |= indexed.rebuild_needed;
                    if first_preview.is_none() {
                        first_preview = Some(indexed.record.preview);
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %id, error = %format!("{:#}", e), "ingest failed");
                    errors.push(SourceError::new(id, &e));
                }
            }
        }

        if rebuild_needed {
            self.rebuild(RebuildMode::Full, progress).await?;
        }

        let status = if succeeded > 0 || (targets.is_empty() && errors.is_empty()) {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Error
        };
        root.report(
            status,
            1.0,
            format!("{} of {} sources ingested", succeeded, targets.len()),
        );
        Ok(IngestReport {
            success: succeeded > 0,
            count,
            preview: first_preview,
            errors,
        })
    }

    /// Index a loaded source outside of a rebuild. On failure the rows are
    /// cleaned up; a source that had no record gets none.
    async fn index_new(
        &self,
        loaded: LoadedSource,
        embedder: &dyn Embedder,
        span: &ProgressSpan<'_>,
    ) -> Result<Indexed> {
        let key = loaded.key.clone();
        self.state
            .table
            .remove_by_source(&loaded.identifier)
            .await
            .with_context(|| format!("removing previous rows of {}", loaded.identifier))?;
        match self.index_loaded(&loaded, embedder, span).await {
            Ok(indexed) => {
                self.catalog
                    .update(|doc| {
                        rules::upsert_record(doc, indexed.record.clone());
                        Ok(())
                    })
                    .await?;
                Ok(indexed)
            }
            Err(e) => {
                if let Err(cleanup) = self.state.table.remove_by_source(&key).await {
                    tracing::warn!(source = %key, error = %cleanup, "cleanup after failed ingest failed");
                }
                Err(e)
            }
        }
    }

    /// Embed `loaded` into the table and build its record. Does not touch
    /// the catalog.
    pub(crate) async fn index_loaded(
        &self,
        loaded: &LoadedSource,
        embedder: &dyn Embedder,
        span: &ProgressSpan<'_>,
    ) -> Result<Indexed> {
        let pipeline = IngestPipeline {
            table: &self.state.table,
            embedder,
            batch_size: self.embedding_config().batch_size,
        };
        let outcome = pipeline
            .ingest(&loaded.key, &loaded.identifier, &loaded.chunks, span)
            .await?;
        let (rows, rebuild_needed) = match outcome {
            IngestOutcome::Written(n) => (n, false),
            IngestOutcome::Empty => (0, false),
            IngestOutcome::RebuildNeeded => (0, true),
        };
        Ok(Indexed {
            record: self.record_for(loaded),
            rows,
            rebuild_needed,
        })
    }

    pub(crate) fn record_for(&self, loaded: &LoadedSource) -> SourceRecord {
        SourceRecord {
            id: loaded.identifier.trim().to_string(),
            key: loaded.key.clone(),
            name: loaded.name.clone(),
            chunk_count: loaded.chunks.len(),
            preview: preview(&loaded.chunks, self.config.loader.preview_chars),
            updated_at: chrono::Utc::now().timestamp(),
            kind: loaded.kind,
            site_name: loaded.site_name.clone(),
            site_url: loaded.site_url.clone(),
            tags: None,
            versions: None,
            content_hash: Some(content_hash(&loaded.chunks)),
        }
    }

    /// Delete a source's rows, then its record. Removing an unknown source
    /// is not an error.
    pub async fn remove_source(&self, identifier: &str) -> Result<CatalogSnapshot> {
        let key = normalize_key(identifier);
        let rows = self.state.table.remove_by_source(identifier).await?;
        let (removed, snapshot) = self
            .catalog
            .update(|doc| Ok(rules::remove_record(doc, &key)))
            .await?;
        tracing::info!(source = %key, rows, record = removed.is_some(), "source removed");
        Ok(snapshot)
    }

    /// Re-load and re-embed one cataloged source. Unlike rebuild, an
    /// unreachable source is an error here and nothing is changed.
    pub async fn reindex_source(
        &self,
        identifier: &str,
        progress: &dyn ProgressSink,
    ) -> Result<CatalogSnapshot> {
        let key = normalize_key(identifier);
        let embedder = self.embedder()?;
        let rebuild_needed = {
            let _guard = self.acquire("reindex").await?;
            let doc = self.catalog.read().await?;
            let record = rules::find(&doc, &key)
                .ok_or_else(|| KbError::NotFound(format!("source {}", identifier)))?
                .clone();
            embedder.warm_up(progress).await?;
            let span = ProgressSpan::full(progress, TaskKind::Reindex);
            span.processing(0.0, format!("loading {}", record.id));
            let loaded = self
                .loader
                .load(&record.id)
                .await
                .map_err(|e| anyhow::Error::from(e.into_kb_error()))?;
            let indexed = self
                .index_new(loaded, embedder.as_ref(), &span.sub(0.1, 1.0))
                .await?;
            span.report(ProgressStatus::Completed, 1.0, format!("reindexed {}", record.id));
            indexed.rebuild_needed
        };
        if rebuild_needed {
            self.rebuild(RebuildMode::Full, progress).await?;
        }
        self.catalog.read().await
    }

    // ---- search ----

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchHit>> {
        if let TableState::Stale {
            table_dims,
            model_dims,
        } = self.state.table.open().await?
        {
            return Err(KbError::SchemaMismatch {
                table_dims,
                model_dims,
            }
            .into());
        }
        let doc = self.catalog.read().await?;
        let names: HashMap<String, String> = doc
            .files
            .iter()
            .map(|r| (r.key.clone(), r.name.clone()))
            .collect();
        let filter = options
            .sources
            .as_ref()
            .map(|s| SourceFilter::new(s, self.config.retrieval.fuzzy_filter_limit));
        let k = options
            .k
            .unwrap_or(self.config.retrieval.default_k)
            .min(self.config.retrieval.max_k);

        let embedder = self.embedder()?;
        let retriever = Retriever {
            table: &self.state.table,
            embedder: embedder.as_ref(),
            translator: self.translator.as_deref(),
            translations: &self.state.translations,
            config: &self.config.retrieval,
        };
        retriever.search(query, k, filter.as_ref(), &names).await
    }

    /// Search restricted to a collection's members.
    pub async fn search_collection(
        &self,
        query: &str,
        collection_id: &str,
        k: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let doc = self.catalog.read().await?;
        let collection = doc
            .collections
            .iter()
            .find(|c| c.id == collection_id)
            .ok_or_else(|| KbError::NotFound(format!("collection {}", collection_id)))?;
        self.search(
            query,
            SearchOptions {
                k,
                sources: Some(collection.files.clone()),
            },
        )
        .await
    }

    // ---- collections ----

    pub async fn create_collection<S: AsRef<str>>(
        &self,
        name: &str,
        files: &[S],
    ) -> Result<CatalogSnapshot> {
        let (created, snapshot) = self
            .catalog
            .update(|doc| rules::create_collection(doc, name, files))
            .await?;
        tracing::info!(id = %created.id, name = %created.name, "collection created");
        Ok(snapshot)
    }

    pub async fn update_collection(
        &self,
        id: &str,
        patch: CollectionPatch,
    ) -> Result<CatalogSnapshot> {
        let (_, snapshot) = self
            .catalog
            .update(|doc| rules::update_collection(doc, id, patch))
            .await?;
        Ok(snapshot)
    }

    /// Delete a collection together with the sources (rows and records)
    /// that belong to no other collection.
    pub async fn delete_collection(
        &self,
        id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<CatalogSnapshot> {
        let _guard = self.acquire("delete_collection").await?;
        let span = ProgressSpan::full(progress, TaskKind::DeleteCollection);
        let doc = self.catalog.read().await?;
        if !doc.collections.iter().any(|c| c.id == id) {
            return Err(KbError::NotFound(format!("collection {}", id)).into());
        }
        let members = rules::exclusive_members(&doc, id);
        let n = members.len().max(1) as f64;
        for (i, key) in members.iter().enumerate() {
            span.processing(i as f64 / n, format!("removing {}", key));
            self.state.table.remove_by_source(key).await?;
        }
        let (_, snapshot) = self
            .catalog
            .update(|doc| {
                rules::delete_collection(doc, id)?;
                for key in &members {
                    rules::remove_record(doc, key);
                }
                Ok(())
            })
            .await?;
        span.report(
            ProgressStatus::Completed,
            1.0,
            format!("collection deleted with {} sources", members.len()),
        );
        Ok(snapshot)
    }
}
