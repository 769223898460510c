//! Semantic retrieval.
//!
//! # Algorithm
//!
//! 1. Compute the fetch breadth from `k`, the cached row count, and whether
//!    the search is scoped to a set of sources.
//! 2. When the query's dominant script differs from the corpus language,
//!    expand it into up to four variants (original, translation, keyword
//!    combination, keywords).
//! 3. Search every variant, pushing the source predicate into the store.
//!    If the scoped search finds nothing, search unfiltered instead.
//! 4. Merge variants by exact chunk text keeping the lowest distance.
//! 5. Re-verify the source filter in memory and drop rows whose source has
//!    no catalog record.
//! 6. Score `1 / (1 + distance)`, sort descending, keep `k`.
//!
//! If the store's distance search fails, rank-ordered `similar` results are
//! used instead with pseudo-scores `1 - i/N`. The fallback keeps the source
//! pushdown and the unfiltered retry.

use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;

use kbase_core::embedding::Embedder;
use kbase_core::filter::SourceFilter;
use kbase_core::lang::{detect_language, extract_keywords, query_variants};
use kbase_core::models::{Neighbor, SearchHit, StoredRow};
use kbase_core::paths::normalize_key;
use kbase_core::scoring::{distance_to_score, fetch_k, merge_variants, rank_score};

use crate::config::RetrievalConfig;
use crate::table::TableManager;
use crate::translate::{translate_cached, TranslationCache, Translator};

/// Options for [`KnowledgeBase::search`](crate::engine::KnowledgeBase::search).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    /// Results to return; `retrieval.default_k` when absent.
    #[serde(default)]
    pub k: Option<usize>,
    /// Restrict results to these sources. `Some(empty)` matches nothing.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
}

pub struct Retriever<'a> {
    pub table: &'a TableManager,
    pub embedder: &'a dyn Embedder,
    pub translator: Option<&'a dyn Translator>,
    pub translations: &'a TranslationCache,
    pub config: &'a RetrievalConfig,
}

impl Retriever<'_> {
    /// Query strings to search for `query`.
    pub async fn variants(&self, query: &str) -> Vec<String> {
        let query = query.trim();
        if !self.config.cross_language {
            return vec![query.to_string()];
        }
        match detect_language(query) {
            Some(lang) if lang != self.config.language => {
                let keywords = extract_keywords(query);
                let translation = match self.translator {
                    Some(t) => {
                        translate_cached(t, self.translations, query, &self.config.language).await
                    }
                    None => None,
                };
                let variants = query_variants(query, &keywords, translation.as_deref());
                tracing::debug!(lang, ?variants, "cross-language query expansion");
                variants
            }
            _ => vec![query.to_string()],
        }
    }

    /// Ranked hits for `query`.
    ///
    /// `names` maps every catalog key to its display name; rows whose source
    /// is not in it are orphans and never returned.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&SourceFilter>,
        names: &HashMap<String, String>,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if filter.is_some_and(|f| f.is_empty()) {
            return Ok(Vec::new());
        }
        let total_rows = self.table.row_count().await?;
        if total_rows == 0 {
            return Ok(Vec::new());
        }

        let params = self.config.fetch_params();
        let breadth = fetch_k(k, total_rows, filter.is_some(), &params);

        let variants = self.variants(query).await;
        let mut vectors = Vec::with_capacity(variants.len());
        for v in &variants {
            vectors.push(self.embedder.embed_query(v).await?);
        }

        match self.nearest_all(&vectors, breadth, filter, total_rows, &params).await {
            Ok(merged) => Ok(finish(
                merged
                    .into_iter()
                    .map(|n| (n.row, distance_to_score(n.distance))),
                k,
                filter,
                names,
            )),
            Err(e) => {
                tracing::warn!(error = %e, "vector search failed; falling back to similarity order");
                let rows = self
                    .similar_first(&vectors[0], breadth, filter, total_rows, &params)
                    .await?;
                let kept: Vec<StoredRow> = rows
                    .into_iter()
                    .filter(|r| admissible(r, filter, names))
                    .collect();
                let n = kept.len();
                Ok(finish(
                    kept.into_iter()
                        .enumerate()
                        .map(|(i, r)| (r, rank_score(i, n))),
                    k,
                    filter,
                    names,
                ))
            }
        }
    }

    async fn nearest_all(
        &self,
        vectors: &[Vec<f32>],
        breadth: usize,
        filter: Option<&SourceFilter>,
        total_rows: usize,
        params: &kbase_core::scoring::FetchParams,
    ) -> Result<Vec<Neighbor>> {
        let store = self.table.store();
        let pushdown = filter.map(|f| f.keys());

        let mut results = Vec::with_capacity(vectors.len());
        for v in vectors {
            results.push(store.nearest(v, breadth, pushdown).await?);
        }

        if pushdown.is_some() && results.iter().all(Vec::is_empty) {
            // Stored keys may predate normalization; filter in memory instead.
            let wide = fetch_k(breadth, total_rows, false, params).max(breadth);
            tracing::debug!(wide, "scoped pushdown matched nothing; retrying unfiltered");
            results.clear();
            for v in vectors {
                results.push(store.nearest(v, wide, None).await?);
            }
            return Ok(merge_variants(results, wide));
        }

        Ok(merge_variants(results, breadth))
    }

    /// Rank-ordered rows for the first variant, scoped the same way as
    /// [`nearest_all`](Self::nearest_all).
    async fn similar_first(
        &self,
        vector: &[f32],
        breadth: usize,
        filter: Option<&SourceFilter>,
        total_rows: usize,
        params: &kbase_core::scoring::FetchParams,
    ) -> Result<Vec<StoredRow>> {
        let store = self.table.store();
        let pushdown = filter.map(|f| f.keys());
        let rows = store.similar(vector, breadth, pushdown).await?;
        if pushdown.is_some() && rows.is_empty() {
            let wide = fetch_k(breadth, total_rows, false, params).max(breadth);
            tracing::debug!(wide, "scoped fallback matched nothing; retrying unfiltered");
            return store.similar(vector, wide, None).await;
        }
        Ok(rows)
    }
}

fn admissible(
    row: &StoredRow,
    filter: Option<&SourceFilter>,
    names: &HashMap<String, String>,
) -> bool {
    filter.map_or(true, |f| f.matches(&row.source)) && names.contains_key(&normalize_key(&row.source))
}

fn finish(
    scored: impl Iterator<Item = (StoredRow, f64)>,
    k: usize,
    filter: Option<&SourceFilter>,
    names: &HashMap<String, String>,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = scored
        .filter(|(row, _)| admissible(row, filter, names))
        .map(|(row, score)| {
            let key = normalize_key(&row.source);
            SearchHit {
                file_name: names.get(&key).cloned().unwrap_or_default(),
                content: row.text,
                source: key,
                page: row.page,
                score,
            }
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kbase_core::embedding::EmbeddingBinding;
    use kbase_core::models::VectorRow;
    use kbase_core::store::memory::InMemoryVectorStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Maps a handful of words onto axes.
    struct Axes;

    #[async_trait]
    impl Embedder for Axes {
        fn model_name(&self) -> &str {
            "axes"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("alpha").count() as f32 + 0.01,
                        t.matches("beta").count() as f32,
                        t.matches("gamma").count() as f32,
                    ]
                })
                .collect())
        }
    }

    async fn fixture() -> (TableManager, HashMap<String, String>) {
        let table = TableManager::new(
            Arc::new(InMemoryVectorStore::new()),
            Some(EmbeddingBinding {
                provider: "test".into(),
                model: "axes".into(),
                endpoint: None,
                dims: 3,
            }),
            Duration::from_secs(0),
        );
        let rows = [
            ("/a.md", "alpha alpha", [2.0, 0.0, 0.0]),
            ("/a.md", "alpha beta", [1.0, 1.0, 0.0]),
            ("/b.md", "beta", [0.0, 1.0, 0.0]),
            ("/orphan.md", "alpha orphan", [1.0, 0.0, 0.0]),
        ];
        let rows: Vec<VectorRow> = rows
            .iter()
            .map(|(s, t, v)| VectorRow {
                vector: v.to_vec(),
                text: t.to_string(),
                source: s.to_string(),
                origin: s.to_string(),
                page: None,
            })
            .collect();
        table.upsert(&rows).await.unwrap();
        let names = [("/a.md", "a.md"), ("/b.md", "b.md")]
            .iter()
            .map(|(k, n)| (k.to_string(), n.to_string()))
            .collect();
        (table, names)
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    #[tokio::test]
    async fn scores_descend_and_orphans_are_dropped() {
        let (table, names) = fixture().await;
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        let config = config();
        let r = Retriever {
            table: &table,
            embedder: &Axes,
            translator: None,
            translations: &cache,
            config: &config,
        };
        let hits = r.search("alpha", 10, None, &names).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.source != "/orphan.md"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        assert_eq!(hits[0].content, "alpha alpha");
        assert_eq!(hits[0].file_name, "a.md");
    }

    #[tokio::test]
    async fn scoped_search_never_leaks() {
        let (table, names) = fixture().await;
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        let config = config();
        let r = Retriever {
            table: &table,
            embedder: &Axes,
            translator: None,
            translations: &cache,
            config: &config,
        };
        let filter = SourceFilter::new(&["/B.md"], 50);
        let hits = r.search("alpha", 10, Some(&filter), &names).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "/b.md");

        let none = SourceFilter::new(&["/nowhere/else.md"], 50);
        assert!(r.search("alpha", 10, Some(&none), &names).await.unwrap().is_empty());

        let empty = SourceFilter::new::<&str>(&[], 50);
        assert!(r.search("alpha", 10, Some(&empty), &names).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_query_returns_nothing() {
        let (table, names) = fixture().await;
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        let config = config();
        let r = Retriever {
            table: &table,
            embedder: &Axes,
            translator: None,
            translations: &cache,
            config: &config,
        };
        assert!(r.search("   ", 5, None, &names).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_language_queries_are_not_expanded() {
        let (table, _) = fixture().await;
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        let config = config();
        let r = Retriever {
            table: &table,
            embedder: &Axes,
            translator: None,
            translations: &cache,
            config: &config,
        };
        assert_eq!(r.variants("how does alpha work").await, vec!["how does alpha work"]);
        let v = r.variants("如何 配置 向量 数据库").await;
        assert!(!v.is_empty() && v.len() <= 4);
        assert_eq!(v[0], "如何 配置 向量 数据库");
    }
}
