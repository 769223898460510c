//! Query translation for cross-language retrieval.
//!
//! A [`Translator`] turns a query into the corpus language. Results are
//! memoized in a [`TranslationCache`] keyed by `normalize(query)|target`
//! with a TTL and a maximum entry count (oldest entries evicted first).
//! Callers treat every failure as "no translation".

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kbase_core::error::KbError;
use kbase_core::lang::normalize_query;

use crate::config::TranslationConfig;

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into the language with code `target_lang`.
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String>;
}

fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        other => other,
    }
}

fn prompt(text: &str, target_lang: &str) -> String {
    format!(
        "Translate the following search query into {}. Reply with the translation only, \
         no quotes or explanation.\n\n{}",
        language_name(target_lang),
        text
    )
}

fn clean(reply: &str) -> String {
    reply
        .trim()
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches(|c| c == '"' || c == '“' || c == '”')
        .trim()
        .to_string()
}

/// Chat-completion translator for OpenAI-compatible endpoints and Ollama.
pub struct ChatTranslator {
    provider: String,
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatTranslator {
    pub fn new(config: &TranslationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("translation.model required"))?;
        let (url, api_key) = match config.provider.as_str() {
            "openai" => {
                let base = config.url.as_deref().unwrap_or("https://api.openai.com/v1");
                let key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                    KbError::ProviderUnavailable("OPENAI_API_KEY environment variable not set".into())
                })?;
                (format!("{}/chat/completions", base.trim_end_matches('/')), Some(key))
            }
            "ollama" => {
                let base = config.url.as_deref().unwrap_or("http://localhost:11434");
                (format!("{}/api/chat", base.trim_end_matches('/')), None)
            }
            other => bail!("Unknown translation provider: {}", other),
        };
        Ok(Self {
            provider: config.provider.clone(),
            model,
            url,
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<String> {
        let messages = serde_json::json!([{ "role": "user", "content": prompt(text, target_lang) }]);
        let body = if self.provider == "ollama" {
            serde_json::json!({ "model": self.model, "messages": messages, "stream": false })
        } else {
            serde_json::json!({ "model": self.model, "messages": messages, "temperature": 0 })
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| KbError::ProviderUnavailable(format!("translation at {}: {}", self.url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("translation API error {}: {}", status, body_text);
        }
        let json: serde_json::Value = response.json().await?;
        let content = json
            .pointer("/choices/0/message/content")
            .or_else(|| json.pointer("/message/content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid translation response: missing content"))?;
        Ok(clean(content))
    }
}

/// Create the translator described by `config`, or `None` when disabled.
pub fn create_translator(config: &TranslationConfig) -> Result<Option<Arc<dyn Translator>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(ChatTranslator::new(config)?)))
}

/// Bounded, expiring memo of translations.
pub struct TranslationCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TranslationCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cache_ttl_days.saturating_mul(24 * 60 * 60)),
            config.cache_max_entries,
        )
    }

    fn key(query: &str, target_lang: &str) -> String {
        format!("{}|{}", normalize_query(query), target_lang)
    }

    pub fn get(&self, query: &str, target_lang: &str) -> Option<String> {
        let key = Self::key(query, target_lang);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let found = entries
            .get(&key)
            .map(|(value, at)| (value.clone(), at.elapsed() < self.ttl));
        match found {
            Some((value, true)) => Some(value),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, query: &str, target_lang: &str, translation: String) {
        let key = Self::key(query, target_lang);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, (_, at)| at.elapsed() < ttl);
        // Overwriting an existing key does not grow the map.
        while !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
        entries.insert(key, (translation, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Translate through the cache. Errors and no-op translations yield `None`.
pub async fn translate_cached(
    translator: &dyn Translator,
    cache: &TranslationCache,
    query: &str,
    target_lang: &str,
) -> Option<String> {
    let translated = match cache.get(query, target_lang) {
        Some(hit) => hit,
        None => match translator.translate(query, target_lang).await {
            Ok(t) => {
                cache.insert(query, target_lang, t.clone());
                t
            }
            Err(e) => {
                tracing::warn!(error = %e, "query translation failed; searching with the original only");
                return None;
            }
        },
    };
    if translated.trim().is_empty() || normalize_query(&translated) == normalize_query(query) {
        None
    } else {
        Some(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl Translator for Counting {
        async fn translate(&self, _text: &str, _target: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("offline"))
        }
    }

    #[tokio::test]
    async fn cache_hits_by_normalized_query() {
        let t = Counting {
            calls: AtomicUsize::new(0),
            reply: Some("retention policy"),
        };
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        let a = translate_cached(&t, &cache, "保留 策略", "en").await;
        let b = translate_cached(&t, &cache, "  保留   策略 ", "en").await;
        assert_eq!(a.as_deref(), Some("retention policy"));
        assert_eq!(a, b);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_and_noops_yield_none() {
        let failing = Counting {
            calls: AtomicUsize::new(0),
            reply: None,
        };
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        assert!(translate_cached(&failing, &cache, "查询", "en").await.is_none());
        assert!(cache.is_empty());

        let echo = Counting {
            calls: AtomicUsize::new(0),
            reply: Some("Rust Tokio"),
        };
        assert!(translate_cached(&echo, &cache, "rust tokio", "en").await.is_none());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = TranslationCache::new(Duration::from_millis(0), 10);
        cache.insert("q", "en", "x".into());
        assert!(cache.get("q", "en").is_none());
    }

    #[test]
    fn oldest_entry_is_evicted_first() {
        let cache = TranslationCache::new(Duration::from_secs(60), 2);
        cache.insert("one", "en", "1".into());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("two", "en", "2".into());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("three", "en", "3".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("one", "en").is_none());
        assert_eq!(cache.get("three", "en").as_deref(), Some("3"));
    }

    #[test]
    fn refreshing_a_key_evicts_nothing() {
        let cache = TranslationCache::new(Duration::from_secs(60), 2);
        cache.insert("one", "en", "1".into());
        cache.insert("two", "en", "2".into());
        cache.insert("two", "en", "2b".into());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("one", "en").as_deref(), Some("1"));
        assert_eq!(cache.get("two", "en").as_deref(), Some("2b"));
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let config = TranslationConfig {
            cache_ttl_days: u64::MAX,
            ..TranslationConfig::default()
        };
        let cache = TranslationCache::from_config(&config);
        cache.insert("q", "en", "x".into());
        assert_eq!(cache.get("q", "en").as_deref(), Some("x"));
    }

    #[test]
    fn replies_are_cleaned() {
        assert_eq!(clean("  \"retention policy\"\nextra"), "retention policy");
    }

    #[test]
    fn target_language_is_part_of_key() {
        let cache = TranslationCache::new(Duration::from_secs(60), 10);
        cache.insert("q", "en", "x".into());
        assert!(cache.get("q", "zh").is_none());
    }
}
