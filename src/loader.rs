//! Source loaders: turn an identifier (file path or URL) into chunks.
//!
//! The engine depends only on the [`Loader`] trait. [`FsUrlLoader`] is the
//! default implementation: local files through [`crate::extract`], web
//! pages through `reqwest`, and directories expanded with `walkdir` +
//! `globset` include/exclude patterns.
//!
//! Loaders never touch the catalog or the vector table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use kbase_core::chunk::{chunk_pages, chunk_text};
use kbase_core::error::KbError;
use kbase_core::models::{DocumentChunk, SourceKind};
use kbase_core::paths::{display_name, normalize_key, url_host};

use crate::config::{ChunkingConfig, LoaderConfig};
use crate::extract::{
    content_type_for_path, content_type_from_header, extract_text, html_to_text, MIME_HTML,
    MIME_PDF,
};

/// A loaded and chunked source.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    /// Identifier exactly as requested.
    pub identifier: String,
    /// Normalized catalog key.
    pub key: String,
    pub name: String,
    pub kind: SourceKind,
    pub chunks: Vec<DocumentChunk>,
    pub site_name: Option<String>,
    pub site_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The source no longer exists (ENOENT, HTTP 404/410).
    #[error("{0} does not exist")]
    Missing(String),
    /// The source could not be read or fetched right now.
    #[error("{identifier} is unreachable: {message}")]
    Unreachable { identifier: String, message: String },
    /// The source was read but its content could not be parsed.
    #[error("{identifier} could not be parsed: {message}")]
    Unparseable { identifier: String, message: String },
}

impl LoadError {
    pub fn is_missing(&self) -> bool {
        matches!(self, LoadError::Missing(_))
    }

    /// Convert to the engine-wide taxonomy. Parse failures are invalid input.
    pub fn into_kb_error(self) -> KbError {
        match self {
            LoadError::Missing(identifier) => KbError::Unreachable {
                identifier,
                message: "does not exist".into(),
            },
            LoadError::Unreachable {
                identifier,
                message,
            } => KbError::Unreachable {
                identifier,
                message,
            },
            LoadError::Unparseable {
                identifier,
                message,
            } => KbError::InvalidInput(format!("{}: {}", identifier, message)),
        }
    }
}

#[async_trait]
pub trait Loader: Send + Sync {
    /// Load and chunk one source.
    async fn load(&self, identifier: &str) -> Result<LoadedSource, LoadError>;

    /// Expand an identifier into the sources it names. Directories expand to
    /// their matching files; everything else expands to itself.
    fn expand(&self, identifier: &str) -> Result<Vec<String>> {
        Ok(vec![identifier.to_string()])
    }
}

/// Default loader for local files, directories, and http(s) URLs.
pub struct FsUrlLoader {
    max_tokens: usize,
    include: GlobSet,
    exclude: GlobSet,
    client: reqwest::Client,
}

impl FsUrlLoader {
    pub fn new(loader: &LoaderConfig, chunking: &ChunkingConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(loader.exclude_globs.iter().cloned());
        Ok(Self {
            max_tokens: chunking.max_tokens,
            include: build_globset(&loader.include_globs)?,
            exclude: build_globset(&excludes)?,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(loader.fetch_timeout_secs))
                .user_agent(concat!("kbase/", env!("CARGO_PKG_VERSION")))
                .build()?,
        })
    }

    fn chunk(&self, key: &str, content_type: &str, text: &str) -> Vec<DocumentChunk> {
        // pdf-extract separates pages with form feeds.
        if content_type == MIME_PDF && text.contains('\x0c') {
            let pages: Vec<&str> = text.split('\x0c').collect();
            return chunk_pages(key, &pages, self.max_tokens);
        }
        chunk_text(key, text, self.max_tokens)
    }

    async fn load_file(&self, identifier: &str) -> Result<LoadedSource, LoadError> {
        let path = file_path(identifier);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::Missing(identifier.to_string()))
            }
            Err(e) => {
                return Err(LoadError::Unreachable {
                    identifier: identifier.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let content_type = content_type_for_path(&path);
        let (title, text) = if content_type == MIME_HTML {
            html_to_text(&String::from_utf8_lossy(&bytes))
        } else {
            (None, self.extract(identifier, bytes, content_type).await?)
        };

        let key = normalize_key(identifier);
        let chunks = self.chunk(&key, content_type, &text);
        Ok(LoadedSource {
            identifier: identifier.to_string(),
            name: title.unwrap_or_else(|| display_name(identifier)),
            key,
            kind: SourceKind::File,
            chunks,
            site_name: None,
            site_url: None,
        })
    }

    async fn load_url(&self, identifier: &str) -> Result<LoadedSource, LoadError> {
        let unreachable = |message: String| LoadError::Unreachable {
            identifier: identifier.to_string(),
            message,
        };

        let response = self
            .client
            .get(identifier)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(LoadError::Missing(identifier.to_string()));
        }
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(content_type_from_header)
            .unwrap_or(MIME_HTML);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let (title, text) = if content_type == MIME_HTML {
            html_to_text(&String::from_utf8_lossy(&bytes))
        } else {
            (None, self.extract(identifier, bytes.to_vec(), content_type).await?)
        };

        let key = normalize_key(identifier);
        let chunks = self.chunk(&key, content_type, &text);
        let host = url_host(identifier);
        let scheme = identifier.split("://").next().unwrap_or("https");
        Ok(LoadedSource {
            identifier: identifier.to_string(),
            name: title.unwrap_or_else(|| display_name(identifier)),
            key,
            kind: SourceKind::Url,
            chunks,
            site_url: host.as_ref().map(|h| format!("{}://{}", scheme, h)),
            site_name: host,
        })
    }

    /// Binary extraction runs on the blocking pool.
    async fn extract(
        &self,
        identifier: &str,
        bytes: Vec<u8>,
        content_type: &'static str,
    ) -> Result<String, LoadError> {
        let result = tokio::task::spawn_blocking(move || extract_text(&bytes, content_type))
            .await
            .map_err(|e| LoadError::Unparseable {
                identifier: identifier.to_string(),
                message: e.to_string(),
            })?;
        result.map_err(|e| LoadError::Unparseable {
            identifier: identifier.to_string(),
            message: e.to_string(),
        })
    }

    fn walk(&self, root: &Path) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }
            out.push(path.to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl Loader for FsUrlLoader {
    async fn load(&self, identifier: &str) -> Result<LoadedSource, LoadError> {
        match SourceKind::detect(identifier) {
            SourceKind::Url => self.load_url(identifier).await,
            SourceKind::File => self.load_file(identifier).await,
        }
    }

    fn expand(&self, identifier: &str) -> Result<Vec<String>> {
        if SourceKind::detect(identifier) == SourceKind::Url {
            return Ok(vec![identifier.to_string()]);
        }
        let path = file_path(identifier);
        if path.is_dir() {
            let files = self.walk(&path)?;
            tracing::debug!(dir = %path.display(), files = files.len(), "expanded directory");
            Ok(files)
        } else {
            Ok(vec![identifier.to_string()])
        }
    }
}

fn file_path(identifier: &str) -> PathBuf {
    let trimmed = identifier.trim();
    PathBuf::from(trimmed.strip_prefix("file://").unwrap_or(trimmed))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loader() -> FsUrlLoader {
        FsUrlLoader::new(&LoaderConfig::default(), &ChunkingConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn loads_text_file_with_normalized_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Notes.md");
        std::fs::write(&path, "# Title\n\nFirst paragraph.\n\nSecond paragraph.").unwrap();
        let id = path.to_string_lossy().to_string();

        let loaded = loader().load(&id).await.unwrap();
        assert_eq!(loaded.key, normalize_key(&id));
        assert_eq!(loaded.name, "Notes.md");
        assert_eq!(loaded.kind, SourceKind::File);
        assert!(!loaded.chunks.is_empty());
        assert!(loaded.chunks.iter().all(|c| c.source == loaded.key));
    }

    #[tokio::test]
    async fn missing_file_is_missing() {
        let err = loader().load("/definitely/not/here.md").await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn html_file_uses_title() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<html><title>Handbook</title><p>Body text.</p></html>").unwrap();
        let loaded = loader().load(&path.to_string_lossy()).await.unwrap();
        assert_eq!(loaded.name, "Handbook");
        assert_eq!(loaded.chunks[0].text, "Body text.");
    }

    #[tokio::test]
    async fn binary_garbage_is_unparseable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let err = loader().load(&path.to_string_lossy()).await.unwrap_err();
        assert!(matches!(err, LoadError::Unparseable { .. }));
    }

    #[test]
    fn expands_directories_with_globs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("image.png"), "x").unwrap();
        std::fs::write(dir.path().join("node_modules/c.md"), "c").unwrap();

        let files = loader().expand(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.md"));
        assert!(files[1].ends_with("b.txt"));
    }

    #[test]
    fn urls_and_files_expand_to_themselves() {
        let l = loader();
        assert_eq!(l.expand("https://example.com/a").unwrap(), vec!["https://example.com/a"]);
        assert_eq!(l.expand("/no/such/file.md").unwrap(), vec!["/no/such/file.md"]);
    }

    #[test]
    fn missing_maps_to_unreachable_kind() {
        let err: anyhow::Error = LoadError::Missing("x".into()).into_kb_error().into();
        assert_eq!(
            kbase_core::error::ErrorKind::of(&err),
            kbase_core::error::ErrorKind::Unreachable
        );
    }
}
