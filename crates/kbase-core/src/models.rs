//! Core data models shared by the engine, its backends, and its hosts.
//!
//! These types represent the catalog records, chunks, vector rows, progress
//! messages, and search hits that flow through ingestion and retrieval.

use serde::{Deserialize, Serialize};

/// Where an indexed source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Url,
}

impl SourceKind {
    /// Classify an identifier: anything with an http(s) scheme is a URL.
    pub fn detect(identifier: &str) -> Self {
        let lower = identifier.trim().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceKind::Url
        } else {
            SourceKind::File
        }
    }
}

/// A previous ingestion of a source, kept for display and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVersion {
    pub updated_at: i64,
    pub chunk_count: usize,
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// One indexed origin (a file path or a URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Canonical identifier as supplied by the user.
    pub id: String,
    /// Normalized key; unique within the catalog.
    pub key: String,
    /// Display name (file name or page title).
    pub name: String,
    pub chunk_count: usize,
    pub preview: String,
    /// Unix seconds of the last successful ingestion.
    pub updated_at: i64,
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<SourceVersion>>,
    /// SHA-256 over the chunk texts of the last ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A named, user-defined grouping of source keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    /// Normalized source keys.
    pub files: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A unit of embeddable text produced by a loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    /// Normalized source key.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Byte offset of the chunk start within the extracted text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

/// A row of the vector table.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub vector: Vec<f32>,
    pub text: String,
    /// Canonical (normalized) source key.
    pub source: String,
    /// The identifier exactly as it was loaded.
    pub origin: String,
    pub page: Option<u32>,
}

/// A [`VectorRow`] together with its storage row id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: i64,
    pub text: String,
    pub source: String,
    pub origin: String,
    pub page: Option<u32>,
}

/// A nearest-neighbour result: a stored row and its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub row: StoredRow,
    pub distance: f32,
}

/// Lifecycle status of a streamed progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Processing,
    Downloading,
    Completed,
    Error,
}

/// Which operation a progress message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ingest,
    Reindex,
    Rebuild,
    Remove,
    DeleteCollection,
    Model,
}

/// An ephemeral progress update. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub status: ProgressStatus,
    /// 0–100.
    pub percent: u8,
    pub stage: String,
    pub task: TaskKind,
}

impl ProgressMessage {
    pub fn new(status: ProgressStatus, percent: f64, stage: impl Into<String>, task: TaskKind) -> Self {
        Self {
            status,
            percent: percent.clamp(0.0, 100.0).round() as u8,
            stage: stage.into(),
            task,
        }
    }
}

/// Where backends and pipelines send progress.
pub trait ProgressSink: Send + Sync {
    fn report(&self, msg: ProgressMessage);
}

/// A [`ProgressSink`] that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _msg: ProgressMessage) {}
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub file_name: String,
    /// Normalized source key.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Similarity in `[0, 1]`.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_kind() {
        assert_eq!(SourceKind::detect("https://example.com/a"), SourceKind::Url);
        assert_eq!(SourceKind::detect("HTTP://EXAMPLE.COM"), SourceKind::Url);
        assert_eq!(SourceKind::detect("/home/me/notes.md"), SourceKind::File);
        assert_eq!(SourceKind::detect("C:\\docs\\a.pdf"), SourceKind::File);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let m = ProgressMessage::new(ProgressStatus::Processing, 140.2, "x", TaskKind::Ingest);
        assert_eq!(m.percent, 100);
        let m = ProgressMessage::new(ProgressStatus::Processing, -3.0, "x", TaskKind::Ingest);
        assert_eq!(m.percent, 0);
    }

    #[test]
    fn progress_serializes_lowercase_status() {
        let m = ProgressMessage::new(ProgressStatus::Downloading, 3.0, "model", TaskKind::Model);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["task"], "model");
    }
}
