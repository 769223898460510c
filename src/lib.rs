//! # kbase
//!
//! A local-first knowledge-base retrieval engine. Files and web pages are
//! chunked, embedded, and stored in a vector table; queries are answered by
//! semantic search with per-source and per-collection scoping, incremental
//! re-indexing, and cross-language query expansion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Loader  │──▶│  Ingestion  │──▶│ Vector table │
//! │ file/URL │   │ chunk+embed │   │   (SQLite)   │
//! └──────────┘   └─────────────┘   └──────┬───────┘
//!                                         │
//!      ┌──────────┐   ┌───────────┐       │
//!      │ Catalog  │◀──│ Retrieval │◀──────┘
//!      └──────────┘   └─────┬─────┘
//!                    ┌──────┴──────┐
//!                    ▼             ▼
//!               ┌────────┐   ┌──────────┐
//!               │  CLI   │   │   HTTP   │
//!               │  (kb)  │   │  + SSE   │
//!               └────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                         # create database
//! kb add ./docs https://example.com/guide
//! kb search "retention policy" -k 5
//! kb rebuild --full               # after changing the embedding model
//! kb serve                        # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`engine`] | [`KnowledgeBase`]: sources, search, collections |
//! | [`rebuild`] | Full and incremental rebuild orchestration |
//! | [`retrieval`] | Fetch breadth, variants, filtering, scoring |
//! | [`ingest`] | Chunks → embeddings → vector rows |
//! | [`table`] | Vector table lifecycle and row-count cache |
//! | [`catalog`] | Serialized catalog read-modify-write |
//! | [`lock`] | Named FIFO operation lock |
//! | [`loader`] | File / URL / directory loading |
//! | [`extract`] | PDF, OOXML, and HTML text extraction |
//! | [`embedding`] | Embedding providers (OpenAI, Ollama, local) |
//! | [`translate`] | Query translation and its cache |
//! | [`progress`] | Progress channel and reporters |
//! | [`server`] | HTTP server |
//! | [`sqlite_store`] | SQLite vector and catalog stores |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |
//!
//! Storage-independent types and rules live in the `kbase-core` crate,
//! re-exported here as [`core`].

pub use kbase_core as core;

pub mod catalog;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod ingest;
pub mod loader;
pub mod lock;
pub mod migrate;
pub mod progress;
pub mod rebuild;
pub mod retrieval;
pub mod server;
pub mod sqlite_store;
pub mod table;
pub mod translate;

pub use engine::{IngestReport, KnowledgeBase, SourceError};
pub use rebuild::{RebuildMode, RebuildReport};
pub use retrieval::SearchOptions;
