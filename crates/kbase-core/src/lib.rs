//! # kbase core
//!
//! Shared, runtime-agnostic logic for the kbase retrieval engine: data
//! models, path keys, fetch-breadth and scoring math, query language
//! heuristics, catalog rules, and the storage/embedding traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Backends and the orchestration layer live in
//! the `kbase` crate.

pub mod catalog;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod lang;
pub mod models;
pub mod paths;
pub mod scoring;
pub mod store;
