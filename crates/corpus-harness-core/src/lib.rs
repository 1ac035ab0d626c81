//! # Corpus Harness Core
//!
//! Shared, runtime-agnostic logic for Corpus Harness: the manifest data
//! model and its status machine, content fingerprints, the overlapping
//! chunker, and the storage and embedding traits the pipeline is written
//! against.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. In-memory
//! implementations of [`store::CorpusStore`] and [`manifest::ManifestStore`]
//! live here so pipeline tests can run without a database.

pub mod chunk;
pub mod embedding;
pub mod fingerprint;
pub mod manifest;
pub mod models;
pub mod store;
