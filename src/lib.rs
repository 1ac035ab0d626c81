//! # Corpus Harness
//!
//! Keeps a retrieval corpus consistent with the source documents it was
//! built from.
//!
//! Three layers drift independently: raw files in a source directory, their
//! refined plain-text derivatives, and the chunked + embedded records in the
//! corpus store. A manifest records, per document, which source fingerprint
//! each layer was last built from; the integrity checker compares the layers
//! and the orchestrator repairs them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │ Source files │──▶│ Refiner  │──▶│ Ingestion │──▶│ Corpus store │
//! │ PDF/PPTX/... │   │ text.txt │   │ chunk+emb │   │   (SQLite)   │
//! └──────────────┘   └────┬─────┘   └─────┬─────┘   └──────────────┘
//!                         └───────┬───────┘
//!                                 ▼
//!                     ┌───────────────────────┐
//!                     │ Manifest + Integrity  │
//!                     └───────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! corpus init                   # create database
//! corpus check                  # drift report
//! corpus repair decks/q3.pptx   # refine + ingest one file
//! corpus reprocess              # sweep everything
//! corpus prune                  # drop orphaned documents
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite manifest and corpus stores |
//! | [`source_fs`] | Source directory listing |
//! | [`extract`] | PDF / OOXML / text conversion |
//! | [`refine`] | Source file to derivative |
//! | [`integrity`] | Drift report and its cache |
//! | [`ingest`] | Chunk, embed, replace |
//! | [`embedding`] | Embedding providers |
//! | [`locks`] | Per-document mutual exclusion |
//! | [`orchestrator`] | Repair, reprocess, prune |
//! | [`progress`] | Sweep progress reporting |
//! | [`stats`] | Corpus statistics |

pub mod app;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod integrity;
pub mod locks;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod refine;
pub mod source_fs;
pub mod sqlite_store;
pub mod stats;
