//! # DocHarbor
//!
//! A file ingestion and retrieval pipeline for project documents.
//!
//! DocHarbor turns uploaded files (plain text, PDF, office documents) into
//! vector- and keyword-searchable knowledge: a background queue drives each
//! file through extraction, chunking, and embedding with bounded
//! concurrency and retry backoff, and a hybrid search service ranks chunks
//! by blended similarity, keyword, and recency scores.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────┐   ┌───────────┐
//! │  Upload  │──▶│        Ingestion Queue        │──▶│  SQLite   │
//! │ (harbor) │   │ extract ▶ chunk ▶ embed ▶ store│   │ FTS5+Vec  │
//! └──────────┘   └───────────────────────────────┘   └────┬──────┘
//!                                                         │
//!                                                         ▼
//!                                                  ┌─────────────┐
//!                                                  │Hybrid Search│
//!                                                  │ 0.6/0.3/0.1 │
//!                                                  └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harbor init                              # create database
//! harbor upload my-project notes.txt      # upload and process
//! harbor search "deployment checklist"    # hybrid search
//! harbor status                           # queue depth
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Per-format content extraction |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding client and vector math |
//! | [`store`] | Chunk persistence and similarity queries |
//! | [`queue`] | Background ingestion scheduler |
//! | [`files`] | Upload, listing, and deletion |
//! | [`search`] | Hybrid ranking and context stitching |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod files;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod search;
pub mod store;
