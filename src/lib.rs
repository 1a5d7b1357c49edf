//! # Findex
//!
//! A financial document classification and indexing pipeline.
//!
//! Findex ingests PDF, DOCX, and HTML documents, extracts and normalizes
//! their text, turns it into versioned feature vectors, classifies each
//! document into a closed category set with a versioned model, and makes
//! the results searchable. Processing is driven by a durable SQLite-backed
//! task queue with at-least-once delivery, per-stage retries with
//! exponential backoff, and an LRU prediction cache keyed by content hash.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌───────┐   ┌─────────────────────────────┐   ┌─────────┐
//! │ submit │──▶│ queue │──▶│ parse → extract → classify  │──▶│ SQLite  │
//! │ (CLI)  │   │ SQLite│   │        → index              │   │ + FTS5  │
//! └────────┘   └───────┘   └─────────────────────────────┘   └────┬────┘
//!                                                                 │
//!                                              search / status ◀──┘
//! ```
//!
//! ## Quick start
//!
//! ```bash
//! findex init                          # create database
//! findex submit report.pdf             # enqueue a document
//! findex worker --drain                # process until the queue is empty
//! findex search "quarterly revenue" --category financial-report
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Stage error taxonomy (terminal vs retryable) |
//! | [`parse`] | PDF/DOCX/HTML text extraction |
//! | [`features`] | Tokenization and feature vectors |
//! | [`classify`] | Model provider abstraction and linear model |
//! | [`cache`] | LRU prediction cache |
//! | [`queue`] | Durable at-least-once work queue |
//! | [`store`] | Documents, tasks, classification history |
//! | [`index`] | Search index adapter (FTS5) |
//! | [`pipeline`] | Stage orchestration |
//! | [`worker`] | Worker pool and graceful shutdown |
//! | [`ingest`] | Submission, dedup, blob storage |
//! | [`search`] | Keyword search and status reports |

pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod queue;
pub mod search;
pub mod store;
pub mod worker;
