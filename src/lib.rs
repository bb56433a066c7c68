//! # Catalog Ingest
//!
//! A concurrent ingestion pipeline for media catalogs.
//!
//! Category sources (movies, series, live, ...) produce pages of raw content
//! metadata concurrently. Each page is mapped to candidate records,
//! deduplicated within the batch (last occurrence wins) and offered to a
//! bounded buffer. A single committer drains the buffer and reconciles each
//! batch against the persisted catalog in one atomic transaction, updating
//! existing rows in place and inserting new ones. Producers poll a memory
//! pressure monitor and slow down as the process approaches its budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │  Sources    │──▶│  Dedup   │──▶│ Backpressure │──▶│  Upsert   │
//! │ per category│   │ per batch│   │    Buffer    │   │  Store    │
//! └─────────────┘   └──────────┘   └──────────────┘   └─────┬─────┘
//!        ▲                                                  │
//!        │ delay                                            ▼
//! ┌──────┴──────┐                                     ┌───────────┐
//! │  Pressure   │                                     │ RunReport │
//! │  Monitor    │                                     └───────────┘
//! └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! catalog-ingest init                    # create database
//! catalog-ingest sync                    # ingest every configured category
//! catalog-ingest sync --category movies  # ingest one category
//! catalog-ingest stats                   # row counts per table and origin
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Record kinds, raw records, key derivation |
//! | [`dedup`] | In-batch deduplication |
//! | [`pressure`] | Memory pressure classification |
//! | [`buffer`] | Bounded backpressure buffer |
//! | [`store`] | Transactional upsert store (SQLite, in-memory) |
//! | [`source`] | Category sources |
//! | [`pipeline`] | Producer/committer orchestration |
//! | [`report`] | Ingestion reports |
//! | [`ingest`] | `sync` command |
//! | [`stats`] | Catalog statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod buffer;
pub mod config;
pub mod db;
pub mod dedup;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod pressure;
pub mod report;
pub mod source;
pub mod stats;
pub mod store;
