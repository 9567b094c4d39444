//! # Rephole
//!
//! **A semantic code-search backend: incremental Git ingestion,
//! syntax-aware chunking, and parent–child retrieval.**
//!
//! Clients submit a repository URL; workers clone it, split each source
//! file into semantic chunks with tree-sitter, embed the chunks, and index
//! them in a vector store alongside the full file bodies in a blob store.
//! Natural-language queries then return either the most relevant whole
//! files or the precise code fragments, filtered by repository and
//! arbitrary metadata.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────────────────────────┐
//! │ API      │──▶│  Job queue │──▶│  Worker                       │
//! │ (axum)   │   │ (Postgres) │   │  clone → diff → chunk → embed │
//! └────┬─────┘   └────────────┘   └──────┬───────────────┬────────┘
//!      │                                 ▼               ▼
//!      │                          ┌────────────┐  ┌────────────┐
//!      └── queries ──────────────▶│   Chroma   │  │  Postgres  │
//!                                 │ (children) │  │ (parents)  │
//!                                 └────────────┘  └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. `POST /ingestions/repository` validates the request ([`producer`])
//!    and enqueues a durable job ([`queue`]).
//! 2. A worker claims the job ([`worker`]), resolves the repository state
//!    ([`state_store`]), and diffs the clone against the last processed
//!    commit ([`git`]) so only changed files are re-indexed.
//! 3. Changed files are stored whole ([`blob_store`]), chunked
//!    ([`chunker`], [`languages`]), embedded ([`embedding`]), and upserted
//!    into the vector collection ([`vector_store`]).
//! 4. Queries embed the prompt and run parent–child retrieval
//!    ([`query`], [`retriever`]): search the small chunks, return the
//!    large parents.
//!
//! ## Processes
//!
//! | Command | Role |
//! |---------|------|
//! | `rephole migrate` | Create/upgrade the database schema |
//! | `rephole serve` | HTTP API: ingestion producer + query service (port 3000) |
//! | `rephole worker` | Queue consumer: the ingestion pipeline (health on port 3002) |
//! | `rephole ingest` | Enqueue an ingestion job from the command line |
//!
//! ## Configuration
//!
//! Everything is environment-driven; see [`config::Config::from_env`].
//! The vector collection defaults to `rephole-collection`.

pub mod blob_store;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod git;
pub mod languages;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod producer;
pub mod query;
pub mod queue;
pub mod retriever;
pub mod server;
pub mod state_store;
pub mod traits;
pub mod vector_store;
pub mod worker;
