//! # arkiv-bitmap-store
//!
//! A bitmap-indexed entity store. It follows an append-only, block-ordered
//! stream of content-addressed entity operations (create / update / delete /
//! expire / extend-TTL / change-owner), maintains one roaring bitmap of
//! internal entity ids per (attribute, value) pair, and serves a boolean
//! attribute query language over the resulting set of live entities -
//! including point-in-time reads against a ring of pinned snapshots.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      event source (lazy sequence)                │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Applier (single writer, one transaction per batch)              │
//! │    payload upserts ── bitmap cache ── flush ── last-block        │
//! │    COMMIT + snapshot-pool install under one lock                 │
//! └───────────────┬──────────────────────────────┬───────────────────┘
//!                 ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────────┐
//! │  SQLite (WAL)            │   │  Historic snapshot ring          │
//! │  payloads / last_block / │   │  per-block pools of pinned       │
//! │  per-value bitmaps       │   │  read-only transactions          │
//! └──────────────┬───────────┘   └──────────────┬───────────────────┘
//!                ▼                              ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Query engine: lex ── parse ── DNF normalize ── roaring algebra  │
//! │  (live reader threads, or a pinned historic transaction)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: one applier per store; each batch commits atomically.
//! 2. **Exactly once per block**: blocks at or below `last-block` are skipped.
//! 3. **Index faithfulness**: every (attribute, value) of a live payload is
//!    in the matching bitmap, and nothing else is.
//! 4. **No empty bitmaps at rest**: emptiness deletes the row on flush.
//! 5. **Monotone last-block**: strictly increasing across commits; a reader
//!    observing block N sees all state up to N.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum.
//! - [`types`]: entity keys, addresses, operations, blocks, batches.
//! - [`codec`]: bitmap and attribute-map blob codecs.
//! - [`schema`]: SQLite DDL, pragmas, and connection handling.
//! - [`store`]: the typed persistence gateway.
//! - [`cache`]: the in-transaction bitmap write-through cache.
//! - [`applier`]: the event applier (the single writer).
//! - [`query`]: lexer, parser, DNF normalizer, bitmap evaluator.
//! - [`pool`]: the historic snapshot ring.
//! - [`pusher`]: channel-backed bridge for push-based event sources.
//! - [`api`]: the [`SqliteStore`] facade and query RPC types.

pub mod api;
pub mod applier;
pub mod cache;
pub mod codec;
pub mod error;
pub mod pool;
pub mod pusher;
pub mod query;
pub mod schema;
pub mod store;
pub mod types;

pub use api::{
    Attribute, EntityData, IncludeData, Options, QueryResponse, SqliteStore, StoreConfig,
};
pub use applier::Applier;
pub use codec::{Bitmap, NumericAttributes, StringAttributes};
pub use error::{Error, Result};
pub use pool::{HistoricTransaction, HistoricTransactionPool, PoolConfig};
pub use pusher::{push_source, BatchIter, PushSource};
pub use schema::Database;
pub use types::{
    Address, BatchOrError, Block, BlockBatch, EntityKey, Operation, OperationKind, PayloadInit,
};
