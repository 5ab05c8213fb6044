//! # Store Facade and Query RPC
//!
//! [`SqliteStore`] is the public entry point. It owns the database handle,
//! the historic snapshot ring, and a pool of dedicated reader threads for
//! live queries, and exposes:
//!
//! - [`SqliteStore::follow_events`]: the blocking writer loop (one caller
//!   thread drives the applier),
//! - [`SqliteStore::query_entities`]: the async query RPC with paging,
//!   `includeData` projection, and the `atBlock` wait.
//!
//! ## Why reader threads?
//!
//! SQLite connections are `!Sync`, so async tasks cannot share one. Live
//! queries are dispatched over an mpsc channel to OS threads that each own
//! a read-only connection; a oneshot carries the response back. Historic
//! queries instead borrow a pinned transaction from the snapshot ring on a
//! blocking task.
//!
//! ```text
//!  async caller ──┬─ atBlock? ── wait until last-block ≥ atBlock (3 s)
//!                 │
//!                 ├─ historic ── spawn_blocking ── snapshot ring ── pinned tx
//!                 │
//!                 └─ live ────── mpsc ── reader thread (own read-only conn)
//! ```
//!
//! ## Paging
//!
//! Results stream in descending internal-id order. The opaque cursor is the
//! hex of the last returned id; resumption masks the evaluation bitmap to
//! `[0, cursor)` before iterating. Pages are capped at 200 rows and 512 MiB
//! of encoded payload, whichever is hit first.

use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, available_parallelism, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::applier::Applier;
use crate::error::{Error, Result};
use crate::pool::{HistoricTransactionPool, PoolConfig};
use crate::query::{self, NormalizedQuery};
use crate::schema::Database;
use crate::store::{PayloadRow, Queries};
use crate::types::{
    is_synthetic, to_hex, BatchOrError, CREATED_AT_BLOCK_ATTR, EXPIRATION_ATTR,
    LAST_MODIFIED_AT_BLOCK_ATTR, OP_INDEX_ATTR, OWNER_ATTR, TX_INDEX_ATTR,
};

/// Hard cap on page size; also the default.
const RESULTS_PER_PAGE_LIMIT: u64 = 200;

/// Per-response cap on encoded entity bytes.
const MAX_RESULT_BYTES: u64 = 512 * 1024 * 1024;

/// Ids pulled from the bitmap per bulk payload fetch while filling a page.
const PAGE_FILL_BATCH: u64 = 10;

/// Size of the live-read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for a store instance. The defaults match production behavior;
/// tests tighten the waits.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Reader threads serving live queries.
    pub read_threads: usize,
    /// Snapshot ring capacity (per-block pools retained).
    pub ring_capacity: usize,
    /// Pinned read transactions per per-block pool.
    pub transactions_per_block: usize,
    /// How long `query_entities` waits for `last-block` to reach `atBlock`.
    pub block_wait_timeout: Duration,
    /// Poll interval for that wait.
    pub block_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cpus = available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            read_threads: cpus.clamp(MIN_READ_THREADS, MAX_READ_THREADS),
            ring_capacity: 128,
            transactions_per_block: 7,
            block_wait_timeout: Duration::from_secs(3),
            block_poll_interval: Duration::from_millis(100),
        }
    }
}

// =============================================================================
// RPC types
// =============================================================================

/// Which fields of each entity the response carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncludeData {
    pub key: bool,
    pub attributes: bool,
    pub synthetic_attributes: bool,
    pub payload: bool,
    pub content_type: bool,
    pub expiration: bool,
    pub owner: bool,
    pub created_at_block: bool,
    pub last_modified_at_block: bool,
    pub transaction_index_in_block: bool,
    pub operation_index_in_transaction: bool,
}

impl IncludeData {
    /// What a response carries when the caller omits `includeData`.
    pub fn response_default() -> Self {
        Self {
            key: true,
            content_type: true,
            payload: true,
            owner: true,
            attributes: true,
            expiration: true,
            ..Self::default()
        }
    }
}

/// Options accepted by [`SqliteStore::query_entities`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Pin the query to a historic block instead of the live state.
    pub at_block: Option<u64>,
    pub include_data: Option<IncludeData>,
    /// Page size; capped at 200.
    pub results_per_page: Option<u64>,
    /// Hex-encoded id of the last entity of the previous page.
    pub cursor: Option<String>,
}

impl Options {
    fn results_per_page(&self) -> u64 {
        match self.results_per_page {
            Some(n) if n > 0 && n <= RESULTS_PER_PAGE_LIMIT => n,
            _ => RESULTS_PER_PAGE_LIMIT,
        }
    }

    fn include_data(&self) -> IncludeData {
        self.include_data.unwrap_or_else(IncludeData::response_default)
    }

    fn cursor_value(&self) -> Result<Option<u64>> {
        match self.cursor.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => {
                let digits = raw.strip_prefix("0x").unwrap_or(raw);
                u64::from_str_radix(digits, 16)
                    .map(Some)
                    .map_err(|_| Error::Parse(format!("invalid cursor {raw:?}")))
            }
        }
    }
}

/// One attribute pair in a response, sorted ascending by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute<T> {
    pub key: String,
    pub value: T,
}

/// One entity in a response, carrying only the fields enabled by
/// `includeData`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The payload bytes, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_index_in_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_index_in_transaction: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub string_attributes: Vec<Attribute<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub numeric_attributes: Vec<Attribute<u64>>,
}

impl EntityData {
    fn project(row: &PayloadRow, include: &IncludeData) -> Self {
        let mut out = Self::default();
        if include.key {
            out.key = Some(row.entity_key.to_hex());
        }
        if include.payload {
            out.value = Some(to_hex(&row.payload));
        }
        if include.content_type {
            out.content_type = Some(row.content_type.clone());
        }
        if include.expiration {
            out.expires_at = Some(
                row.numeric_attributes
                    .get(EXPIRATION_ATTR)
                    .copied()
                    .unwrap_or(0),
            );
        }
        if include.owner {
            out.owner = Some(
                row.string_attributes
                    .get(OWNER_ATTR)
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        if include.created_at_block {
            out.created_at_block = Some(
                row.numeric_attributes
                    .get(CREATED_AT_BLOCK_ATTR)
                    .copied()
                    .unwrap_or(0),
            );
        }
        if include.last_modified_at_block {
            out.last_modified_at_block = Some(
                row.numeric_attributes
                    .get(LAST_MODIFIED_AT_BLOCK_ATTR)
                    .copied()
                    .unwrap_or(0),
            );
        }
        if include.transaction_index_in_block {
            out.transaction_index_in_block = Some(
                row.numeric_attributes
                    .get(TX_INDEX_ATTR)
                    .copied()
                    .unwrap_or(0),
            );
        }
        if include.operation_index_in_transaction {
            out.operation_index_in_transaction = Some(
                row.numeric_attributes
                    .get(OP_INDEX_ATTR)
                    .copied()
                    .unwrap_or(0),
            );
        }

        let keep: Option<fn(&str) -> bool> =
            match (include.attributes, include.synthetic_attributes) {
                (true, true) => Some(|_| true),
                (true, false) => Some(|k| !is_synthetic(k)),
                (false, true) => Some(is_synthetic),
                (false, false) => None,
            };
        if let Some(keep) = keep {
            // BTreeMap iteration is ascending by key, matching the sorted
            // attribute-list contract.
            out.string_attributes = row
                .string_attributes
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| Attribute {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect();
            out.numeric_attributes = row
                .numeric_attributes
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, &v)| Attribute {
                    key: k.clone(),
                    value: v,
                })
                .collect();
        }
        out
    }
}

/// The response of one [`SqliteStore::query_entities`] page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub data: Vec<EntityData>,
    /// The block this page was evaluated at.
    pub block_number: u64,
    /// Present when more results remain; feed back as `options.cursor`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

// =============================================================================
// Reader threads
// =============================================================================

enum ReadRequest {
    LastBlock {
        response: oneshot::Sender<Result<u64>>,
    },
    Query {
        query: String,
        options: Options,
        response: oneshot::Sender<Result<QueryResponse>>,
    },
}

/// Reader loop: threads compete for the receiver lock; whichever is free
/// picks up the next request on its own read-only connection.
fn run_reader(mut conn: Connection, rx: Arc<StdMutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().expect("reader receiver mutex poisoned");
            guard.blocking_recv()
        };
        match request {
            Some(ReadRequest::LastBlock { response }) => {
                let result = Queries::new(&conn).get_last_block();
                let _ = response.send(result);
            }
            Some(ReadRequest::Query {
                query,
                options,
                response,
            }) => {
                let _ = response.send(live_query(&mut conn, &query, &options));
            }
            None => break,
        }
    }
}

/// Parses and runs one live query inside a fresh read transaction, so the
/// evaluation and the page fill see a single snapshot.
fn live_query(conn: &mut Connection, query: &str, options: &Options) -> Result<QueryResponse> {
    let parsed = query::parse(query)?;
    let tx = conn.transaction()?;
    let queries = Queries::new(&tx);
    let block_number = queries.get_last_block()?;
    run_query(&queries, &parsed, options, block_number)
    // Dropping `tx` rolls the read transaction back.
}

/// Evaluates a compiled query and fills one page.
fn run_query(
    queries: &Queries<'_>,
    parsed: &NormalizedQuery,
    options: &Options,
    block_number: u64,
) -> Result<QueryResponse> {
    let mut bitmap = parsed.evaluate(queries)?;

    // The cursor is the last id already returned; keep strictly below it.
    if let Some(cursor) = options.cursor_value()? {
        debug!(cursor, "resuming from cursor");
        bitmap.remove_from(cursor);
    }

    let max_results = options.results_per_page();
    let include = options.include_data();

    let mut response = QueryResponse {
        block_number,
        ..QueryResponse::default()
    };
    let mut ids = bitmap.iter().rev().peekable();
    let mut total_bytes = 0u64;
    let mut finished = true;
    let mut last_id = None;

    'fill: while ids.peek().is_some() {
        let room = max_results - response.data.len() as u64;
        let chunk: Vec<u64> = ids.by_ref().take(room.min(PAGE_FILL_BATCH) as usize).collect();
        for row in queries.retrieve_payloads(&chunk)? {
            last_id = Some(row.id);
            let entity = EntityData::project(&row, &include);
            total_bytes += encoded_len(&entity)?;
            response.data.push(entity);

            if total_bytes > MAX_RESULT_BYTES || response.data.len() as u64 >= max_results {
                finished = false;
                break 'fill;
            }
        }
    }

    if !finished {
        response.cursor = last_id.map(|id| format!("{id:#x}"));
    }
    Ok(response)
}

fn encoded_len(entity: &EntityData) -> Result<u64> {
    let bytes = serde_json::to_vec(entity)
        .map_err(|e| Error::Codec(format!("failed to encode entity data: {e}")))?;
    Ok(bytes.len() as u64)
}

// =============================================================================
// SqliteStore
// =============================================================================

/// A bitmap-indexed entity store over one SQLite database.
pub struct SqliteStore {
    db: Database,
    pool: Arc<HistoricTransactionPool>,
    config: StoreConfig,
    read_tx: mpsc::Sender<ReadRequest>,
    reader_handles: Vec<JoinHandle<()>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `path` and spins up its
    /// reader threads.
    pub fn open(path: impl AsRef<std::path::Path>, config: StoreConfig) -> Result<Self> {
        let db = Database::open(path)?;
        let pool = Arc::new(HistoricTransactionPool::new(
            db.clone(),
            PoolConfig {
                ring_capacity: config.ring_capacity,
                transactions_per_block: config.transactions_per_block,
            },
        ));

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(StdMutex::new(read_rx));
        let mut reader_handles = Vec::with_capacity(config.read_threads);
        for _ in 0..config.read_threads {
            let conn = db.read_connection()?;
            let rx = Arc::clone(&read_rx);
            reader_handles.push(thread::spawn(move || run_reader(conn, rx)));
        }

        Ok(Self {
            db,
            pool,
            config,
            read_tx,
            reader_handles,
        })
    }

    /// The historic snapshot ring, for embedders that drive it directly.
    pub fn historic_pool(&self) -> &Arc<HistoricTransactionPool> {
        &self.pool
    }

    /// Runs the applier over the event sequence on the calling thread.
    /// There must be at most one follower per store at a time.
    pub fn follow_events<I>(&self, events: I, token: &CancellationToken) -> Result<()>
    where
        I: IntoIterator<Item = BatchOrError>,
    {
        let conn = self.db.write_connection()?;
        let mut applier = Applier::new(conn, Arc::clone(&self.pool));
        applier.follow(events, token)
    }

    /// The greatest committed block number.
    pub async fn last_block(&self) -> Result<u64> {
        let (response, receiver) = oneshot::channel();
        self.read_tx
            .send(ReadRequest::LastBlock { response })
            .await
            .map_err(|_| Error::Cancelled)?;
        receiver.await.map_err(|_| Error::Cancelled)?
    }

    /// Evaluates a query and returns one page of matching entities.
    ///
    /// With `atBlock` set, the call first waits (up to the configured
    /// timeout) for the live `last-block` to reach that height, then reads
    /// from the pinned snapshot of that block. Without it, the query runs
    /// against the latest committed state.
    pub async fn query_entities(
        &self,
        query: &str,
        options: Option<Options>,
        token: &CancellationToken,
    ) -> Result<QueryResponse> {
        let options = options.unwrap_or_default();

        if let Some(at_block) = options.at_block {
            self.wait_for_block(at_block, token).await?;
            return self.historic_query(at_block, query, options, token).await;
        }

        let (response, receiver) = oneshot::channel();
        self.read_tx
            .send(ReadRequest::Query {
                query: query.to_string(),
                options,
                response,
            })
            .await
            .map_err(|_| Error::Cancelled)?;

        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            result = receiver => result.map_err(|_| Error::Cancelled)?,
        }
    }

    async fn wait_for_block(&self, at_block: u64, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.config.block_wait_timeout;
        loop {
            let last = self.last_block().await?;
            if last >= at_block {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::BlockNotReady {
                    requested: at_block,
                    last,
                });
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.block_poll_interval) => {}
            }
        }
    }

    async fn historic_query(
        &self,
        at_block: u64,
        query: &str,
        options: Options,
        token: &CancellationToken,
    ) -> Result<QueryResponse> {
        let pool = Arc::clone(&self.pool);
        let query = query.to_string();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let parsed = query::parse(&query)?;
            let handle = pool.acquire(at_block, &token)?;
            let queries = Queries::new(handle.connection()?);
            run_query(&queries, &parsed, &options, at_block)
        })
        .await
        .map_err(|_| Error::Cancelled)?
    }

    /// Shuts the reader threads down and waits for them to exit.
    pub fn close(self) {
        drop(self.read_tx);
        for handle in self.reader_handles {
            let _ = handle.join();
        }
    }
}
