//! # Event Applier
//!
//! The single writer. [`Applier::follow`] consumes a lazy sequence of block
//! batches and turns each batch into exactly one SQLite write transaction:
//!
//! ```text
//! BatchOrError ──► BEGIN IMMEDIATE
//!                    ├─ replay guard: skip blocks ≤ last-block
//!                    ├─ per block, in order:
//!                    │    Create / Update / Delete / Expire /
//!                    │    ExtendBtl / ChangeOwner
//!                    │      ├─ payload upsert/delete
//!                    │      └─ bitmap cache add/remove
//!                    ├─ cache flush (coalesced bitmap writes)
//!                    ├─ set last-block
//!                    └─ COMMIT + install snapshot pool   (one lock)
//! ```
//!
//! Any error inside a batch rolls the whole transaction back - no partial
//! block is ever visible and the bitmap cache dies with the transaction.
//! An upstream error terminates the stream immediately.
//!
//! ## Within-block semantics
//!
//! Operations apply in order. For `Update`, only the last update to a key
//! within a block is materialized; earlier ones are skipped without
//! disturbing any other operation in the block. Create and Update inject
//! the synthetic attributes; Delete and Expire are indistinguishable here -
//! both drop the payload and every index entry for it.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::BitmapCache;
use crate::codec::{NumericAttributes, StringAttributes};
use crate::error::{Error, Result};
use crate::pool::HistoricTransactionPool;
use crate::store::{Queries, UpsertPayload};
use crate::types::{
    BatchOrError, Block, EntityKey, Operation, OperationKind, PayloadInit, CREATED_AT_BLOCK_ATTR,
    CREATOR_ATTR, EXPIRATION_ATTR, KEY_ATTR, LAST_MODIFIED_AT_BLOCK_ATTR, OP_INDEX_ATTR,
    OWNER_ATTR, SEQUENCE_ATTR, TX_INDEX_ATTR,
};

/// Per-block operation counters, for the post-block log line.
#[derive(Debug, Default)]
struct OpCounters {
    creates: u64,
    updates: u64,
    deletes: u64,
    extends: u64,
    owner_changes: u64,
}

/// The single writer over one store.
pub struct Applier {
    conn: Connection,
    pool: Arc<HistoricTransactionPool>,
}

impl Applier {
    pub fn new(conn: Connection, pool: Arc<HistoricTransactionPool>) -> Self {
        Self { conn, pool }
    }

    /// Consumes the event sequence until end-of-stream, the first error, or
    /// cancellation. Each batch is applied in one atomic write transaction.
    pub fn follow<I>(&mut self, events: I, token: &CancellationToken) -> Result<()>
    where
        I: IntoIterator<Item = BatchOrError>,
    {
        for item in events {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let batch = item.map_err(|e| Error::Upstream(e.to_string()))?;
            if batch.blocks.is_empty() {
                continue;
            }
            self.apply_batch(&batch.blocks)?;
        }
        Ok(())
    }

    fn apply_batch(&mut self, blocks: &[Block]) -> Result<()> {
        let first = blocks[0].number;
        let last = blocks[blocks.len() - 1].number;
        info!(first_block = first, last_block = last, "new batch");

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Everything in this scope sees the transaction through `queries`;
        // the scope must end before the transaction can be committed.
        let newest_applied = {
            let queries = Queries::new(&tx);
            let last_from_db = queries.get_last_block()?;
            let mut cache = BitmapCache::new(&queries);

            let mut newest_applied = None;
            for block in blocks {
                if block.number <= last_from_db {
                    info!(
                        block = block.number,
                        last_block = last_from_db,
                        "skipping already applied block"
                    );
                    continue;
                }
                apply_block(&queries, &mut cache, block)?;
                newest_applied = Some(block.number);
            }

            if let Some(newest) = newest_applied {
                cache.flush()?;
                queries.set_last_block(newest)?;
            }
            newest_applied
        };

        match newest_applied {
            Some(newest) => self.pool.commit_and_install(newest, tx)?,
            // Every block was a replay: commit the empty transaction and
            // leave last-block and the snapshot ring untouched.
            None => tx.commit()?,
        }
        Ok(())
    }
}

fn apply_block(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    block: &Block,
) -> Result<()> {
    // Last update wins within a block: record, per key, which operation
    // index carries the final update.
    let mut last_update_for_key: HashMap<EntityKey, usize> = HashMap::new();
    for (index, operation) in block.operations.iter().enumerate() {
        if let OperationKind::Update(init) = &operation.kind {
            last_update_for_key.insert(init.key, index);
        }
    }

    let mut counters = OpCounters::default();

    for (index, operation) in block.operations.iter().enumerate() {
        match &operation.kind {
            OperationKind::Create(init) => {
                counters.creates += 1;
                apply_create(queries, cache, block.number, operation, init)?;
            }
            OperationKind::Update(init) => {
                counters.updates += 1;
                if last_update_for_key.get(&init.key) != Some(&index) {
                    // Superseded later in this block; the final update
                    // carries the whole state.
                    debug!(
                        block = block.number,
                        key = %init.key,
                        "skipping superseded update"
                    );
                    continue;
                }
                apply_update(queries, cache, block.number, init)?;
            }
            OperationKind::Delete { key } | OperationKind::Expire { key } => {
                counters.deletes += 1;
                apply_delete(queries, cache, key)?;
            }
            OperationKind::ExtendBtl { key, btl } => {
                counters.extends += 1;
                apply_extend_btl(queries, cache, block.number, key, *btl)?;
            }
            OperationKind::ChangeOwner { key, owner } => {
                counters.owner_changes += 1;
                apply_change_owner(queries, cache, key, &owner.to_hex())?;
            }
        }
    }

    info!(
        block = block.number,
        creates = counters.creates,
        updates = counters.updates,
        deletes = counters.deletes,
        extends = counters.extends,
        owner_changes = counters.owner_changes,
        "block applied"
    );
    Ok(())
}

fn apply_create(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    block: u64,
    operation: &Operation,
    init: &PayloadInit,
) -> Result<()> {
    let owner_hex = init.owner.to_hex();

    let mut string_attributes = init.string_attributes.clone();
    string_attributes.insert(OWNER_ATTR, owner_hex.clone());
    string_attributes.insert(CREATOR_ATTR, owner_hex);
    string_attributes.insert(KEY_ATTR, init.key.to_hex());

    let mut numeric_attributes = init.numeric_attributes.clone();
    numeric_attributes.insert(EXPIRATION_ATTR, block + init.btl);
    numeric_attributes.insert(CREATED_AT_BLOCK_ATTR, block);
    numeric_attributes.insert(LAST_MODIFIED_AT_BLOCK_ATTR, block);
    numeric_attributes.insert(TX_INDEX_ATTR, operation.tx_index as u64);
    numeric_attributes.insert(OP_INDEX_ATTR, operation.op_index as u64);
    numeric_attributes.insert(SEQUENCE_ATTR, operation.sequence(block));

    let id = queries.upsert_payload(&UpsertPayload {
        entity_key: init.key,
        payload: &init.content,
        content_type: &init.content_type,
        string_attributes: &string_attributes,
        numeric_attributes: &numeric_attributes,
    })?;

    add_all(cache, &string_attributes, &numeric_attributes, id)
}

fn apply_update(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    block: u64,
    init: &PayloadInit,
) -> Result<()> {
    let old = queries.get_payload(&init.key)?;

    let mut string_attributes = init.string_attributes.clone();
    string_attributes.insert(OWNER_ATTR, init.owner.to_hex());
    string_attributes.insert(
        CREATOR_ATTR,
        old.string_attributes
            .get(CREATOR_ATTR)
            .cloned()
            .unwrap_or_default(),
    );
    string_attributes.insert(KEY_ATTR, init.key.to_hex());

    let mut numeric_attributes = init.numeric_attributes.clone();
    numeric_attributes.insert(EXPIRATION_ATTR, block + init.btl);
    numeric_attributes.insert(LAST_MODIFIED_AT_BLOCK_ATTR, block);
    // The creating operation's position is part of the entity's identity
    // and survives every update.
    for carried in [
        CREATED_AT_BLOCK_ATTR,
        SEQUENCE_ATTR,
        TX_INDEX_ATTR,
        OP_INDEX_ATTR,
    ] {
        numeric_attributes.insert(
            carried,
            old.numeric_attributes.get(carried).copied().unwrap_or(0),
        );
    }

    let id = queries.upsert_payload(&UpsertPayload {
        entity_key: init.key,
        payload: &init.content,
        content_type: &init.content_type,
        string_attributes: &string_attributes,
        numeric_attributes: &numeric_attributes,
    })?;

    // Unchanged pairs net to zero inside the cache and produce no write.
    remove_all(cache, &old.string_attributes, &old.numeric_attributes, id)?;
    add_all(cache, &string_attributes, &numeric_attributes, id)
}

fn apply_delete(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    key: &EntityKey,
) -> Result<()> {
    let old = queries.get_payload(key)?;
    remove_all(cache, &old.string_attributes, &old.numeric_attributes, old.id)?;
    queries.delete_payload(key)
}

fn apply_extend_btl(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    block: u64,
    key: &EntityKey,
    btl: u64,
) -> Result<()> {
    let old = queries.get_payload(key)?;
    let old_expiration = old
        .numeric_attributes
        .get(EXPIRATION_ATTR)
        .copied()
        .unwrap_or(0);
    let new_expiration = block + btl;

    let mut numeric_attributes = old.numeric_attributes.clone();
    numeric_attributes.insert(EXPIRATION_ATTR, new_expiration);

    let id = queries.upsert_payload(&UpsertPayload {
        entity_key: *key,
        payload: &old.payload,
        content_type: &old.content_type,
        string_attributes: &old.string_attributes,
        numeric_attributes: &numeric_attributes,
    })?;

    cache.remove_numeric(EXPIRATION_ATTR, old_expiration, id)?;
    cache.add_numeric(EXPIRATION_ATTR, new_expiration, id)
}

fn apply_change_owner(
    queries: &Queries<'_>,
    cache: &mut BitmapCache<'_, '_>,
    key: &EntityKey,
    new_owner: &str,
) -> Result<()> {
    let old = queries.get_payload(key)?;
    let old_owner = old
        .string_attributes
        .get(OWNER_ATTR)
        .cloned()
        .unwrap_or_default();

    let mut string_attributes = old.string_attributes.clone();
    string_attributes.insert(OWNER_ATTR, new_owner.to_string());

    let id = queries.upsert_payload(&UpsertPayload {
        entity_key: *key,
        payload: &old.payload,
        content_type: &old.content_type,
        string_attributes: &string_attributes,
        numeric_attributes: &old.numeric_attributes,
    })?;

    cache.remove_string(OWNER_ATTR, &old_owner, id)?;
    cache.add_string(OWNER_ATTR, new_owner, id)
}

fn add_all(
    cache: &mut BitmapCache<'_, '_>,
    strings: &StringAttributes,
    numerics: &NumericAttributes,
    id: u64,
) -> Result<()> {
    for (name, value) in strings.iter() {
        cache.add_string(name, value, id)?;
    }
    for (name, &value) in numerics.iter() {
        cache.add_numeric(name, value, id)?;
    }
    Ok(())
}

fn remove_all(
    cache: &mut BitmapCache<'_, '_>,
    strings: &StringAttributes,
    numerics: &NumericAttributes,
    id: u64,
) -> Result<()> {
    for (name, value) in strings.iter() {
        cache.remove_string(name, value, id)?;
    }
    for (name, &value) in numerics.iter() {
        cache.remove_numeric(name, value, id)?;
    }
    Ok(())
}
