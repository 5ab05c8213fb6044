#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use arkiv_bitmap_store::types::Operation;
use arkiv_bitmap_store::{
    Address, Block, BlockBatch, Database, EntityKey, NumericAttributes, OperationKind,
    PayloadInit, QueryResponse, SqliteStore, StoreConfig, StringAttributes,
};

/// The owner address used across the scenarios.
pub fn owner() -> Address {
    "0x1234567890123456789012345678901234567890"
        .parse()
        .expect("valid address")
}

/// An alternative owner, for change-owner scenarios.
pub fn other_owner() -> Address {
    "0xffffffffffffffffffffffffffffffffffff0000"
        .parse()
        .expect("valid address")
}

/// A deterministic entity key from a fill byte.
pub fn key(byte: u8) -> EntityKey {
    EntityKey::new([byte; 32])
}

pub fn string_attrs(pairs: &[(&str, &str)]) -> StringAttributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn numeric_attrs(pairs: &[(&str, u64)]) -> NumericAttributes {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn payload_init(
    key: EntityKey,
    content: &[u8],
    strings: StringAttributes,
    numerics: NumericAttributes,
) -> PayloadInit {
    PayloadInit {
        key,
        owner: owner(),
        btl: 1000,
        content: content.to_vec(),
        content_type: "application/json".to_string(),
        string_attributes: strings,
        numeric_attributes: numerics,
    }
}

pub fn create_op(
    op_index: u16,
    key: EntityKey,
    content: &[u8],
    strings: StringAttributes,
    numerics: NumericAttributes,
) -> Operation {
    Operation {
        tx_index: 0,
        op_index,
        kind: OperationKind::Create(payload_init(key, content, strings, numerics)),
    }
}

pub fn update_op(
    op_index: u16,
    key: EntityKey,
    content: &[u8],
    strings: StringAttributes,
    numerics: NumericAttributes,
) -> Operation {
    Operation {
        tx_index: 0,
        op_index,
        kind: OperationKind::Update(payload_init(key, content, strings, numerics)),
    }
}

pub fn delete_op(op_index: u16, key: EntityKey) -> Operation {
    Operation {
        tx_index: 0,
        op_index,
        kind: OperationKind::Delete { key },
    }
}

pub fn extend_btl_op(op_index: u16, key: EntityKey, btl: u64) -> Operation {
    Operation {
        tx_index: 0,
        op_index,
        kind: OperationKind::ExtendBtl { key, btl },
    }
}

pub fn change_owner_op(op_index: u16, key: EntityKey, owner: Address) -> Operation {
    Operation {
        tx_index: 0,
        op_index,
        kind: OperationKind::ChangeOwner { key, owner },
    }
}

pub fn block(number: u64, operations: Vec<Operation>) -> Block {
    Block { number, operations }
}

pub fn batch(blocks: Vec<Block>) -> BlockBatch {
    BlockBatch { blocks }
}

/// A store configuration with short waits, so timeout paths finish quickly
/// under test.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        read_threads: 2,
        block_wait_timeout: Duration::from_millis(300),
        block_poll_interval: Duration::from_millis(50),
        ..StoreConfig::default()
    }
}

pub fn open_store() -> (tempfile::TempDir, PathBuf, SqliteStore) {
    open_store_with(test_config())
}

pub fn open_store_with(config: StoreConfig) -> (tempfile::TempDir, PathBuf, SqliteStore) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("entities.db");
    let store = SqliteStore::open(&path, config).expect("open store");
    (dir, path, store)
}

/// Applies batches through the store's writer, as the event source would.
pub fn follow(store: &SqliteStore, batches: Vec<BlockBatch>) -> arkiv_bitmap_store::Result<()> {
    let token = CancellationToken::new();
    let events = batches
        .into_iter()
        .map(Ok::<BlockBatch, arkiv_bitmap_store::types::SourceError>);
    store.follow_events(events, &token)
}

/// Runs a live query with default options.
pub async fn query(store: &SqliteStore, q: &str) -> QueryResponse {
    let token = CancellationToken::new();
    store
        .query_entities(q, None, &token)
        .await
        .unwrap_or_else(|e| panic!("query {q:?} failed: {e}"))
}

/// The entity keys of a response, in page order.
pub fn response_keys(response: &QueryResponse) -> Vec<String> {
    response
        .data
        .iter()
        .map(|e| e.key.clone().expect("key included"))
        .collect()
}

/// Opens an independent read-only inspection connection on the same file.
pub fn inspection_conn(path: &std::path::Path) -> rusqlite::Connection {
    Database::open(path)
        .expect("reopen database")
        .read_connection()
        .expect("open read connection")
}
