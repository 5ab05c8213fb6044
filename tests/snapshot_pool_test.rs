//! Snapshot Pool Integration Tests
//!
//! Exercises the historic snapshot ring through the public store surface:
//! pinned reads under a concurrently advancing writer, pool exhaustion with
//! blocking acquire, and the push-source bridge feeding the applier from
//! another thread.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use arkiv_bitmap_store::store::Queries;
use arkiv_bitmap_store::{push_source, Error};
use common::*;

/// A handle acquired at block N keeps seeing block N while the writer
/// commits past it.
#[tokio::test]
async fn pinned_snapshot_survives_writer_progress() {
    let (_dir, _path, store) = open_store();

    follow(
        &store,
        vec![batch(vec![block(
            1,
            vec![create_op(
                0,
                key(0x11),
                b"v1",
                string_attrs(&[("status", "draft")]),
                numeric_attrs(&[]),
            )],
        )])],
    )
    .unwrap();

    let token = CancellationToken::new();
    let handle = store.historic_pool().acquire(1, &token).unwrap();

    follow(
        &store,
        vec![batch(vec![block(2, vec![delete_op(0, key(0x11))])])],
    )
    .unwrap();
    assert_eq!(store.last_block().await.unwrap(), 2);

    // The pinned transaction still sees the pre-delete world.
    let queries = Queries::new(handle.connection().unwrap());
    assert_eq!(queries.get_last_block().unwrap(), 1);
    assert!(queries.get_payload(&key(0x11)).is_ok());
}

/// With every transaction of a block lent out, acquire blocks until one
/// comes back.
#[tokio::test]
async fn exhausted_pool_blocks_until_return() {
    let config = arkiv_bitmap_store::StoreConfig {
        transactions_per_block: 2,
        ..test_config()
    };
    let (_dir, _path, store) = open_store_with(config);

    follow(
        &store,
        vec![batch(vec![block(
            1,
            vec![create_op(0, key(0x11), b"x", string_attrs(&[]), numeric_attrs(&[]))],
        )])],
    )
    .unwrap();

    let pool = Arc::clone(store.historic_pool());
    let token = CancellationToken::new();
    let h1 = pool.acquire(1, &token).unwrap();
    let h2 = pool.acquire(1, &token).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        let token = token.clone();
        std::thread::spawn(move || pool.acquire(1, &token).map(|h| h.block()))
    };

    std::thread::sleep(Duration::from_millis(100));
    drop(h1);
    assert_eq!(waiter.join().unwrap().unwrap(), 1);
    drop(h2);
}

/// The future-block check uses the newest installed snapshot.
#[tokio::test]
async fn future_block_is_rejected_at_the_pool() {
    let (_dir, _path, store) = open_store();

    follow(
        &store,
        vec![batch(vec![block(
            3,
            vec![create_op(0, key(0x11), b"x", string_attrs(&[]), numeric_attrs(&[]))],
        )])],
    )
    .unwrap();

    let token = CancellationToken::new();
    let err = store.historic_pool().acquire(7, &token).unwrap_err();
    assert!(matches!(
        err,
        Error::FutureBlock {
            requested: 7,
            last: 3
        }
    ));
}

/// A multi-block batch installs one snapshot at its final block.
#[tokio::test]
async fn multi_block_batch_installs_final_snapshot() {
    let (_dir, _path, store) = open_store();

    follow(
        &store,
        vec![batch(vec![
            block(
                1,
                vec![create_op(0, key(0x01), b"a", string_attrs(&[]), numeric_attrs(&[]))],
            ),
            block(
                2,
                vec![create_op(0, key(0x02), b"b", string_attrs(&[]), numeric_attrs(&[]))],
            ),
        ])],
    )
    .unwrap();

    assert_eq!(store.historic_pool().newest_block(), Some(2));
    let token = CancellationToken::new();
    assert!(store.historic_pool().acquire(2, &token).is_ok());
    // Block 1 never had its own commit point, so no snapshot exists for it.
    assert!(matches!(
        store.historic_pool().acquire(1, &token),
        Err(Error::BlockRetired { requested: 1 })
    ));
}

/// The push source feeds `follow` across threads; queries observe the
/// batches as they commit.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_source_drives_the_applier() {
    let (_dir, _path, store) = open_store();
    let store = Arc::new(store);

    let (source, events) = push_source(8);
    let follower = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            let token = CancellationToken::new();
            store.follow_events(events, &token)
        })
    };

    for n in 1..=3u64 {
        source
            .push(batch(vec![block(
                n,
                vec![create_op(
                    0,
                    key(n as u8),
                    b"x",
                    string_attrs(&[("kind", "pushed")]),
                    numeric_attrs(&[]),
                )],
            )]))
            .unwrap();
    }
    source.close();
    follower.join().unwrap().unwrap();

    assert_eq!(store.last_block().await.unwrap(), 3);
    assert_eq!(query(store.as_ref(), r#"kind = "pushed""#).await.data.len(), 3);
}
