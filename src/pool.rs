//! # Historic Snapshot Pool
//!
//! Point-in-time reads are served by a bounded ring of per-block pools.
//! Each pool holds a fixed number of read-only SQLite transactions that were
//! opened - and pinned by a warm-up read - at the moment their block
//! committed. WAL isolation then keeps every one of those transactions at
//! exactly that block's state, no matter how far the writer advances.
//!
//! ```text
//!              ring (oldest ── newest, capacity 128)
//! ┌──────────┐ ┌──────────┐         ┌──────────┐
//! │ block N-k│ │block N-k+1│  ...   │ block N  │   each pool: 7 pinned
//! │ txs: 7   │ │ txs: 7   │         │ txs: 7   │   read transactions
//! └──────────┘ └──────────┘         └──────────┘
//!      ▲                                  ▲
//!   evicted on overflow        installed by commit_and_install
//! ```
//!
//! Committing the writer's transaction and installing the new pool happen
//! under one lock, so no reader can observe the committed block before a
//! pool for it exists.
//!
//! `acquire` blocks while a pool's transactions are all lent out and returns
//! promptly with [`Error::Cancelled`] once the caller's token fires. Unlike
//! the install path, the wait holds only the per-pool lock, so a blocked
//! reader never delays a commit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::store::Queries;

/// How often a blocked `acquire` rechecks its cancellation token.
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Sizing of the snapshot ring.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// How many per-block pools the ring retains.
    pub ring_capacity: usize,
    /// How many pinned read transactions each per-block pool holds.
    pub transactions_per_block: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 128,
            transactions_per_block: 7,
        }
    }
}

// =============================================================================
// Per-block pool
// =============================================================================

struct PoolState {
    /// Connections with an open, pinned read transaction, ready to lend.
    idle: Vec<Connection>,
    closed: bool,
}

/// The pinned transactions for a single block.
struct BlockPool {
    block: u64,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl BlockPool {
    fn acquire(pool: &Arc<BlockPool>, token: &CancellationToken) -> Result<HistoricTransaction> {
        let mut state = pool.state.lock().expect("block pool mutex poisoned");
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if state.closed {
                // Evicted while we were waiting.
                return Err(Error::BlockRetired {
                    requested: pool.block,
                });
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(HistoricTransaction {
                    conn: Some(conn),
                    pool: Arc::clone(pool),
                });
            }
            let (guard, _) = pool
                .returned
                .wait_timeout(state, ACQUIRE_POLL)
                .expect("block pool mutex poisoned");
            state = guard;
        }
    }

    fn give_back(&self, conn: Connection) {
        let mut state = self.state.lock().expect("block pool mutex poisoned");
        if state.closed {
            rollback_quietly(&conn, self.block);
        } else {
            state.idle.push(conn);
            self.returned.notify_one();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("block pool mutex poisoned");
        for conn in state.idle.drain(..) {
            rollback_quietly(&conn, self.block);
        }
        state.closed = true;
        // Wake every waiter so it can observe the closed flag.
        self.returned.notify_all();
    }
}

fn rollback_quietly(conn: &Connection, block: u64) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(block, error = %e, "failed to roll back historic read transaction");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A pinned read transaction lent out by a per-block pool.
///
/// The handle is single-use: after [`close`](Self::close) (or drop, which
/// closes implicitly) the underlying transaction belongs to the pool again
/// and any further access fails with [`Error::HandleReturned`].
pub struct HistoricTransaction {
    conn: Option<Connection>,
    pool: Arc<BlockPool>,
}

impl std::fmt::Debug for HistoricTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricTransaction")
            .field("block", &self.pool.block)
            .finish()
    }
}

impl HistoricTransaction {
    /// The block this transaction is pinned to.
    pub fn block(&self) -> u64 {
        self.pool.block
    }

    /// The underlying connection, for running queries against the snapshot.
    pub fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::HandleReturned)
    }

    /// Returns the transaction to its pool, waking one waiter. If the pool
    /// was retired in the meantime the transaction is rolled back instead.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

impl Drop for HistoricTransaction {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Ring
// =============================================================================

/// The bounded ring of per-block snapshot pools, newest last.
pub struct HistoricTransactionPool {
    db: Database,
    config: PoolConfig,
    pools: Mutex<VecDeque<Arc<BlockPool>>>,
}

impl HistoricTransactionPool {
    pub fn new(db: Database, config: PoolConfig) -> Self {
        Self {
            db,
            config,
            pools: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
        }
    }

    /// Commits the writer's transaction and installs a snapshot pool at
    /// `block`, atomically with respect to `acquire`. Evicts the oldest
    /// pool(s) once the ring is full.
    pub fn commit_and_install(&self, block: u64, tx: rusqlite::Transaction<'_>) -> Result<()> {
        let mut pools = self.pools.lock().expect("snapshot ring mutex poisoned");

        tx.commit()?;

        let pool = self.new_pool_at_block(block)?;
        while pools.len() >= self.config.ring_capacity {
            if let Some(old) = pools.pop_front() {
                info!(block = old.block, "retiring historic snapshot pool");
                old.close();
            }
        }
        pools.push_back(pool);
        info!(
            block,
            pools = pools.len(),
            transactions = self.config.transactions_per_block,
            "installed historic snapshot pool"
        );
        Ok(())
    }

    /// Borrows a pinned transaction for `at_block`, blocking while all of
    /// that block's transactions are lent out.
    pub fn acquire(
        &self,
        at_block: u64,
        token: &CancellationToken,
    ) -> Result<HistoricTransaction> {
        let pool = {
            let pools = self.pools.lock().expect("snapshot ring mutex poisoned");
            let newest = pools
                .back()
                .map(|p| p.block)
                .ok_or(Error::BlockRetired {
                    requested: at_block,
                })?;
            if at_block > newest {
                return Err(Error::FutureBlock {
                    requested: at_block,
                    last: newest,
                });
            }
            pools
                .iter()
                .find(|p| p.block == at_block)
                .map(Arc::clone)
                .ok_or(Error::BlockRetired {
                    requested: at_block,
                })?
            // Ring lock dropped here; only the per-pool lock is held while
            // blocked, so installs proceed during the wait.
        };
        BlockPool::acquire(&pool, token)
    }

    /// The newest block with an installed snapshot pool, if any.
    pub fn newest_block(&self) -> Option<u64> {
        let pools = self.pools.lock().expect("snapshot ring mutex poisoned");
        pools.back().map(|p| p.block)
    }

    fn new_pool_at_block(&self, block: u64) -> Result<Arc<BlockPool>> {
        let mut idle = Vec::with_capacity(self.config.transactions_per_block);
        for _ in 0..self.config.transactions_per_block {
            let conn = self.db.read_connection()?;
            conn.execute_batch("BEGIN")?;
            // The snapshot only binds to the WAL end mark once the
            // transaction reads; verify it landed on the block we committed.
            let pinned = Queries::new(&conn).get_last_block()?;
            if pinned != block {
                // Dropping `idle` (and `conn`) rolls the open transactions
                // back as the connections close.
                return Err(Error::SnapshotPin {
                    expected: block,
                    actual: pinned,
                });
            }
            idle.push(conn);
        }

        Ok(Arc::new(BlockPool {
            block,
            state: Mutex::new(PoolState {
                idle,
                closed: false,
            }),
            returned: Condvar::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::TransactionBehavior;

    fn small_config() -> PoolConfig {
        PoolConfig {
            ring_capacity: 2,
            transactions_per_block: 2,
        }
    }

    fn temp_pool() -> (tempfile::TempDir, Database, HistoricTransactionPool) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("pool.db")).unwrap();
        let pool = HistoricTransactionPool::new(db.clone(), small_config());
        (dir, db, pool)
    }

    /// Commits `block` through the pool the way the applier does.
    fn commit_block(db: &Database, pool: &HistoricTransactionPool, block: u64) {
        let mut conn = db.write_connection().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        Queries::new(&tx).set_last_block(block).unwrap();
        pool.commit_and_install(block, tx).unwrap();
    }

    #[test]
    fn acquire_returns_pinned_transaction() {
        let (_dir, db, pool) = temp_pool();
        commit_block(&db, &pool, 5);

        let token = CancellationToken::new();
        let handle = pool.acquire(5, &token).unwrap();
        assert_eq!(handle.block(), 5);
        let pinned = Queries::new(handle.connection().unwrap())
            .get_last_block()
            .unwrap();
        assert_eq!(pinned, 5);
    }

    #[test]
    fn future_and_retired_blocks_are_rejected() {
        let (_dir, db, pool) = temp_pool();
        let token = CancellationToken::new();

        // Empty ring: nothing is available.
        assert!(matches!(
            pool.acquire(1, &token),
            Err(Error::BlockRetired { .. })
        ));

        commit_block(&db, &pool, 1);
        commit_block(&db, &pool, 2);
        commit_block(&db, &pool, 3); // capacity 2: block 1 evicted

        assert!(matches!(
            pool.acquire(9, &token),
            Err(Error::FutureBlock { requested: 9, last: 3 })
        ));
        assert!(matches!(
            pool.acquire(1, &token),
            Err(Error::BlockRetired { requested: 1 })
        ));
        assert!(pool.acquire(2, &token).is_ok());
    }

    #[test]
    fn returned_handle_cannot_execute() {
        let (_dir, db, pool) = temp_pool();
        commit_block(&db, &pool, 1);

        let token = CancellationToken::new();
        let mut handle = pool.acquire(1, &token).unwrap();
        handle.close();
        assert!(matches!(handle.connection(), Err(Error::HandleReturned)));
    }

    #[test]
    fn acquire_blocks_until_a_handle_returns() {
        let (_dir, db, pool) = temp_pool();
        commit_block(&db, &pool, 1);
        let pool = Arc::new(pool);

        let token = CancellationToken::new();
        // Drain the pool (2 transactions per block in the test config).
        let h1 = pool.acquire(1, &token).unwrap();
        let h2 = pool.acquire(1, &token).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let token = token.clone();
            std::thread::spawn(move || pool.acquire(1, &token).map(|h| h.block()))
        };

        std::thread::sleep(Duration::from_millis(100));
        drop(h1);
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, 1);
        drop(h2);
    }

    #[test]
    fn cancellation_unblocks_acquire() {
        let (_dir, db, pool) = temp_pool();
        commit_block(&db, &pool, 1);
        let pool = Arc::new(pool);

        let token = CancellationToken::new();
        let _h1 = pool.acquire(1, &token).unwrap();
        let _h2 = pool.acquire(1, &token).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let token = token.clone();
            std::thread::spawn(move || pool.acquire(1, &token))
        };

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn snapshot_stays_at_its_block() {
        let (_dir, db, pool) = temp_pool();
        commit_block(&db, &pool, 1);

        let token = CancellationToken::new();
        let handle = pool.acquire(1, &token).unwrap();

        // Writer advances while the handle is out.
        commit_block(&db, &pool, 2);

        let pinned = Queries::new(handle.connection().unwrap())
            .get_last_block()
            .unwrap();
        assert_eq!(pinned, 1);
    }
}
