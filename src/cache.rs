//! # Bitmap Write-Through Cache
//!
//! Every block touches the same few (attribute, value) bitmaps many times -
//! each `Create` in block N lands in `$createdAtBlock = N`, for example.
//! Reading and rewriting the blob once per operation would turn O(distinct
//! pairs) of real work into O(operations) of storage traffic.
//!
//! [`BitmapCache`] collapses that: the first touch of a pair loads the
//! bitmap (an absent row loads as empty), every further add/remove mutates
//! it in memory, and [`BitmapCache::flush`] writes each pair back exactly
//! once. A bitmap that ends up empty is deleted instead of upserted, which
//! is what keeps the "no empty bitmap at rest" invariant.
//!
//! The cache lives strictly inside one write transaction: it borrows the
//! transaction's [`Queries`], is flushed right before the last-block upsert,
//! and is dropped with the transaction on rollback. It never straddles
//! transactions and is never shared.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::codec::Bitmap;
use crate::error::{Error, Result};
use crate::store::Queries;

/// In-transaction memoization of (attribute name, value) -> bitmap.
pub struct BitmapCache<'q, 'c> {
    queries: &'q Queries<'c>,
    string_bitmaps: HashMap<(String, String), Bitmap>,
    numeric_bitmaps: HashMap<(String, u64), Bitmap>,
}

impl<'q, 'c> BitmapCache<'q, 'c> {
    pub fn new(queries: &'q Queries<'c>) -> Self {
        Self {
            queries,
            string_bitmaps: HashMap::new(),
            numeric_bitmaps: HashMap::new(),
        }
    }

    /// Adds `id` to the bitmap for a string attribute pair.
    pub fn add_string(&mut self, name: &str, value: &str, id: u64) -> Result<()> {
        self.string_entry(name, value)?.add(id);
        Ok(())
    }

    /// Removes `id` from the bitmap for a string attribute pair.
    pub fn remove_string(&mut self, name: &str, value: &str, id: u64) -> Result<()> {
        self.string_entry(name, value)?.remove(id);
        Ok(())
    }

    /// Adds `id` to the bitmap for a numeric attribute pair.
    pub fn add_numeric(&mut self, name: &str, value: u64, id: u64) -> Result<()> {
        self.numeric_entry(name, value)?.add(id);
        Ok(())
    }

    /// Removes `id` from the bitmap for a numeric attribute pair.
    pub fn remove_numeric(&mut self, name: &str, value: u64, id: u64) -> Result<()> {
        self.numeric_entry(name, value)?.remove(id);
        Ok(())
    }

    fn string_entry(&mut self, name: &str, value: &str) -> Result<&mut Bitmap> {
        match self.string_bitmaps.entry((name.to_owned(), value.to_owned())) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let bitmap = match self.queries.get_string_bitmap(name, value) {
                    Ok(bitmap) => bitmap,
                    Err(Error::NotFound) => Bitmap::new(),
                    Err(e) => return Err(e),
                };
                Ok(slot.insert(bitmap))
            }
        }
    }

    fn numeric_entry(&mut self, name: &str, value: u64) -> Result<&mut Bitmap> {
        match self.numeric_bitmaps.entry((name.to_owned(), value)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let bitmap = match self.queries.get_numeric_bitmap(name, value) {
                    Ok(bitmap) => bitmap,
                    Err(Error::NotFound) => Bitmap::new(),
                    Err(e) => return Err(e),
                };
                Ok(slot.insert(bitmap))
            }
        }
    }

    /// Writes every cached bitmap through: empty bitmaps are deleted,
    /// non-empty ones are compacted and upserted. Consumes the cache - it
    /// must not outlive its transaction.
    pub fn flush(self) -> Result<()> {
        for ((name, value), mut bitmap) in self.string_bitmaps {
            if bitmap.is_empty() {
                self.queries.delete_string_bitmap(&name, &value)?;
            } else {
                bitmap.run_optimize();
                self.queries.upsert_string_bitmap(&name, &value, &bitmap)?;
            }
        }
        for ((name, value), mut bitmap) in self.numeric_bitmaps {
            if bitmap.is_empty() {
                self.queries.delete_numeric_bitmap(&name, value)?;
            } else {
                bitmap.run_optimize();
                self.queries.upsert_numeric_bitmap(&name, value, &bitmap)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn temp_conn() -> (tempfile::TempDir, rusqlite::Connection) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("cache.db")).unwrap();
        let conn = db.write_connection().unwrap();
        (dir, conn)
    }

    #[test]
    fn mutations_are_invisible_until_flush() {
        let (_dir, conn) = temp_conn();
        let queries = Queries::new(&conn);

        let mut cache = BitmapCache::new(&queries);
        cache.add_string("type", "document", 1).unwrap();
        cache.add_string("type", "document", 2).unwrap();

        assert!(matches!(
            queries.get_string_bitmap("type", "document"),
            Err(Error::NotFound)
        ));

        cache.flush().unwrap();
        let bm = queries.get_string_bitmap("type", "document").unwrap();
        assert!(bm.contains(1));
        assert!(bm.contains(2));
        assert_eq!(bm.len(), 2);
    }

    #[test]
    fn miss_loads_existing_bitmap() {
        let (_dir, conn) = temp_conn();
        let queries = Queries::new(&conn);

        let mut seeded = Bitmap::new();
        seeded.add(7);
        queries.upsert_numeric_bitmap("version", 1, &seeded).unwrap();

        let mut cache = BitmapCache::new(&queries);
        cache.add_numeric("version", 1, 8).unwrap();
        cache.flush().unwrap();

        let bm = queries.get_numeric_bitmap("version", 1).unwrap();
        assert!(bm.contains(7));
        assert!(bm.contains(8));
    }

    #[test]
    fn empty_bitmap_is_deleted_on_flush() {
        let (_dir, conn) = temp_conn();
        let queries = Queries::new(&conn);

        let mut seeded = Bitmap::new();
        seeded.add(5);
        queries.upsert_string_bitmap("status", "draft", &seeded).unwrap();

        let mut cache = BitmapCache::new(&queries);
        cache.remove_string("status", "draft", 5).unwrap();
        cache.flush().unwrap();

        assert!(matches!(
            queries.get_string_bitmap("status", "draft"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn add_then_remove_nets_to_no_row() {
        let (_dir, conn) = temp_conn();
        let queries = Queries::new(&conn);

        let mut cache = BitmapCache::new(&queries);
        cache.add_numeric("$expiration", 1100, 3).unwrap();
        cache.remove_numeric("$expiration", 1100, 3).unwrap();
        cache.flush().unwrap();

        assert!(matches!(
            queries.get_numeric_bitmap("$expiration", 1100),
            Err(Error::NotFound)
        ));
    }
}
