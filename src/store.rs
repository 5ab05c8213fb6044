//! # Persistence Gateway
//!
//! [`Queries`] is the narrow, typed surface over the backing SQLite store:
//! last-block bookkeeping, payload CRUD, per-value bitmap CRUD, and the
//! range/inclusion/glob bitmap fetchers the query engine evaluates against.
//!
//! Every method runs against a borrowed connection, so the same code works
//! inside the applier's write transaction, a live read transaction, or a
//! pinned historic transaction.
//!
//! Absence is a first-class outcome here: methods that can legitimately
//! find nothing return [`Error::NotFound`] rather than a generic storage
//! error, so callers can distinguish "empty" from "missing".
//!
//! Numeric attribute values are `u64` in the domain and `INTEGER` (i64) at
//! rest; the cast is lossless and order-preserving for values below 2^63,
//! which covers every synthetic attribute.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};

use crate::codec::{Bitmap, NumericAttributes, StringAttributes};
use crate::error::{not_found_on_no_rows, Error, Result};
use crate::types::EntityKey;

/// Comparison operators accepted by the bitmap range fetchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Lt,
    Le,
    Gt,
    Ge,
    /// `<>`: every value for the name except the given one.
    Ne,
}

impl RangeOp {
    fn sql(self) -> &'static str {
        match self {
            RangeOp::Lt => "<",
            RangeOp::Le => "<=",
            RangeOp::Gt => ">",
            RangeOp::Ge => ">=",
            RangeOp::Ne => "<>",
        }
    }
}

/// A materialized payload row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRow {
    /// The internal id; the value indexed by every bitmap.
    pub id: u64,
    pub entity_key: EntityKey,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub string_attributes: StringAttributes,
    pub numeric_attributes: NumericAttributes,
}

/// Parameters for [`Queries::upsert_payload`].
#[derive(Debug)]
pub struct UpsertPayload<'a> {
    pub entity_key: EntityKey,
    pub payload: &'a [u8],
    pub content_type: &'a str,
    pub string_attributes: &'a StringAttributes,
    pub numeric_attributes: &'a NumericAttributes,
}

/// The typed query surface over one connection (or open transaction).
pub struct Queries<'c> {
    conn: &'c Connection,
}

impl<'c> Queries<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // =========================================================================
    // Last block
    // =========================================================================

    /// The greatest committed block number, or 0 if nothing has been
    /// applied yet.
    pub fn get_last_block(&self) -> Result<u64> {
        let block = self
            .conn
            .query_row("SELECT block FROM last_block WHERE id = 0", [], |row| {
                row.get::<_, i64>(0)
            });
        match block {
            Ok(block) => Ok(block as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::Storage(e)),
        }
    }

    /// Idempotent upsert of the last-block marker.
    pub fn set_last_block(&self, block: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO last_block (id, block) VALUES (0, ?1)
             ON CONFLICT (id) DO UPDATE SET block = excluded.block",
            params![block as i64],
        )?;
        Ok(())
    }

    // =========================================================================
    // Payloads
    // =========================================================================

    /// Creates or replaces the payload row for the entity key and returns
    /// its internal id. The id is stable across upserts to the same key.
    pub fn upsert_payload(&self, p: &UpsertPayload<'_>) -> Result<u64> {
        let string_blob = p.string_attributes.to_bytes()?;
        let numeric_blob = p.numeric_attributes.to_bytes()?;
        let id: i64 = self.conn.query_row(
            "INSERT INTO payloads
                 (entity_key, payload, content_type, string_attributes, numeric_attributes)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (entity_key) DO UPDATE SET
                 payload = excluded.payload,
                 content_type = excluded.content_type,
                 string_attributes = excluded.string_attributes,
                 numeric_attributes = excluded.numeric_attributes
             RETURNING id",
            params![
                p.entity_key.as_bytes().as_slice(),
                p.payload,
                p.content_type,
                string_blob,
                numeric_blob,
            ],
            |row| row.get(0),
        )?;
        Ok(id as u64)
    }

    /// Fetches the live payload for an entity key, or [`Error::NotFound`].
    pub fn get_payload(&self, key: &EntityKey) -> Result<PayloadRow> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, entity_key, payload, content_type, string_attributes, numeric_attributes
                 FROM payloads WHERE entity_key = ?1",
                params![key.as_bytes().as_slice()],
                raw_payload_row,
            )
            .map_err(not_found_on_no_rows)?;
        decode_payload_row(raw)
    }

    /// Removes the payload row. The internal id may be reclaimed afterwards.
    pub fn delete_payload(&self, key: &EntityKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM payloads WHERE entity_key = ?1",
            params![key.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Bulk-materializes payload rows by internal id, in the order the ids
    /// were given. Ids with no row (deleted concurrently) are skipped.
    pub fn retrieve_payloads(&self, ids: &[u64]) -> Result<Vec<PayloadRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, entity_key, payload, content_type, string_attributes, numeric_attributes
             FROM payloads WHERE id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(ids.iter().map(|&id| id as i64)),
            raw_payload_row,
        )?;

        let mut by_id = std::collections::HashMap::with_capacity(ids.len());
        for raw in rows {
            let row = decode_payload_row(raw?)?;
            by_id.insert(row.id, row);
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    // =========================================================================
    // Per-value bitmap CRUD
    // =========================================================================

    /// The bitmap for one (string attribute, value) pair, or
    /// [`Error::NotFound`].
    pub fn get_string_bitmap(&self, name: &str, value: &str) -> Result<Bitmap> {
        let blob: Vec<u8> = self
            .conn
            .query_row(
                "SELECT bitmap FROM string_attribute_bitmaps WHERE name = ?1 AND value = ?2",
                params![name, value],
                |row| row.get(0),
            )
            .map_err(not_found_on_no_rows)?;
        Bitmap::from_bytes(&blob)
    }

    pub fn upsert_string_bitmap(&self, name: &str, value: &str, bitmap: &Bitmap) -> Result<()> {
        let blob = bitmap.to_bytes()?;
        self.conn.execute(
            "INSERT INTO string_attribute_bitmaps (name, value, bitmap) VALUES (?1, ?2, ?3)
             ON CONFLICT (name, value) DO UPDATE SET bitmap = excluded.bitmap",
            params![name, value, blob],
        )?;
        Ok(())
    }

    pub fn delete_string_bitmap(&self, name: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM string_attribute_bitmaps WHERE name = ?1 AND value = ?2",
            params![name, value],
        )?;
        Ok(())
    }

    /// The bitmap for one (numeric attribute, value) pair, or
    /// [`Error::NotFound`].
    pub fn get_numeric_bitmap(&self, name: &str, value: u64) -> Result<Bitmap> {
        let blob: Vec<u8> = self
            .conn
            .query_row(
                "SELECT bitmap FROM numeric_attribute_bitmaps WHERE name = ?1 AND value = ?2",
                params![name, value as i64],
                |row| row.get(0),
            )
            .map_err(not_found_on_no_rows)?;
        Bitmap::from_bytes(&blob)
    }

    pub fn upsert_numeric_bitmap(&self, name: &str, value: u64, bitmap: &Bitmap) -> Result<()> {
        let blob = bitmap.to_bytes()?;
        self.conn.execute(
            "INSERT INTO numeric_attribute_bitmaps (name, value, bitmap) VALUES (?1, ?2, ?3)
             ON CONFLICT (name, value) DO UPDATE SET bitmap = excluded.bitmap",
            params![name, value as i64, blob],
        )?;
        Ok(())
    }

    pub fn delete_numeric_bitmap(&self, name: &str, value: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM numeric_attribute_bitmaps WHERE name = ?1 AND value = ?2",
            params![name, value as i64],
        )?;
        Ok(())
    }

    // =========================================================================
    // Bitmap fetchers for query evaluation
    // =========================================================================
    // All fetchers return every matching (value, bitmap) pair for a name;
    // the evaluator ORs them. An empty result list is normal, not NotFound.

    /// All string bitmaps for `name` whose value compares `op` against
    /// `value`.
    pub fn string_bitmaps_in_range(
        &self,
        name: &str,
        op: RangeOp,
        value: &str,
    ) -> Result<Vec<(String, Bitmap)>> {
        let sql = format!(
            "SELECT value, bitmap FROM string_attribute_bitmaps
             WHERE name = ? AND value {} ? ORDER BY value",
            op.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![name, value], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        collect_string_bitmaps(rows)
    }

    /// All numeric bitmaps for `name` whose value compares `op` against
    /// `value`.
    pub fn numeric_bitmaps_in_range(
        &self,
        name: &str,
        op: RangeOp,
        value: u64,
    ) -> Result<Vec<(u64, Bitmap)>> {
        let sql = format!(
            "SELECT value, bitmap FROM numeric_attribute_bitmaps
             WHERE name = ? AND value {} ? ORDER BY value",
            op.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![name, value as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        collect_numeric_bitmaps(rows)
    }

    /// All string bitmaps for `name` whose value is in (or, negated, not in)
    /// the given set.
    pub fn string_bitmaps_in_set(
        &self,
        name: &str,
        values: &[String],
        negated: bool,
    ) -> Result<Vec<(String, Bitmap)>> {
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "SELECT value, bitmap FROM string_attribute_bitmaps
             WHERE name = ? AND value {} ({placeholders}) ORDER BY value",
            if negated { "NOT IN" } else { "IN" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut sql_params: Vec<SqlValue> = Vec::with_capacity(values.len() + 1);
        sql_params.push(SqlValue::from(name.to_string()));
        sql_params.extend(values.iter().map(|v| SqlValue::from(v.clone())));
        let rows = stmt.query_map(params_from_iter(sql_params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        collect_string_bitmaps(rows)
    }

    /// All numeric bitmaps for `name` whose value is in (or not in) the set.
    pub fn numeric_bitmaps_in_set(
        &self,
        name: &str,
        values: &[u64],
        negated: bool,
    ) -> Result<Vec<(u64, Bitmap)>> {
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "SELECT value, bitmap FROM numeric_attribute_bitmaps
             WHERE name = ? AND value {} ({placeholders}) ORDER BY value",
            if negated { "NOT IN" } else { "IN" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut sql_params: Vec<SqlValue> = Vec::with_capacity(values.len() + 1);
        sql_params.push(SqlValue::from(name.to_string()));
        sql_params.extend(values.iter().map(|&v| SqlValue::from(v as i64)));
        let rows = stmt.query_map(params_from_iter(sql_params), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        collect_numeric_bitmaps(rows)
    }

    /// All string bitmaps for `name` whose value matches (or, negated, does
    /// not match) the glob pattern. SQLite's GLOB is case-sensitive.
    pub fn string_bitmaps_glob(
        &self,
        name: &str,
        pattern: &str,
        negated: bool,
    ) -> Result<Vec<(String, Bitmap)>> {
        let sql = format!(
            "SELECT value, bitmap FROM string_attribute_bitmaps
             WHERE name = ? AND value {} ? ORDER BY value",
            if negated { "NOT GLOB" } else { "GLOB" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![name, pattern], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        collect_string_bitmaps(rows)
    }
}

// =============================================================================
// Row decoding
// =============================================================================
// Blob decoding is kept out of the rusqlite row closures so codec failures
// surface as Error::Codec instead of being squeezed through rusqlite's
// error type.

type RawPayloadRow = (i64, Vec<u8>, Vec<u8>, String, Vec<u8>, Vec<u8>);

fn raw_payload_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPayloadRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_payload_row(raw: RawPayloadRow) -> Result<PayloadRow> {
    let (id, entity_key, payload, content_type, string_blob, numeric_blob) = raw;
    Ok(PayloadRow {
        id: id as u64,
        entity_key: EntityKey::from_slice(&entity_key)?,
        payload,
        content_type,
        string_attributes: StringAttributes::from_bytes(Some(&string_blob))?,
        numeric_attributes: NumericAttributes::from_bytes(Some(&numeric_blob))?,
    })
}

fn collect_string_bitmaps(
    rows: impl Iterator<Item = rusqlite::Result<(String, Vec<u8>)>>,
) -> Result<Vec<(String, Bitmap)>> {
    let mut out = Vec::new();
    for row in rows {
        let (value, blob) = row?;
        out.push((value, Bitmap::from_bytes(&blob)?));
    }
    Ok(out)
}

fn collect_numeric_bitmaps(
    rows: impl Iterator<Item = rusqlite::Result<(i64, Vec<u8>)>>,
) -> Result<Vec<(u64, Bitmap)>> {
    let mut out = Vec::new();
    for row in rows {
        let (value, blob) = row?;
        out.push((value as u64, Bitmap::from_bytes(&blob)?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn temp_store() -> (tempfile::TempDir, rusqlite::Connection) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("store.db")).unwrap();
        let conn = db.write_connection().unwrap();
        (dir, conn)
    }

    fn sample_upsert<'a>(
        key: &'a EntityKey,
        strings: &'a StringAttributes,
        numerics: &'a NumericAttributes,
    ) -> UpsertPayload<'a> {
        UpsertPayload {
            entity_key: *key,
            payload: b"content",
            content_type: "application/json",
            string_attributes: strings,
            numeric_attributes: numerics,
        }
    }

    #[test]
    fn last_block_defaults_to_zero() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);
        assert_eq!(queries.get_last_block().unwrap(), 0);

        queries.set_last_block(42).unwrap();
        assert_eq!(queries.get_last_block().unwrap(), 42);

        // Idempotent upsert.
        queries.set_last_block(42).unwrap();
        queries.set_last_block(43).unwrap();
        assert_eq!(queries.get_last_block().unwrap(), 43);
    }

    #[test]
    fn upsert_payload_keeps_id_stable() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);
        let key = EntityKey::new([0x11; 32]);
        let strings = StringAttributes::new();
        let numerics = NumericAttributes::new();

        let id1 = queries.upsert_payload(&sample_upsert(&key, &strings, &numerics)).unwrap();
        let id2 = queries.upsert_payload(&sample_upsert(&key, &strings, &numerics)).unwrap();
        assert_eq!(id1, id2);

        let other = EntityKey::new([0x22; 32]);
        let id3 = queries.upsert_payload(&sample_upsert(&other, &strings, &numerics)).unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn get_payload_round_trip_and_not_found() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);
        let key = EntityKey::new([0x33; 32]);
        let mut strings = StringAttributes::new();
        strings.insert("type", "document");
        let mut numerics = NumericAttributes::new();
        numerics.insert("version", 7);

        let id = queries.upsert_payload(&sample_upsert(&key, &strings, &numerics)).unwrap();
        let row = queries.get_payload(&key).unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.entity_key, key);
        assert_eq!(row.payload, b"content");
        assert_eq!(row.string_attributes, strings);
        assert_eq!(row.numeric_attributes, numerics);

        queries.delete_payload(&key).unwrap();
        assert!(matches!(queries.get_payload(&key), Err(Error::NotFound)));
    }

    #[test]
    fn retrieve_payloads_preserves_requested_order() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);
        let strings = StringAttributes::new();
        let numerics = NumericAttributes::new();

        let mut ids = Vec::new();
        for i in 0..4u8 {
            let key = EntityKey::new([i; 32]);
            ids.push(queries.upsert_payload(&sample_upsert(&key, &strings, &numerics)).unwrap());
        }

        let want = vec![ids[2], ids[0], ids[3]];
        let rows = queries.retrieve_payloads(&want).unwrap();
        let got: Vec<u64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn bitmap_crud_and_not_found() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);

        assert!(matches!(
            queries.get_string_bitmap("type", "document"),
            Err(Error::NotFound)
        ));

        let mut bm = Bitmap::new();
        bm.add(1);
        bm.add(9);
        queries.upsert_string_bitmap("type", "document", &bm).unwrap();
        let loaded = queries.get_string_bitmap("type", "document").unwrap();
        assert_eq!(loaded, bm);

        queries.delete_string_bitmap("type", "document").unwrap();
        assert!(matches!(
            queries.get_string_bitmap("type", "document"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn numeric_range_fetchers() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);

        for value in [10u64, 20, 30] {
            let mut bm = Bitmap::new();
            bm.add(value);
            queries.upsert_numeric_bitmap("version", value, &bm).unwrap();
        }

        let lt: Vec<u64> = queries
            .numeric_bitmaps_in_range("version", RangeOp::Lt, 30)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(lt, vec![10, 20]);

        let ge: Vec<u64> = queries
            .numeric_bitmaps_in_range("version", RangeOp::Ge, 20)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(ge, vec![20, 30]);

        let ne: Vec<u64> = queries
            .numeric_bitmaps_in_range("version", RangeOp::Ne, 20)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(ne, vec![10, 30]);

        // Unknown name matches nothing, which is not an error.
        assert!(queries
            .numeric_bitmaps_in_range("missing", RangeOp::Ge, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn inclusion_and_glob_fetchers() {
        let (_dir, conn) = temp_store();
        let queries = Queries::new(&conn);

        for (value, id) in [("reports", 1u64), ("images", 2), ("audio", 3)] {
            let mut bm = Bitmap::new();
            bm.add(id);
            queries.upsert_string_bitmap("category", value, &bm).unwrap();
        }

        let in_set: Vec<String> = queries
            .string_bitmaps_in_set(
                "category",
                &["reports".to_string(), "audio".to_string()],
                false,
            )
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(in_set, vec!["audio", "reports"]);

        let not_in: Vec<String> = queries
            .string_bitmaps_in_set("category", &["reports".to_string()], true)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(not_in, vec!["audio", "images"]);

        let glob: Vec<String> = queries
            .string_bitmaps_glob("category", "*s", false)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(glob, vec!["images", "reports"]);

        let not_glob: Vec<String> = queries
            .string_bitmaps_glob("category", "*s", true)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(not_glob, vec!["audio"]);
    }
}
