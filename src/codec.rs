//! # Bitmap and Attribute Map Codecs
//!
//! Two families of blobs are persisted alongside payload rows:
//!
//! - **Per-value bitmaps**: 64-bit roaring bitmaps of internal entity ids,
//!   stored in the portable roaring serialization.
//! - **Attribute maps**: small `name -> string` and `name -> u64` maps,
//!   stored as one JSON blob per map. `BTreeMap` keeps key order stable, so
//!   equal maps always encode to byte-identical blobs.
//!
//! Decoding treats an empty or absent blob as the empty value; anything else
//! that fails to decode is a [`Error::Codec`] - a corrupt row, not a normal
//! condition.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Bitmap
// =============================================================================

/// A 64-bit roaring bitmap of internal entity ids.
///
/// Wraps [`RoaringTreemap`] with the binary codec used at rest and the small
/// operation surface the index layer needs. The empty-blob convention
/// matches the store: a bitmap column is never NULL, but decoding an empty
/// blob still yields an empty bitmap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitmap(RoaringTreemap);

impl Bitmap {
    pub fn new() -> Self {
        Self(RoaringTreemap::new())
    }

    pub fn add(&mut self, id: u64) {
        self.0.insert(id);
    }

    pub fn remove(&mut self, id: u64) {
        self.0.remove(id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    /// Bitwise OR with another bitmap.
    pub fn or(&mut self, other: &Bitmap) {
        self.0 |= &other.0;
    }

    /// Bitwise AND with another bitmap.
    pub fn and(&mut self, other: &Bitmap) {
        self.0 &= &other.0;
    }

    /// Drops every id at or above `from`. Used to apply the paging cursor
    /// mask `[0, cursor)`.
    pub fn remove_from(&mut self, from: u64) {
        self.0.remove_range(from..);
    }

    /// Compaction hint invoked before persisting.
    pub fn run_optimize(&mut self) {
        self.0.optimize();
    }

    /// Ascending iterator over ids; reversible for descending paging.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = u64> + '_ {
        self.0.iter()
    }

    /// Binary encoding in the portable roaring format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.0.serialized_size());
        self.0
            .serialize_into(&mut buf)
            .map_err(|e| Error::Codec(format!("failed to serialize bitmap: {e}")))?;
        Ok(buf)
    }

    /// Decodes a persisted bitmap. An empty blob yields an empty bitmap.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let inner = RoaringTreemap::deserialize_from(bytes)
            .map_err(|e| Error::Codec(format!("failed to deserialize bitmap: {e}")))?;
        Ok(Self(inner))
    }
}

impl FromIterator<u64> for Bitmap {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(RoaringTreemap::from_iter(iter))
    }
}

// =============================================================================
// Attribute maps
// =============================================================================

/// `name -> string value` attributes of one payload, synthetic entries
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringAttributes(pub BTreeMap<String, String>);

impl StringAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes to the persisted blob. The empty map encodes to `{}`, never
    /// to an empty or NULL blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0)
            .map_err(|e| Error::Codec(format!("failed to encode string attributes: {e}")))
    }

    /// Decodes a persisted blob; NULL decodes to the empty map.
    pub fn from_bytes(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            None => Ok(Self::default()),
            Some(data) => serde_json::from_slice(data)
                .map(Self)
                .map_err(|e| Error::Codec(format!("failed to decode string attributes: {e}"))),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }
}

impl Deref for StringAttributes {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for StringAttributes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, String)> for StringAttributes {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(BTreeMap::from_iter(iter))
    }
}

/// `name -> u64 value` attributes of one payload, synthetic entries
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NumericAttributes(pub BTreeMap<String, u64>);

impl NumericAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes to the persisted blob. The empty map encodes to `{}`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0)
            .map_err(|e| Error::Codec(format!("failed to encode numeric attributes: {e}")))
    }

    /// Decodes a persisted blob; NULL decodes to the empty map.
    pub fn from_bytes(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            None => Ok(Self::default()),
            Some(data) => serde_json::from_slice(data)
                .map(Self)
                .map_err(|e| Error::Codec(format!("failed to decode numeric attributes: {e}"))),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: u64) {
        self.0.insert(name.into(), value);
    }
}

impl Deref for NumericAttributes {
    type Target = BTreeMap<String, u64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for NumericAttributes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, u64)> for NumericAttributes {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(BTreeMap::from_iter(iter))
    }
}
