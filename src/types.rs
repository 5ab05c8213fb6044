//! # Domain Types
//!
//! Core types for the entity operation stream: entity keys, owner addresses,
//! the tagged operation variants, blocks, and batches. Identifiers use the
//! newtype pattern so a 32-byte entity key can never be confused with a
//! 20-byte owner address.
//!
//! ## Identifiers
//!
//! - [`EntityKey`]: the external 32-byte identifier of an entity. At most
//!   one live payload exists per key.
//! - [`Address`]: a 20-byte owner address.
//!
//! Both render as lowercase `0x`-prefixed hex, which is also the form stored
//! in the `$key` / `$owner` / `$creator` synthetic attributes - writing and
//! querying agree on casing by construction.
//!
//! ## Ordering within a block
//!
//! Every operation carries `(tx_index, op_index)`. Together with the block
//! number they form the synthetic `$sequence` key
//! `(block << 32) | (tx << 16) | op`, which totally orders operations across
//! the whole stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{NumericAttributes, StringAttributes};
use crate::error::{Error, Result};

// =============================================================================
// Synthetic attribute names
// =============================================================================

/// `$owner`: current owner address, lowercase hex. String attribute.
pub const OWNER_ATTR: &str = "$owner";
/// `$creator`: owner at creation time, lowercase hex. Never changes.
pub const CREATOR_ATTR: &str = "$creator";
/// `$key`: the entity key, lowercase hex. String attribute.
pub const KEY_ATTR: &str = "$key";
/// `$expiration`: block number at which the payload expires. Numeric.
pub const EXPIRATION_ATTR: &str = "$expiration";
/// `$createdAtBlock`: block of the creating operation. Numeric.
pub const CREATED_AT_BLOCK_ATTR: &str = "$createdAtBlock";
/// `$lastModifiedAtBlock`: block of the latest create or update. Numeric.
pub const LAST_MODIFIED_AT_BLOCK_ATTR: &str = "$lastModifiedAtBlock";
/// `$txIndex`: transaction index of the creating operation. Numeric.
pub const TX_INDEX_ATTR: &str = "$txIndex";
/// `$opIndex`: operation index of the creating operation. Numeric.
pub const OP_INDEX_ATTR: &str = "$opIndex";
/// `$sequence`: `(block << 32) | (tx << 16) | op` of the creating operation.
pub const SEQUENCE_ATTR: &str = "$sequence";

/// Returns true for `$`-prefixed attribute names, which are computed by the
/// applier rather than supplied by users.
pub fn is_synthetic(name: &str) -> bool {
    name.starts_with('$')
}

/// The identity attributes: stored and queried lowercase on both sides.
pub fn is_identity_attribute(name: &str) -> bool {
    matches!(name, OWNER_ATTR | CREATOR_ATTR | KEY_ATTR)
}

/// Packs a block number and in-block indexes into the `$sequence` key.
pub fn sequence_key(block: u64, tx_index: u16, op_index: u16) -> u64 {
    (block << 32) | ((tx_index as u64) << 16) | (op_index as u64)
}

// =============================================================================
// Hex helpers
// =============================================================================

/// Encodes bytes as lowercase hex with a `0x` prefix.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((b & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

fn from_hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| Error::Parse(format!("hex literal must start with 0x: {s:?}")))?;
    if digits.len() != N * 2 {
        return Err(Error::Parse(format!(
            "hex literal must be {} digits, got {}",
            N * 2,
            digits.len()
        )));
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        let pair = &digits[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| Error::Parse(format!("invalid hex digits: {pair:?}")))?;
    }
    Ok(out)
}

// =============================================================================
// Entity keys and addresses
// =============================================================================

/// The external 32-byte identifier of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey([u8; 32]);

impl EntityKey {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a raw byte slice, failing unless it is exactly
    /// 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("entity key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex, the form stored in `$key`.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for EntityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(from_hex_array::<32>(s)?))
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 20-byte owner address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex, the form stored in `$owner`/`$creator`.
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(from_hex_array::<20>(s)?))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// The full payload carried by `Create` and `Update` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInit {
    pub key: EntityKey,
    pub owner: Address,
    /// Block-to-live: the payload expires at `block.number + btl`.
    pub btl: u64,
    pub content: Vec<u8>,
    pub content_type: String,
    /// User-supplied string attributes. Synthetic (`$`) entries are injected
    /// by the applier, never by the source.
    pub string_attributes: StringAttributes,
    /// User-supplied numeric attributes.
    pub numeric_attributes: NumericAttributes,
}

/// The closed set of operation kinds. The applier matches exhaustively;
/// there is no unknown-operation fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Create(PayloadInit),
    Update(PayloadInit),
    /// Removes the payload and all its index entries.
    Delete { key: EntityKey },
    /// Identical to `Delete` for indexing purposes; the distinction is kept
    /// for observability only.
    Expire { key: EntityKey },
    /// Moves `$expiration` to `block.number + btl`. Touches no other index.
    ExtendBtl { key: EntityKey, btl: u64 },
    /// Replaces `$owner` (but not `$creator`). Touches no other index.
    ChangeOwner { key: EntityKey, owner: Address },
}

/// One operation within a block, with its stable in-block position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub tx_index: u16,
    pub op_index: u16,
    pub kind: OperationKind,
}

impl Operation {
    /// The `$sequence` value of this operation within the given block.
    pub fn sequence(&self, block: u64) -> u64 {
        sequence_key(block, self.tx_index, self.op_index)
    }
}

/// A block of operations. Block numbers are strictly increasing across
/// committed blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub operations: Vec<Operation>,
}

/// A batch of consecutive blocks, applied in a single write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBatch {
    pub blocks: Vec<Block>,
}

/// An error surfaced by the upstream event source.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One element of the event sequence consumed by the applier: either a batch
/// or an upstream failure that terminates the stream.
pub type BatchOrError = std::result::Result<BlockBatch, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_key_packs_fields() {
        assert_eq!(sequence_key(0, 0, 0), 0);
        assert_eq!(sequence_key(1, 0, 0), 1 << 32);
        assert_eq!(sequence_key(100, 2, 3), (100 << 32) | (2 << 16) | 3);
    }

    #[test]
    fn entity_key_hex_round_trip() {
        let key = EntityKey::new([0x11; 32]);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 2 + 64);
        assert!(hex.starts_with("0x1111"));
        assert_eq!(hex.parse::<EntityKey>().unwrap(), key);
    }

    #[test]
    fn entity_key_parses_uppercase_to_same_key() {
        let lower: EntityKey = format!("0x{}", "ab".repeat(32)).parse().unwrap();
        let upper: EntityKey = format!("0x{}", "AB".repeat(32)).parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.to_hex(), format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn entity_key_rejects_bad_input() {
        assert!("1111".parse::<EntityKey>().is_err());
        assert!("0x1111".parse::<EntityKey>().is_err());
        assert!(format!("0x{}", "zz".repeat(32)).parse::<EntityKey>().is_err());
    }

    #[test]
    fn address_hex_round_trip() {
        let addr = Address::new([0xab; 20]);
        assert_eq!(addr.to_hex(), format!("0x{}", "ab".repeat(20)));
        assert_eq!(addr.to_hex().parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn identity_attributes() {
        assert!(is_identity_attribute("$owner"));
        assert!(is_identity_attribute("$creator"));
        assert!(is_identity_attribute("$key"));
        assert!(!is_identity_attribute("$expiration"));
        assert!(!is_identity_attribute("owner"));
    }

    #[test]
    fn synthetic_prefix() {
        assert!(is_synthetic("$sequence"));
        assert!(!is_synthetic("type"));
    }
}
