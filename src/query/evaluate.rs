//! # Query Evaluation
//!
//! Maps a normalized query onto roaring set algebra: every atom fetches the
//! bitmaps it needs from the persistence gateway and ORs them into one
//! bitmap, each conjunction ANDs its atoms, the top level ORs the
//! conjunctions.
//!
//! The only atom that can see [`Error::NotFound`] is a positive equality
//! (it asks for exactly one `(name, value)` row); that is mapped to the
//! empty bitmap, because "no entity holds this pair" is an answer, not a
//! failure. Every other fetcher returns a possibly-empty list of
//! `(value, bitmap)` pairs.
//!
//! `$all` / `*` evaluates to the universe: the OR of every
//! `$createdAtBlock` bitmap, since every live entity has exactly one
//! creation block.

use crate::codec::Bitmap;
use crate::error::{Error, Result};
use crate::query::language::{Atom, CompareOp, Value, Values};
use crate::query::normalize::{Conjunct, Dnf, NormalizedQuery};
use crate::store::{Queries, RangeOp};
use crate::types::CREATED_AT_BLOCK_ATTR;

impl NormalizedQuery {
    /// Evaluates the query against one snapshot, yielding the bitmap of
    /// matching internal ids.
    pub fn evaluate(&self, queries: &Queries<'_>) -> Result<Bitmap> {
        match self {
            NormalizedQuery::All => universe(queries),
            NormalizedQuery::Dnf(dnf) => evaluate_dnf(dnf, queries),
        }
    }
}

/// The set of all live entity ids.
pub fn universe(queries: &Queries<'_>) -> Result<Bitmap> {
    let pairs = queries.numeric_bitmaps_in_range(CREATED_AT_BLOCK_ATTR, RangeOp::Ge, 0)?;
    Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
}

fn evaluate_dnf(dnf: &Dnf, queries: &Queries<'_>) -> Result<Bitmap> {
    let mut result = Bitmap::new();
    for conjunct in &dnf.disjuncts {
        result.or(&evaluate_conjunct(conjunct, queries)?);
    }
    Ok(result)
}

fn evaluate_conjunct(conjunct: &Conjunct, queries: &Queries<'_>) -> Result<Bitmap> {
    let mut result: Option<Bitmap> = None;
    for atom in &conjunct.atoms {
        let bitmap = evaluate_atom(atom, queries)?;
        match &mut result {
            None => result = Some(bitmap),
            Some(acc) => {
                acc.and(&bitmap);
                // An empty intersection can only shrink further.
                if acc.is_empty() {
                    break;
                }
            }
        }
    }
    Ok(result.unwrap_or_default())
}

fn evaluate_atom(atom: &Atom, queries: &Queries<'_>) -> Result<Bitmap> {
    match atom {
        Atom::Equality {
            name,
            negated: false,
            value,
        } => {
            let fetched = match value {
                Value::String(s) => queries.get_string_bitmap(name, s),
                Value::Number(n) => queries.get_numeric_bitmap(name, *n),
            };
            match fetched {
                Ok(bitmap) => Ok(bitmap),
                Err(Error::NotFound) => Ok(Bitmap::new()),
                Err(e) => Err(e),
            }
        }
        Atom::Equality {
            name,
            negated: true,
            value,
        } => match value {
            Value::String(s) => {
                let pairs = queries.string_bitmaps_in_range(name, RangeOp::Ne, s)?;
                Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
            }
            Value::Number(n) => {
                let pairs = queries.numeric_bitmaps_in_range(name, RangeOp::Ne, *n)?;
                Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
            }
        },
        Atom::Compare { name, op, value } => {
            let range_op = match op {
                CompareOp::Lt => RangeOp::Lt,
                CompareOp::Le => RangeOp::Le,
                CompareOp::Gt => RangeOp::Gt,
                CompareOp::Ge => RangeOp::Ge,
            };
            match value {
                Value::String(s) => {
                    let pairs = queries.string_bitmaps_in_range(name, range_op, s)?;
                    Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
                }
                Value::Number(n) => {
                    let pairs = queries.numeric_bitmaps_in_range(name, range_op, *n)?;
                    Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
                }
            }
        }
        Atom::Inclusion {
            name,
            negated,
            values,
        } => match values {
            Values::Strings(items) => {
                let pairs = queries.string_bitmaps_in_set(name, items, *negated)?;
                Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
            }
            Values::Numbers(items) => {
                let pairs = queries.numeric_bitmaps_in_set(name, items, *negated)?;
                Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
            }
        },
        Atom::Glob {
            name,
            negated,
            pattern,
        } => {
            let pairs = queries.string_bitmaps_glob(name, pattern, *negated)?;
            Ok(or_all(pairs.into_iter().map(|(_, bm)| bm)))
        }
    }
}

fn or_all(bitmaps: impl Iterator<Item = Bitmap>) -> Bitmap {
    let mut result = Bitmap::new();
    for bitmap in bitmaps {
        result.or(&bitmap);
    }
    result
}
