//! # DNF Normalization
//!
//! Transforms the surface tree into disjunctive normal form: an OR of ANDs
//! of plain atoms, with no parentheses left and no negation anywhere but
//! inside an atom's own operator.
//!
//! Three rewrites compose, all as owned-subtree transforms over the strictly
//! tree-shaped input:
//!
//! 1. **De Morgan pushdown.** A negated parenthesis flips the whole subtree
//!    under it: `NOT (A || B)` becomes `(NOT A) && (NOT B)` and vice versa.
//!    Leaves invert their operator: `=` <-> `!=`, `<` <-> `>=`, `<=` <-> `>`,
//!    `IN` <-> `NOT IN`, `GLOB` <-> `NOT GLOB`. The pushdown runs on the way
//!    *down* the tree, so distribution below only ever sees negation-free
//!    structure.
//! 2. **Distribution.** A conjunction over disjunctions expands by cross
//!    product: `(A || B) && (C || D)` becomes
//!    `A&&C || A&&D || B&&C || B&&D`.
//! 3. **Identity case folding.** String values compared against `$owner`,
//!    `$creator`, or `$key` are lowercased, mirroring the applier's
//!    insertion-side lowercasing. Glob patterns are left as written.
//!
//! Folding is also where the cheap type checks live: identity attributes
//! take string values, the numeric synthetics take numbers.

use crate::error::{Error, Result};
use crate::query::language::{Atom, CompareOp, Expression, Term, TopLevel, Value, Values};
use crate::types::{
    is_identity_attribute, CREATED_AT_BLOCK_ATTR, EXPIRATION_ATTR, LAST_MODIFIED_AT_BLOCK_ATTR,
    OP_INDEX_ATTR, SEQUENCE_ATTR, TX_INDEX_ATTR,
};

/// A query compiled to DNF, ready for bitmap evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedQuery {
    /// `$all` / `*`: the universe of live entities.
    All,
    Dnf(Dnf),
}

/// OR of conjunctions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnf {
    pub disjuncts: Vec<Conjunct>,
}

/// AND of atoms. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conjunct {
    pub atoms: Vec<Atom>,
}

impl TopLevel {
    /// Normalizes the surface tree to DNF.
    pub fn normalize(&self) -> Result<NormalizedQuery> {
        match self {
            TopLevel::All => Ok(NormalizedQuery::All),
            TopLevel::Expression(expr) => Ok(NormalizedQuery::Dnf(Dnf {
                disjuncts: dnf(expr)?,
            })),
        }
    }
}

/// DNF of an expression as written.
fn dnf(expr: &Expression) -> Result<Vec<Conjunct>> {
    // OR nodes concatenate their children's disjuncts.
    let mut disjuncts = Vec::new();
    for group in &expr.or {
        disjuncts.extend(dnf_and(&group.terms)?);
    }
    Ok(disjuncts)
}

/// DNF of the *negation* of an expression: De Morgan turns the OR into an
/// AND over negated children, which distribution then expands.
fn dnf_negated(expr: &Expression) -> Result<Vec<Conjunct>> {
    let per_group: Vec<Vec<Conjunct>> = expr
        .or
        .iter()
        .map(|group| dnf_and_negated(&group.terms))
        .collect::<Result<_>>()?;
    Ok(cross_product(per_group))
}

/// DNF of a conjunction: cross product of the terms' disjunct lists.
fn dnf_and(terms: &[Term]) -> Result<Vec<Conjunct>> {
    let per_term: Vec<Vec<Conjunct>> = terms.iter().map(dnf_term).collect::<Result<_>>()?;
    Ok(cross_product(per_term))
}

/// DNF of a negated conjunction: De Morgan turns it into an OR over the
/// negated terms.
fn dnf_and_negated(terms: &[Term]) -> Result<Vec<Conjunct>> {
    let mut disjuncts = Vec::new();
    for term in terms {
        disjuncts.extend(dnf_term_negated(term)?);
    }
    Ok(disjuncts)
}

fn dnf_term(term: &Term) -> Result<Vec<Conjunct>> {
    match term {
        Term::Atom(atom) => Ok(vec![Conjunct {
            atoms: vec![fold(atom)?],
        }]),
        Term::Paren {
            negated: false,
            expr,
        } => dnf(expr),
        Term::Paren {
            negated: true,
            expr,
        } => dnf_negated(expr),
    }
}

fn dnf_term_negated(term: &Term) -> Result<Vec<Conjunct>> {
    match term {
        Term::Atom(atom) => Ok(vec![Conjunct {
            atoms: vec![fold(&invert(atom))?],
        }]),
        // Double negation cancels.
        Term::Paren {
            negated: true,
            expr,
        } => dnf(expr),
        Term::Paren {
            negated: false,
            expr,
        } => dnf_negated(expr),
    }
}

/// AND together a sequence of disjunction lists by cross product.
fn cross_product(parts: Vec<Vec<Conjunct>>) -> Vec<Conjunct> {
    let mut acc = vec![Conjunct { atoms: Vec::new() }];
    for disjuncts in parts {
        let mut next = Vec::with_capacity(acc.len() * disjuncts.len());
        for prefix in &acc {
            for conjunct in &disjuncts {
                let mut atoms = prefix.atoms.clone();
                atoms.extend(conjunct.atoms.iter().cloned());
                next.push(Conjunct { atoms });
            }
        }
        acc = next;
    }
    acc
}

/// Flips an atom's operator (the leaf step of De Morgan).
fn invert(atom: &Atom) -> Atom {
    match atom {
        Atom::Equality {
            name,
            negated,
            value,
        } => Atom::Equality {
            name: name.clone(),
            negated: !negated,
            value: value.clone(),
        },
        Atom::Inclusion {
            name,
            negated,
            values,
        } => Atom::Inclusion {
            name: name.clone(),
            negated: !negated,
            values: values.clone(),
        },
        Atom::Glob {
            name,
            negated,
            pattern,
        } => Atom::Glob {
            name: name.clone(),
            negated: !negated,
            pattern: pattern.clone(),
        },
        Atom::Compare { name, op, value } => Atom::Compare {
            name: name.clone(),
            op: match op {
                CompareOp::Lt => CompareOp::Ge,
                CompareOp::Ge => CompareOp::Lt,
                CompareOp::Le => CompareOp::Gt,
                CompareOp::Gt => CompareOp::Le,
            },
            value: value.clone(),
        },
    }
}

/// The numeric-only synthetic attributes.
fn is_numeric_synthetic(name: &str) -> bool {
    matches!(
        name,
        EXPIRATION_ATTR
            | SEQUENCE_ATTR
            | CREATED_AT_BLOCK_ATTR
            | LAST_MODIFIED_AT_BLOCK_ATTR
            | TX_INDEX_ATTR
            | OP_INDEX_ATTR
    )
}

/// Case-folds identity-attribute values and type-checks synthetics.
fn fold(atom: &Atom) -> Result<Atom> {
    let mut atom = atom.clone();
    match &mut atom {
        Atom::Equality { name, value, .. } | Atom::Compare { name, value, .. } => {
            let identity = is_identity_attribute(name);
            match value {
                Value::String(s) if identity => {
                    let folded = s.to_lowercase();
                    *s = folded;
                }
                Value::Number(_) if identity => {
                    return Err(Error::Type(format!(
                        "attribute {name} takes string values"
                    )))
                }
                Value::String(_) if is_numeric_synthetic(name) => {
                    return Err(Error::Type(format!(
                        "attribute {name} takes numeric values"
                    )))
                }
                _ => {}
            }
        }
        Atom::Inclusion { name, values, .. } => {
            let identity = is_identity_attribute(name);
            match values {
                Values::Strings(items) if identity => {
                    for item in items.iter_mut() {
                        *item = item.to_lowercase();
                    }
                }
                Values::Numbers(_) if identity => {
                    return Err(Error::Type(format!(
                        "attribute {name} takes string values"
                    )))
                }
                Values::Strings(_) if is_numeric_synthetic(name) => {
                    return Err(Error::Type(format!(
                        "attribute {name} takes numeric values"
                    )))
                }
                _ => {}
            }
        }
        // Glob patterns are matched against stored values as written.
        Atom::Glob { name, .. } => {
            if is_numeric_synthetic(name) {
                return Err(Error::Type(format!(
                    "attribute {name} takes numeric values"
                )));
            }
        }
    }
    Ok(atom)
}
