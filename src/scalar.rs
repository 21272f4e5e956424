//! Dynamic cell values.
//!
//! [`Scalar`] is the unit of data the planner and kernel pass around: one cell
//! of one column, with `Null` standing in for a missing value. Reduction
//! variables, group keys, and kernel outputs are all `Scalar`s, so arithmetic
//! and ordering helpers live here.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// One dynamically typed cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    /// Missing value.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// `true` for [`Scalar::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view as `f64`; `None` for nulls, strings, and bools.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view; floats are not silently truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Addition over the numeric domain. Int+Int stays Int; anything mixed
    /// with a float widens. Null absorbs (null + x = null).
    pub fn add(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Null, _) | (_, Scalar::Null) => Scalar::Null,
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a + b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Scalar::Float(x + y),
                _ => Scalar::Null,
            },
        }
    }

    /// Subtraction with the same widening rules as [`Scalar::add`].
    pub fn sub(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Null, _) | (_, Scalar::Null) => Scalar::Null,
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a - b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Scalar::Float(x - y),
                _ => Scalar::Null,
            },
        }
    }

    /// Multiplication with the same widening rules as [`Scalar::add`].
    pub fn mul(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Null, _) | (_, Scalar::Null) => Scalar::Null,
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a * b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Scalar::Float(x * y),
                _ => Scalar::Null,
            },
        }
    }

    /// Total ordering across same-kind values. Nulls sort first; ordering a
    /// number against a string returns `None` (the caller decides how to
    /// surface that).
    pub fn total_cmp(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
            (Scalar::Null, _) => Some(Ordering::Less),
            (_, Scalar::Null) => Some(Ordering::Greater),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
            (a, b) => {
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                Some(OrderedFloat(x).cmp(&OrderedFloat(y)))
            }
        }
    }

    /// Pointwise minimum under [`Scalar::total_cmp`], ignoring nulls.
    pub fn min_with(&self, other: &Scalar) -> Scalar {
        match (self.is_null(), other.is_null()) {
            (true, _) => other.clone(),
            (_, true) => self.clone(),
            _ => match self.total_cmp(other) {
                Some(Ordering::Greater) => other.clone(),
                _ => self.clone(),
            },
        }
    }

    /// Pointwise maximum under [`Scalar::total_cmp`], ignoring nulls.
    pub fn max_with(&self, other: &Scalar) -> Scalar {
        match (self.is_null(), other.is_null()) {
            (true, _) => other.clone(),
            (_, true) => self.clone(),
            _ => match self.total_cmp(other) {
                Some(Ordering::Less) => other.clone(),
                _ => self.clone(),
            },
        }
    }
}

impl Eq for Scalar {}

// Grouping semantics: Null keys hash/compare equal to each other so that rows
// with missing keys fall into one group when `dropna` is off. Floats hash via
// their ordered-float bit view.
impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Null => 0u8.hash(state),
            Scalar::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Scalar::Int(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Scalar::Float(v) => {
                3u8.hash(state);
                OrderedFloat(*v).hash(state);
            }
            Scalar::Str(s) => {
                4u8.hash(state);
                s.hash(state);
            }
        }
    }
}

/// A composite group key: one scalar per key column.
///
/// Wrapping the `Vec` lets the kernel use it directly as a hash-map key with
/// the null-equals-null grouping rule above.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<Scalar>);
