//! Columnar containers: typed columns with validity, and the named-column
//! [`Table`] the planner and kernel exchange.
//!
//! Storage is deliberately simple — `Vec<Option<_>>` per column — because this
//! crate's job is plan synthesis, not a storage engine. The categorical
//! variant carries its category set as an `Option` so the planner can detect
//! the "categorical without known categories" case statically.

use crate::error::{AggError, Result};
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Element type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float64,
    Utf8,
    Categorical,
}

/// One column of data with per-cell validity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Bool(Vec<Option<bool>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    /// Dictionary-encoded strings. `categories` is `None` when the dictionary
    /// is not known ahead of time, which blocks `min`/`max`/`shift` reuse.
    Categorical {
        codes: Vec<Option<u32>>,
        categories: Option<Arc<Vec<String>>>,
    },
}

impl Column {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Bool(v) => v.len(),
            Column::Int64(v) => v.len(),
            Column::Float64(v) => v.len(),
            Column::Utf8(v) => v.len(),
            Column::Categorical { codes, .. } => codes.len(),
        }
    }

    /// `true` when the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type tag.
    pub fn dtype(&self) -> DataType {
        match self {
            Column::Bool(_) => DataType::Bool,
            Column::Int64(_) => DataType::Int64,
            Column::Float64(_) => DataType::Float64,
            Column::Utf8(_) => DataType::Utf8,
            Column::Categorical { .. } => DataType::Categorical,
        }
    }

    /// Read one cell. Categorical cells resolve through the dictionary when
    /// it is known, otherwise surface as the raw code.
    pub fn get(&self, row: usize) -> Scalar {
        match self {
            Column::Bool(v) => v[row].map_or(Scalar::Null, Scalar::Bool),
            Column::Int64(v) => v[row].map_or(Scalar::Null, Scalar::Int),
            Column::Float64(v) => v[row].map_or(Scalar::Null, Scalar::Float),
            Column::Utf8(v) => v[row]
                .as_ref()
                .map_or(Scalar::Null, |s| Scalar::Str(s.clone())),
            Column::Categorical { codes, categories } => match (&codes[row], categories) {
                (Some(code), Some(cats)) => cats
                    .get(*code as usize)
                    .map_or(Scalar::Null, |s| Scalar::Str(s.clone())),
                (Some(code), None) => Scalar::Int(i64::from(*code)),
                (None, _) => Scalar::Null,
            },
        }
    }

    /// An empty column of the given type, used when reserving output buffers.
    pub fn empty(dtype: DataType) -> Column {
        match dtype {
            DataType::Bool => Column::Bool(Vec::new()),
            DataType::Int64 => Column::Int64(Vec::new()),
            DataType::Float64 => Column::Float64(Vec::new()),
            DataType::Utf8 => Column::Utf8(Vec::new()),
            DataType::Categorical => Column::Categorical {
                codes: Vec::new(),
                categories: None,
            },
        }
    }

    /// Append one scalar, widening nulls into the column's native slot type.
    ///
    /// Pushing a value of the wrong kind stores a null rather than panicking;
    /// the planner reserves output buffers with matching types up front.
    pub fn push(&mut self, value: Scalar) {
        match self {
            Column::Bool(v) => v.push(match value {
                Scalar::Bool(b) => Some(b),
                _ => None,
            }),
            Column::Int64(v) => v.push(match value {
                Scalar::Int(i) => Some(i),
                _ => None,
            }),
            Column::Float64(v) => v.push(match value {
                Scalar::Float(f) => Some(f),
                Scalar::Int(i) => Some(i as f64),
                _ => None,
            }),
            Column::Utf8(v) => v.push(match value {
                Scalar::Str(s) => Some(s),
                _ => None,
            }),
            Column::Categorical { codes, categories } => codes.push(match value {
                Scalar::Int(i) => u32::try_from(i).ok(),
                Scalar::Str(s) => categories
                    .as_ref()
                    .and_then(|cats| cats.iter().position(|c| *c == s))
                    .and_then(|p| u32::try_from(p).ok()),
                _ => None,
            }),
        }
    }

    /// Materialize a column of the given type from kernel output scalars.
    pub fn from_scalars(dtype: DataType, values: Vec<Scalar>) -> Column {
        let mut col = Column::empty(dtype);
        for v in values {
            col.push(v);
        }
        col
    }

    /// Materialize a column whose type is inferred from the values (used for
    /// UDF outputs, whose type depends on the finishing expression). Any float
    /// widens the column to Float64; all-integer stays Int64.
    pub fn from_scalars_inferred(values: Vec<Scalar>) -> Column {
        let dtype = if values.iter().any(|v| matches!(v, Scalar::Str(_))) {
            DataType::Utf8
        } else if values.iter().any(|v| matches!(v, Scalar::Float(_))) {
            DataType::Float64
        } else if values.iter().any(|v| matches!(v, Scalar::Bool(_))) {
            DataType::Bool
        } else {
            DataType::Int64
        };
        Column::from_scalars(dtype, values)
    }

    /// Build an Int64 column from plain values.
    pub fn from_i64(values: impl IntoIterator<Item = i64>) -> Column {
        Column::Int64(values.into_iter().map(Some).collect())
    }

    /// Build a Float64 column from plain values.
    pub fn from_f64(values: impl IntoIterator<Item = f64>) -> Column {
        Column::Float64(values.into_iter().map(Some).collect())
    }

    /// Build a Utf8 column from plain values.
    pub fn from_strs(values: impl IntoIterator<Item = &'static str>) -> Column {
        Column::Utf8(values.into_iter().map(|s| Some(s.to_string())).collect())
    }
}

/// An ordered set of named columns. All columns have the same length.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    cols: Vec<(String, Column)>,
}

impl Table {
    /// Empty table.
    pub fn new() -> Table {
        Table::default()
    }

    /// Append a named column. Replaces any existing column of the same name.
    pub fn push_column(&mut self, name: impl Into<String>, col: Column) {
        let name = name.into();
        if let Some(slot) = self.cols.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = col;
        } else {
            self.cols.push((name, col));
        }
    }

    /// Builder-style [`Table::push_column`].
    pub fn with_column(mut self, name: impl Into<String>, col: Column) -> Table {
        self.push_column(name, col);
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.cols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| AggError::UnknownColumn(name.to_string()))
    }

    /// Column names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.cols.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.cols.len()
    }

    /// Number of rows (0 for a table with no columns).
    pub fn height(&self) -> usize {
        self.cols.first().map_or(0, |(_, c)| c.len())
    }
}
