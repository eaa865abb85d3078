#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use cm_types::{cast_scalar, cast_scalar_owned, infer_dtype, DType, NullKind, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error("duplicate column '{0}' resulting from rename")]
    DuplicateColumn(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// A dtype-homogeneous value vector. Construction coerces every value to
/// the column dtype; missing values carry the dtype-specific marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
}

impl Column {
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, FrameError> {
        let needs_coercion = values.iter().any(|v| {
            let d = v.dtype();
            d != dtype && d != DType::Null
        });

        let coerced = if needs_coercion {
            values
                .into_iter()
                .map(|value| cast_scalar_owned(value, dtype))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            values
                .into_iter()
                .map(|value| match value {
                    Scalar::Null(_) => Scalar::missing_for_dtype(dtype),
                    other => other,
                })
                .collect()
        };

        Ok(Self {
            dtype,
            values: coerced,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, FrameError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    /// Gather values at `positions`; `None` slots materialize as the
    /// dtype's missing marker. This is the building block for left joins.
    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, FrameError> {
        let values = positions
            .iter()
            .map(|slot| match slot {
                Some(idx) => self
                    .values
                    .get(*idx)
                    .cloned()
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype)),
                None => Scalar::missing_for_dtype(self.dtype),
            })
            .collect::<Vec<_>>();

        Self::new(self.dtype, values)
    }

    /// Fill missing values with `fill_value`, cast to the column dtype.
    /// An all-missing (Null-typed) column adopts the fill value's dtype,
    /// so zero-filling a column no source row ever populated still yields
    /// a numeric column.
    pub fn fillna(&self, fill_value: &Scalar) -> Result<Self, FrameError> {
        if self.dtype == DType::Null {
            return Self::new(fill_value.dtype(), vec![fill_value.clone(); self.len()]);
        }

        let cast_fill = cast_scalar(fill_value, self.dtype)?;
        let values = self
            .values
            .iter()
            .map(|v| {
                if v.is_missing() {
                    cast_fill.clone()
                } else {
                    v.clone()
                }
            })
            .collect();

        Self::new(self.dtype, values)
    }

    /// Cast every value to `target`. Missing values stay missing.
    pub fn cast(&self, target: DType) -> Result<Self, FrameError> {
        if self.dtype == target {
            return Ok(self.clone());
        }
        let values = self
            .values
            .iter()
            .map(|v| cast_scalar(v, target))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(target, values)
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}

/// A row-count-consistent collection of named columns with an observable
/// column order. Rows are addressed positionally; there is no label index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
    row_count: usize,
}

impl Frame {
    fn validate(
        columns: &BTreeMap<String, Column>,
        column_order: &[String],
    ) -> Result<usize, FrameError> {
        let mut row_count = None;
        for name in column_order {
            let column = columns
                .get(name)
                .ok_or_else(|| FrameError::ColumnNotFound(name.clone()))?;
            match row_count {
                None => row_count = Some(column.len()),
                Some(expected) if expected != column.len() => {
                    return Err(FrameError::LengthMismatch {
                        expected,
                        found: column.len(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(row_count.unwrap_or(0))
    }

    /// Build a frame from `(name, column)` pairs; the pair order becomes
    /// the observable column order.
    pub fn from_columns(pairs: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let mut columns = BTreeMap::new();
        let mut column_order = Vec::with_capacity(pairs.len());
        for (name, column) in pairs {
            if columns.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            column_order.push(name.clone());
            columns.insert(name, column);
        }
        let row_count = Self::validate(&columns, &column_order)?;
        Ok(Self {
            columns,
            column_order,
            row_count,
        })
    }

    /// Build a frame from row records. Column order is first-seen key
    /// order across the records; keys absent from a record are null.
    pub fn from_records(records: &[BTreeMap<String, Scalar>]) -> Result<Self, FrameError> {
        let mut discovered = Vec::new();
        let mut seen = BTreeSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.clone()) {
                    discovered.push(key.clone());
                }
            }
        }

        let mut pairs = Vec::with_capacity(discovered.len());
        for name in discovered {
            let values = records
                .iter()
                .map(|record| {
                    record
                        .get(&name)
                        .cloned()
                        .unwrap_or(Scalar::Null(NullKind::Null))
                })
                .collect::<Vec<_>>();
            pairs.push((name, Column::from_values(values)?));
        }

        let mut frame = Self::from_columns(pairs)?;
        frame.row_count = records.len();
        Ok(frame)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column names in observable order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.columns
            .get(name)
            .ok_or_else(|| FrameError::ColumnNotFound(name.to_owned()))
    }

    /// One row as `(name, value)` pairs in column order.
    #[must_use]
    pub fn row(&self, idx: usize) -> Vec<(&str, &Scalar)> {
        self.column_order
            .iter()
            .filter_map(|name| {
                self.columns
                    .get(name)
                    .and_then(|column| column.value(idx))
                    .map(|value| (name.as_str(), value))
            })
            .collect()
    }

    pub fn select_columns(&self, names: &[&str]) -> Result<Self, FrameError> {
        let mut pairs = Vec::with_capacity(names.len());
        for &name in names {
            let column = self.require_column(name)?;
            pairs.push((name.to_owned(), column.clone()));
        }
        Self::from_columns(pairs)
    }

    pub fn drop_column(&self, name: &str) -> Result<Self, FrameError> {
        if !self.columns.contains_key(name) {
            return Err(FrameError::ColumnNotFound(name.to_owned()));
        }
        let pairs = self
            .column_order
            .iter()
            .filter(|entry| entry.as_str() != name)
            .map(|entry| (entry.clone(), self.columns[entry].clone()))
            .collect();
        Self::from_columns(pairs)
    }

    /// Rename columns per `mapping`; names absent from the mapping pass
    /// through. Renaming onto an existing name is an error.
    pub fn rename_columns(&self, mapping: &[(&str, &str)]) -> Result<Self, FrameError> {
        let rename_map: BTreeMap<&str, &str> = mapping.iter().copied().collect();
        let mut pairs = Vec::with_capacity(self.column_order.len());
        for name in &self.column_order {
            let new_name = rename_map.get(name.as_str()).copied().unwrap_or(name);
            pairs.push(((*new_name).to_owned(), self.columns[name].clone()));
        }
        Self::from_columns(pairs)
    }

    /// Replace a column's values wholesale, keeping its position.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, FrameError> {
        if !self.columns.contains_key(name) {
            return Err(FrameError::ColumnNotFound(name.to_owned()));
        }
        if column.len() != self.row_count {
            return Err(FrameError::LengthMismatch {
                expected: self.row_count,
                found: column.len(),
            });
        }
        let mut out = self.clone();
        out.columns.insert(name.to_owned(), column);
        Ok(out)
    }

    /// Fill missing values in the named columns with `fill_value`. Names
    /// not present in the frame are skipped silently; other columns are
    /// untouched.
    pub fn fill_columns(&self, names: &[&str], fill_value: &Scalar) -> Result<Self, FrameError> {
        let mut out = self.clone();
        for &name in names {
            if let Some(column) = self.columns.get(name) {
                out.columns.insert(name.to_owned(), column.fillna(fill_value)?);
            }
        }
        Ok(out)
    }

    /// Cast the named column to `target` in place of the original.
    pub fn cast_column(&self, name: &str, target: DType) -> Result<Self, FrameError> {
        let column = self.require_column(name)?;
        self.with_column(name, column.cast(target)?)
    }
}
