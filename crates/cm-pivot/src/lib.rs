#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use cm_frame::{Column, Frame, FrameError};
use cm_types::{DType, NullKind, Scalar, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PivotError {
    #[error("pivot column '{0}' not found")]
    ColumnNotFound(String),
    #[error("pivot value in column '{column}' is not numeric")]
    NonNumericValue {
        column: String,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// How duplicate cells (same row key, same wide column) collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Sum,
    First,
}

impl Aggregation {
    fn apply(self, values: &[f64]) -> f64 {
        match self {
            Self::Mean => {
                if values.is_empty() {
                    f64::NAN
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
            Self::Sum => values.iter().sum(),
            Self::First => values.first().copied().unwrap_or(f64::NAN),
        }
    }
}

/// Stable textual form of a scalar used as a grouping key. Floats render
/// via `{:?}` so `2000.0` and `2000` stay distinct key strings while the
/// original scalar is kept for the output columns.
fn key_string(value: &Scalar) -> String {
    match value {
        Scalar::Null(_) => "<null>".to_owned(),
        Scalar::Bool(v) => v.to_string(),
        Scalar::Int64(v) => v.to_string(),
        Scalar::Float64(v) => format!("{v:?}"),
        Scalar::Utf8(v) => v.clone(),
    }
}

/// Reshape long-form rows into wide form.
///
/// One output row per distinct combination of `index_columns` (first-seen
/// order); one Float64 output column per distinct value of `column_column`
/// (first-seen order), named by that value's textual form. Cells never
/// observed in the input stay NaN-missing. The wide column set is entirely
/// data-driven.
pub fn pivot_wider(
    frame: &Frame,
    index_columns: &[&str],
    column_column: &str,
    value_column: &str,
    aggregation: Aggregation,
) -> Result<Frame, PivotError> {
    let mut index_cols = Vec::with_capacity(index_columns.len());
    for &name in index_columns {
        index_cols.push(
            frame
                .column(name)
                .ok_or_else(|| PivotError::ColumnNotFound(name.to_owned()))?,
        );
    }
    let labels = frame
        .column(column_column)
        .ok_or_else(|| PivotError::ColumnNotFound(column_column.to_owned()))?;
    let values = frame
        .column(value_column)
        .ok_or_else(|| PivotError::ColumnNotFound(value_column.to_owned()))?;

    let n_rows = frame.len();

    // Distinct row keys in first-seen order, keeping the original scalars
    // for the output index columns.
    let mut key_order: Vec<String> = Vec::new();
    let mut key_rows: HashMap<String, usize> = HashMap::new();
    let mut index_values: Vec<Vec<Scalar>> = vec![Vec::new(); index_columns.len()];

    for row in 0..n_rows {
        let key = index_cols
            .iter()
            .map(|column| key_string(column.value(row).unwrap_or(&Scalar::Null(NullKind::Null))))
            .collect::<Vec<_>>()
            .join("\u{1f}");

        if !key_rows.contains_key(&key) {
            key_rows.insert(key.clone(), key_order.len());
            key_order.push(key);
            for (slot, column) in index_cols.iter().enumerate() {
                index_values[slot].push(
                    column
                        .value(row)
                        .cloned()
                        .unwrap_or(Scalar::Null(NullKind::Null)),
                );
            }
        }
    }

    // Distinct wide-column labels in first-seen order.
    let mut label_order: Vec<String> = Vec::new();
    let mut label_seen: HashSet<String> = HashSet::new();
    for row in 0..n_rows {
        let label = key_string(labels.value(row).unwrap_or(&Scalar::Null(NullKind::Null)));
        if label_seen.insert(label.clone()) {
            label_order.push(label);
        }
    }

    // Group cell values: (row key position, label) -> Vec<f64>.
    let mut cells: HashMap<(usize, String), Vec<f64>> = HashMap::new();
    for row in 0..n_rows {
        let key = index_cols
            .iter()
            .map(|column| key_string(column.value(row).unwrap_or(&Scalar::Null(NullKind::Null))))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let key_pos = key_rows[&key];
        let label = key_string(labels.value(row).unwrap_or(&Scalar::Null(NullKind::Null)));

        let Some(cell) = values.value(row) else {
            continue;
        };
        if cell.is_missing() {
            continue;
        }
        let numeric = cell.to_f64().map_err(|source| PivotError::NonNumericValue {
            column: value_column.to_owned(),
            source,
        })?;
        cells.entry((key_pos, label)).or_default().push(numeric);
    }

    let mut pairs = Vec::with_capacity(index_columns.len() + label_order.len());
    for (slot, &name) in index_columns.iter().enumerate() {
        pairs.push((
            name.to_owned(),
            Column::from_values(std::mem::take(&mut index_values[slot]))?,
        ));
    }

    for label in label_order {
        let mut column_values = Vec::with_capacity(key_order.len());
        for key_pos in 0..key_order.len() {
            match cells.get(&(key_pos, label.clone())) {
                Some(observed) => {
                    column_values.push(Scalar::Float64(aggregation.apply(observed)));
                }
                None => column_values.push(Scalar::Null(NullKind::NaN)),
            }
        }
        pairs.push((label, Column::new(DType::Float64, column_values)?));
    }

    Ok(Frame::from_columns(pairs)?)
}
