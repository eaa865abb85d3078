#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;

use bumpalo::{collections::Vec as BumpVec, Bump};
use cm_frame::{Frame, FrameError};
use cm_types::{DType, Scalar};
use thiserror::Error;

/// A hashable join-key component. Keys are normalized to exactly two
/// shapes: Utf8 (country names) and Int64 (years). Integral floats are
/// folded into Int64 so a year stored as `2000.0` in one source still
/// matches `2000` in another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyLabel {
    Int64(i64),
    Utf8(String),
}

impl fmt::Display for KeyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join key column '{column}' not found in {side} frame")]
    KeyColumnNotFound { column: String, side: &'static str },
    #[error("join key column '{column}' holds non-joinable value of dtype {dtype:?}")]
    UnsupportedKeyValue { column: String, dtype: DType },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Scratch-allocation knobs for the join build phase. Position vectors go
/// into a bump arena when the estimated footprint fits the budget;
/// otherwise the global allocator is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

/// Normalize one key cell. Missing values yield `None` (a left row with a
/// missing key never matches; a right row with one is unreachable).
fn key_component(column: &str, value: &Scalar) -> Result<Option<KeyLabel>, JoinError> {
    match value {
        Scalar::Null(_) => Ok(None),
        Scalar::Int64(v) => Ok(Some(KeyLabel::Int64(*v))),
        Scalar::Utf8(v) => Ok(Some(KeyLabel::Utf8(v.clone()))),
        Scalar::Float64(v) => {
            if v.is_nan() {
                return Ok(None);
            }
            if v.is_finite() && *v == v.trunc() && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                return Ok(Some(KeyLabel::Int64(*v as i64)));
            }
            Err(JoinError::UnsupportedKeyValue {
                column: column.to_owned(),
                dtype: DType::Float64,
            })
        }
        Scalar::Bool(_) => Err(JoinError::UnsupportedKeyValue {
            column: column.to_owned(),
            dtype: DType::Bool,
        }),
    }
}

/// The composite key of row `idx`, or `None` if any component is missing.
fn row_key(
    frame: &Frame,
    on: &[&str],
    side: &'static str,
    idx: usize,
) -> Result<Option<Vec<KeyLabel>>, JoinError> {
    let mut key = Vec::with_capacity(on.len());
    for &column in on {
        let col = frame
            .column(column)
            .ok_or_else(|| JoinError::KeyColumnNotFound {
                column: column.to_owned(),
                side,
            })?;
        let value = col
            .value(idx)
            .cloned()
            .unwrap_or(Scalar::Null(cm_types::NullKind::Null));
        match key_component(column, &value)? {
            Some(label) => key.push(label),
            None => return Ok(None),
        }
    }
    Ok(Some(key))
}

fn estimate_output_rows(
    left: &Frame,
    on: &[&str],
    right_map: &HashMap<Vec<KeyLabel>, Vec<usize>>,
) -> Result<usize, JoinError> {
    let mut rows = 0_usize;
    for idx in 0..left.len() {
        rows = rows.saturating_add(match row_key(left, on, "left", idx)? {
            Some(key) => right_map.get(&key).map_or(1, Vec::len),
            None => 1,
        });
    }
    Ok(rows)
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

/// Left join `left` with `right` on the named key columns.
///
/// Every left row survives; a row with no right match gets missing values
/// for the right-side columns. A right key matched by several right rows
/// multiplies cardinality. Output columns are the left columns followed by
/// the right non-key columns; a right column whose name already exists on
/// the left is skipped, so earlier columns are never overwritten.
pub fn left_join(left: &Frame, right: &Frame, on: &[&str]) -> Result<Frame, JoinError> {
    left_join_with_options(left, right, on, JoinOptions::default())
}

pub fn left_join_with_options(
    left: &Frame,
    right: &Frame,
    on: &[&str],
    options: JoinOptions,
) -> Result<Frame, JoinError> {
    // Surface missing key columns before any work, on both sides.
    for &column in on {
        if left.column(column).is_none() {
            return Err(JoinError::KeyColumnNotFound {
                column: column.to_owned(),
                side: "left",
            });
        }
        if right.column(column).is_none() {
            return Err(JoinError::KeyColumnNotFound {
                column: column.to_owned(),
                side: "right",
            });
        }
    }

    let mut right_map = HashMap::<Vec<KeyLabel>, Vec<usize>>::new();
    for idx in 0..right.len() {
        if let Some(key) = row_key(right, on, "right", idx)? {
            right_map.entry(key).or_default().push(idx);
        }
    }

    let output_rows = estimate_output_rows(left, on, &right_map)?;
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    if use_arena {
        let arena = Bump::new();
        let mut left_positions = BumpVec::with_capacity_in(output_rows, &arena);
        let mut right_positions = BumpVec::with_capacity_in(output_rows, &arena);
        build_positions(left, on, &right_map, &mut |l, r| {
            left_positions.push(l);
            right_positions.push(r);
        })?;
        assemble(left, right, on, left_positions.as_slice(), right_positions.as_slice())
    } else {
        let mut left_positions = Vec::with_capacity(output_rows);
        let mut right_positions = Vec::with_capacity(output_rows);
        build_positions(left, on, &right_map, &mut |l, r| {
            left_positions.push(l);
            right_positions.push(r);
        })?;
        assemble(left, right, on, &left_positions, &right_positions)
    }
}

fn build_positions(
    left: &Frame,
    on: &[&str],
    right_map: &HashMap<Vec<KeyLabel>, Vec<usize>>,
    emit: &mut dyn FnMut(Option<usize>, Option<usize>),
) -> Result<(), JoinError> {
    for left_idx in 0..left.len() {
        let matches = match row_key(left, on, "left", left_idx)? {
            Some(key) => right_map.get(&key),
            None => None,
        };

        match matches {
            Some(positions) => {
                for &right_idx in positions {
                    emit(Some(left_idx), Some(right_idx));
                }
            }
            None => emit(Some(left_idx), None),
        }
    }
    Ok(())
}

fn assemble(
    left: &Frame,
    right: &Frame,
    on: &[&str],
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
) -> Result<Frame, JoinError> {
    let mut pairs = Vec::with_capacity(left.num_columns() + right.num_columns());

    for name in left.column_names() {
        let column = left
            .column(name)
            .expect("column name listed in order must exist");
        pairs.push((name.clone(), column.reindex_by_positions(left_positions)?));
    }

    for name in right.column_names() {
        if on.contains(&name.as_str()) {
            continue;
        }
        if left.column(name).is_some() {
            // Collision: the earlier join result stays authoritative.
            continue;
        }
        let column = right
            .column(name)
            .expect("column name listed in order must exist");
        pairs.push((name.clone(), column.reindex_by_positions(right_positions)?));
    }

    Ok(Frame::from_columns(pairs)?)
}

#[cfg(test)]
mod tests {
    use cm_frame::{Column, Frame};
    use cm_types::Scalar;

    use super::{left_join, left_join_with_options, JoinOptions};

    fn utf8_column(values: &[&str]) -> Column {
        Column::from_values(values.iter().map(|v| Scalar::Utf8((*v).to_owned())).collect())
            .expect("column")
    }

    fn int_column(values: &[i64]) -> Column {
        Column::from_values(values.iter().map(|v| Scalar::Int64(*v)).collect()).expect("column")
    }

    fn base_frame() -> Frame {
        Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A", "A", "B"])),
            ("Year".to_owned(), int_column(&[2000, 2001, 2000])),
            ("GDP".to_owned(), int_column(&[10, 11, 20])),
        ])
        .expect("base")
    }

    #[test]
    fn left_join_keeps_unmatched_left_rows() {
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A"])),
            ("Year".to_owned(), int_column(&[2000])),
            ("Sea Level (mm)".to_owned(), int_column(&[7])),
        ])
        .expect("right");

        let out = left_join(&base_frame(), &right, &["Country", "Year"]).expect("join");

        assert_eq!(out.len(), 3);
        let sea = out.column("Sea Level (mm)").expect("sea");
        assert_eq!(sea.values()[0], Scalar::Int64(7));
        assert!(sea.values()[1].is_missing());
        assert!(sea.values()[2].is_missing());
    }

    #[test]
    fn single_column_key_broadcasts_to_every_year() {
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A", "B"])),
            ("Risk Index".to_owned(), int_column(&[3, 9])),
        ])
        .expect("right");

        let out = left_join(&base_frame(), &right, &["Country"]).expect("join");

        let risk = out.column("Risk Index").expect("risk");
        assert_eq!(risk.values()[0], Scalar::Int64(3));
        assert_eq!(risk.values()[1], Scalar::Int64(3));
        assert_eq!(risk.values()[2], Scalar::Int64(9));
    }

    #[test]
    fn integral_float_year_matches_int_year() {
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A"])),
            (
                "Year".to_owned(),
                Column::from_values(vec![Scalar::Float64(2000.0)]).expect("year"),
            ),
            ("Minor".to_owned(), int_column(&[5])),
        ])
        .expect("right");

        let out = left_join(&base_frame(), &right, &["Country", "Year"]).expect("join");
        assert_eq!(out.column("Minor").expect("minor").values()[0], Scalar::Int64(5));
    }

    #[test]
    fn colliding_right_column_is_skipped() {
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A"])),
            ("GDP".to_owned(), int_column(&[999])),
        ])
        .expect("right");

        let out = left_join(&base_frame(), &right, &["Country"]).expect("join");

        // The base GDP survives untouched.
        let gdp = out.column("GDP").expect("gdp");
        assert_eq!(gdp.values()[0], Scalar::Int64(10));
    }

    #[test]
    fn missing_key_column_is_an_error() {
        let right = Frame::from_columns(vec![(
            "Risk Index".to_owned(),
            int_column(&[1]),
        )])
        .expect("right");

        let err = left_join(&base_frame(), &right, &["Country"]).expect_err("must fail");
        assert!(err.to_string().contains("'Country' not found in right"));
    }

    #[test]
    fn missing_left_key_value_produces_unmatched_row() {
        let left = Frame::from_columns(vec![
            (
                "Country".to_owned(),
                Column::from_values(vec![
                    Scalar::Utf8("A".into()),
                    Scalar::Null(cm_types::NullKind::Null),
                ])
                .expect("country"),
            ),
            ("GDP".to_owned(), int_column(&[1, 2])),
        ])
        .expect("left");
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A"])),
            ("Risk Index".to_owned(), int_column(&[3])),
        ])
        .expect("right");

        let out = left_join(&left, &right, &["Country"]).expect("join");
        assert_eq!(out.len(), 2);
        assert!(out.column("Risk Index").expect("risk").values()[1].is_missing());
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let right = Frame::from_columns(vec![
            ("Country".to_owned(), utf8_column(&["A", "B"])),
            ("Risk Index".to_owned(), int_column(&[3, 9])),
        ])
        .expect("right");

        let with_arena =
            left_join_with_options(&base_frame(), &right, &["Country"], JoinOptions::default())
                .expect("arena join");
        let without_arena = left_join_with_options(
            &base_frame(),
            &right,
            &["Country"],
            JoinOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        )
        .expect("global join");

        assert_eq!(with_arena.column_names(), without_arena.column_names());
        for name in with_arena.column_names() {
            assert!(with_arena
                .column(name)
                .expect("col")
                .semantic_eq(without_arena.column(name).expect("col")));
        }
    }
}
