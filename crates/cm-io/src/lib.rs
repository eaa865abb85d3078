#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use cm_frame::{Column, Frame, FrameError};
use cm_types::{NullKind, Scalar};
use csv::ReaderBuilder;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("expected a top-level array of record objects in {path}")]
    NotRecordArray { path: String },
    #[error("record field '{field}' holds a nested {found}; only flat values are supported")]
    NestedValue { field: String, found: &'static str },
    #[error("unsupported table extension for '{path}' (expected .json or .csv)")]
    UnsupportedExtension { path: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Read a table file, dispatching on extension: `.json` is parsed as a
/// record-oriented array of objects, `.csv` as headered CSV.
pub fn read_table_path(path: &Path) -> Result<Frame, IoError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => read_json_records_path(path),
        Some("csv") => read_csv_path(path),
        _ => Err(IoError::UnsupportedExtension {
            path: path.display().to_string(),
        }),
    }
}

// ── Record-oriented JSON ───────────────────────────────────────────────

pub fn read_json_records_path(path: &Path) -> Result<Frame, IoError> {
    let text = fs::read_to_string(path)?;
    read_json_records_str(&text, &path.display().to_string())
}

/// Parse `[{"Country": "A", "Year": 2000, ...}, ...]` into a frame.
/// Column order is first-seen key order; missing keys become nulls.
pub fn read_json_records_str(input: &str, origin: &str) -> Result<Frame, IoError> {
    let parsed: Value = serde_json::from_str(input)?;
    let Value::Array(items) = parsed else {
        return Err(IoError::NotRecordArray {
            path: origin.to_owned(),
        });
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(fields) = item else {
            return Err(IoError::NotRecordArray {
                path: origin.to_owned(),
            });
        };
        let mut record = BTreeMap::new();
        for (field, value) in fields {
            record.insert(field.clone(), json_to_scalar(&field, value)?);
        }
        records.push(record);
    }

    Ok(Frame::from_records(&records)?)
}

fn json_to_scalar(field: &str, value: Value) -> Result<Scalar, IoError> {
    match value {
        Value::Null => Ok(Scalar::Null(NullKind::Null)),
        Value::Bool(v) => Ok(Scalar::Bool(v)),
        Value::Number(v) => {
            if let Some(int) = v.as_i64() {
                Ok(Scalar::Int64(int))
            } else if let Some(float) = v.as_f64() {
                Ok(Scalar::Float64(float))
            } else {
                // u64 beyond i64::MAX; keep the magnitude as a float.
                Ok(Scalar::Float64(v.as_u64().map_or(f64::NAN, |u| u as f64)))
            }
        }
        Value::String(v) => Ok(Scalar::Utf8(v)),
        Value::Array(_) => Err(IoError::NestedValue {
            field: field.to_owned(),
            found: "array",
        }),
        Value::Object(_) => Err(IoError::NestedValue {
            field: field.to_owned(),
            found: "object",
        }),
    }
}

// ── CSV ────────────────────────────────────────────────────────────────

pub fn read_csv_path(path: &Path) -> Result<Frame, IoError> {
    let text = fs::read_to_string(path)?;
    read_csv_str(&text)
}

pub fn read_csv_str(input: &str) -> Result<Frame, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let mut columns: Vec<Vec<Scalar>> = (0..header_count).map(|_| Vec::new()).collect();

    for row in reader.records() {
        let record = row?;
        for (idx, col) in columns.iter_mut().enumerate() {
            let field = record.get(idx).unwrap_or_default();
            col.push(parse_csv_scalar(field));
        }
    }

    let mut pairs = Vec::with_capacity(header_count);
    for (idx, values) in columns.into_iter().enumerate() {
        let name = headers.get(idx).unwrap_or_default().to_owned();
        pairs.push((name, Column::from_values(values)?));
    }

    Ok(Frame::from_columns(pairs)?)
}

fn parse_csv_scalar(field: &str) -> Scalar {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Scalar::Null(NullKind::Null);
    }

    if let Ok(value) = trimmed.parse::<i64>() {
        return Scalar::Int64(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return Scalar::Float64(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Scalar::Bool(value);
    }

    Scalar::Utf8(trimmed.to_owned())
}

// ── Output ─────────────────────────────────────────────────────────────

/// Serialize `value` as JSON with 2-space indentation, overwriting any
/// existing file at `path`. No atomicity: a crash mid-write leaves a
/// truncated file.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<(), IoError> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cm_types::{NullKind, Scalar};

    use super::{read_csv_str, read_json_records_str, read_table_path, write_json_pretty};

    #[test]
    fn json_records_parse_with_mixed_numbers() {
        let input = r#"[
            {"Country": "A", "Year": 2000, "GDP": 1.5},
            {"Country": "B", "Year": 2001, "GDP": null}
        ]"#;
        let frame = read_json_records_str(input, "test").expect("read");

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.column_names(), &["Country", "GDP", "Year"]);
        assert_eq!(
            frame.column("Year").expect("year").values(),
            &[Scalar::Int64(2000), Scalar::Int64(2001)]
        );
        assert!(frame.column("GDP").expect("gdp").values()[1].is_missing());
    }

    #[test]
    fn json_non_array_input_is_rejected() {
        let err = read_json_records_str(r#"{"Country": "A"}"#, "test").expect_err("must fail");
        assert!(err.to_string().contains("array of record objects"));
    }

    #[test]
    fn json_nested_field_is_rejected() {
        let err = read_json_records_str(r#"[{"Country": ["A"]}]"#, "test").expect_err("must fail");
        assert!(err.to_string().contains("nested array"));
    }

    #[test]
    fn csv_preserves_null_and_numeric_shape() {
        let input = "Country,Year,Flood Days\nA,2000,5\nB,2001,\n";
        let frame = read_csv_str(input).expect("read");

        assert_eq!(frame.len(), 2);
        assert_eq!(
            frame.column("Flood Days").expect("days").values()[0],
            Scalar::Int64(5)
        );
        assert_eq!(
            frame.column("Flood Days").expect("days").values()[1],
            Scalar::Null(NullKind::Null)
        );
    }

    #[test]
    fn table_dispatch_rejects_unknown_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("table.parquet");
        std::fs::write(&path, b"").expect("write");
        let err = read_table_path(&path).expect_err("must fail");
        assert!(err.to_string().contains("unsupported table extension"));
    }

    #[test]
    fn table_dispatch_reads_both_formats() {
        let dir = tempfile::tempdir().expect("tempdir");

        let json_path = dir.path().join("t.json");
        std::fs::write(&json_path, r#"[{"Country": "A", "Year": 2000}]"#).expect("write json");
        let from_json = read_table_path(&json_path).expect("json");
        assert_eq!(from_json.len(), 1);

        let csv_path = dir.path().join("t.csv");
        std::fs::write(&csv_path, "Country,Year\nA,2000\n").expect("write csv");
        let from_csv = read_table_path(&csv_path).expect("csv");
        assert_eq!(from_csv.len(), 1);
        assert_eq!(
            from_csv.column("Year").expect("year").values(),
            from_json.column("Year").expect("year").values()
        );
    }

    #[test]
    fn pretty_writer_uses_two_space_indent_and_overwrites() {
        use std::collections::BTreeMap;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");

        let mut nested: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
        nested.entry("A".to_owned()).or_default().insert(2000, 1.5);

        write_json_pretty(&path, &nested).expect("first write");
        let first = std::fs::read_to_string(&path).expect("read");
        assert!(first.contains("\n  \"A\""), "top level indented by 2");
        assert!(first.contains("\n    \"2000\""), "second level indented by 4");

        nested.entry("B".to_owned()).or_default().insert(2001, 2.5);
        write_json_pretty(&path, &nested).expect("second write");
        let second = std::fs::read_to_string(&path).expect("read");
        assert!(second.contains("\"B\""));
    }
}
