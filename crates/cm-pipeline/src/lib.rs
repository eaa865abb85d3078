#![forbid(unsafe_code)]

//! One-shot batch transform: load the four climate tables, pivot flood
//! days to one column per severity, left-join everything onto the base
//! indicator table, zero-fill the three severity columns, nest the result
//! by country and year, and write pretty JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cm_frame::{Frame, FrameError};
use cm_io::IoError;
use cm_join::{left_join, JoinError};
use cm_pivot::{pivot_wider, Aggregation, PivotError};
use cm_types::{DType, Scalar, TypeError};
use serde_json::{Number, Value};
use thiserror::Error;

pub const COUNTRY_COLUMN: &str = "Country";
pub const YEAR_COLUMN: &str = "Year";
pub const SEVERITY_COLUMN: &str = "Severity";
pub const FLOOD_DAYS_COLUMN: &str = "Flood Days";
pub const SEA_LEVEL_METRIC_COLUMN: &str = "Sea Level Metric";

/// The severity columns the filler zero-fills. Any other severity label
/// coming out of the pivot keeps its nulls; that mirrors the upstream
/// data product, where only these three tiers are expected.
pub const FLOOD_SEVERITY_COLUMNS: [&str; 3] = ["Minor", "Moderate", "Major"];

/// Risk-table renames applied before the broadcast join.
pub const RISK_COLUMN_RENAMES: [(&str, &str); 4] = [
    ("Composite Risk Index", "Risk Index"),
    ("Sea Level", "Sea Level Risk"),
    ("Population Exposure", "Population Exposure Risk"),
    ("GDP Exposure", "GDP Exposure Risk"),
];

pub const DEFAULT_INDICATORS_FILE: &str = "climate_socioecon_indicators.json";
pub const DEFAULT_FLOOD_FILE: &str = "processed_flood_days.json";
pub const DEFAULT_SEA_LEVEL_FILE: &str = "processed_sealevel.json";
pub const DEFAULT_RISK_FILE: &str = "processed_risk_index.json";
pub const DEFAULT_OUTPUT_FILE: &str = "merged_climate_metrics.json";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("column '{column}' not found in the {table} table")]
    MissingColumn { table: &'static str, column: String },
    #[error("row {row} has a non-string country value of dtype {dtype:?}")]
    NonStringCountry { row: usize, dtype: DType },
    #[error("row {row} has a year that is not an integer")]
    YearNotIntegral {
        row: usize,
        #[source]
        source: TypeError,
    },
    #[error("year column in the {table} table cannot be normalized to integers")]
    YearNormalization {
        table: &'static str,
        #[source]
        source: FrameError,
    },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Pivot(#[from] PivotError),
}

/// Input and output paths. Explicit so tests (and callers with their own
/// layout) can point the pipeline at fixture data.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub indicators_path: PathBuf,
    pub flood_path: PathBuf,
    pub sea_level_path: PathBuf,
    pub risk_path: PathBuf,
    pub output_path: PathBuf,
}

impl PipelineConfig {
    /// Default relative layout: the four inputs under `src/data/` and the
    /// output next to the working directory, matching the published data
    /// product.
    #[must_use]
    pub fn default_paths() -> Self {
        Self::from_data_dir(Path::new("src/data"))
    }

    /// All four inputs under `dir`, with their default file names.
    #[must_use]
    pub fn from_data_dir(dir: &Path) -> Self {
        Self {
            indicators_path: dir.join(DEFAULT_INDICATORS_FILE),
            flood_path: dir.join(DEFAULT_FLOOD_FILE),
            sea_level_path: dir.join(DEFAULT_SEA_LEVEL_FILE),
            risk_path: dir.join(DEFAULT_RISK_FILE),
            output_path: PathBuf::from(DEFAULT_OUTPUT_FILE),
        }
    }
}

/// The four raw tables as loaded, before any reshaping.
#[derive(Debug, Clone)]
pub struct InputTables {
    pub indicators: Frame,
    pub flood: Frame,
    pub sea_level: Frame,
    pub risk: Frame,
}

/// Nested output shape: country → year → {metric: value}.
pub type NestedMetrics = BTreeMap<String, BTreeMap<i64, BTreeMap<String, Value>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub merged_rows: usize,
    pub countries: usize,
    pub output_path: PathBuf,
}

// ── Loader ─────────────────────────────────────────────────────────────

pub fn load_inputs(config: &PipelineConfig) -> Result<InputTables, PipelineError> {
    Ok(InputTables {
        indicators: cm_io::read_table_path(&config.indicators_path)?,
        flood: cm_io::read_table_path(&config.flood_path)?,
        sea_level: cm_io::read_table_path(&config.sea_level_path)?,
        risk: cm_io::read_table_path(&config.risk_path)?,
    })
}

// ── Reshaper ───────────────────────────────────────────────────────────

/// Pivot the long flood table to one row per (Country, Year) with one
/// Float64 column per severity label observed in the data.
pub fn pivot_flood_days(flood: &Frame) -> Result<Frame, PipelineError> {
    Ok(pivot_wider(
        flood,
        &[COUNTRY_COLUMN, YEAR_COLUMN],
        SEVERITY_COLUMN,
        FLOOD_DAYS_COLUMN,
        Aggregation::Mean,
    )?)
}

// ── Normalizer ─────────────────────────────────────────────────────────

/// Rename the sea-level descriptor column. The column is dropped before
/// the join, so this only matters for callers inspecting the intermediate
/// table; it is kept for parity with the published transform.
pub fn normalize_sea_level(sea_level: &Frame) -> Result<Frame, PipelineError> {
    if sea_level.column("Metric").is_none() {
        return Ok(sea_level.clone());
    }
    Ok(sea_level.rename_columns(&[("Metric", SEA_LEVEL_METRIC_COLUMN)])?)
}

/// Apply the fixed risk-table renames.
pub fn normalize_risk(risk: &Frame) -> Result<Frame, PipelineError> {
    Ok(risk.rename_columns(&RISK_COLUMN_RENAMES)?)
}

/// Force a table's year column to Int64. A year stored as float in one
/// source would otherwise silently fail to match during the join; the
/// dtype change is surfaced as a warning instead.
fn normalize_year(frame: &Frame, table: &'static str) -> Result<Frame, PipelineError> {
    let year = frame
        .column(YEAR_COLUMN)
        .ok_or_else(|| PipelineError::MissingColumn {
            table,
            column: YEAR_COLUMN.to_owned(),
        })?;

    if year.dtype() == DType::Int64 {
        return Ok(frame.clone());
    }

    eprintln!(
        "warning: {table} table stores '{YEAR_COLUMN}' as {:?}; normalizing to int64 for the join",
        year.dtype()
    );
    frame
        .cast_column(YEAR_COLUMN, DType::Int64)
        .map_err(|source| PipelineError::YearNormalization { table, source })
}

// ── Joiner ─────────────────────────────────────────────────────────────

/// Three sequential left joins. The base indicator table is authoritative
/// for which (Country, Year) pairs exist; the risk join is keyed on
/// country alone and broadcasts its values across every year.
pub fn merge_tables(tables: &InputTables) -> Result<Frame, PipelineError> {
    let base = normalize_year(&tables.indicators, "indicators")?;
    let flood_wide = normalize_year(&pivot_flood_days(&tables.flood)?, "flood")?;
    let sea_level = normalize_year(&normalize_sea_level(&tables.sea_level)?, "sea level")?;
    let risk = normalize_risk(&tables.risk)?;

    let merged = left_join(&base, &flood_wide, &[COUNTRY_COLUMN, YEAR_COLUMN])?;

    let sea_level = if sea_level.column(SEA_LEVEL_METRIC_COLUMN).is_some() {
        sea_level.drop_column(SEA_LEVEL_METRIC_COLUMN)?
    } else {
        sea_level
    };
    let merged = left_join(&merged, &sea_level, &[COUNTRY_COLUMN, YEAR_COLUMN])?;

    let merged = left_join(&merged, &risk, &[COUNTRY_COLUMN])?;

    Ok(merged)
}

// ── Filler ─────────────────────────────────────────────────────────────

/// Zero-fill the three expected severity columns. Severity labels outside
/// the expected set keep their nulls; columns absent from the merged
/// table are skipped.
pub fn fill_missing_severities(merged: &Frame) -> Result<Frame, PipelineError> {
    Ok(merged.fill_columns(&FLOOD_SEVERITY_COLUMNS, &Scalar::Int64(0))?)
}

// ── Nester ─────────────────────────────────────────────────────────────

fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null(_) => Value::Null,
        Scalar::Bool(v) => Value::Bool(*v),
        Scalar::Int64(v) => Value::Number(Number::from(*v)),
        Scalar::Float64(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        Scalar::Utf8(v) => Value::String(v.clone()),
    }
}

/// Regroup the flat merged table into country → year → metrics. Every
/// remaining missing value becomes an explicit JSON null. A duplicate
/// (Country, Year) pair overwrites the earlier entry.
pub fn nest_by_country_year(merged: &Frame) -> Result<NestedMetrics, PipelineError> {
    let countries = merged
        .column(COUNTRY_COLUMN)
        .ok_or_else(|| PipelineError::MissingColumn {
            table: "merged",
            column: COUNTRY_COLUMN.to_owned(),
        })?;
    let years = merged
        .column(YEAR_COLUMN)
        .ok_or_else(|| PipelineError::MissingColumn {
            table: "merged",
            column: YEAR_COLUMN.to_owned(),
        })?;

    let mut nested = NestedMetrics::new();
    for row in 0..merged.len() {
        let country = match countries.value(row) {
            Some(Scalar::Utf8(name)) => name.clone(),
            Some(other) => {
                return Err(PipelineError::NonStringCountry {
                    row,
                    dtype: other.dtype(),
                })
            }
            None => {
                return Err(PipelineError::NonStringCountry {
                    row,
                    dtype: DType::Null,
                })
            }
        };
        let year = years
            .value(row)
            .cloned()
            .unwrap_or(Scalar::Null(cm_types::NullKind::Null))
            .to_i64()
            .map_err(|source| PipelineError::YearNotIntegral { row, source })?;

        let mut metrics = BTreeMap::new();
        for (name, value) in merged.row(row) {
            if name == COUNTRY_COLUMN || name == YEAR_COLUMN {
                continue;
            }
            metrics.insert(name.to_owned(), scalar_to_json(value));
        }

        nested.entry(country).or_default().insert(year, metrics);
    }

    Ok(nested)
}

// ── Writer / orchestration ─────────────────────────────────────────────

pub fn write_output(nested: &NestedMetrics, path: &Path) -> Result<(), PipelineError> {
    Ok(cm_io::write_json_pretty(path, nested)?)
}

/// Run the whole transform: load, pivot, join, fill, nest, write.
pub fn run(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let tables = load_inputs(config)?;
    let merged = merge_tables(&tables)?;
    let filled = fill_missing_severities(&merged)?;
    let nested = nest_by_country_year(&filled)?;
    write_output(&nested, &config.output_path)?;

    Ok(RunSummary {
        merged_rows: filled.len(),
        countries: nested.len(),
        output_path: config.output_path.clone(),
    })
}
