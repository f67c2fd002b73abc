//! CSV-backed skeleton dataset.
//!
//! Two files describe a split:
//! - `data_path`: one row per sample, flattened joint coordinates
//! - `label_path`: one row per sample, `name,class_index`
//!
//! Both accept an optional header row (auto-detected: the first row is a
//! header if it contains any non-numeric, non-empty cell in a numeric column).
//! Double-quoted fields with embedded commas are handled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::feeder::feeder::{Feeder, Sample};
use crate::feeder::memory::InMemoryFeeder;

/// Samples kept when `debug` is set.
const DEBUG_SAMPLES: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederArgs {
    pub data_path: PathBuf,
    pub label_path: PathBuf,
    pub debug: bool,
}

pub struct CsvFeeder {
    inner: InMemoryFeeder,
}

impl CsvFeeder {
    pub fn load(args: &FeederArgs) -> Result<CsvFeeder> {
        let data = std::fs::read(&args.data_path).map_err(|e| {
            TrainError::Dataset(format!("cannot read {}: {e}", args.data_path.display()))
        })?;
        let labels = std::fs::read(&args.label_path).map_err(|e| {
            TrainError::Dataset(format!("cannot read {}: {e}", args.label_path.display()))
        })?;

        let features = parse_features(&data)?;
        let (names, labels) = parse_labels(&labels)?;
        if features.len() != labels.len() {
            return Err(TrainError::Dataset(format!(
                "{} has {} samples but {} has {} labels",
                args.data_path.display(),
                features.len(),
                args.label_path.display(),
                labels.len()
            )));
        }

        let mut inner = InMemoryFeeder::new(features, labels).with_names(names);
        if args.debug {
            inner.truncate(DEBUG_SAMPLES);
        }
        tracing::info!(
            path = %args.data_path.display(),
            samples = inner.len(),
            features = inner.feature_dim(),
            "loaded dataset"
        );
        Ok(CsvFeeder { inner })
    }
}

impl Feeder for CsvFeeder {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn feature_dim(&self) -> usize {
        self.inner.feature_dim()
    }

    fn sample(&self, index: usize) -> Sample {
        self.inner.sample(index)
    }

    fn label(&self, index: usize) -> usize {
        self.inner.label(index)
    }

    fn sample_name(&self, index: usize) -> String {
        self.inner.sample_name(index)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn rows(data: &[u8]) -> Result<Vec<Vec<String>>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| TrainError::Dataset("CSV file is not valid UTF-8".into()))?;
    Ok(text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_csv_row)
        .collect())
}

fn parse_features(data: &[u8]) -> Result<Vec<Vec<f64>>> {
    let mut rows = rows(data)?;
    if rows.first().map(|r| is_header(r)).unwrap_or(false) {
        rows.remove(0);
    }
    if rows.is_empty() {
        return Err(TrainError::Dataset("feature CSV contains no data rows".into()));
    }

    let features: Vec<Vec<f64>> = rows.iter()
        .enumerate()
        .map(|(i, cells)| parse_floats(cells, i + 1))
        .collect::<Result<_>>()?;

    // Verify all rows have the same feature width.
    let n_feats = features[0].len();
    for (i, row) in features.iter().enumerate() {
        if row.len() != n_feats {
            return Err(TrainError::Dataset(format!(
                "Row {}: feature count {} does not match first row's {}",
                i + 1, row.len(), n_feats
            )));
        }
    }
    Ok(features)
}

fn parse_labels(data: &[u8]) -> Result<(Vec<String>, Vec<usize>)> {
    let mut rows = rows(data)?;
    // Only the label column is numeric, so the header check looks at it alone.
    if rows.first()
        .and_then(|r| r.last())
        .map(|c| c.trim().parse::<usize>().is_err())
        .unwrap_or(false)
    {
        rows.remove(0);
    }

    let mut names = Vec::with_capacity(rows.len());
    let mut labels = Vec::with_capacity(rows.len());
    for (row_idx, cells) in rows.iter().enumerate() {
        if cells.len() != 2 {
            return Err(TrainError::Dataset(format!(
                "Row {}: expected 2 columns (name, class index), got {}",
                row_idx + 1,
                cells.len()
            )));
        }
        let class_idx = cells[1].trim().parse::<usize>().map_err(|_| {
            TrainError::Dataset(format!(
                "Row {}: class index '{}' is not a non-negative integer",
                row_idx + 1,
                cells[1]
            ))
        })?;
        names.push(cells[0].trim().to_string());
        labels.push(class_idx);
    }
    Ok((names, labels))
}

/// Returns `true` if the row looks like a header (any cell non-numeric).
fn is_header(cells: &[String]) -> bool {
    cells.iter().any(|c| {
        let t = c.trim();
        !t.is_empty() && t.parse::<f64>().is_err()
    })
}

/// Parses a single CSV row, handling double-quoted fields.
fn parse_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '"' => {
                if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                    // Escaped quote inside quoted field.
                    current.push('"');
                    i += 2;
                    continue;
                }
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
        i += 1;
    }
    fields.push(current);
    fields
}

fn parse_floats(cells: &[String], row_num: usize) -> Result<Vec<f64>> {
    cells.iter()
        .map(|c| {
            c.trim().parse::<f64>().map_err(|_| {
                TrainError::Dataset(format!("Row {}: '{}' is not a valid number", row_num, c))
            })
        })
        .collect()
}
