//! Signal normalizer: raw tabular rows to canonical measurement points.
//!
//! Column names are matched case-insensitively against a small synonym table,
//! in any order, with extra columns ignored. A single bad row fails the whole
//! input; a corrupt file never yields a truncated dataset.
//!
//! Canonical ordering:
//! - sweeps are sorted ascending by frequency;
//! - maps are grouped by `(x, y)` in first-encounter order, each group sorted
//!   by frequency, and every group must carry the same set of frequencies.

use crate::error::ParseError;
use crate::types::{Dataset, DatasetKind, MeasurementPoint};
use std::collections::HashMap;
use std::io::Read;
use tracing::debug;

/// Raw rows as read from a file, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Read a CSV document with a header row.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, ParseError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| ParseError::Malformed {
                message: format!("Failed to read header row: {}", e),
            })?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| ParseError::Malformed {
                message: format!("Failed to read row: {}", e),
            })?;
            rows.push(record.iter().map(|cell| cell.to_string()).collect());
        }

        Ok(Self { headers, rows })
    }
}

/// A canonical column the normalizer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Frequency,
    Magnitude,
    Phase,
    X,
    Y,
}

impl Column {
    fn name(self) -> &'static str {
        match self {
            Column::Frequency => "frequency",
            Column::Magnitude => "magnitude",
            Column::Phase => "phase",
            Column::X => "x",
            Column::Y => "y",
        }
    }

    fn synonyms(self) -> &'static [&'static str] {
        match self {
            Column::Frequency => &["frequency", "freq"],
            Column::Magnitude => &["impedance", "mag", "magnitude"],
            Column::Phase => &["phase", "phase_degrees"],
            Column::X => &["x"],
            Column::Y => &["y"],
        }
    }

    fn find(self, headers: &[String]) -> Option<usize> {
        headers.iter().position(|h| {
            let key = h.trim_start_matches('\u{feff}').trim().to_lowercase();
            self.synonyms().contains(&key.as_str())
        })
    }
}

/// Resolved column indices for one input.
#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    frequency: usize,
    magnitude: usize,
    phase: usize,
    coords: Option<(usize, usize)>,
}

fn required(column: Column, headers: &[String]) -> Result<usize, ParseError> {
    column.find(headers).ok_or_else(|| ParseError::MissingColumn {
        column: column.name().to_string(),
        row: None,
    })
}

fn resolve_columns(headers: &[String], kind: DatasetKind) -> Result<ColumnMap, ParseError> {
    let coords = match kind {
        DatasetKind::Sweep => {
            for column in [Column::X, Column::Y] {
                if column.find(headers).is_some() {
                    return Err(ParseError::WrongDatasetShape {
                        expected: kind,
                        reason: format!(
                            "column '{}' is present; load this file as a map instead",
                            column.name()
                        ),
                    });
                }
            }
            None
        }
        DatasetKind::Map => Some((
            required(Column::X, headers)?,
            required(Column::Y, headers)?,
        )),
    };

    Ok(ColumnMap {
        frequency: required(Column::Frequency, headers)?,
        magnitude: required(Column::Magnitude, headers)?,
        phase: required(Column::Phase, headers)?,
        coords,
    })
}

fn cell<'a>(
    row: &'a [String],
    index: usize,
    column: Column,
    row_no: usize,
) -> Result<&'a str, ParseError> {
    row.get(index)
        .map(String::as_str)
        .ok_or_else(|| ParseError::MissingColumn {
            column: column.name().to_string(),
            row: Some(row_no),
        })
}

fn number(raw: &str, column: Column, row_no: usize) -> Result<f64, ParseError> {
    let invalid = |reason: &str| ParseError::InvalidValue {
        row: row_no,
        field: column.name().to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("value is empty"));
    }
    let value: f64 = raw.parse().map_err(|_| invalid("not a number"))?;
    if !value.is_finite() {
        return Err(invalid("value is not finite"));
    }
    Ok(value)
}

/// Validate polar values and build a point.
fn polar_point(
    frequency: f64,
    magnitude: f64,
    phase: f64,
    row_no: usize,
) -> Result<MeasurementPoint, ParseError> {
    let out_of_range = |column: Column, value: f64, reason: &str| ParseError::InvalidValue {
        row: row_no,
        field: column.name().to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(out_of_range(
            Column::Frequency,
            frequency,
            "must be greater than zero",
        ));
    }
    if !magnitude.is_finite() || magnitude < 0.0 {
        return Err(out_of_range(Column::Magnitude, magnitude, "must not be negative"));
    }
    if !phase.is_finite() || !(-180.0..=180.0).contains(&phase) {
        return Err(out_of_range(
            Column::Phase,
            phase,
            "must be within [-180, 180] degrees",
        ));
    }
    Ok(MeasurementPoint::new(frequency, magnitude, phase))
}

fn parse_row(
    row: &[String],
    columns: &ColumnMap,
    row_no: usize,
) -> Result<MeasurementPoint, ParseError> {
    let read = |index: usize, column: Column| -> Result<f64, ParseError> {
        number(cell(row, index, column, row_no)?, column, row_no)
    };

    let frequency = read(columns.frequency, Column::Frequency)?;
    let magnitude = read(columns.magnitude, Column::Magnitude)?;
    let phase = read(columns.phase, Column::Phase)?;
    let point = polar_point(frequency, magnitude, phase, row_no)?;

    match columns.coords {
        Some((x_idx, y_idx)) => {
            let x = read(x_idx, Column::X)?;
            let y = read(y_idx, Column::Y)?;
            Ok(point.at(x, y))
        }
        None => Ok(point),
    }
}

fn sort_by_frequency(points: &mut [MeasurementPoint]) {
    points.sort_by(|a, b| a.frequency().total_cmp(&b.frequency()));
}

/// Hash key for a coordinate pair; `-0.0` and `0.0` collapse together.
fn coordinate_key(x: f64, y: f64) -> (u64, u64) {
    ((x + 0.0).to_bits(), (y + 0.0).to_bits())
}

fn group_by_position(points: Vec<MeasurementPoint>) -> Result<Vec<MeasurementPoint>, ParseError> {
    let mut index: HashMap<(u64, u64), usize> = HashMap::new();
    let mut groups: Vec<Vec<MeasurementPoint>> = Vec::new();

    for point in points {
        let Some((x, y)) = point.position() else {
            continue;
        };
        let slot = *index.entry(coordinate_key(x, y)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(point);
    }

    for group in &mut groups {
        sort_by_frequency(group);
    }

    if let Some((first, rest)) = groups.split_first() {
        let expected: Vec<u64> = first.iter().map(|p| p.frequency().to_bits()).collect();
        for group in rest {
            let found: Vec<u64> = group.iter().map(|p| p.frequency().to_bits()).collect();
            if found != expected {
                let (x, y) = group[0].position().unwrap_or_default();
                return Err(ParseError::WrongDatasetShape {
                    expected: DatasetKind::Map,
                    reason: format!(
                        "position (x:{}, y:{}) has {} frequencies, expected the same {} as every other position",
                        x,
                        y,
                        group.len(),
                        first.len()
                    ),
                });
            }
        }
    }

    Ok(groups.into_iter().flatten().collect())
}

/// Normalize raw rows into canonical measurement points for the requested shape.
pub fn normalize(
    table: &RawTable,
    kind: DatasetKind,
) -> Result<Vec<MeasurementPoint>, ParseError> {
    let columns = resolve_columns(&table.headers, kind)?;

    let points = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| parse_row(row, &columns, i + 1))
        .collect::<Result<Vec<_>, _>>()?;

    let points = match kind {
        DatasetKind::Sweep => {
            let mut points = points;
            sort_by_frequency(&mut points);
            points
        }
        DatasetKind::Map => group_by_position(points)?,
    };

    debug!(kind = %kind, points = points.len(), "Normalized dataset");
    Ok(points)
}

/// Read and normalize a CSV document into a dataset.
pub fn parse_csv<R: Read>(reader: R, kind: DatasetKind) -> Result<Dataset, ParseError> {
    let table = RawTable::from_csv(reader)?;
    Ok(Dataset::new(kind, normalize(&table, kind)?))
}

/// Build a canonical sweep from live device readings of `(frequency, magnitude, phase)`.
pub fn from_readings<I>(readings: I) -> Result<Dataset, ParseError>
where
    I: IntoIterator<Item = (f64, f64, f64)>,
{
    let mut points = readings
        .into_iter()
        .enumerate()
        .map(|(i, (f, m, p))| polar_point(f, m, p, i + 1))
        .collect::<Result<Vec<_>, _>>()?;
    sort_by_frequency(&mut points);
    Ok(Dataset::new(DatasetKind::Sweep, points))
}
