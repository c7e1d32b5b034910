//! Spatial aggregator for map datasets.
//!
//! Turns scattered `(x, y)` samples into normalized `[0, 1]` positions and
//! metric values that any renderer can map to screen space and colour. No grid
//! is assumed. A zero-width range normalizes to `0.5`.

use crate::error::SpatialError;
use crate::types::MeasurementPoint;
use serde::{Deserialize, Serialize};

/// Which measured quantity drives the colour scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Magnitude,
    PhaseDegrees,
}

impl Metric {
    pub fn value_of(self, point: &MeasurementPoint) -> f64 {
        match self {
            Metric::Magnitude => point.magnitude(),
            Metric::PhaseDegrees => point.phase_degrees(),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "magnitude" | "mag" | "impedance" => Ok(Metric::Magnitude),
            "phase" | "phase_degrees" | "phasedegrees" => Ok(Metric::PhaseDegrees),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// Closed interval observed over a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        values.into_iter().fold(None, |acc, v| match acc {
            None => Some(Range { min: v, max: v }),
            Some(r) => Some(Range {
                min: r.min.min(v),
                max: r.max.max(v),
            }),
        })
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Position of `value` within the range, `0.5` when the range is degenerate.
    pub fn normalize(&self, value: f64) -> f64 {
        let span = self.span();
        if span > 0.0 {
            (value - self.min) / span
        } else {
            0.5
        }
    }
}

/// Value and coordinate ranges of one aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialBounds {
    pub value: Range,
    pub x: Range,
    pub y: Range,
}

/// One point mapped into unit space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSample {
    pub x: f64,
    pub y: f64,
    pub value: f64,
    /// Metric value in `[0, 1]`.
    pub normalized: f64,
    /// Horizontal position in `[0, 1]`.
    pub x_position: f64,
    /// Vertical position in `[0, 1]`.
    pub y_position: f64,
}

impl NormalizedSample {
    pub fn hue(&self) -> f64 {
        heat_hue(self.normalized)
    }
}

/// The result of aggregating a set of map points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialMap {
    pub metric: Metric,
    /// `None` for an empty input.
    pub bounds: Option<SpatialBounds>,
    pub samples: Vec<NormalizedSample>,
}

/// Normalize `points` for the given metric.
///
/// Every point must carry coordinates.
pub fn aggregate(points: &[MeasurementPoint], metric: Metric) -> Result<SpatialMap, SpatialError> {
    let positioned = points
        .iter()
        .enumerate()
        .map(|(index, p)| {
            p.position()
                .map(|(x, y)| (x, y, metric.value_of(p)))
                .ok_or(SpatialError::MissingCoordinates { index })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let bounds = match (
        Range::of(positioned.iter().map(|s| s.2)),
        Range::of(positioned.iter().map(|s| s.0)),
        Range::of(positioned.iter().map(|s| s.1)),
    ) {
        (Some(value), Some(x), Some(y)) => SpatialBounds { value, x, y },
        _ => {
            return Ok(SpatialMap {
                metric,
                bounds: None,
                samples: Vec::new(),
            });
        }
    };

    let samples = positioned
        .into_iter()
        .map(|(x, y, value)| NormalizedSample {
            x,
            y,
            value,
            normalized: bounds.value.normalize(value),
            x_position: bounds.x.normalize(x),
            y_position: bounds.y.normalize(y),
        })
        .collect();

    Ok(SpatialMap {
        metric,
        bounds: Some(bounds),
        samples,
    })
}

/// Heat-scale hue in degrees: 240 (blue) for the low end down to 0 (red).
pub fn heat_hue(normalized: f64) -> f64 {
    (1.0 - normalized.clamp(0.0, 1.0)) * 240.0
}

/// Distinct frequencies present in `points`, ascending.
pub fn available_frequencies(points: &[MeasurementPoint]) -> Vec<f64> {
    let mut freqs: Vec<f64> = points.iter().map(|p| p.frequency()).collect();
    freqs.sort_by(f64::total_cmp);
    freqs.dedup();
    freqs
}

/// The layer of a map measured at exactly `frequency`.
pub fn frequency_slice(points: &[MeasurementPoint], frequency: f64) -> Vec<MeasurementPoint> {
    points
        .iter()
        .filter(|p| p.frequency() == frequency)
        .copied()
        .collect()
}
