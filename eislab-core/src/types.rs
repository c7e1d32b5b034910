//! Core type definitions for EISLab.
//!
//! Defines the measurement model (points, datasets), the analysis conversation
//! model (turns, structured reports), and the response contract that governs
//! how a completion is parsed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One impedance reading at a frequency, optionally tagged with a position.
///
/// The rectangular components are always derived from the polar input and
/// cannot be set directly; deserialization recomputes them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolarRecord")]
pub struct MeasurementPoint {
    frequency: f64,
    magnitude: f64,
    phase_degrees: f64,
    real: f64,
    imaginary: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y: Option<f64>,
}

/// Serialized shape of a point; only the polar fields and coordinates are read.
#[derive(Deserialize)]
struct PolarRecord {
    frequency: f64,
    magnitude: f64,
    phase_degrees: f64,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
}

impl From<PolarRecord> for MeasurementPoint {
    fn from(record: PolarRecord) -> Self {
        let point = MeasurementPoint::new(record.frequency, record.magnitude, record.phase_degrees);
        match (record.x, record.y) {
            (Some(x), Some(y)) => point.at(x, y),
            _ => point,
        }
    }
}

impl MeasurementPoint {
    /// Create a point from polar values, deriving `real` and `imaginary`.
    pub fn new(frequency: f64, magnitude: f64, phase_degrees: f64) -> Self {
        let radians = phase_degrees.to_radians();
        Self {
            frequency,
            magnitude,
            phase_degrees,
            real: magnitude * radians.cos(),
            imaginary: magnitude * radians.sin(),
            x: None,
            y: None,
        }
    }

    /// Tag this point with spatial coordinates.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn phase_degrees(&self) -> f64 {
        self.phase_degrees
    }

    pub fn real(&self) -> f64 {
        self.real
    }

    pub fn imaginary(&self) -> f64 {
        self.imaginary
    }

    pub fn x(&self) -> Option<f64> {
        self.x
    }

    pub fn y(&self) -> Option<f64> {
        self.y
    }

    /// The `(x, y)` pair when both coordinates are present.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.x.zip(self.y)
    }
}

/// Whether a dataset is a single sweep or a spatial map of sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Sweep,
    Map,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Sweep => write!(f, "sweep"),
            DatasetKind::Map => write!(f, "map"),
        }
    }
}

/// A canonical, immutable set of measurement points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub kind: DatasetKind,
    pub points: Vec<MeasurementPoint>,
}

impl Dataset {
    pub fn new(kind: DatasetKind, points: Vec<MeasurementPoint>) -> Self {
        Self { kind, points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// Who authored a turn in an analysis conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Requester,
    Responder,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::Requester => write!(f, "requester"),
            TurnRole::Responder => write!(f, "responder"),
        }
    }
}

/// One named observation inside a structured report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetric {
    pub name: String,
    pub value: String,
    pub insight: String,
}

/// The structured answer to the first turn of an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredReport {
    #[serde(rename = "report_title", alias = "title")]
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub metrics: Vec<ReportMetric>,
}

impl StructuredReport {
    /// Canonical string form used when a report is replayed as conversation text.
    pub fn to_canonical_string(&self) -> String {
        // Plain structs of strings always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Content of a turn: free text or a structured report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Report(StructuredReport),
}

impl TurnContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TurnContent::Text(text) => Some(text),
            TurnContent::Report(_) => None,
        }
    }

    pub fn as_report(&self) -> Option<&StructuredReport> {
        match self {
            TurnContent::Report(report) => Some(report),
            TurnContent::Text(_) => None,
        }
    }

    /// Text sent to the completion service for this content.
    pub fn to_wire_text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Report(report) => report.to_canonical_string(),
        }
    }
}

/// One message in an analysis conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl Turn {
    pub fn requester(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Requester,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn responder(content: TurnContent) -> Self {
        Self {
            role: TurnRole::Responder,
            content,
        }
    }
}

/// How the completion service is asked to shape its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseContract {
    /// Output constrained to the given schema, decoded as a `StructuredReport`.
    Structured(serde_json::Value),
    /// Plain text output.
    FreeText,
}

impl ResponseContract {
    /// The contract that applies to a request carrying `turn_count` turns.
    ///
    /// Only the opening exchange (a single requester turn) may be structured;
    /// anything past it is free text.
    pub fn effective_for(self, turn_count: usize) -> Self {
        match self {
            ResponseContract::Structured(_) if turn_count > 1 => ResponseContract::FreeText,
            other => other,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ResponseContract::Structured(_))
    }
}

/// Interpretation domain for an analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisTopic {
    #[default]
    General,
    Soil,
    Plant,
}

impl AnalysisTopic {
    /// Default topic for a dataset shape: maps are soil surveys.
    pub fn default_for(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Sweep => AnalysisTopic::General,
            DatasetKind::Map => AnalysisTopic::Soil,
        }
    }

    /// Maps only support the soil survey topic.
    pub fn supports(&self, kind: DatasetKind) -> bool {
        kind == DatasetKind::Sweep || *self == AnalysisTopic::Soil
    }
}

impl fmt::Display for AnalysisTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisTopic::General => write!(f, "general"),
            AnalysisTopic::Soil => write!(f, "soil"),
            AnalysisTopic::Plant => write!(f, "plant"),
        }
    }
}

impl std::str::FromStr for AnalysisTopic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(AnalysisTopic::General),
            "soil" => Ok(AnalysisTopic::Soil),
            "plant" => Ok(AnalysisTopic::Plant),
            other => Err(format!("unknown analysis topic '{}'", other)),
        }
    }
}
