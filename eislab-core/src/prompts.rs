//! Instructions, report schemas, and dataset rendering for analysis requests.

use crate::spatial::available_frequencies;
use crate::types::{AnalysisTopic, Dataset, DatasetKind};
use serde_json::{Value, json};
use std::fmt::Write as _;

/// Number of map points quoted verbatim in a dataset summary.
const MAP_PREVIEW_POINTS: usize = 5;

const GENERAL_INSTRUCTIONS: &str = "\
You are an expert in Electrochemical Impedance Spectroscopy (EIS).
The user has provided sweep data. Give a brief one-paragraph summary of what the data \
represents (for example capacitive, resistive, or diffusion-limited behaviour), then list \
2-3 key metrics or observations.
All data is below 5 kHz.
";

const SOIL_INSTRUCTIONS: &str = "\
You are an agricultural EIS expert. The data comes from a soil sample (below 5 kHz).
Estimate moisture and salinity from it.
- Moisture correlates with the phase angle at low frequencies (around 100 Hz): a more \
negative phase suggests higher moisture.
- Salinity correlates with the impedance magnitude at high frequencies (around 5 kHz): \
lower impedance suggests higher salinity.
";

const SOIL_SWEEP_FOCUS: &str =
    "Provide a summary and specific metrics for moisture and salinity.\n";

const SOIL_MAP_FOCUS: &str = "\
The data is a 2D tomography map. Your analysis MUST focus on SPATIAL VARIATION: identify \
regions (for example 'Top-Left' or 'Center') of high or low moisture and salinity.
";

const PLANT_INSTRUCTIONS: &str = "\
You are a plant pathologist using EIS. The data comes from a plant stem or leaf (below 5 kHz).
Look for signs of early stress or disease.
- Stress (dehydration, nutrient loss) usually raises overall impedance.
- Disease (cell wall breakdown) usually lowers impedance, especially at low frequencies, \
and shifts the phase.
Provide a summary and metrics for plant health.
";

/// Appended to the opening instructions whenever a historical digest exists.
pub const TREND_ADDENDUM: &str = "\
--- TASK: TREND ANALYSIS ---
The request includes historical context for this same subject.
Your primary task is to compare the NEW data against that context. Look specifically for:
1. Magnitude trend: is impedance at key frequencies (around 100 Hz and 5 kHz) rising or falling over time?
2. Phase trend: is the low-frequency phase (around 100 Hz) becoming more or less negative?
3. Anomalies: is the new reading a significant deviation from the historical average or part of a stable trend?
Your summary must include this trend analysis.
";

const JSON_ANSWER_FOOTER: &str =
    "Provide your final answer as a single, valid JSON object matching the requested schema.";

/// System instructions for follow-up turns.
pub const FOLLOW_UP_INSTRUCTIONS: &str = "\
You are an expert EIS assistant.
The user has provided data and a subject, and you have already given an initial analysis.
Answer the user's follow-up question using the entire conversation so far.
Be helpful and concise. If the user asks for new metrics, provide them.
";

/// Domain guidance for `topic` on a dataset of `kind`.
pub fn topic_instructions(topic: AnalysisTopic, kind: DatasetKind) -> String {
    match topic {
        AnalysisTopic::General => GENERAL_INSTRUCTIONS.to_string(),
        AnalysisTopic::Soil => {
            let focus = match kind {
                DatasetKind::Map => SOIL_MAP_FOCUS,
                DatasetKind::Sweep => SOIL_SWEEP_FOCUS,
            };
            format!("{}{}", SOIL_INSTRUCTIONS, focus)
        }
        AnalysisTopic::Plant => PLANT_INSTRUCTIONS.to_string(),
    }
}

/// Full system instructions for the opening turn.
pub fn analysis_instructions(
    topic: AnalysisTopic,
    kind: DatasetKind,
    has_history: bool,
) -> String {
    let mut out = topic_instructions(topic, kind);
    if has_history {
        out.push('\n');
        out.push_str(TREND_ADDENDUM);
    }
    out.push('\n');
    out.push_str(JSON_ANSWER_FOOTER);
    out
}

/// Response schema for the opening turn.
///
/// Every topic shares the report shape; only the field descriptions differ.
pub fn report_schema(topic: AnalysisTopic, kind: DatasetKind) -> Value {
    let is_map = kind == DatasetKind::Map;
    let (title, summary, name, value, insight) = match topic {
        AnalysisTopic::General => (
            "e.g., 'General EIS Analysis'",
            "A one-paragraph summary.".to_string(),
            "Name of the metric (e.g., 'Low-Freq Behavior')",
            "Value (e.g., 'Capacitive')",
            "Brief insight",
        ),
        AnalysisTopic::Soil => (
            if is_map {
                "e.g., '2D Soil Map Analysis'"
            } else {
                "e.g., 'Soil Analysis Report'"
            },
            if is_map {
                "A one-paragraph summary of soil health. Focus on spatial variations.".to_string()
            } else {
                "A one-paragraph summary of soil health.".to_string()
            },
            "e.g., 'Moisture Index' or 'Salinity (Spatial)'",
            "e.g., 'High' or 'High in center, low at edges'",
            "e.g., 'Based on low-freq phase' or 'Based on high-freq magnitude map'",
        ),
        AnalysisTopic::Plant => (
            "e.g., 'Plant Health Analysis'",
            "A one-paragraph summary of plant health.".to_string(),
            "e.g., 'Stress Level' or 'Disease Indicator'",
            "e.g., 'High' or 'Potential cell degradation'",
            "e.g., 'Based on high impedance' or 'Based on low-freq phase shift'",
        ),
    };

    json!({
        "type": "OBJECT",
        "properties": {
            "report_title": { "type": "STRING", "description": title },
            "summary": { "type": "STRING", "description": summary },
            "metrics": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING", "description": name },
                        "value": { "type": "STRING", "description": value },
                        "insight": { "type": "STRING", "description": insight },
                    },
                    "required": ["name", "value", "insight"],
                },
            },
        },
        "required": ["report_title", "summary", "metrics"],
    })
}

/// Render a dataset as text for the opening turn.
pub fn summarize_dataset(dataset: &Dataset) -> String {
    let mut out = String::new();
    match dataset.kind {
        DatasetKind::Sweep => {
            out.push_str("Type: 1D Frequency Sweep\n");
            let lines: Vec<String> = dataset
                .points
                .iter()
                .map(|p| {
                    format!(
                        "Freq: {:.0} Hz, Mag: {:.2} Ω, Phase: {:.2}°",
                        p.frequency(),
                        p.magnitude(),
                        p.phase_degrees()
                    )
                })
                .collect();
            out.push_str(&lines.join("\n"));
        }
        DatasetKind::Map => {
            let freqs = available_frequencies(&dataset.points);
            let listed: Vec<String> = freqs.iter().map(|f| f.to_string()).collect();
            let positions = dataset.points.len() / freqs.len().max(1);

            out.push_str("Type: 2D Tomography Map\n");
            let _ = writeln!(out, "Frequencies: {} Hz", listed.join(", "));
            let _ = writeln!(out, "Spatial Points: {}", positions);
            out.push_str("Data summary (first 5 points):\n");
            let preview: Vec<String> = dataset
                .points
                .iter()
                .take(MAP_PREVIEW_POINTS)
                .map(|p| {
                    let (x, y) = p.position().unwrap_or((f64::NAN, f64::NAN));
                    format!(
                        "(x:{}, y:{}) @ {}Hz: {:.0}Ω, {:.1}°",
                        x,
                        y,
                        p.frequency(),
                        p.magnitude(),
                        p.phase_degrees()
                    )
                })
                .collect();
            out.push_str(&preview.join("\n"));
        }
    }
    out
}

/// Text of the opening requester turn: digest (if any) followed by the data.
pub fn first_turn_text(digest: &str, dataset_summary: &str) -> String {
    format!(
        "{}\nHere is the NEW sweep data to analyze:\n{}\n\
         Please provide the analysis for the NEW data, comparing it to the historical context if provided.",
        digest, dataset_summary
    )
}
