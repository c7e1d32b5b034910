//! Device calibration coefficients and the correction formulas they drive.
//!
//! The device publishes a flat `name -> value` map. Magnitude is corrected by a
//! multiplicative factor `A + B·ln(f)` chosen per band (low band below the
//! crossover frequency, high band at or above it). Phase is corrected by an
//! additive offset `A + B·f + C·ln(f) + D/f`.

use crate::types::MeasurementPoint;
use std::collections::BTreeMap;

pub const MAG1_A: &str = "MAG1_A";
pub const MAG1_B: &str = "MAG1_B";
pub const MAG2_A: &str = "MAG2_A";
pub const MAG2_B: &str = "MAG2_B";
pub const PHASE_A: &str = "PHASE_A";
pub const PHASE_B: &str = "PHASE_B";
pub const PHASE_C: &str = "PHASE_C";
pub const PHASE_D: &str = "PHASE_D";

/// `A + B·ln(f)` magnitude factor for one band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnitudeBand {
    pub a: f64,
    pub b: f64,
}

impl MagnitudeBand {
    pub fn factor(&self, frequency: f64) -> f64 {
        self.a + self.b * frequency.ln()
    }
}

/// `A + B·f + C·ln(f) + D/f` phase offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseCorrection {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl PhaseCorrection {
    pub fn offset(&self, frequency: f64) -> f64 {
        self.a + self.b * frequency + self.c * frequency.ln() + self.d / frequency
    }
}

/// Parsed calibration. A component whose coefficients are incomplete is `None`
/// and leaves its quantity uncorrected.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub low_band: Option<MagnitudeBand>,
    pub high_band: Option<MagnitudeBand>,
    pub phase: Option<PhaseCorrection>,
    pub crossover_hz: f64,
}

impl Calibration {
    /// Interpret a coefficient map as published by the device.
    pub fn from_coefficients(coefficients: &BTreeMap<String, f64>, crossover_hz: f64) -> Self {
        let get = |key: &str| coefficients.get(key).copied().filter(|v| v.is_finite());
        let band = |a: &str, b: &str| Some(MagnitudeBand { a: get(a)?, b: get(b)? });

        let phase = match (get(PHASE_A), get(PHASE_B), get(PHASE_C), get(PHASE_D)) {
            (Some(a), Some(b), Some(c), Some(d)) => Some(PhaseCorrection { a, b, c, d }),
            _ => None,
        };

        Self {
            low_band: band(MAG1_A, MAG1_B),
            high_band: band(MAG2_A, MAG2_B),
            phase,
            crossover_hz,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.low_band.is_none() && self.high_band.is_none() && self.phase.is_none()
    }

    fn band_for(&self, frequency: f64) -> Option<&MagnitudeBand> {
        if frequency < self.crossover_hz {
            self.low_band.as_ref()
        } else {
            self.high_band.as_ref()
        }
    }

    /// Corrected magnitude, floored at zero.
    pub fn correct_magnitude(&self, frequency: f64, magnitude: f64) -> f64 {
        match self.band_for(frequency) {
            Some(band) => (magnitude * band.factor(frequency)).max(0.0),
            None => magnitude,
        }
    }

    /// Corrected phase, wrapped back into `[-180, 180]`.
    pub fn correct_phase(&self, frequency: f64, phase_degrees: f64) -> f64 {
        match &self.phase {
            Some(phase) => wrap_degrees(phase_degrees + phase.offset(frequency)),
            None => phase_degrees,
        }
    }

    /// Apply the correction to a point, re-deriving its rectangular values.
    pub fn apply(&self, point: &MeasurementPoint) -> MeasurementPoint {
        let f = point.frequency();
        let corrected = MeasurementPoint::new(
            f,
            self.correct_magnitude(f, point.magnitude()),
            self.correct_phase(f, point.phase_degrees()),
        );
        match point.position() {
            Some((x, y)) => corrected.at(x, y),
            None => corrected,
        }
    }

    pub fn apply_all(&self, points: &[MeasurementPoint]) -> Vec<MeasurementPoint> {
        points.iter().map(|p| self.apply(p)).collect()
    }

    /// Human-readable formula lines, one per component; `?` marks a missing value.
    pub fn describe(&self) -> Vec<String> {
        fn fmt(v: Option<f64>, precision: usize) -> String {
            v.map(|v| format!("{:.*}", precision, v))
                .unwrap_or_else(|| "?".to_string())
        }

        let band_line = |label: &str, band: Option<&MagnitudeBand>| {
            format!(
                "Magnitude ({}): Z *= {} + {} * ln(f)",
                label,
                fmt(band.map(|b| b.a), 6),
                fmt(band.map(|b| b.b), 7)
            )
        };

        let phase = self.phase.as_ref();
        vec![
            band_line(&format!("f < {} Hz", self.crossover_hz), self.low_band.as_ref()),
            band_line(&format!("f >= {} Hz", self.crossover_hz), self.high_band.as_ref()),
            format!(
                "Phase: phi += {} + ({} * f) + ({} * ln(f)) + ({} / f)",
                fmt(phase.map(|p| p.a), 3),
                fmt(phase.map(|p| p.b), 6),
                fmt(phase.map(|p| p.c), 6),
                fmt(phase.map(|p| p.d), 6)
            ),
        ]
    }
}

fn wrap_degrees(degrees: f64) -> f64 {
    if (-180.0..=180.0).contains(&degrees) {
        return degrees;
    }
    let wrapped = (degrees + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid maps +180 onto -180; keep the sign of the input there.
    if wrapped == -180.0 && degrees > 0.0 {
        180.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coefficients(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_empty_map_is_identity() {
        let cal = Calibration::from_coefficients(&BTreeMap::new(), 1000.0);
        assert!(cal.is_empty());
        let p = MeasurementPoint::new(100.0, 50.0, -20.0);
        assert_eq!(cal.apply(&p), p);
    }

    #[test]
    fn test_magnitude_uses_band_by_crossover() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[(MAG1_A, 2.0), (MAG1_B, 0.0), (MAG2_A, 0.5), (MAG2_B, 0.0)]),
            1000.0,
        );
        assert_eq!(cal.correct_magnitude(100.0, 10.0), 20.0);
        assert_eq!(cal.correct_magnitude(1000.0, 10.0), 5.0);
    }

    #[test]
    fn test_magnitude_log_term() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[(MAG1_A, 1.0), (MAG1_B, 0.1)]),
            1000.0,
        );
        let f = 100.0f64;
        let expected = 10.0 * (1.0 + 0.1 * f.ln());
        assert!((cal.correct_magnitude(f, 10.0) - expected).abs() < 1e-12);
        // High band missing: untouched.
        assert_eq!(cal.correct_magnitude(2000.0, 10.0), 10.0);
    }

    #[test]
    fn test_phase_offset_formula() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[
                (PHASE_A, 1.0),
                (PHASE_B, 0.001),
                (PHASE_C, -0.5),
                (PHASE_D, 20.0),
            ]),
            1000.0,
        );
        let f = 200.0f64;
        let expected = -10.0 + 1.0 + 0.001 * f - 0.5 * f.ln() + 20.0 / f;
        assert!((cal.correct_phase(f, -10.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_partial_phase_coefficients_ignored() {
        let cal = Calibration::from_coefficients(&coefficients(&[(PHASE_A, 5.0)]), 1000.0);
        assert!(cal.phase.is_none());
        assert_eq!(cal.correct_phase(100.0, -3.0), -3.0);
    }

    #[test]
    fn test_apply_rederives_rectangular_and_keeps_position() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[(MAG1_A, 2.0), (MAG1_B, 0.0)]),
            1000.0,
        );
        let p = MeasurementPoint::new(10.0, 3.0, 0.0).at(4.0, 5.0);
        let c = cal.apply(&p);
        assert_eq!(c.magnitude(), 6.0);
        assert!((c.real() - 6.0).abs() < 1e-12);
        assert_eq!(c.position(), Some((4.0, 5.0)));
    }

    #[test]
    fn test_describe_marks_missing() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[(MAG1_A, 1.5), (MAG1_B, 0.25)]),
            1000.0,
        );
        let lines = cal.describe();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "Magnitude (f < 1000 Hz): Z *= 1.500000 + 0.2500000 * ln(f)"
        );
        assert!(lines[1].contains("Z *= ? + ?"));
        assert!(lines[2].starts_with("Phase: phi += ?"));
    }

    #[test]
    fn test_negative_band_factor_floors_magnitude_at_zero() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[(MAG1_A, -1.0), (MAG1_B, 0.0)]),
            1000.0,
        );
        let c = cal.apply(&MeasurementPoint::new(100.0, 50.0, -30.0));
        assert_eq!(c.magnitude(), 0.0);
        assert_eq!(c.real(), 0.0);
    }

    #[test]
    fn test_phase_offset_wraps_into_half_turn_range() {
        let cal = Calibration::from_coefficients(
            &coefficients(&[
                (MAG1_A, -1.0),
                (MAG1_B, 0.0),
                (PHASE_A, -10.0),
                (PHASE_B, 0.0),
                (PHASE_C, 0.0),
                (PHASE_D, 0.0),
            ]),
            1000.0,
        );
        let c = cal.apply(&MeasurementPoint::new(100.0, 50.0, -175.0));
        assert!((c.phase_degrees() - 175.0).abs() < 1e-9);
        assert!(c.magnitude() >= 0.0);

        assert!((wrap_degrees(190.0) + 170.0).abs() < 1e-9);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), -180.0);
        assert_eq!(wrap_degrees(540.0), 180.0);
    }
}
