//! Post-processing of a completed result set with the two S21 calibration
//! paths.

use std::sync::Arc;

use detcal_messages::{MeasurementPoint, RecalculatedPoint, S21Table, SweepSettings};

/// Linear interpolation of the table's magnitude at `frequency`.
///
/// Frequencies outside the table clamp to the nearest endpoint. A NaN
/// frequency gives NaN.
pub fn interpolate(table: &S21Table, frequency: f64) -> f64 {
    if frequency.is_nan() {
        return f64::NAN;
    }
    let freqs = table.frequencies();
    let mags = table.magnitudes_db();
    let last = freqs.len() - 1;

    if frequency <= freqs[0] {
        return mags[0];
    }
    if frequency >= freqs[last] {
        return mags[last];
    }

    // First index with a frequency above the query; always in 1..=last here.
    let hi = freqs.partition_point(|&f| f <= frequency);
    let lo = hi - 1;
    let t = (frequency - freqs[lo]) / (freqs[hi] - freqs[lo]);
    mags[lo] + t * (mags[hi] - mags[lo])
}

/// Correct every point for the generator→analyzer and generator→detector
/// paths.
///
/// Returns a fresh collection; the input is never touched, so the same inputs
/// always give the same output.
pub fn recalculate(
    points: &[MeasurementPoint],
    s21_gen_sa: &S21Table,
    s21_gen_det: &S21Table,
) -> Vec<RecalculatedPoint> {
    points
        .iter()
        .map(|&point| {
            let s21_gen_sa_db = interpolate(s21_gen_sa, point.frequency_hz);
            let s21_gen_det_db = interpolate(s21_gen_det, point.frequency_hz);
            RecalculatedPoint {
                point,
                s21_gen_sa_db,
                s21_gen_det_db,
                det_level_dbm: (point.sa_level_dbm + s21_gen_sa_db) - s21_gen_det_db,
            }
        })
        .collect()
}

/// Both calibration tables, loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct S21Calibrator {
    gen_sa: Arc<S21Table>,
    gen_det: Arc<S21Table>,
}

impl S21Calibrator {
    pub fn new(gen_sa: Arc<S21Table>, gen_det: Arc<S21Table>) -> Self {
        Self { gen_sa, gen_det }
    }

    pub fn recalculate(&self, points: &[MeasurementPoint]) -> Vec<RecalculatedPoint> {
        recalculate(points, &self.gen_sa, &self.gen_det)
    }

    /// Power expected at the detector input for a generator level.
    pub fn detector_level(&self, frequency: f64, gen_level_dbm: f64) -> f64 {
        gen_level_dbm + interpolate(&self.gen_det, frequency)
    }

    pub fn max_detector_level(&self, settings: &SweepSettings) -> f64 {
        max_detector_level(settings, &self.gen_det)
    }
}

/// Highest detector input level the sweep will produce: the maximum
/// generator level through the least lossy point of the detector path.
pub fn max_detector_level(settings: &SweepSettings, s21_gen_det: &S21Table) -> f64 {
    settings
        .frequencies()
        .into_iter()
        .map(|f| settings.level_max() + interpolate(s21_gen_det, f))
        .fold(f64::NEG_INFINITY, f64::max)
}
